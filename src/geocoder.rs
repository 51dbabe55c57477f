use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::{AppConfig, OperatingMode};
use crate::errors::{AppError, AppResult};

pub const NO_NUMBER: &str = "S/N";
pub const UNIDENTIFIED_CITY: &str = "UNIDENTIFIED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub street: String,
    pub house_number: String,
    pub neighborhood: String,
    pub postal_code: String,
    pub city: String,
}

impl GeoRecord {
    /// Maps typed address components onto record fields. Later components
    /// overwrite earlier ones of the same type; unmapped types are ignored.
    pub fn from_candidate(
        candidate: &GeocodeCandidate,
        mode: OperatingMode,
        home_locality: &str,
    ) -> Self {
        let mut record = GeoRecord {
            latitude: candidate.latitude,
            longitude: candidate.longitude,
            street: String::new(),
            house_number: NO_NUMBER.to_string(),
            neighborhood: String::new(),
            postal_code: String::new(),
            city: UNIDENTIFIED_CITY.to_string(),
        };
        let mut city_found = false;

        for component in &candidate.components {
            if component.has_type("route") {
                record.street = component.long_name.to_uppercase();
            }
            if component.has_type("street_number") {
                record.house_number = component.long_name.clone();
            }
            if component.has_type("sublocality") {
                record.neighborhood = component.long_name.to_uppercase();
            }
            if component.has_type("postal_code") {
                record.postal_code = component.long_name.clone();
            }
            if component.has_type("administrative_area_level_2") {
                record.city = component.long_name.to_uppercase();
                city_found = true;
            }
        }

        if !city_found && mode == OperatingMode::Municipal {
            record.city = home_locality.trim().to_uppercase();
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressComponent {
    pub long_name: String,
    #[serde(default)]
    pub types: Vec<String>,
}

impl AddressComponent {
    pub fn new(long_name: impl Into<String>, types: &[&str]) -> Self {
        Self {
            long_name: long_name.into(),
            types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn has_type(&self, kind: &str) -> bool {
        self.types.iter().any(|t| t == kind)
    }
}

/// First result returned by a geocoder for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeCandidate {
    pub latitude: f64,
    pub longitude: f64,
    pub components: Vec<AddressComponent>,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the provider answered but found nothing.
    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>>;

    /// Whether calls reach a rate-limited upstream.
    fn is_remote(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct GeocoderService {
    inner: Arc<dyn Geocoder>,
}

impl GeocoderService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        if let Some(key) = config.geocoder_api_key.clone() {
            let http = HttpGeocoder::new(
                &config.geocoder_endpoint,
                key,
                Duration::from_secs(config.geocoder_timeout_secs),
            )?;
            Ok(Self {
                inner: Arc::new(http),
            })
        } else {
            warn!(
                target: "geocoder",
                "no geocoder key configured; only cached addresses will resolve"
            );
            Ok(Self {
                inner: Arc::new(OfflineGeocoder),
            })
        }
    }

    pub fn from_geocoder(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { inner: geocoder }
    }

    pub fn is_remote(&self) -> bool {
        self.inner.is_remote()
    }

    pub async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>> {
        self.inner.geocode(query).await
    }
}

/// Client for the Google Geocoding JSON API.
pub struct HttpGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            error_message: Option<String>,
            #[serde(default)]
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
            #[serde(default)]
            address_components: Vec<AddressComponent>,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("address", query), ("key", self.api_key.expose_secret())])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        trace!(target: "geocoder", status = %parsed.status, "geocode response received");
        match parsed.status.as_str() {
            "OK" => Ok(parsed
                .results
                .into_iter()
                .next()
                .map(|result| GeocodeCandidate {
                    latitude: result.geometry.location.lat,
                    longitude: result.geometry.location.lng,
                    components: result.address_components,
                })),
            "ZERO_RESULTS" => Ok(None),
            status => Err(AppError::Geocoder(match parsed.error_message {
                Some(message) => format!("{status}: {message}"),
                None => status.to_string(),
            })),
        }
    }
}

/// Resolves nothing; lets a run proceed from the cache alone.
#[derive(Default)]
pub struct OfflineGeocoder;

#[async_trait]
impl Geocoder for OfflineGeocoder {
    async fn geocode(&self, _query: &str) -> AppResult<Option<GeocodeCandidate>> {
        Ok(None)
    }

    fn is_remote(&self) -> bool {
        false
    }
}
