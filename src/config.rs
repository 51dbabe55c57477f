use std::fmt;
use std::{env, io};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::spatial::DEFAULT_MATCH_RADIUS_METERS;

pub const DEFAULT_GEOCODER_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_COUNTRY_QUALIFIER: &str = "BRASIL";
const DEFAULT_HOME_LOCALITY: &str = "SAO JOSE DO RIO PRETO";
const DEFAULT_CACHE_FILE_NAME: &str = "geocode_cache.json";
const DEFAULT_CHECKPOINT_INTERVAL: usize = 20;
const DEFAULT_MIN_INTERVAL_MS: u64 = 150;
const DEFAULT_COST_PER_REQUEST: f64 = 0.029;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Municipal,
    State,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Municipal => "MUNICIPAL",
            OperatingMode::State => "STATE",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MUNICIPAL" => Ok(OperatingMode::Municipal),
            "STATE" | "ESTADUAL" => Ok(OperatingMode::State),
            _ => Err(AppError::Config(format!("invalid operating mode: {value}"))),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_endpoint: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_min_interval_ms: u64,
    pub geocoder_cost_per_request: f64,
    pub home_locality: String,
    pub operating_mode: OperatingMode,
    /// Raw `OPERATING_MODE` value that failed to parse; rejected by [`AppConfig::validate`].
    pub invalid_operating_mode: Option<String>,
    pub country_qualifier: String,
    pub cache_file_name: String,
    pub checkpoint_interval: usize,
    pub match_radius_meters: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_min_interval_ms: u64,
    pub home_locality: String,
    pub operating_mode: OperatingMode,
    pub country_qualifier: String,
    pub cache_file_name: String,
    pub checkpoint_interval: usize,
    pub match_radius_meters: f64,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let (operating_mode, invalid_operating_mode) =
            operating_mode_from(env::var("OPERATING_MODE").ok().as_deref());
        Self {
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", 10).max(1),
            geocoder_min_interval_ms: parse_u64(
                "GEOCODER_MIN_INTERVAL_MS",
                DEFAULT_MIN_INTERVAL_MS,
            ),
            geocoder_cost_per_request: parse_f64(
                "GEOCODER_COST_PER_REQUEST",
                DEFAULT_COST_PER_REQUEST,
            ),
            home_locality: env::var("HOME_LOCALITY")
                .map(|v| v.trim().to_uppercase())
                .unwrap_or_else(|_| DEFAULT_HOME_LOCALITY.to_string()),
            operating_mode,
            invalid_operating_mode,
            country_qualifier: env::var("COUNTRY_QUALIFIER")
                .map(|v| v.trim().to_uppercase())
                .unwrap_or_else(|_| DEFAULT_COUNTRY_QUALIFIER.to_string()),
            cache_file_name: env::var("CACHE_FILE_NAME")
                .unwrap_or_else(|_| DEFAULT_CACHE_FILE_NAME.to_string()),
            checkpoint_interval: parse_usize("CHECKPOINT_INTERVAL", DEFAULT_CHECKPOINT_INTERVAL)
                .max(1),
            match_radius_meters: parse_f64("MATCH_RADIUS_METERS", DEFAULT_MATCH_RADIUS_METERS),
        }
    }

    /// Defaults with no environment lookups, used as a base by tests and embedders.
    pub fn defaults() -> Self {
        Self {
            geocoder_api_key: None,
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            geocoder_timeout_secs: 10,
            geocoder_min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            geocoder_cost_per_request: DEFAULT_COST_PER_REQUEST,
            home_locality: DEFAULT_HOME_LOCALITY.to_string(),
            operating_mode: OperatingMode::Municipal,
            invalid_operating_mode: None,
            country_qualifier: DEFAULT_COUNTRY_QUALIFIER.to_string(),
            cache_file_name: DEFAULT_CACHE_FILE_NAME.to_string(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            match_radius_meters: DEFAULT_MATCH_RADIUS_METERS,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(raw) = &self.invalid_operating_mode {
            return Err(AppError::Config(format!("invalid operating mode: {raw}")));
        }
        if self.home_locality.trim().is_empty() {
            return Err(AppError::Config("home locality must not be empty".into()));
        }
        if !self.match_radius_meters.is_finite() || self.match_radius_meters < 0.0 {
            return Err(AppError::Config(format!(
                "invalid match radius: {}",
                self.match_radius_meters
            )));
        }
        Ok(())
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_min_interval_ms: self.geocoder_min_interval_ms,
            home_locality: self.home_locality.clone(),
            operating_mode: self.operating_mode,
            country_qualifier: self.country_qualifier.clone(),
            cache_file_name: self.cache_file_name.clone(),
            checkpoint_interval: self.checkpoint_interval,
            match_radius_meters: self.match_radius_meters,
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

/// Unset or blank means `Municipal`; anything unparseable is kept for `validate` to reject.
fn operating_mode_from(raw: Option<&str>) -> (OperatingMode, Option<String>) {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => (OperatingMode::Municipal, None),
        Some(value) => match OperatingMode::parse(value) {
            Ok(mode) => (mode, None),
            Err(_) => (OperatingMode::Municipal, Some(value.to_string())),
        },
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
