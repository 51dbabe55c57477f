use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::tempdir;

use address_geomatch::geocoder::{AddressComponent, GeocodeCandidate};
use address_geomatch::report::default_report_name;
use address_geomatch::spatial::{NOT_IDENTIFIED, NO_LOCATION_REGISTERED};
use address_geomatch::{
    run_batch, AppResult, BatchInputs, EventSink, GeoResolver, GeocodeCache, Geocoder,
    GeocoderService, OperatingMode, ResolverSettings, RunEvent,
};

const SCHOOL: (f64, f64) = (-23.5505, -46.6333);
const METERS_PER_DEGREE: f64 = 111_194.93;

struct FakeGeocoder {
    points: Mutex<HashMap<String, (f64, f64)>>,
    calls: AtomicUsize,
}

impl FakeGeocoder {
    fn new() -> Self {
        let north = |meters: f64| (SCHOOL.0 + meters / METERS_PER_DEGREE, SCHOOL.1);
        let points = [
            ("AV. PAULISTA, 1000, CAMPINAS, BRASIL", SCHOOL),
            ("RUA AUGUSTA, 30, CAMPINAS, BRASIL", north(30.0)),
            ("RUA DA CONSOLAÇÃO, 80, CAMPINAS, BRASIL", north(80.0)),
        ]
        .into_iter()
        .map(|(query, point)| (query.to_string(), point))
        .collect();
        Self {
            points: Mutex::new(points),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.points.lock().get(query).map(|&(latitude, longitude)| {
            GeocodeCandidate {
                latitude,
                longitude,
                components: vec![
                    AddressComponent::new(query.split(',').next().unwrap_or_default(), &["route"]),
                    AddressComponent::new("Campinas", &["administrative_area_level_2"]),
                ],
            }
        }))
    }
}

fn resolver(cache: &Path, geocoder: Arc<FakeGeocoder>, events: EventSink) -> GeoResolver {
    GeoResolver::new(
        GeocodeCache::open(cache),
        GeocoderService::from_geocoder(geocoder),
        ResolverSettings {
            home_locality: "Campinas".into(),
            operating_mode: OperatingMode::State,
            country_qualifier: "BRASIL".into(),
            checkpoint_interval: 20,
            min_call_interval: Duration::ZERO,
        },
        events,
    )
}

#[tokio::test]
async fn reference_and_two_accounts_end_to_end() {
    let dir = tempdir().unwrap();
    let references = dir.path().join("references.csv");
    fs::write(
        &references,
        "department,location,address\nEDUCATION,Escola Central,\"Av. Paulista, 1000\"\n",
    )
    .unwrap();
    let accounts = dir.path().join("accounts.csv");
    // Latin-1 encoded, semicolon separated
    let mut latin1 = b"ENDERECO;MEDIDOR;TIPO\nRua Augusta, 30;A-1;agua\n".to_vec();
    latin1.extend_from_slice(b"Rua da Consola\xe7\xe3o, 80;A-2;energia\n");
    fs::write(&accounts, latin1).unwrap();

    let cache_path = dir.path().join("cache.json");
    let report = dir
        .path()
        .join(default_report_name(OperatingMode::State, "Campinas"));
    let inputs = BatchInputs {
        references,
        accounts,
        report: report.clone(),
        radius_meters: 50.0,
    };

    let geocoder = Arc::new(FakeGeocoder::new());
    let (events, mut receiver) = EventSink::channel();
    let mut first = resolver(&cache_path, geocoder.clone(), events.clone());
    let summary = run_batch(&mut first, &inputs, &events, None).await.unwrap();

    assert_eq!(summary.references_indexed, 1);
    assert_eq!(summary.accounts_total, 2);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);
    assert!(report.ends_with("report_STATE_Campinas.csv"));

    let mut reader = csv::Reader::from_path(&report).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][0], "EDUCATION");
    assert_eq!(&rows[0][1], "Escola Central");
    assert_eq!(&rows[0][2], "A-1");
    assert_eq!(&rows[0][3], "AGUA");
    assert_eq!(&rows[0][8], "CAMPINAS");
    assert_eq!(&rows[1][0], NOT_IDENTIFIED);
    assert_eq!(&rows[1][1], NO_LOCATION_REGISTERED);
    assert_eq!(&rows[1][4], "RUA DA CONSOLAÇÃO");

    let mut saw_cache_status = false;
    while let Ok(event) = receiver.try_recv() {
        if let RunEvent::CacheStatus { statistics } = event {
            saw_cache_status = statistics.size == 3;
        }
    }
    assert!(saw_cache_status);

    // a second run is served entirely from the saved cache
    drop(first);
    let mut second = resolver(&cache_path, geocoder.clone(), EventSink::disabled());
    let again = run_batch(&mut second, &inputs, &EventSink::disabled(), None)
        .await
        .unwrap();
    assert_eq!(again.matched, 1);
    assert_eq!(again.counters.cache_hits, 3);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);
}
