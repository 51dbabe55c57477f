use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheStatistics, GeocodeCache};
use crate::config::{AppConfig, OperatingMode};
use crate::errors::AppResult;
use crate::events::{EventSink, RunEvent};
use crate::geocoder::{GeoRecord, GeocoderService};
use crate::normalizer::AddressNormalizer;
use crate::spatial::{MatchOutcome, ReferenceLocation, SpatialIndex};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub home_locality: String,
    pub operating_mode: OperatingMode,
    pub country_qualifier: String,
    pub checkpoint_interval: usize,
    pub min_call_interval: Duration,
}

impl ResolverSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            home_locality: config.home_locality.clone(),
            operating_mode: config.operating_mode,
            country_qualifier: config.country_qualifier.clone(),
            checkpoint_interval: config.checkpoint_interval.max(1),
            min_call_interval: Duration::from_millis(config.geocoder_min_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResolverCounters {
    pub cache_hits: usize,
    pub geocoder_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub checkpoints: usize,
    pub persist_failures: usize,
}

/// Single-worker resolution state: cache, checkpoint bookkeeping and the
/// reference index all live here and are mutated through `&mut self`.
pub struct GeoResolver {
    cache: GeocodeCache,
    normalizer: AddressNormalizer,
    geocoder: GeocoderService,
    home_locality: String,
    mode: OperatingMode,
    checkpoint_interval: usize,
    pending_since_checkpoint: usize,
    pacer: CallPacer,
    index: SpatialIndex,
    events: EventSink,
    counters: ResolverCounters,
}

impl GeoResolver {
    pub fn new(
        mut cache: GeocodeCache,
        geocoder: GeocoderService,
        settings: ResolverSettings,
        events: EventSink,
    ) -> Self {
        let home_locality = settings.home_locality.trim().to_uppercase();
        cache.set_context(&home_locality);
        info!(
            target: "geo_resolver",
            locality = %home_locality,
            mode = %settings.operating_mode,
            cached = cache.len(),
            "geo resolver ready"
        );
        Self {
            normalizer: AddressNormalizer::new(&home_locality, &settings.country_qualifier),
            cache,
            geocoder,
            home_locality,
            mode: settings.operating_mode,
            checkpoint_interval: settings.checkpoint_interval.max(1),
            pending_since_checkpoint: 0,
            pacer: CallPacer::new(settings.min_call_interval),
            index: SpatialIndex::default(),
            events,
            counters: ResolverCounters::default(),
        }
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache.path().to_path_buf()
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    pub fn counters(&self) -> ResolverCounters {
        self.counters
    }

    pub fn pending_since_checkpoint(&self) -> usize {
        self.pending_since_checkpoint
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn home_locality(&self) -> &str {
        &self.home_locality
    }

    pub fn normalize(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    /// Resolves one address. Every failure is absorbed into `None` so a batch
    /// keeps going; geocoder errors are never retried.
    pub async fn resolve(&mut self, raw: &str) -> Option<GeoRecord> {
        let query = self.normalizer.normalize(raw);
        if let Some(record) = self.cache.lookup(&query) {
            self.counters.cache_hits += 1;
            self.counters.resolved += 1;
            trace!(target: "geo_resolver", %query, "cache hit");
            return Some(record);
        }

        let remote = self.geocoder.is_remote();
        if remote {
            self.pacer.wait().await;
            self.counters.geocoder_calls += 1;
        }
        let response = self.geocoder.geocode(&query).await;
        if remote {
            self.pacer.mark();
        }

        match response {
            Ok(Some(candidate)) => {
                let record = GeoRecord::from_candidate(&candidate, self.mode, &self.home_locality);
                self.cache.insert_with_origin(&query, raw, record.clone());
                self.pending_since_checkpoint += 1;
                if self.pending_since_checkpoint >= self.checkpoint_interval {
                    self.checkpoint();
                }
                self.counters.resolved += 1;
                Some(record)
            }
            Ok(None) => {
                debug!(target: "geo_resolver", %query, "geocoder returned no result");
                self.counters.unresolved += 1;
                None
            }
            Err(err) => {
                warn!(
                    target: "geo_resolver",
                    %query,
                    error = %err,
                    class = ?err.class(),
                    "geocode failed; address left unresolved"
                );
                self.counters.unresolved += 1;
                None
            }
        }
    }

    /// Persists the cache now. Failures are logged and announced but never propagated.
    pub fn checkpoint(&mut self) {
        self.pending_since_checkpoint = 0;
        match self.cache.persist() {
            Ok(()) => {
                self.counters.checkpoints += 1;
                debug!(
                    target: "geo_resolver",
                    entries = self.cache.len(),
                    "cache checkpoint written"
                );
                self.events.emit(RunEvent::CheckpointSaved {
                    entries: self.cache.len(),
                });
            }
            Err(err) => {
                self.counters.persist_failures += 1;
                warn!(
                    target: "geo_resolver",
                    error = %err,
                    "cache checkpoint failed; continuing without saving"
                );
                self.events.emit(RunEvent::PersistFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Final save at the end of a run. The caller decides how to surface a failure.
    pub fn finish(&mut self) -> AppResult<()> {
        self.pending_since_checkpoint = 0;
        let result = self.cache.persist();
        match &result {
            Ok(()) => {
                self.events.emit(RunEvent::CacheStatus {
                    statistics: self.cache.statistics(),
                });
            }
            Err(err) => {
                self.counters.persist_failures += 1;
                self.events.emit(RunEvent::PersistFailed {
                    reason: err.to_string(),
                });
            }
        }
        result
    }

    /// Replaces the reference index. Returns whether any location was indexed.
    pub fn build_index(&mut self, locations: Vec<ReferenceLocation>) -> bool {
        self.index = SpatialIndex::build(locations);
        !self.index.is_absent()
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn nearest(&self, latitude: f64, longitude: f64, radius_meters: f64) -> MatchOutcome {
        self.index.nearest(latitude, longitude, radius_meters)
    }
}

/// Keeps at least `min_interval` between the end of one geocoder call and the
/// start of the next.
struct CallPacer {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl CallPacer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    async fn wait(&self) {
        if let Some(prev) = self.last_call {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
    }

    fn mark(&mut self) {
        self.last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::errors::AppError;
    use crate::geocoder::{AddressComponent, GeocodeCandidate, Geocoder, NO_NUMBER};

    struct TestGeocoder {
        responses: Mutex<HashMap<String, Result<Option<GeocodeCandidate>, String>>>,
        calls: AtomicUsize,
    }

    impl TestGeocoder {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn respond(&self, query: &str, response: Result<Option<GeocodeCandidate>, String>) {
            self.responses.lock().insert(query.to_string(), response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for TestGeocoder {
        async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().get(query) {
                Some(Ok(candidate)) => Ok(candidate.clone()),
                Some(Err(message)) => Err(AppError::Geocoder(message.clone())),
                None => Ok(Some(GeocodeCandidate {
                    latitude: -20.8,
                    longitude: -49.4,
                    components: vec![AddressComponent::new(query, &["route"])],
                })),
            }
        }
    }

    fn settings(mode: OperatingMode) -> ResolverSettings {
        ResolverSettings {
            home_locality: "Sao Jose do Rio Preto".into(),
            operating_mode: mode,
            country_qualifier: "BRASIL".into(),
            checkpoint_interval: 20,
            min_call_interval: Duration::ZERO,
        }
    }

    fn resolver_with(
        geocoder: Arc<TestGeocoder>,
        cache_path: PathBuf,
        mode: OperatingMode,
    ) -> GeoResolver {
        GeoResolver::new(
            GeocodeCache::open(cache_path),
            GeocoderService::from_geocoder(geocoder),
            settings(mode),
            EventSink::disabled(),
        )
    }

    #[tokio::test]
    async fn uses_cache_before_geocoder() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(TestGeocoder::new());
        let mut resolver = resolver_with(
            geocoder.clone(),
            dir.path().join("cache.json"),
            OperatingMode::Municipal,
        );

        let first = resolver.resolve("Rua A, 10").await.unwrap();
        let second = resolver.resolve("  rua a, 10 ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(geocoder.calls(), 1);

        let counters = resolver.counters();
        assert_eq!(counters.cache_hits, 1);
        assert_eq!(counters.geocoder_calls, 1);
        let stats = resolver.statistics();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn absorbs_geocoder_failures_without_caching() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(TestGeocoder::new());
        geocoder.respond(
            "RUA QUEBRADA, SAO JOSE DO RIO PRETO, BRASIL",
            Err("OVER_QUERY_LIMIT".into()),
        );
        geocoder.respond("RUA NENHUMA, SAO JOSE DO RIO PRETO, BRASIL", Ok(None));
        let mut resolver = resolver_with(
            geocoder.clone(),
            dir.path().join("cache.json"),
            OperatingMode::Municipal,
        );

        assert!(resolver.resolve("rua quebrada").await.is_none());
        assert!(resolver.resolve("rua nenhuma").await.is_none());
        assert!(resolver.resolve("rua quebrada").await.is_none());
        assert!(resolver.resolve("rua boa").await.is_some());

        assert_eq!(geocoder.calls(), 4);
        assert_eq!(resolver.counters().unresolved, 3);
        assert_eq!(resolver.cache().len(), 1);
    }

    #[tokio::test]
    async fn checkpoints_every_twenty_new_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let (events, mut receiver) = EventSink::channel();
        let mut resolver = GeoResolver::new(
            GeocodeCache::open(&path),
            GeocoderService::from_geocoder(Arc::new(TestGeocoder::new())),
            settings(OperatingMode::State),
            events,
        );

        for i in 0..19 {
            resolver.resolve(&format!("Rua {i}")).await.unwrap();
        }
        // cache hits never count toward a checkpoint
        resolver.resolve("Rua 0").await.unwrap();
        assert!(!path.exists());
        assert_eq!(resolver.pending_since_checkpoint(), 19);

        resolver.resolve("Rua 19").await.unwrap();
        assert!(path.exists());
        assert_eq!(resolver.pending_since_checkpoint(), 0);
        assert_eq!(GeocodeCache::open(&path).len(), 20);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            RunEvent::CheckpointSaved { entries: 20 }
        ));

        resolver.resolve("Rua 20").await.unwrap();
        assert_eq!(GeocodeCache::open(&path).len(), 20);
        resolver.finish().unwrap();
        assert_eq!(GeocodeCache::open(&path).len(), 21);
    }

    #[tokio::test]
    async fn checkpoint_failure_does_not_stop_resolution() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let (events, mut receiver) = EventSink::channel();
        let mut settings = settings(OperatingMode::State);
        settings.checkpoint_interval = 2;
        let mut resolver = GeoResolver::new(
            GeocodeCache::open(blocker.join("cache.json")),
            GeocoderService::from_geocoder(Arc::new(TestGeocoder::new())),
            settings,
            events,
        );

        for i in 0..3 {
            assert!(resolver.resolve(&format!("Rua {i}")).await.is_some());
        }
        assert_eq!(resolver.counters().persist_failures, 1);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            RunEvent::PersistFailed { .. }
        ));
        assert!(resolver.finish().is_err());
    }

    #[tokio::test]
    async fn keeps_raw_text_and_mode_defaults() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(TestGeocoder::new());
        geocoder.respond(
            "AV. BRASIL, SAO JOSE DO RIO PRETO",
            Ok(Some(GeocodeCandidate {
                latitude: 1.0,
                longitude: 2.0,
                components: vec![AddressComponent::new("Avenida Brasil", &["route"])],
            })),
        );
        let mut resolver = resolver_with(
            geocoder,
            dir.path().join("cache.json"),
            OperatingMode::Municipal,
        );

        // "BRASIL" is already in the street name, so no country suffix is added
        let record = resolver.resolve(" av. brasil").await.unwrap();
        assert_eq!(record.street, "AVENIDA BRASIL");
        assert_eq!(record.house_number, NO_NUMBER);
        assert_eq!(record.city, "SAO JOSE DO RIO PRETO");

        let entry = resolver
            .cache()
            .entry("AV. BRASIL, SAO JOSE DO RIO PRETO")
            .unwrap();
        assert_eq!(entry.original_address, " av. brasil");
        assert_eq!(entry.context, "SAO JOSE DO RIO PRETO");
    }

    #[tokio::test]
    async fn answers_nearest_queries_from_built_index() {
        let dir = tempdir().unwrap();
        let mut resolver = resolver_with(
            Arc::new(TestGeocoder::new()),
            dir.path().join("cache.json"),
            OperatingMode::State,
        );
        assert!(!resolver.nearest(0.0, 0.0, 50.0).is_identified());
        assert!(!resolver.build_index(Vec::new()));

        assert!(resolver.build_index(vec![ReferenceLocation::new(
            "HEALTH", "Clinic", -20.8, -49.4
        )]));
        let outcome = resolver.nearest(-20.8, -49.4, 50.0);
        assert_eq!(outcome.label, "HEALTH");
        assert_eq!(outcome.distance_meters, 0.0);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_calls() {
        let mut pacer = CallPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait().await;
            pacer.mark();
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    struct SlowGeocoder {
        latency: Duration,
        windows: Mutex<Vec<(Instant, Instant)>>,
    }

    #[async_trait]
    impl Geocoder for SlowGeocoder {
        async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeCandidate>> {
            let started = Instant::now();
            sleep(self.latency).await;
            self.windows.lock().push((started, Instant::now()));
            Ok(Some(GeocodeCandidate {
                latitude: 0.0,
                longitude: 0.0,
                components: vec![AddressComponent::new(query, &["route"])],
            }))
        }
    }

    #[tokio::test]
    async fn waits_after_slow_calls_return() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(SlowGeocoder {
            latency: Duration::from_millis(200),
            windows: Mutex::new(Vec::new()),
        });
        let mut settings = settings(OperatingMode::State);
        settings.min_call_interval = Duration::from_millis(150);
        let mut resolver = GeoResolver::new(
            GeocodeCache::open(dir.path().join("cache.json")),
            GeocoderService::from_geocoder(geocoder.clone()),
            settings,
            EventSink::disabled(),
        );

        resolver.resolve("Rua Lenta 1").await.unwrap();
        resolver.resolve("Rua Lenta 2").await.unwrap();

        let windows = geocoder.windows.lock();
        assert_eq!(windows.len(), 2);
        let gap = windows[1].0.duration_since(windows[0].1);
        assert!(gap >= Duration::from_millis(140), "gap was {gap:?}");
    }
}
