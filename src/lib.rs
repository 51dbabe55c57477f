pub mod batch;
pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod geocoder;
pub mod ingestion;
pub mod normalizer;
pub mod refiner;
pub mod report;
pub mod resolver;
pub mod spatial;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use batch::{index_references, run_batch, BatchInputs, BatchSummary};
pub use cache::{CacheStatistics, GeocodeCache};
pub use config::{AppConfig, OperatingMode};
pub use errors::{AppError, AppResult, FailureClass};
pub use events::{EventSink, RunEvent};
pub use geocoder::{GeoRecord, Geocoder, GeocoderService};
pub use normalizer::AddressNormalizer;
pub use refiner::{refine, refine_street_field, RefinedAddress};
pub use resolver::{GeoResolver, ResolverSettings};
pub use spatial::{MatchOutcome, ReferenceLocation, SpatialIndex};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_geomatch=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
