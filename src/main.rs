use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use address_geomatch::report::default_report_name;
use address_geomatch::{
    index_references, init_tracing, run_batch, AppConfig, BatchInputs, EventSink, GeoResolver,
    GeocodeCache, GeocoderService, OperatingMode, ResolverSettings, RunEvent,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "address-geomatch")]
#[command(about = "Geocode addresses and match them to reference locations", long_about = None)]
struct Cli {
    /// Geocode cache file (defaults to CACHE_FILE_NAME)
    #[arg(long, global = true, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// Home locality used for address context and cache partitioning
    #[arg(long, global = true)]
    locality: Option<String>,

    /// Operating mode: MUNICIPAL or STATE
    #[arg(long, global = true)]
    mode: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode both files, match accounts to references and write the report
    Run {
        /// Reference locations file
        #[arg(value_name = "REFERENCES")]
        references: PathBuf,

        /// Accounts file
        #[arg(value_name = "ACCOUNTS")]
        accounts: PathBuf,

        /// Report file (defaults to report_<MODE>_<LOCALITY>.csv)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Match radius in meters
        #[arg(short, long)]
        radius: Option<f64>,
    },
    /// Show cache size and the estimated geocoding cost it saves
    Stats,
    /// Resolve a single address
    Resolve {
        address: String,

        /// Reference locations file to match the address against
        #[arg(long, value_name = "FILE")]
        references: Option<PathBuf>,

        /// Match radius in meters
        #[arg(short, long)]
        radius: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(locality) = &cli.locality {
        config.home_locality = locality.trim().to_uppercase();
    }
    if let Some(mode) = &cli.mode {
        config.operating_mode = OperatingMode::parse(mode)?;
        config.invalid_operating_mode = None;
    }
    config.validate()?;
    let cache_path = cli
        .cache
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.cache_file_name));

    match cli.command {
        Commands::Run {
            references,
            accounts,
            output,
            radius,
        } => {
            let output = output.unwrap_or_else(|| {
                PathBuf::from(default_report_name(
                    config.operating_mode,
                    &config.home_locality,
                ))
            });
            let inputs = BatchInputs {
                references,
                accounts,
                report: output,
                radius_meters: radius.unwrap_or(config.match_radius_meters),
            };
            run(&config, cache_path, inputs).await
        }
        Commands::Stats => {
            let mut cache = GeocodeCache::open(&cache_path);
            cache.set_context(&config.home_locality);
            let statistics = cache.statistics();
            let report = json!({
                "cache": cache_path.display().to_string(),
                "statistics": statistics,
                "estimated_savings": statistics.estimated_savings(config.geocoder_cost_per_request),
                "config": config.public_profile(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Resolve {
            address,
            references,
            radius,
        } => {
            let events = EventSink::disabled();
            let mut resolver = build_resolver(&config, &cache_path, events.clone())?;
            if let Some(path) = &references {
                index_references(&mut resolver, path, &events, None)
                    .await
                    .with_context(|| format!("failed to index {}", path.display()))?;
            }
            let record = resolver.resolve(&address).await;
            let outcome = record.as_ref().map(|r| {
                resolver.nearest(
                    r.latitude,
                    r.longitude,
                    radius.unwrap_or(config.match_radius_meters),
                )
            });
            if let Err(err) = resolver.finish() {
                warn!(error = %err, "cache was not saved");
            }
            let report = json!({
                "query": resolver.normalize(&address),
                "record": record,
                "match": outcome,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn run(config: &AppConfig, cache_path: PathBuf, inputs: BatchInputs) -> Result<()> {
    let (events, mut receiver) = EventSink::channel();
    let mut resolver = build_resolver(config, &cache_path, events.clone())?;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = cancel_flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current address");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let worker = tokio::spawn(async move {
        run_batch(&mut resolver, &inputs, &events, Some(cancel_flag)).await
    });
    while let Some(event) = receiver.recv().await {
        log_event(&event);
    }
    let summary = worker
        .await
        .context("batch worker stopped unexpectedly")?
        .context("batch run failed")?;

    for warning in &summary.warnings {
        warn!("{warning}");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn build_resolver(
    config: &AppConfig,
    cache_path: &Path,
    events: EventSink,
) -> Result<GeoResolver> {
    let geocoder = GeocoderService::new(config).context("failed to build geocoder client")?;
    Ok(GeoResolver::new(
        GeocodeCache::open(cache_path),
        geocoder,
        ResolverSettings::from_config(config),
        events,
    ))
}

fn log_event(event: &RunEvent) {
    match event {
        RunEvent::Stage { message } => info!("{message}"),
        RunEvent::DuplicatesRemoved { count } => info!(count, "duplicate accounts removed"),
        RunEvent::ReferencesIndexed { resolved, total } => {
            info!(resolved, total, "reference locations indexed")
        }
        RunEvent::Progress {
            processed,
            total,
            matched,
        } => info!(processed, total, matched, "progress"),
        RunEvent::CheckpointSaved { entries } => info!(entries, "cache checkpoint saved"),
        RunEvent::PersistFailed { reason } => warn!(%reason, "cache save failed"),
        RunEvent::CacheStatus { statistics } => info!(
            size = statistics.size,
            hits = statistics.hits,
            misses = statistics.misses,
            hit_rate = statistics.hit_rate,
            "cache status"
        ),
        RunEvent::Cancelled { processed } => warn!(processed, "run cancelled"),
    }
}
