use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CacheStatistics;
use crate::errors::AppResult;
use crate::events::{EventSink, RunEvent};
use crate::ingestion::{account_rows, reference_rows, AccountRow, ReferenceRow, Table};
use crate::report::{write_report, ReportRow};
use crate::resolver::{GeoResolver, ResolverCounters};
use crate::spatial::{MatchOutcome, ReferenceLocation};

const PROGRESS_EVERY: usize = 20;

#[derive(Debug, Clone)]
pub struct BatchInputs {
    pub references: PathBuf,
    pub accounts: PathBuf,
    pub report: PathBuf,
    pub radius_meters: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub references_total: usize,
    pub references_indexed: usize,
    pub accounts_total: usize,
    pub duplicates_removed: usize,
    pub processed: usize,
    pub matched: usize,
    pub unresolved: usize,
    pub cancelled: bool,
    pub statistics: CacheStatistics,
    pub counters: ResolverCounters,
    pub report_path: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct MatchTally {
    processed: usize,
    matched: usize,
    unresolved: usize,
    cancelled: bool,
}

/// Runs one full pass: read both files, index references, match every account,
/// save the cache and write the report. Unreadable inputs and an unwritable
/// report abort the run; anything that goes wrong per address does not.
pub async fn run_batch(
    resolver: &mut GeoResolver,
    inputs: &BatchInputs,
    events: &EventSink,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> AppResult<BatchSummary> {
    events.stage("reading input files");
    let (accounts, duplicates_removed) = account_rows(Table::read(&inputs.accounts)?)?;
    if duplicates_removed > 0 {
        info!(target: "batch", duplicates_removed, "duplicate accounts dropped");
        events.emit(RunEvent::DuplicatesRemoved {
            count: duplicates_removed,
        });
    }
    let (references_indexed, references_total) =
        index_references(resolver, &inputs.references, events, cancel_flag.as_deref()).await?;

    events.stage("matching accounts");
    let accounts_total = accounts.len();
    let (rows, tally) = match_accounts(
        resolver,
        &accounts,
        inputs.radius_meters,
        events,
        cancel_flag.as_deref(),
    )
    .await;

    let mut warnings = Vec::new();
    if let Err(err) = resolver.finish() {
        warn!(target: "batch", error = %err, "final cache save failed");
        warnings.push(format!("cache was not saved: {err}"));
    }

    events.stage("writing report");
    write_report(&inputs.report, &rows)?;
    info!(
        target: "batch",
        report = %inputs.report.display(),
        rows = rows.len(),
        matched = tally.matched,
        "report written"
    );

    Ok(BatchSummary {
        references_total,
        references_indexed,
        accounts_total,
        duplicates_removed,
        processed: tally.processed,
        matched: tally.matched,
        unresolved: tally.unresolved,
        cancelled: tally.cancelled,
        statistics: resolver.statistics(),
        counters: resolver.counters(),
        report_path: inputs.report.clone(),
        warnings,
    })
}

/// Geocodes every reference row and installs the result as the resolver's
/// spatial index. Returns `(indexed, total)`.
pub async fn index_references(
    resolver: &mut GeoResolver,
    path: &Path,
    events: &EventSink,
    cancel_flag: Option<&AtomicBool>,
) -> AppResult<(usize, usize)> {
    let references = reference_rows(&Table::read(path)?)?;
    events.stage("mapping reference locations");
    let total = references.len();
    let locations = geocode_references(resolver, references, cancel_flag).await;
    let indexed = locations.len();
    if !resolver.build_index(locations) {
        warn!(
            target: "batch",
            "no reference location resolved; every account will be unidentified"
        );
    }
    events.emit(RunEvent::ReferencesIndexed {
        resolved: indexed,
        total,
    });
    Ok((indexed, total))
}

async fn geocode_references(
    resolver: &mut GeoResolver,
    references: Vec<ReferenceRow>,
    cancel_flag: Option<&AtomicBool>,
) -> Vec<ReferenceLocation> {
    let mut locations = Vec::with_capacity(references.len());
    for reference in references {
        if is_cancelled(cancel_flag) {
            break;
        }
        if reference.address.trim().is_empty() {
            continue;
        }
        match resolver.resolve(&reference.address).await {
            Some(record) => locations.push(ReferenceLocation::new(
                reference.label,
                reference.display_name,
                record.latitude,
                record.longitude,
            )),
            None => warn!(
                target: "batch",
                address = %reference.address,
                "reference location could not be geocoded"
            ),
        }
    }
    locations
}

async fn match_accounts(
    resolver: &mut GeoResolver,
    accounts: &[AccountRow],
    radius_meters: f64,
    events: &EventSink,
    cancel_flag: Option<&AtomicBool>,
) -> (Vec<ReportRow>, MatchTally) {
    let total = accounts.len();
    let mut rows = Vec::with_capacity(total);
    let mut tally = MatchTally::default();

    for account in accounts {
        if is_cancelled(cancel_flag) {
            tally.cancelled = true;
            info!(target: "batch", processed = tally.processed, total, "run cancelled");
            events.emit(RunEvent::Cancelled {
                processed: tally.processed,
            });
            break;
        }

        let record = if account.address.trim().is_empty() {
            debug!(target: "batch", meter_id = %account.meter_id, "blank account address");
            None
        } else {
            resolver.resolve(&account.address).await
        };
        let outcome = match &record {
            Some(record) => resolver.nearest(record.latitude, record.longitude, radius_meters),
            None => {
                tally.unresolved += 1;
                MatchOutcome::unidentified(f64::INFINITY)
            }
        };
        if outcome.is_identified() {
            tally.matched += 1;
        }
        rows.push(ReportRow::from_resolution(account, record.as_ref(), &outcome));

        tally.processed += 1;
        if tally.processed % PROGRESS_EVERY == 0 || tally.processed == total {
            events.emit(RunEvent::Progress {
                processed: tally.processed,
                total,
                matched: tally.matched,
            });
        }
    }
    (rows, tally)
}

fn is_cancelled(flag: Option<&AtomicBool>) -> bool {
    flag.map(|f| f.load(Ordering::SeqCst)).unwrap_or(false)
}
