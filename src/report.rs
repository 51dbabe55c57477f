use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::OperatingMode;
use crate::errors::{AppError, AppResult};
use crate::geocoder::{GeoRecord, NO_NUMBER};
use crate::ingestion::AccountRow;
use crate::refiner::refine_street_field;
use crate::spatial::MatchOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub department: String,
    pub location: String,
    pub meter_id: String,
    pub service_type: String,
    pub street: String,
    pub house_number: String,
    pub neighborhood: String,
    pub postal_code: String,
    pub city: String,
    pub distance_meters: Option<f64>,
}

impl ReportRow {
    /// Geocoder fields win over the raw account text; a street that still
    /// carries `", number"` fragments goes through the refinement stage.
    pub fn from_resolution(
        account: &AccountRow,
        record: Option<&GeoRecord>,
        outcome: &MatchOutcome,
    ) -> Self {
        let mut row = ReportRow {
            department: outcome.label.clone(),
            location: outcome.display_name.clone(),
            meter_id: account.meter_id.clone(),
            service_type: account.service_type.clone(),
            street: account.address.clone(),
            house_number: NO_NUMBER.to_string(),
            neighborhood: String::new(),
            postal_code: String::new(),
            city: String::new(),
            distance_meters: outcome
                .distance_meters
                .is_finite()
                .then_some(round_meters(outcome.distance_meters)),
        };

        if let Some(record) = record {
            if !record.street.is_empty() {
                row.street = record.street.clone();
            }
            row.house_number = record.house_number.clone();
            row.neighborhood = record.neighborhood.clone();
            row.postal_code = record.postal_code.clone();
            row.city = record.city.clone();
        }

        if let Some(refined) = refine_street_field(&row.street) {
            row.street = refined.street;
            row.house_number = refined.house_number;
            row.neighborhood = refined.neighborhood;
        }
        row
    }
}

pub fn default_report_name(mode: OperatingMode, locality: &str) -> String {
    format!("report_{}_{}.csv", mode.as_str(), locality.trim()).replace(' ', "_")
}

pub fn write_report<P: AsRef<Path>>(path: P, rows: &[ReportRow]) -> AppResult<()> {
    let path = path.as_ref();
    let unwritable = |err: &dyn std::fmt::Display| {
        AppError::Path(format!("cannot write {}: {err}", path.display()))
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| unwritable(&err))?;
        }
    }
    let mut writer = csv::Writer::from_path(path).map_err(|err| unwritable(&err))?;
    for row in rows {
        writer.serialize(row).map_err(|err| unwritable(&err))?;
    }
    writer.flush().map_err(|err| unwritable(&err))?;
    Ok(())
}

fn round_meters(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
