use std::collections::HashSet;
use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

pub const REFERENCE_ADDRESS_COLUMNS: &[&str] = &[
    "ENDERECO_COMPLETO",
    "ENDERECO",
    "LOGRADOURO",
    "FULL_ADDRESS",
    "ADDRESS",
];
pub const REFERENCE_NAME_COLUMNS: &[&str] = &["LOCALIDADE", "NOME", "UNIDADE", "LOCATION", "NAME"];
pub const REFERENCE_LABEL_COLUMNS: &[&str] = &["SECRETARIA", "SETOR", "DEPARTMENT"];
pub const ACCOUNT_ADDRESS_COLUMNS: &[&str] =
    &["ENDERECO_CONTA", "ENDERECO", "ACCOUNT_ADDRESS", "ADDRESS"];
pub const ACCOUNT_ID_COLUMNS: &[&str] = &["ID_MEDIDOR", "MEDIDOR", "INSTALACAO", "METER_ID"];
pub const ACCOUNT_TYPE_COLUMNS: &[&str] = &["TIPO", "SERVICO", "TYPE", "SERVICE"];

pub const DEFAULT_REFERENCE_LABEL: &str = "GENERAL";
pub const DEFAULT_REFERENCE_NAME: &str = "UNNAMED";

/// A delimited file held in memory with its header row.
#[derive(Debug, Clone)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|err| AppError::Input(format!("cannot read {}: {err}", path.display())))?;
        let table = Self::parse(&bytes)
            .map_err(|err| AppError::Input(format!("{}: {err}", path.display())))?;
        debug!(
            target: "ingestion",
            path = %path.display(),
            columns = table.headers.len(),
            rows = table.rows.len(),
            "table loaded"
        );
        Ok(table)
    }

    /// Tries `;` first and falls back to `,` when that yields fewer than two columns.
    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        let text = decode_text(bytes);
        let semicolon = parse_delimited(&text, b';')?;
        let table = if semicolon.headers.len() < 2 {
            parse_delimited(&text, b',')?
        } else {
            semicolon
        };
        if table.headers.iter().all(|h| h.is_empty()) {
            return Err(AppError::Input("file has no header row".into()));
        }
        Ok(table)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First header matching an alias, ignoring case and surrounding whitespace.
    pub fn find_column(&self, aliases: &[&str]) -> Option<usize> {
        let cleaned: Vec<String> = self
            .headers
            .iter()
            .map(|h| h.trim().to_uppercase())
            .collect();
        aliases
            .iter()
            .find_map(|alias| cleaned.iter().position(|h| h.as_str() == *alias))
    }

    pub fn value(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Drops rows whose `column` value was already seen, keeping the first.
    pub fn dedupe_by(&mut self, column: usize) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        self.rows
            .retain(|row| seen.insert(row.get(column).cloned().unwrap_or_default()));
        before - self.rows.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceRow {
    pub address: String,
    pub label: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountRow {
    pub address: String,
    pub meter_id: String,
    pub service_type: String,
}

pub fn reference_rows(table: &Table) -> AppResult<Vec<ReferenceRow>> {
    let address = table
        .find_column(REFERENCE_ADDRESS_COLUMNS)
        .ok_or_else(|| AppError::Input("reference file has no address column".into()))?;
    let label = table.find_column(REFERENCE_LABEL_COLUMNS);
    let name = table.find_column(REFERENCE_NAME_COLUMNS);

    Ok((0..table.len())
        .map(|row| ReferenceRow {
            address: table.value(row, address).to_string(),
            label: optional_value(table, row, label, DEFAULT_REFERENCE_LABEL),
            display_name: optional_value(table, row, name, DEFAULT_REFERENCE_NAME),
        })
        .collect())
}

/// Account rows with duplicates by meter id removed. Returns the removal count.
pub fn account_rows(mut table: Table) -> AppResult<(Vec<AccountRow>, usize)> {
    let address = table
        .find_column(ACCOUNT_ADDRESS_COLUMNS)
        .ok_or_else(|| AppError::Input("account file has no address column".into()))?;
    let id = table.find_column(ACCOUNT_ID_COLUMNS);
    let kind = table.find_column(ACCOUNT_TYPE_COLUMNS);
    let removed = id.map(|column| table.dedupe_by(column)).unwrap_or(0);

    let rows = (0..table.len())
        .map(|row| AccountRow {
            address: table.value(row, address).to_string(),
            meter_id: value_or_empty(&table, row, id),
            service_type: value_or_empty(&table, row, kind).to_uppercase(),
        })
        .collect();
    Ok((rows, removed))
}

fn optional_value(table: &Table, row: usize, column: Option<usize>, fallback: &str) -> String {
    column
        .map(|c| table.value(row, c).to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn value_or_empty(table: &Table, row: usize, column: Option<usize>) -> String {
    column
        .map(|c| table.value(row, c).to_string())
        .unwrap_or_default()
}

/// UTF-8 when valid, otherwise Latin-1 (every byte maps to the same code point).
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn parse_delimited(text: &str, delimiter: u8) -> AppResult<Table> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|v| v.to_string()).collect());
    }
    Ok(Table { headers, rows })
}
