use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::geocoder::GeoRecord;

/// md5 digest of the uppercased, trimmed address joined with the context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(address: &str, context: &str) -> Self {
        let material = format!(
            "{}|{}",
            address.trim().to_uppercase(),
            context.trim().to_uppercase()
        );
        Self(format!("{:x}", md5::compute(material.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub record: GeoRecord,
    pub timestamp: DateTime<Utc>,
    pub original_address: String,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Fraction of lookups answered from the cache, in `0.0..=1.0`.
    pub hit_rate: f64,
}

impl CacheStatistics {
    /// Geocoder spend avoided by the entries already on disk.
    pub fn estimated_savings(&self, cost_per_request: f64) -> f64 {
        self.size as f64 * cost_per_request
    }
}

pub struct GeocodeCache {
    path: PathBuf,
    entries: HashMap<CacheKey, CacheEntry>,
    context: String,
    hits: u64,
    misses: u64,
}

impl GeocodeCache {
    /// Opens the store at `path`. A missing or unreadable file yields an empty cache.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let mut cache = Self {
            path: path.as_ref().to_path_buf(),
            entries: HashMap::new(),
            context: String::new(),
            hits: 0,
            misses: 0,
        };
        cache.load();
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn set_context(&mut self, context: &str) {
        self.context = context.trim().to_uppercase();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_for(&self, address: &str) -> CacheKey {
        CacheKey::derive(address, &self.context)
    }

    pub fn lookup(&mut self, address: &str) -> Option<GeoRecord> {
        let key = self.key_for(address);
        match self.entries.get(&key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.record.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, address: &str, record: GeoRecord) {
        self.insert_with_origin(address, address, record);
    }

    /// Stores `record` under the key of `address`, keeping `original` verbatim for audit.
    pub fn insert_with_origin(&mut self, address: &str, original: &str, record: GeoRecord) {
        let key = self.key_for(address);
        self.entries.insert(
            key,
            CacheEntry {
                record,
                timestamp: Utc::now(),
                original_address: original.to_string(),
                context: self.context.clone(),
            },
        );
    }

    pub fn entry(&self, address: &str) -> Option<&CacheEntry> {
        self.entries.get(&self.key_for(address))
    }

    pub fn statistics(&self) -> CacheStatistics {
        let total = self.hits + self.misses;
        let hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
        CacheStatistics {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate,
        }
    }

    /// Replaces the in-memory entries with the store contents.
    pub fn load(&mut self) {
        match read_store(&self.path) {
            Ok(entries) => {
                debug!(
                    target: "geocode_cache",
                    path = %self.path.display(),
                    entries = entries.len(),
                    "cache store loaded"
                );
                self.entries = entries;
            }
            Err(AppError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    target: "geocode_cache",
                    path = %self.path.display(),
                    "no cache store found; starting empty"
                );
                self.entries.clear();
            }
            Err(err) => {
                info!(
                    target: "geocode_cache",
                    path = %self.path.display(),
                    error = %err,
                    "cache store unreadable; starting empty"
                );
                self.entries.clear();
            }
        }
    }

    /// Writes the whole cache to a sibling temp file and renames it over the store.
    pub fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(&self.entries)?;
        let staging = staging_path(&self.path)?;
        fs::write(&staging, serialized)?;
        if let Err(err) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(AppError::Io(err));
        }
        debug!(
            target: "geocode_cache",
            path = %self.path.display(),
            entries = self.entries.len(),
            "cache store persisted"
        );
        Ok(())
    }
}

fn read_store(path: &Path) -> AppResult<HashMap<CacheKey, CacheEntry>> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn staging_path(path: &Path) -> AppResult<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::Path(format!("cache path has no file name: {}", path.display())))?;
    let mut buf = path.to_path_buf();
    buf.set_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    Ok(buf)
}
