//! Tunnel record storage
//!
//! Records are persisted one JSON document per tunnel name in the tunnels
//! directory (`/etc/l2link/tunnels/<name>.json` by default). Files are written
//! atomically and readable by the owning account only.

use l2link_proto::{validate_name, TunnelRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to serialize tunnel '{name}': {source}")]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[error("Invalid tunnel name: {0}")]
    InvalidName(String),

    #[error("Store is read-only")]
    ReadOnly,
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A persisted record that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// File path or record name
    pub source: String,
    pub reason: String,
}

/// Result of reloading every persisted record
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<TunnelRecord>,
    pub skipped: Vec<SkippedRecord>,
}

/// Persistence boundary of the registry
pub trait RecordStore: Send + Sync {
    /// Load all records; malformed entries are reported, not fatal
    fn load_all(&self) -> Result<LoadReport, StoreError>;

    /// Create or overwrite the record stored under `record.name`
    fn save(&self, record: &TunnelRecord) -> Result<(), StoreError>;

    /// Remove the record stored under `name` (missing is not an error)
    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// File-per-tunnel JSON store
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `base_dir`
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        restrict_permissions(&base_dir, 0o700)?;
        Ok(Self { base_dir })
    }

    /// Get the path for a tunnel record file
    fn record_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", name))
    }

    /// Get the base directory path (for display purposes)
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn read_record(path: &Path) -> Result<TunnelRecord, String> {
        let json = fs::read_to_string(path).map_err(|e| format!("read failed: {}", e))?;
        let record: TunnelRecord =
            serde_json::from_str(&json).map_err(|e| format!("parse failed: {}", e))?;
        record.check().map_err(|e| e.to_string())?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != record.name {
            return Err(format!(
                "file name '{}' does not match tunnel name '{}'",
                stem, record.name
            ));
        }
        Ok(record)
    }
}

impl RecordStore for FileStore {
    fn load_all(&self) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::default();

        let entries = fs::read_dir(&self.base_dir).map_err(|e| StoreError::io(&self.base_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.base_dir, e))?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            match Self::read_record(&path) {
                Ok(record) => report.records.push(record),
                Err(reason) => {
                    warn!("Skipping tunnel record {:?}: {}", path, reason);
                    report.skipped.push(SkippedRecord {
                        source: path.display().to_string(),
                        reason,
                    });
                }
            }
        }

        // Sort by name for consistent output
        report.records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            "Loaded {} tunnel record(s) from {:?}",
            report.records.len(),
            self.base_dir
        );

        Ok(report)
    }

    fn save(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        validate_name(&record.name).map_err(|e| StoreError::InvalidName(e.to_string()))?;

        let path = self.record_path(&record.name);
        let tmp_path = self.base_dir.join(format!(".{}.json.tmp", record.name));
        let json = serde_json::to_string_pretty(record).map_err(|e| StoreError::Serialize {
            name: record.name.clone(),
            source: e,
        })?;

        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            restrict_permissions(&tmp_path, 0o600)?;
            file.write_all(json.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.sync_all())
                .map_err(|e| StoreError::io(&tmp_path, e))?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name).map_err(|e| StoreError::InvalidName(e.to_string()))?;

        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| StoreError::io(path, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}

/// In-memory store, for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, TunnelRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if records had been persisted by an earlier run
    pub fn with_records(records: impl IntoIterator<Item = TunnelRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.records.lock() {
            for record in records {
                map.insert(record.name.clone(), record);
            }
        }
        store
    }

    /// Make every subsequent save/remove fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<LoadReport, StoreError> {
        let map = self.records.lock().map_err(|_| StoreError::ReadOnly)?;
        let mut report = LoadReport::default();
        for record in map.values() {
            match record.check() {
                Ok(()) => report.records.push(record.clone()),
                Err(e) => report.skipped.push(SkippedRecord {
                    source: record.name.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    fn save(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut map = self.records.lock().map_err(|_| StoreError::ReadOnly)?;
        map.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut map = self.records.lock().map_err(|_| StoreError::ReadOnly)?;
        map.remove(name);
        Ok(())
    }
}
