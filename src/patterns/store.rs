//! Durable pattern store.
//!
//! The store holds the [`PatternDatabase`] in memory behind one lock and
//! persists every mutation as a single JSON document. Writes go to
//! `<path>.tmp` followed by an atomic rename, so readers never observe a
//! torn file. A missing file yields an empty database; a corrupt file is
//! logged, discarded, and replaced by an empty database rather than
//! crashing. The file's mtime is cached to skip re-parsing when nothing
//! changed on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::core::error::{GatewayError, Result};

use super::model::{
    now_nanos, DevicePattern, Fingerprint, PatternDatabase, PatternMatch, TimestampNs,
};

/// Aggregate statistics over the stored patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternStats {
    /// Number of stored patterns.
    pub total_patterns: usize,
    /// Sum of all usage counts.
    pub total_usage: u64,
    /// Mean pattern confidence (0 when empty).
    pub average_confidence: f64,
    /// Id and usage count of the most used pattern.
    pub most_used: Option<(String, u64)>,
    /// Distinct protocols, sorted.
    pub protocols: Vec<String>,
    /// Last database update in nanoseconds.
    pub last_updated: Option<TimestampNs>,
}

struct StoreInner {
    db: PatternDatabase,
    file_mtime: Option<SystemTime>,
}

/// File-backed pattern store.
pub struct PatternStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
    /// Serialises savers so renames land in mutation order.
    save_lock: Mutex<()>,
}

impl PatternStore {
    /// Open a store at `path`, loading the existing database if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (db, file_mtime) = Self::load(&path);
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner { db, file_mtime }),
            save_lock: Mutex::new(()),
        })
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> (PatternDatabase, Option<SystemTime>) {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return (PatternDatabase::default(), None);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "pattern file unreadable, starting empty");
                return (PatternDatabase::default(), None);
            }
        };
        match serde_json::from_slice::<PatternDatabase>(&bytes) {
            Ok(mut db) => {
                for pattern in db.patterns.values_mut() {
                    pattern.clamp_confidences();
                }
                let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
                (db, mtime)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "pattern file corrupt, starting empty");
                (PatternDatabase::default(), None)
            }
        }
    }

    /// Re-read the file when its mtime moved past the cached one.
    fn reload_if_changed(&self, inner: &mut StoreInner) {
        let current = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return,
        };
        if inner.file_mtime.is_none_or(|cached| current > cached) {
            let (db, mtime) = Self::load(&self.path);
            inner.db = db;
            inner.file_mtime = mtime;
        }
    }

    /// Persist the database, consuming the state guard.
    ///
    /// Serialisation happens under the state lock; the file I/O after it is
    /// released. The save lock is taken before the state lock goes so
    /// concurrent savers rename in mutation order.
    fn save(&self, mut inner: std::sync::MutexGuard<'_, StoreInner>) -> Result<()> {
        inner.db.last_updated = Some(now_nanos());
        let json = serde_json::to_vec_pretty(&inner.db)
            .map_err(|err| GatewayError::internal(format!("pattern serialization failed: {err}")))?;

        let save_guard = self
            .save_lock
            .lock()
            .map_err(|_| GatewayError::internal("pattern save lock poisoned"))?;
        drop(inner);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let result = (|| -> Result<()> {
            fs::write(&tmp, &json)?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        drop(save_guard);

        self.lock().file_mtime = mtime;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("pattern store lock poisoned")
    }

    /// Add (or replace) a pattern and persist.
    pub fn add(&self, pattern: DevicePattern) -> Result<()> {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        inner.db.add(pattern);
        self.save(inner)
    }

    /// Remove a pattern and persist; returns whether it existed.
    pub fn remove(&self, pattern_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        if !inner.db.remove(pattern_id) {
            return Ok(false);
        }
        self.save(inner)?;
        Ok(true)
    }

    /// Copy of a pattern by id.
    pub fn get(&self, pattern_id: &str) -> Option<DevicePattern> {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        inner.db.get(pattern_id).cloned()
    }

    /// Ranked matches for a fingerprint.
    pub fn find(&self, fingerprint: &Fingerprint, min_confidence: f64) -> Vec<PatternMatch> {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        inner.db.find(fingerprint, min_confidence)
    }

    /// Record one use of a pattern and nudge its confidence.
    ///
    /// Successful use adds 0.01, failed use subtracts 0.05, clamped to
    /// [0, 1]. Returns false when the pattern does not exist.
    pub fn update_usage(&self, pattern_id: &str, success: bool) -> Result<bool> {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        let Some(pattern) = inner.db.patterns.get_mut(pattern_id) else {
            return Ok(false);
        };
        pattern.usage_count += 1;
        pattern.last_verified = Some(now_nanos());
        pattern.pattern_confidence = if success {
            (pattern.pattern_confidence + 0.01).min(1.0)
        } else {
            (pattern.pattern_confidence - 0.05).max(0.0)
        };
        self.save(inner)?;
        Ok(true)
    }

    /// Number of stored patterns.
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        inner.db.len()
    }

    /// Check whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> PatternStats {
        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        let db = &inner.db;
        let total_patterns = db.len();
        let total_usage = db.patterns.values().map(|p| p.usage_count).sum();
        let average_confidence = if total_patterns == 0 {
            0.0
        } else {
            db.patterns.values().map(|p| p.pattern_confidence).sum::<f64>() / total_patterns as f64
        };
        let most_used = db
            .patterns
            .values()
            .max_by_key(|p| p.usage_count)
            .map(|p| (p.pattern_id.clone(), p.usage_count));
        let mut protocols: Vec<String> = db
            .patterns
            .values()
            .map(|p| p.protocol_variant.protocol.clone())
            .collect();
        protocols.sort();
        protocols.dedup();
        PatternStats {
            total_patterns,
            total_usage,
            average_confidence,
            most_used,
            protocols,
            last_updated: db.last_updated,
        }
    }

    /// Export the database to another file.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = {
            let mut inner = self.lock();
            self.reload_if_changed(&mut inner);
            serde_json::to_vec_pretty(&inner.db).map_err(|err| {
                GatewayError::internal(format!("pattern serialization failed: {err}"))
            })?
        };
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Import patterns from an exported file; returns how many were taken.
    ///
    /// Existing pattern ids are kept unless `overwrite` is set.
    pub fn import(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<usize> {
        let bytes = fs::read(path.as_ref())?;
        let imported: PatternDatabase = serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::invalid_request(format!("invalid import file: {err}")))?;

        let mut inner = self.lock();
        self.reload_if_changed(&mut inner);
        let mut taken = 0;
        for (id, pattern) in imported.patterns {
            if overwrite || !inner.db.patterns.contains_key(&id) {
                inner.db.add(pattern);
                taken += 1;
            }
        }
        if taken > 0 {
            self.save(inner)?;
        }
        Ok(taken)
    }
}

impl std::fmt::Debug for PatternStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternStore")
            .field("path", &self.path)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::model::ProtocolSpec;

    fn pattern(id: &str) -> DevicePattern {
        DevicePattern::new(id, "Acme", "PLC", "M1", ProtocolSpec::new("modbus_tcp"))
    }

    fn temp_store() -> (tempfile::TempDir, PatternStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path().join("patterns.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let (_dir, store) = temp_store();
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_persists_across_reopen() {
        let (dir, store) = temp_store();
        store.add(pattern("p1")).unwrap();
        drop(store);

        let reopened = PatternStore::open(dir.path().join("patterns.json")).unwrap();
        let loaded = reopened.get("p1").unwrap();
        assert_eq!(loaded.manufacturer_id, "Acme");
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_file_shape_matches_document_format() {
        let (dir, store) = temp_store();
        store.add(pattern("p1")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("patterns.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], "1.0");
        assert!(json["last_updated"].is_i64());
        assert!(json["patterns"]["p1"].is_object());
        assert!(json["metadata"].is_object());
        // No stray temp file after a successful save.
        assert!(!dir.path().join("patterns.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_recovers_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        std::fs::write(&path, b"{ not json at all").unwrap();

        let store = PatternStore::open(&path).unwrap();
        assert!(store.is_empty());
        // The store remains usable and persists over the corrupt file.
        store.add(pattern("fresh")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_reports_presence() {
        let (_dir, store) = temp_store();
        store.add(pattern("p1")).unwrap();
        assert!(store.remove("p1").unwrap());
        assert!(!store.remove("p1").unwrap());
        assert!(store.get("p1").is_none());
    }

    #[test]
    fn test_update_usage_nudges_confidence() {
        let (_dir, store) = temp_store();
        store.add(pattern("p1").with_confidence(0.5)).unwrap();

        assert!(store.update_usage("p1", true).unwrap());
        let p = store.get("p1").unwrap();
        assert_eq!(p.usage_count, 1);
        assert!((p.pattern_confidence - 0.51).abs() < 1e-9);
        assert!(p.last_verified.is_some());

        assert!(store.update_usage("p1", false).unwrap());
        let p = store.get("p1").unwrap();
        assert_eq!(p.usage_count, 2);
        assert!((p.pattern_confidence - 0.46).abs() < 1e-9);

        assert!(!store.update_usage("missing", true).unwrap());
    }

    #[test]
    fn test_confidence_clamps_at_bounds() {
        let (_dir, store) = temp_store();
        store.add(pattern("hi").with_confidence(1.0)).unwrap();
        store.add(pattern("lo").with_confidence(0.02)).unwrap();

        store.update_usage("hi", true).unwrap();
        assert_eq!(store.get("hi").unwrap().pattern_confidence, 1.0);

        store.update_usage("lo", false).unwrap();
        assert_eq!(store.get("lo").unwrap().pattern_confidence, 0.0);
    }

    #[test]
    fn test_find_through_store() {
        let (_dir, store) = temp_store();
        store.add(pattern("p1").with_confidence(0.9)).unwrap();

        let fp = Fingerprint {
            protocol: "modbus_tcp".into(),
            host: "10.0.0.1".into(),
            manufacturer: Some("Acme".into()),
            model: Some("M1".into()),
            ..Fingerprint::default()
        };
        let matches = store.find(&fp, 0.7);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern.pattern_id, "p1");

        let opcua_fp = Fingerprint {
            protocol: "opcua".into(),
            ..fp
        };
        assert!(store.find(&opcua_fp, 0.0).is_empty());
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = temp_store();
        store.add(pattern("a").with_confidence(0.4)).unwrap();
        store.add(pattern("b").with_confidence(0.8)).unwrap();
        store.update_usage("b", true).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_patterns, 2);
        assert_eq!(stats.total_usage, 1);
        assert!((stats.average_confidence - 0.605).abs() < 1e-9);
        assert_eq!(stats.most_used.as_ref().unwrap().0, "b");
        assert_eq!(stats.protocols, vec!["modbus_tcp".to_string()]);
        assert!(stats.last_updated.is_some());
    }

    #[test]
    fn test_export_import_round_trip() {
        let (dir, store) = temp_store();
        store.add(pattern("p1")).unwrap();
        store.add(pattern("p2")).unwrap();

        let export_path = dir.path().join("export.json");
        store.export(&export_path).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let other = PatternStore::open(other_dir.path().join("patterns.json")).unwrap();
        other.add(pattern("p1").with_confidence(0.9)).unwrap();

        // Without overwrite only the new id is taken.
        assert_eq!(other.import(&export_path, false).unwrap(), 1);
        assert_eq!(other.get("p1").unwrap().pattern_confidence, 0.9);

        assert_eq!(other.import(&export_path, true).unwrap(), 2);
        assert_eq!(other.get("p1").unwrap().pattern_confidence, 0.5);
    }

    #[test]
    fn test_mtime_reload_sees_external_change() {
        let (dir, store) = temp_store();
        store.add(pattern("p1")).unwrap();

        // Another process replaces the file wholesale.
        let other = PatternStore::open(dir.path().join("patterns.json")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        other.add(pattern("p2")).unwrap();

        assert!(store.get("p2").is_some());
    }
}
