//! Versioned on-disk snapshots of a [`PatternStore`].
//!
//! Writers go through [`StoreWriter`] (exclusive lease + atomic commit);
//! readers go through [`CommittedSnapshot`] and only ever see a fully written
//! file, because every write lands in a temp file that is renamed over the
//! target.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::store::{Pattern, PatternStore};
use crate::config::StoreConfig;
use crate::domain::{StoreKey, Timeframe};
use crate::error::{PatternError, Result};

pub const SNAPSHOT_FORMAT: &str = "patmem-store";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: &'a str,
    version: u32,
    coin: &'a str,
    timeframe: Timeframe,
    committed_at: DateTime<Utc>,
    patterns: Vec<&'a Pattern>,
}

#[derive(Deserialize)]
struct SnapshotFile {
    format: String,
    version: u32,
    coin: String,
    timeframe: Timeframe,
    committed_at: DateTime<Utc>,
    patterns: Vec<Pattern>,
}

/// Write `bytes` to `path` through a temp file in the same directory, then
/// rename it into place. Readers see either the old file or the new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PatternError::Io(e.error))?;
    Ok(())
}

/// Result of loading a snapshot. A corrupt or mismatched file yields an empty
/// store and a `CorruptStore` warning instead of an error.
#[derive(Debug)]
pub struct LoadedStore {
    pub store: PatternStore,
    pub warning: Option<PatternError>,
}

impl PatternStore {
    /// Commit the store to `path` stamped with the current time.
    pub fn persist(&mut self, path: &Path) -> Result<DateTime<Utc>> {
        self.persist_at(path, Utc::now())
    }

    /// Commit the store to `path` stamped with `at`.
    pub fn persist_at(&mut self, path: &Path, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let snapshot = SnapshotRef {
            format: SNAPSHOT_FORMAT,
            version: SNAPSHOT_VERSION,
            coin: &self.key().coin,
            timeframe: self.key().timeframe,
            committed_at: at,
            patterns: self.sorted_patterns(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        write_atomic(path, &bytes)?;
        self.set_committed_at(Some(at));

        tracing::debug!(
            store = %self.key(),
            patterns = self.len(),
            path = %path.display(),
            "Snapshot committed"
        );
        Ok(at)
    }

    /// Load a snapshot. Never fails: a missing file gives an empty store, a
    /// corrupt or foreign one gives an empty store plus a warning.
    pub fn load(path: &Path, key: StoreKey, config: StoreConfig) -> LoadedStore {
        if !path.exists() {
            tracing::info!(store = %key, path = %path.display(), "No snapshot yet");
            return LoadedStore {
                store: PatternStore::new(key, config),
                warning: None,
            };
        }

        match read_snapshot(path, &key) {
            Ok(file) => {
                let store =
                    PatternStore::from_patterns(key, config, file.patterns, Some(file.committed_at));
                tracing::info!(
                    store = %store.key(),
                    patterns = store.len(),
                    committed_at = %file.committed_at,
                    "Snapshot loaded"
                );
                LoadedStore {
                    store,
                    warning: None,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    store = %key,
                    path = %path.display(),
                    %reason,
                    "Snapshot unusable, starting from an empty store"
                );
                LoadedStore {
                    store: PatternStore::new(key, config),
                    warning: Some(PatternError::CorruptStore {
                        path: path.to_path_buf(),
                        reason,
                    }),
                }
            }
        }
    }
}

fn read_snapshot(path: &Path, key: &StoreKey) -> std::result::Result<SnapshotFile, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    let file: SnapshotFile =
        serde_json::from_slice(&bytes).map_err(|e| format!("malformed snapshot: {}", e))?;

    if file.format != SNAPSHOT_FORMAT {
        return Err(format!("unexpected format tag {:?}", file.format));
    }
    if file.version != SNAPSHOT_VERSION {
        return Err(format!(
            "unsupported version {} (expected {})",
            file.version, SNAPSHOT_VERSION
        ));
    }
    if file.coin != key.coin || file.timeframe != key.timeframe {
        return Err(format!(
            "snapshot belongs to {}/{}, expected {}",
            file.coin, file.timeframe, key
        ));
    }
    if let Some(bad) = file.patterns.iter().find(|p| {
        p.vector.high().len() != p.vector.close().len()
            || p.vector.low().len() != p.vector.close().len()
    }) {
        return Err(format!("pattern {} has ragged change vectors", bad.hash));
    }
    Ok(file)
}

// ── Write side ─────────────────────────────────────────────────────────────────

/// Exclusive write access to one snapshot.
///
/// `acquire` takes a lease file (`<snapshot>.lock`, created with create-new
/// semantics) so a second writer for the same (coin, timeframe) fails with
/// `WriterBusy`. `commit` is the only way the working store becomes visible
/// to readers. The lease is released on drop.
#[derive(Debug)]
pub struct StoreWriter {
    store: PatternStore,
    path: PathBuf,
    lease: PathBuf,
    load_warning: Option<PatternError>,
}

impl StoreWriter {
    pub fn acquire(path: &Path, key: StoreKey, config: StoreConfig) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let lease = lease_path(path);
        let mut lease_file = match create_lease(&lease) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let timeout = Duration::minutes((config.lease_timeout_hours * 60.0) as i64);
                let Some(reason) = stale_lease_reason(&lease, timeout) else {
                    return Err(PatternError::WriterBusy { path: lease });
                };
                tracing::warn!(lease = %lease.display(), %reason, "Reclaiming stale store lease");
                match std::fs::remove_file(&lease) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                // Another writer may reclaim it first; only one create wins.
                create_lease(&lease).map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => PatternError::WriterBusy {
                        path: lease.clone(),
                    },
                    _ => e.into(),
                })?
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(lease_file, "{}", std::process::id())?;

        let LoadedStore { store, warning } = PatternStore::load(path, key, config);
        Ok(Self {
            store,
            path: path.to_path_buf(),
            lease,
            load_warning: warning,
        })
    }

    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PatternStore {
        &mut self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `CorruptStore` warning raised while loading, if any.
    pub fn load_warning(&self) -> Option<&PatternError> {
        self.load_warning.as_ref()
    }

    pub fn commit(&mut self) -> Result<DateTime<Utc>> {
        let at = self.store.persist(&self.path)?;
        self.touch_lease();
        Ok(at)
    }

    pub fn commit_at(&mut self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let at = self.store.persist_at(&self.path, at)?;
        self.touch_lease();
        Ok(at)
    }

    /// Bump the lease mtime so a long run is not mistaken for an abandoned one.
    fn touch_lease(&self) {
        let touched = OpenOptions::new()
            .write(true)
            .open(&self.lease)
            .and_then(|f| f.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            tracing::debug!(lease = %self.lease.display(), error = %e, "Failed to refresh store lease");
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lease) {
            tracing::warn!(lease = %self.lease.display(), error = %e, "Failed to release store lease");
        }
    }
}

fn lease_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn create_lease(lease: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().write(true).create_new(true).open(lease)
}

/// Why an existing lease may be taken over, or `None` while it looks held.
///
/// A lease is abandoned when its recorded pid no longer runs on this host, or
/// when it has not been refreshed by a commit for longer than `timeout`.
fn stale_lease_reason(lease: &Path, timeout: Duration) -> Option<String> {
    let contents = std::fs::read_to_string(lease).ok()?;
    if let Ok(pid) = contents.trim().parse::<u32>() {
        if !process_alive(pid) {
            return Some(format!("holder pid {} is not running", pid));
        }
    }

    let modified = std::fs::metadata(lease).and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).unwrap_or_default();
    let timeout = timeout.to_std().ok()?;
    (age > timeout).then(|| format!("lease not refreshed for {}s", age.as_secs()))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Whether a write lease is currently held for `path`.
pub fn is_leased(path: &Path) -> bool {
    lease_path(path).exists()
}

// ── Read side ──────────────────────────────────────────────────────────────────

/// Immutable view of the last committed snapshot, shared cheaply between
/// inference tasks.
#[derive(Debug, Clone)]
pub struct CommittedSnapshot {
    store: Arc<PatternStore>,
}

impl CommittedSnapshot {
    /// Open the committed snapshot at `path`. Corruption is reported as a
    /// warning alongside an empty (untrained) snapshot.
    pub fn open(path: &Path, key: StoreKey, config: StoreConfig) -> (Self, Option<PatternError>) {
        let LoadedStore { store, warning } = PatternStore::load(path, key, config);
        (Self::from_store(store), warning)
    }

    pub fn from_store(store: PatternStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    pub fn key(&self) -> &StoreKey {
        self.store.key()
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.store.committed_at()
    }

    /// True when never committed or committed longer ago than `freshness`.
    pub fn is_stale(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        match self.committed_at() {
            Some(at) => now - at > freshness,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::extractor::ChangeVector;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn key() -> StoreKey {
        StoreKey::new("ETH", Timeframe::H4)
    }

    fn populated_store() -> PatternStore {
        let mut store = PatternStore::new(key(), StoreConfig::default());
        for i in 0..25 {
            let x = i as f64 * 0.13;
            let v = ChangeVector::new(vec![x, -x, 0.2], vec![x, 0.1, 0.0], vec![0.0, x, -0.3])
                .unwrap();
            let mut p = Pattern::new(Timeframe::H4, v, (i as f64 / 10.0) - 1.0, t0());
            p.hit_count = i;
            p.success_count = i / 2;
            p.high_weight = 0.8;
            store.insert_or_update(p);
        }
        store
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH").join("4h.store.json");
        let mut store = populated_store();
        store.persist_at(&path, t0()).unwrap();

        let loaded = PatternStore::load(&path, key(), StoreConfig::default());
        assert!(loaded.warning.is_none());
        let restored = loaded.store;
        assert_eq!(restored.len(), store.len());
        assert_eq!(restored.committed_at(), Some(t0()));
        for p in store.iter() {
            let q = restored.get(&p.hash).expect("hash survives round trip");
            assert!((p.weight - q.weight).abs() < 1e-12);
            assert!((p.high_weight - q.high_weight).abs() < 1e-12);
            assert_eq!(p.hit_count, q.hit_count);
            assert_eq!(p.success_count, q.success_count);
        }
    }

    #[test]
    fn test_load_missing_is_empty_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PatternStore::load(&dir.path().join("nope.json"), key(), StoreConfig::default());
        assert!(loaded.store.is_empty());
        assert!(loaded.warning.is_none());
        assert!(loaded.store.committed_at().is_none());
    }

    #[test]
    fn test_load_garbage_falls_back_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, b"\x00\x01not json at all").unwrap();
        let loaded = PatternStore::load(&path, key(), StoreConfig::default());
        assert!(loaded.store.is_empty());
        assert!(matches!(loaded.warning, Some(PatternError::CorruptStore { .. })));
    }

    #[test]
    fn test_load_wrong_version_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        let body = serde_json::json!({
            "format": SNAPSHOT_FORMAT,
            "version": 0,
            "coin": "ETH",
            "timeframe": "4h",
            "committed_at": t0(),
            "patterns": []
        });
        std::fs::write(&path, body.to_string()).unwrap();
        let loaded = PatternStore::load(&path, key(), StoreConfig::default());
        assert!(loaded.store.is_empty());
        match loaded.warning {
            Some(PatternError::CorruptStore { reason, .. }) => {
                assert!(reason.contains("version"), "reason={}", reason)
            }
            other => panic!("expected CorruptStore, got {:?}", other),
        }
    }

    #[test]
    fn test_load_unversioned_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.json");
        std::fs::write(&path, "{\"patterns\": []}").unwrap();
        let loaded = PatternStore::load(&path, key(), StoreConfig::default());
        assert!(loaded.warning.is_some());
    }

    #[test]
    fn test_load_other_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eth.json");
        populated_store().persist_at(&path, t0()).unwrap();
        let other = StoreKey::new("BTC", Timeframe::H4);
        let loaded = PatternStore::load(&path, other, StoreConfig::default());
        assert!(loaded.store.is_empty());
        assert!(loaded.warning.is_some());
    }

    #[test]
    fn test_persist_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let mut store = populated_store();
        store.persist_at(&path, t0()).unwrap();
        store.persist_at(&path, t0()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_writer_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH").join("4h.store.json");
        let first = StoreWriter::acquire(&path, key(), StoreConfig::default()).unwrap();
        assert!(is_leased(&path));

        let second = StoreWriter::acquire(&path, key(), StoreConfig::default());
        assert!(matches!(second, Err(PatternError::WriterBusy { .. })));

        drop(first);
        assert!(!is_leased(&path));
        assert!(StoreWriter::acquire(&path, key(), StoreConfig::default()).is_ok());
    }

    #[test]
    fn test_lease_of_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH").join("4h.store.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // No live process has a pid this large.
        std::fs::write(lease_path(&path), format!("{}\n", u32::MAX)).unwrap();

        let result = StoreWriter::acquire(&path, key(), StoreConfig::default());
        if cfg!(target_os = "linux") {
            let writer = result.unwrap();
            let holder = std::fs::read_to_string(lease_path(writer.path())).unwrap();
            assert_eq!(holder.trim(), std::process::id().to_string());
        } else {
            assert!(matches!(result, Err(PatternError::WriterBusy { .. })));
        }
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH").join("4h.store.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let lease = lease_path(&path);
        std::fs::write(&lease, format!("{}\n", std::process::id())).unwrap();
        let old = SystemTime::now() - std::time::Duration::from_secs(48 * 3600);
        OpenOptions::new()
            .write(true)
            .open(&lease)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let config = StoreConfig {
            lease_timeout_hours: 24.0,
            ..StoreConfig::default()
        };
        let mut writer = StoreWriter::acquire(&path, key(), config).unwrap();
        writer.commit().unwrap();
        let refreshed = std::fs::metadata(&lease).unwrap().modified().unwrap();
        assert!(refreshed > old);
    }

    #[test]
    fn test_fresh_lease_of_live_process_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH").join("4h.store.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(lease_path(&path), format!("{}\n", std::process::id())).unwrap();

        let result = StoreWriter::acquire(&path, key(), StoreConfig::default());
        assert!(matches!(result, Err(PatternError::WriterBusy { .. })));
        assert!(is_leased(&path));
    }

    #[test]
    fn test_readers_only_see_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4h.store.json");
        let mut writer = StoreWriter::acquire(&path, key(), StoreConfig::default()).unwrap();

        let v = ChangeVector::new(vec![1.0], vec![1.0], vec![1.0]).unwrap();
        writer
            .store_mut()
            .insert_or_update(Pattern::new(Timeframe::H4, v, 0.5, t0()));

        let (before, _) = CommittedSnapshot::open(&path, key(), StoreConfig::default());
        assert!(before.store().is_empty());
        assert!(before.committed_at().is_none());

        writer.commit_at(t0()).unwrap();
        let (after, warning) = CommittedSnapshot::open(&path, key(), StoreConfig::default());
        assert!(warning.is_none());
        assert_eq!(after.store().len(), 1);
        assert_eq!(after.committed_at(), Some(t0()));
    }

    #[test]
    fn test_snapshot_staleness() {
        let mut store = PatternStore::new(key(), StoreConfig::default());
        let never = CommittedSnapshot::from_store(store.clone());
        assert!(never.is_stale(t0(), Duration::days(14)));

        store.set_committed_at(Some(t0()));
        let snap = CommittedSnapshot::from_store(store);
        assert!(!snap.is_stale(t0() + Duration::days(13), Duration::days(14)));
        assert!(snap.is_stale(t0() + Duration::days(15), Duration::days(14)));
    }
}
