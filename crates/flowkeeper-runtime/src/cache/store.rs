//! On-disk cache store
//!
//! One JSON file per key under `entries/`. The store tracks its own in-flight
//! temp files so an interrupted process can remove them before exiting.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::key::{derive_key, CacheKey};
use super::{CacheError, CacheResult};

/// Subdirectory holding committed entries and in-flight temp files
const ENTRIES_DIR: &str = "entries";

/// Prefix of in-flight temp files
const TEMP_PREFIX: &str = ".tmp-";

/// Extension of committed entries
const ENTRY_EXT: &str = "json";

/// Temp files not owned by this process are only removed past this age
pub const ORPHAN_TEMP_AGE: Duration = Duration::from_secs(3600);

/// A committed cache entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry was written under
    pub key: String,
    /// Commit time, used for lazy expiry
    pub written_at: DateTime<Utc>,
    /// Opaque caller payload
    pub payload: String,
}

impl CacheEntry {
    /// Whether the entry is older than `max_age` at `now`.
    ///
    /// An entry written "in the future" (clock skew) counts as fresh.
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.written_at).to_std() {
            Ok(age) => age > max_age,
            Err(_) => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Committed entries
    pub entries: usize,
    /// Entries past the TTL
    pub expired: usize,
    /// Total size of committed entries in bytes
    pub total_bytes: u64,
    /// Temp files currently present
    pub temp_files: usize,
}

/// Result of a prune pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    /// Files examined
    pub scanned: usize,
    /// Entries deleted (expired or unreadable)
    pub removed: usize,
    /// Orphaned temp files deleted
    pub orphan_temps_removed: usize,
    /// Files left alone (fresh, in-flight, or unknown)
    pub skipped: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Non-fatal errors
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Inflight {
    temps: HashSet<PathBuf>,
    closed: bool,
}

/// TTL-bounded content-addressed cache rooted at a directory.
pub struct CacheStore {
    cache_root: PathBuf,
    entries_dir: PathBuf,
    /// Root that cached source paths must stay within
    source_root: PathBuf,
    ttl: Duration,
    seq: AtomicU64,
    inflight: Mutex<Inflight>,
}

impl CacheStore {
    /// Open (creating if needed) a cache at `cache_root`.
    ///
    /// `source_root` is the directory that `key_for` paths must resolve
    /// inside of.
    pub fn open(cache_root: &Path, source_root: &Path, ttl: Duration) -> CacheResult<Self> {
        validate_root(cache_root)?;

        let entries_dir = cache_root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries_dir).map_err(|e| CacheError::io(&entries_dir, e))?;

        Ok(Self {
            cache_root: cache_root.to_path_buf(),
            entries_dir,
            source_root: source_root.to_path_buf(),
            ttl,
            seq: AtomicU64::new(0),
            inflight: Mutex::new(Inflight::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.cache_root
    }

    pub fn entries_dir(&self) -> &Path {
        &self.entries_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derive the key for a source file and optional context string.
    pub fn key_for(&self, path: &Path, context: Option<&str>) -> CacheResult<CacheKey> {
        derive_key(&self.source_root, path, context)
    }

    /// Look up a payload; stale, absent or unreadable entries are a miss.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.get_as_of(key, Utc::now())
    }

    /// Look up a payload as if the current time were `now`.
    pub fn get_as_of(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<String> {
        let path = self.entry_path(key);
        let entry = read_entry(&path)?;

        if entry.key != key.as_str() {
            debug!(key = %key, "cache entry key mismatch, treating as miss");
            return None;
        }
        if entry.is_older_than(self.ttl, now) {
            debug!(key = %key, "cache entry expired");
            return None;
        }

        debug!(key = %key, "cache hit");
        Some(entry.payload)
    }

    /// Typed lookup; a payload that does not deserialize is a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let payload = self.get(key)?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %key, error = %e, "cached payload has unexpected shape");
                None
            }
        }
    }

    /// Store a payload, replacing any previous entry for `key`.
    ///
    /// The entry is written to a temp file in the entries directory and
    /// renamed into place.
    pub fn put(&self, key: &CacheKey, payload: &str) -> CacheResult<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            written_at: Utc::now(),
            payload: payload.to_string(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        let target = self.entry_path(key);

        let (temp_path, file) = self.begin_write()?;
        let result = write_and_commit(file, &temp_path, &target, &bytes);
        let closed = self.finish_write(&temp_path, result.is_err());

        match result {
            Ok(()) => {
                debug!(key = %key, bytes = bytes.len(), "cache entry written");
                Ok(())
            }
            Err(_) if closed => Err(CacheError::Closed),
            Err(e) => Err(CacheError::io(&target, e)),
        }
    }

    /// Typed store
    pub fn put_json<T: Serialize>(&self, key: &CacheKey, value: &T) -> CacheResult<()> {
        let payload = serde_json::to_string(value)?;
        self.put(key, &payload)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Delete entries older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> CacheResult<PruneReport> {
        self.prune_as_of(max_age, Utc::now())
    }

    /// Prune as if the current time were `now`.
    ///
    /// Committed entries are replaced atomically, so a concurrent writer can
    /// only ever cause a fresh entry to be re-read, never a torn one. Temp
    /// files are left alone unless they are orphans past [`ORPHAN_TEMP_AGE`].
    pub fn prune_as_of(&self, max_age: Duration, now: DateTime<Utc>) -> CacheResult<PruneReport> {
        let mut report = PruneReport::default();

        for path in self.list_dir()? {
            report.scanned += 1;

            match classify(&path) {
                FileKind::Temp => {
                    if self.is_inflight(&path) || !is_stale_file(&path, ORPHAN_TEMP_AGE) {
                        report.skipped += 1;
                        continue;
                    }
                    let size = file_size(&path);
                    match remove_if_present(&path) {
                        Ok(true) => {
                            report.orphan_temps_removed += 1;
                            report.bytes_reclaimed += size;
                        }
                        Ok(false) => report.skipped += 1,
                        Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
                    }
                }
                FileKind::Entry => {
                    let is_stale = |path: &Path| match read_entry(path) {
                        Some(entry) => entry.is_older_than(max_age, now),
                        // Unreadable entries can never hit; reclaim them
                        None => true,
                    };
                    if !is_stale(&path) {
                        report.skipped += 1;
                        continue;
                    }
                    match self.remove_stale_entry(&path, is_stale) {
                        Ok(Some(size)) => {
                            report.removed += 1;
                            report.bytes_reclaimed += size;
                        }
                        Ok(None) => report.skipped += 1,
                        Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
                    }
                }
                FileKind::Other => report.skipped += 1,
            }
        }

        debug!(
            removed = report.removed,
            orphans = report.orphan_temps_removed,
            skipped = report.skipped,
            "cache prune finished"
        );
        Ok(report)
    }

    /// Count entries, expired entries and bytes.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let now = Utc::now();
        let mut stats = CacheStats::default();

        for path in self.list_dir()? {
            match classify(&path) {
                FileKind::Entry => {
                    stats.entries += 1;
                    stats.total_bytes += file_size(&path);
                    match read_entry(&path) {
                        Some(entry) if !entry.is_older_than(self.ttl, now) => {}
                        _ => stats.expired += 1,
                    }
                }
                FileKind::Temp => stats.temp_files += 1,
                FileKind::Other => {}
            }
        }

        Ok(stats)
    }

    /// Remove every committed entry and every temp file not in flight here.
    pub fn clear(&self) -> CacheResult<usize> {
        let mut removed = 0;
        for path in self.list_dir()? {
            let eligible = match classify(&path) {
                FileKind::Entry => true,
                FileKind::Temp => !self.is_inflight(&path),
                FileKind::Other => false,
            };
            if eligible && remove_if_present(&path).map_err(|e| CacheError::io(&path, e))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Refuse further writes and delete this process's in-flight temp files.
    ///
    /// Idempotent. A write racing with this call fails its rename and
    /// reports [`CacheError::Closed`].
    pub fn close_and_cleanup(&self) -> usize {
        let mut inflight = self.lock_inflight();
        inflight.closed = true;

        let mut removed = 0;
        for temp in inflight.temps.drain() {
            match fs::remove_file(&temp) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %temp.display(), error = %e, "failed to remove cache temp file"),
            }
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inflight().closed
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(format!("{}.{}", key.as_str(), ENTRY_EXT))
    }

    /// Create and register a temp file. The file is created while the
    /// in-flight lock is held so `close_and_cleanup` always sees it.
    fn begin_write(&self) -> CacheResult<(PathBuf, File)> {
        let mut inflight = self.lock_inflight();
        if inflight.closed {
            return Err(CacheError::Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .entries_dir
            .join(format!("{}{}-{}", TEMP_PREFIX, std::process::id(), seq));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| CacheError::io(&temp_path, e))?;

        inflight.temps.insert(temp_path.clone());
        Ok((temp_path, file))
    }

    /// Deregister a temp file, deleting it if the write failed.
    /// Returns whether the store was closed meanwhile.
    fn finish_write(&self, temp_path: &Path, failed: bool) -> bool {
        let mut inflight = self.lock_inflight();
        inflight.temps.remove(temp_path);
        if failed {
            let _ = fs::remove_file(temp_path);
        }
        inflight.closed
    }

    /// Take a stale entry out of the directory and delete it.
    ///
    /// The entry is renamed to a private temp name first. Rename is atomic
    /// against writers committing a new entry at `path`, so the claimed file
    /// is exactly what gets re-checked. A fresh entry committed after the
    /// caller's read is linked back, unless an even newer one has landed.
    /// Returns the bytes reclaimed, or `None` when nothing was removed.
    fn remove_stale_entry<F>(&self, path: &Path, is_stale: F) -> io::Result<Option<u64>>
    where
        F: Fn(&Path) -> bool,
    {
        let claim = {
            let mut inflight = self.lock_inflight();
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let claim = self
                .entries_dir
                .join(format!("{}{}-{}", TEMP_PREFIX, std::process::id(), seq));
            inflight.temps.insert(claim.clone());
            claim
        };

        let result = claim_stale(path, &claim, is_stale);
        self.lock_inflight().temps.remove(&claim);
        if result.is_err() {
            let _ = fs::remove_file(&claim);
        }
        result
    }

    fn is_inflight(&self, path: &Path) -> bool {
        self.lock_inflight().temps.contains(path)
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn list_dir(&self) -> CacheResult<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.entries_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.entries_dir, e)),
        };

        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| CacheError::io(&self.entries_dir, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn validate_root(root: &Path) -> CacheResult<()> {
    if root.as_os_str().is_empty() {
        return Err(CacheError::InvalidRoot {
            path: root.to_path_buf(),
            reason: "empty path".to_string(),
        });
    }
    if root.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CacheError::InvalidRoot {
            path: root.to_path_buf(),
            reason: "must not contain '..'".to_string(),
        });
    }
    Ok(())
}

fn write_and_commit(mut file: File, temp_path: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, target)
}

fn claim_stale<F>(path: &Path, claim: &Path, is_stale: F) -> io::Result<Option<u64>>
where
    F: Fn(&Path) -> bool,
{
    match fs::rename(path, claim) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }

    let size = file_size(claim);
    if is_stale(claim) {
        fs::remove_file(claim)?;
        return Ok(Some(size));
    }

    debug!(path = %path.display(), "entry refreshed while pruning, putting it back");
    match fs::hard_link(claim, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            debug!(error = %e, "hard link failed, renaming back");
            if !path.exists() {
                fs::rename(claim, path)?;
                return Ok(None);
            }
        }
    }
    remove_if_present(claim)?;
    Ok(None)
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable cache entry");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "corrupt cache entry");
            None
        }
    }
}

enum FileKind {
    Entry,
    Temp,
    Other,
}

fn classify(path: &Path) -> FileKind {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return FileKind::Other,
    };
    if name.starts_with(TEMP_PREFIX) {
        return FileKind::Temp;
    }
    match name.strip_suffix(".json") {
        Some(stem) if CacheKey::parse(stem).is_ok() => FileKind::Entry,
        _ => FileKind::Other,
    }
}

fn is_stale_file(path: &Path, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > max_age)
        .unwrap_or(false)
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, ttl: Duration) -> CacheStore {
        CacheStore::open(&dir.path().join("cache"), dir.path(), ttl).unwrap()
    }

    fn source_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_open_creates_entries_dir() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        assert!(store.entries_dir().is_dir());
    }

    #[test]
    fn test_open_rejects_traversal_root() {
        let err = CacheStore::open(Path::new("cache/../../etc"), Path::new("."), Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::InvalidRoot { .. }));

        let err = CacheStore::open(Path::new(""), Path::new("."), Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::InvalidRoot { .. }));
    }

    #[test]
    fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        source_file(&dir, "ci.yml", "on: push");

        let key = store.key_for(Path::new("ci.yml"), Some("syntax")).unwrap();
        assert!(store.get(&key).is_none());

        store.put(&key, "{\"errors\":0}").unwrap();
        assert_eq!(store.get(&key).as_deref(), Some("{\"errors\":0}"));
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        let key = CacheKey::from_parts(&[b"ttl"]);
        store.put(&key, "payload").unwrap();

        let now = Utc::now();
        assert!(store.get_as_of(&key, now + chrono::Duration::seconds(59)).is_some());
        assert!(store.get_as_of(&key, now + chrono::Duration::seconds(61)).is_none());
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        let key = CacheKey::from_parts(&[b"overwrite"]);

        store.put(&key, "first").unwrap();
        store.put(&key, "second").unwrap();
        assert_eq!(store.get(&key).as_deref(), Some("second"));
        assert_eq!(store.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        let key = CacheKey::from_parts(&[b"corrupt"]);
        fs::write(store.entry_path(&key), b"{not json").unwrap();
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_typed_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Outcome {
            errors: u32,
        }

        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        let key = CacheKey::from_parts(&[b"typed"]);
        store.put_json(&key, &Outcome { errors: 2 }).unwrap();
        assert_eq!(store.get_json::<Outcome>(&key), Some(Outcome { errors: 2 }));
    }

    #[test]
    fn test_no_temp_files_after_put() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        for i in 0..10u8 {
            store.put(&CacheKey::from_parts(&[&[i]]), "x").unwrap();
        }
        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 10);
        assert_eq!(stats.temp_files, 0);
    }

    #[test]
    fn test_close_removes_inflight_and_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));

        let (temp_path, _file) = store.begin_write().unwrap();
        assert!(temp_path.exists());

        assert_eq!(store.close_and_cleanup(), 1);
        assert!(!temp_path.exists());
        assert!(store.is_closed());

        let err = store.put(&CacheKey::from_parts(&[b"late"]), "x").unwrap_err();
        assert!(matches!(err, CacheError::Closed));

        // Idempotent
        assert_eq!(store.close_and_cleanup(), 0);
    }

    #[test]
    fn test_prune_removes_only_old_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));
        let old = CacheKey::from_parts(&[b"old"]);
        let fresh = CacheKey::from_parts(&[b"fresh"]);
        store.put(&old, "old").unwrap();
        store.put(&fresh, "fresh").unwrap();

        // Rewrite `old` with a backdated timestamp
        let backdated = CacheEntry {
            key: old.to_string(),
            written_at: Utc::now() - chrono::Duration::hours(48),
            payload: "old".to_string(),
        };
        fs::write(store.entry_path(&old), serde_json::to_vec(&backdated).unwrap()).unwrap();

        let report = store.prune(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(report.removed, 1);
        assert!(store.get(&old).is_none());
        assert_eq!(store.get(&fresh).as_deref(), Some("fresh"));
    }

    #[test]
    fn test_entry_refreshed_before_removal_survives() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));
        let key = CacheKey::from_parts(&[b"raced"]);
        let path = store.entry_path(&key);

        // A scan judged the entry stale, then a writer committed a fresh one
        store.put(&key, "fresh").unwrap();
        let day_old = |p: &Path| {
            read_entry(p).map_or(true, |e| e.is_older_than(Duration::from_secs(86400), Utc::now()))
        };
        assert_eq!(store.remove_stale_entry(&path, day_old).unwrap(), None);

        assert_eq!(store.get(&key).as_deref(), Some("fresh"));
        assert_eq!(store.stats().unwrap().temp_files, 0);
    }

    #[test]
    fn test_stale_entry_removal_reports_size() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));
        let key = CacheKey::from_parts(&[b"gone"]);
        store.put(&key, "old").unwrap();
        let path = store.entry_path(&key);
        let size = fs::metadata(&path).unwrap().len();

        assert_eq!(store.remove_stale_entry(&path, |_| true).unwrap(), Some(size));
        assert!(!path.exists());
        assert_eq!(store.remove_stale_entry(&path, |_| true).unwrap(), None);
        assert_eq!(store.stats().unwrap().temp_files, 0);
    }

    #[test]
    fn test_prune_races_with_writers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir, Duration::from_secs(3600)));
        let key = CacheKey::from_parts(&[b"busy"]);

        let writer = {
            let store = Arc::clone(&store);
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store.put(&key, "fresh").unwrap();
                }
            })
        };
        for _ in 0..50 {
            // Nothing written here is a day old, so nothing may go
            let report = store.prune(Duration::from_secs(86400)).unwrap();
            assert_eq!(report.removed, 0);
        }
        writer.join().unwrap();

        assert_eq!(store.get(&key).as_deref(), Some("fresh"));
        assert_eq!(store.stats().unwrap().temp_files, 0);
    }

    #[test]
    fn test_prune_leaves_young_temps_and_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));

        let young = store.entries_dir().join(".tmp-999999-0");
        fs::write(&young, b"partial").unwrap();

        let orphan = store.entries_dir().join(".tmp-999999-1");
        fs::write(&orphan, b"partial").unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        File::options()
            .write(true)
            .open(&orphan)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        let report = store.prune(Duration::from_secs(60)).unwrap();
        assert_eq!(report.orphan_temps_removed, 1);
        assert!(young.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_prune_never_touches_inflight_temp() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));
        let (temp_path, _file) = store.begin_write().unwrap();
        File::options()
            .write(true)
            .open(&temp_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        store.prune(Duration::ZERO).unwrap();
        assert!(temp_path.exists());
        store.close_and_cleanup();
    }

    #[test]
    fn test_prune_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600));
        let foreign = store.entries_dir().join("README.json");
        fs::write(&foreign, b"{}").unwrap();

        let report = store.prune(Duration::ZERO).unwrap();
        assert_eq!(report.removed, 0);
        assert!(foreign.exists());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        store.put(&CacheKey::from_parts(&[b"a"]), "a").unwrap();
        store.put(&CacheKey::from_parts(&[b"b"]), "b").unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));
        let key = CacheKey::from_parts(&[b"rm"]);
        store.put(&key, "x").unwrap();
        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir, Duration::from_secs(60)));
        let key = CacheKey::from_parts(&[b"shared"]);
        let payload_a = "a".repeat(64 * 1024);
        let payload_b = "b".repeat(64 * 1024);
        store.put(&key, &payload_a).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let key = key.clone();
                let payload = if i % 2 == 0 { payload_a.clone() } else { payload_b.clone() };
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.put(&key, &payload).unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                let (a, b) = (payload_a.clone(), payload_b.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        let got = store.get(&key).expect("entry always present");
                        assert!(got == a || got == b, "torn read of {} bytes", got.len());
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(store.stats().unwrap().temp_files, 0);
    }
}
