//! Cache key derivation
//!
//! A key is the SHA-256 of four folded fields: the absolute path, the file's
//! mtime, the SHA-256 of its content and an optional context string. Any of
//! the four changing yields a different key. Paths are resolved against an
//! expected root and rejected if they escape it.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use super::CacheError;

/// Domain separator folded into every key
const KEY_DOMAIN: &str = "flowkeeper-cache-v1";

/// Fixed-length cache key (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Length of the hex digest
    pub const LEN: usize = 64;

    /// Validate an externally supplied key.
    ///
    /// Only digests are accepted so a key can never name a path outside the
    /// store.
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        if raw.len() != Self::LEN {
            return Err(CacheError::InvalidKey {
                reason: format!("expected {} hex characters, got {}", Self::LEN, raw.len()),
            });
        }
        if !raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(CacheError::InvalidKey {
                reason: "key must be lowercase hex".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a key from arbitrary bytes (used for non-file computations)
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the key for `path` (resolved against `root`) and `context`.
pub fn derive_key(root: &Path, path: &Path, context: Option<&str>) -> Result<CacheKey, CacheError> {
    let resolved = resolve_within(root, path)?;

    let metadata = fs::metadata(&resolved).map_err(|e| CacheError::io(&resolved, e))?;
    if !metadata.is_file() {
        return Err(CacheError::InvalidKey {
            reason: format!("not a regular file: {}", resolved.display()),
        });
    }
    let mtime_nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let content_hash = hash_file(&resolved).map_err(|e| CacheError::io(&resolved, e))?;

    let path_bytes = resolved.to_string_lossy();
    let mtime = mtime_nanos.to_string();
    // Absent context and empty context must not collide
    let context_field = match context {
        Some(c) => format!("1:{c}"),
        None => "0".to_string(),
    };

    Ok(CacheKey::from_parts(&[
        path_bytes.as_bytes(),
        mtime.as_bytes(),
        content_hash.as_bytes(),
        context_field.as_bytes(),
    ]))
}

/// SHA-256 of a file's content, hex encoded
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve `path` against `root` and reject anything that escapes it.
///
/// The check is lexical first (so `../../etc/passwd` fails even when the
/// target does not exist) and then repeated on canonical paths so a symlink
/// inside the root cannot point outside it.
pub fn resolve_within(root: &Path, path: &Path) -> Result<PathBuf, CacheError> {
    if path.as_os_str().is_empty() {
        return Err(CacheError::InvalidKey {
            reason: "empty path".to_string(),
        });
    }

    let root = normalize_lexically(root).ok_or_else(|| CacheError::InvalidKey {
        reason: format!("invalid root: {}", root.display()),
    })?;

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize_lexically(&joined).ok_or_else(|| CacheError::InvalidKey {
        reason: format!("path escapes root: {}", path.display()),
    })?;

    if !normalized.starts_with(&root) {
        return Err(CacheError::InvalidKey {
            reason: format!("path escapes root: {}", path.display()),
        });
    }

    if let (Ok(real_root), Ok(real_path)) = (root.canonicalize(), normalized.canonicalize()) {
        if !real_path.starts_with(&real_root) {
            return Err(CacheError::InvalidKey {
                reason: format!("path resolves outside root: {}", path.display()),
            });
        }
    }

    Ok(normalized)
}

/// Remove `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` would climb above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_accepts_digest() {
        let key = CacheKey::from_parts(&[b"a"]);
        assert_eq!(key.as_str().len(), CacheKey::LEN);
        assert_eq!(CacheKey::parse(key.as_str()).unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_traversal_strings() {
        assert!(CacheKey::parse("../../etc/passwd").is_err());
        assert!(CacheKey::parse("").is_err());
        let upper = "A".repeat(64);
        assert!(CacheKey::parse(&upper).is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        let dir = TempDir::new().unwrap();
        let err = derive_key(dir.path(), Path::new(""), None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let err = derive_key(dir.path(), Path::new("../../etc/passwd"), None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_absolute_path_outside_root_rejected() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let outside = write_file(other.path(), "ci.yml", "on: push");
        let err = derive_key(root.path(), &outside, None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_inner_dotdot_that_stays_inside_is_fine() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        write_file(dir.path(), "a/ci.yml", "on: push");
        assert!(derive_key(dir.path(), Path::new("a/b/../ci.yml"), None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let target = write_file(other.path(), "secret.yml", "x");
        std::os::unix::fs::symlink(&target, root.path().join("link.yml")).unwrap();
        let err = derive_key(root.path(), Path::new("link.yml"), None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_key_is_deterministic() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "ci.yml", "on: push");
        let a = derive_key(dir.path(), Path::new("ci.yml"), Some("syntax")).unwrap();
        let b = derive_key(dir.path(), Path::new("ci.yml"), Some("syntax")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_context_separates_keys() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "ci.yml", "on: push");
        let syntax = derive_key(dir.path(), Path::new("ci.yml"), Some("syntax")).unwrap();
        let security = derive_key(dir.path(), Path::new("ci.yml"), Some("security")).unwrap();
        let none = derive_key(dir.path(), Path::new("ci.yml"), None).unwrap();
        let empty = derive_key(dir.path(), Path::new("ci.yml"), Some("")).unwrap();
        assert_ne!(syntax, security);
        assert_ne!(none, empty);
    }

    #[test]
    fn test_content_change_changes_key() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "ci.yml", "on: push");
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        let before = derive_key(dir.path(), Path::new("ci.yml"), None).unwrap();

        // Same length, same mtime: only the content hash differs
        write_file(dir.path(), "ci.yml", "on: pull");
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let after = derive_key(dir.path(), Path::new("ci.yml"), None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_mtime_change_changes_key() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "ci.yml", "on: push");
        let before = derive_key(dir.path(), Path::new("ci.yml"), None).unwrap();

        let later = fs::metadata(&path).unwrap().modified().unwrap() + std::time::Duration::from_secs(5);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let after = derive_key(dir.path(), Path::new("ci.yml"), None).unwrap();
        assert_ne!(before, after);
    }
}
