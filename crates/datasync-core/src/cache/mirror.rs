//! Session-scoped warm-start copy of the cache.
//!
//! Entries are written as one JSON file per key. The copy is never
//! authoritative: everything read back goes through the same TTL checks as
//! the in-memory cache, and a full quota silently skips the write.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::entry::CacheEntry;

/// Default byte budget for the session directory (5 MiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

const FILE_EXTENSION: &str = "json";

/// Storage the cache store mirrors its entries into.
pub trait CacheMirror<V>: Send + Sync {
    fn save(&self, entry: &CacheEntry<V>) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn remove_prefix(&self, prefix: &str) -> Result<usize>;
    fn clear(&self) -> Result<()>;
    /// Load every entry that has not yet expired, deleting the ones that have.
    fn load_all(&self) -> Result<Vec<CacheEntry<V>>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<T> {
    key: String,
    data: T,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// JSON-file mirror rooted at a per-session directory.
///
/// Clones share the byte-usage counter, so they must point at the same directory.
#[derive(Debug, Clone)]
pub struct SessionMirror {
    dir: PathBuf,
    quota_bytes: u64,
    /// Bytes currently on disk; `None` until the directory has been scanned.
    usage: Arc<Mutex<Option<u64>>>,
}

impl SessionMirror {
    pub fn new(dir: PathBuf, quota_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            quota_bytes,
            usage: Arc::new(Mutex::new(None)),
        })
    }

    fn lock_usage(&self) -> MutexGuard<'_, Option<u64>> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), FILE_EXTENSION))
    }

    fn entry_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for item in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list session directory: {}", self.dir.display()))?
        {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key);
            if let Some(key) = key {
                files.push((path, key));
            }
        }
        Ok(files)
    }

    /// Bytes used by every mirrored entry, read from disk.
    fn scan_usage(&self) -> Result<u64> {
        let mut total = 0;
        for (path, _) in self.entry_files()? {
            total += file_len(&path);
        }
        Ok(total)
    }

    fn remove_file(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove mirrored entry: {}", path.display())),
        }
    }
}

impl<V> CacheMirror<V> for SessionMirror
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn save(&self, entry: &CacheEntry<V>) -> Result<()> {
        let persisted = PersistedEntry {
            key: entry.key.clone(),
            data: &entry.data,
            cached_at: entry.cached_at,
            expires_at: entry.expires_at_wall(),
        };
        let contents = serde_json::to_string(&persisted)
            .with_context(|| format!("Failed to serialize cache entry: {}", entry.key))?;
        let path = self.entry_path(&entry.key);
        let bytes = contents.len() as u64;

        let mut usage = self.lock_usage();
        let total = match *usage {
            Some(total) => total,
            None => self.scan_usage()?,
        };
        let used = total.saturating_sub(file_len(&path));

        if used + bytes > self.quota_bytes {
            debug!(
                key = %entry.key,
                bytes,
                used,
                quota = self.quota_bytes,
                "Session quota exceeded, skipping mirror write"
            );
            // An older copy would only warm-start outdated data
            let removed = Self::remove_file(&path);
            *usage = removed.is_ok().then_some(used);
            return removed;
        }

        match std::fs::write(&path, contents) {
            Ok(()) => {
                *usage = Some(used + bytes);
                Ok(())
            }
            Err(e) => {
                *usage = None;
                Err(e).with_context(|| format!("Failed to write mirrored entry: {}", entry.key))
            }
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        let mut usage = self.lock_usage();
        let bytes = file_len(&path);
        let removed = Self::remove_file(&path);
        *usage = match (*usage, &removed) {
            (Some(total), Ok(())) => Some(total.saturating_sub(bytes)),
            _ => None,
        };
        removed
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut usage = self.lock_usage();
        *usage = None;
        let mut removed = 0;
        for (path, key) in self.entry_files()? {
            if key.starts_with(prefix) {
                Self::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        let mut usage = self.lock_usage();
        *usage = None;
        for (path, _) in self.entry_files()? {
            Self::remove_file(&path)?;
        }
        *usage = Some(0);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<CacheEntry<V>>> {
        // Expired and unreadable files are deleted below; rescan on the next write.
        *self.lock_usage() = None;
        let now = Utc::now();
        let mut entries = Vec::new();

        for (path, key) in self.entry_files()? {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read mirrored entry: {}", key))?;
            let persisted: PersistedEntry<V> = match serde_json::from_str(&contents) {
                Ok(p) => p,
                Err(e) => {
                    debug!(key = %key, error = %e, "Discarding unreadable mirrored entry");
                    Self::remove_file(&path)?;
                    continue;
                }
            };

            let remaining = match (persisted.expires_at - now).to_std() {
                Ok(r) if !r.is_zero() => r,
                _ => {
                    Self::remove_file(&path)?;
                    continue;
                }
            };

            entries.push(CacheEntry::restored(
                persisted.key,
                persisted.data,
                persisted.cached_at,
                remaining,
            ));
        }

        Ok(entries)
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// File-name-safe form of a cache key; bytes outside `[A-Za-z0-9._-]` become `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
