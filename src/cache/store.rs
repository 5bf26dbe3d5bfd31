// src/cache/store.rs
//! Durable cache tier. The trait models whatever shared key-value store the
//! deployment provides; the default implementation is a directory of JSON
//! blobs with atomic tmp+rename writes.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Payload + write time, as persisted in the durable tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub payload: serde_json::Value,
    pub stored_at_unix: u64,
}

impl StoredEntry {
    pub fn age_secs(&self, now_unix: u64) -> u64 {
        now_unix.saturating_sub(self.stored_at_unix)
    }
}

#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>>;
    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// File-backed store: one `<key>.json` per entry under a cache directory.
/// Keys are fingerprints (hex), so they are filesystem-safe by construction.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let _ = std::fs::create_dir_all(&dir); // best-effort
        Self { dir }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Defensive: hash anything that is not already a plain token.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait::async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let path = self.entry_path(key);
        match std::fs::read_to_string(&path) {
            Ok(s) => {
                let entry: StoredEntry = serde_json::from_str(&s)
                    .with_context(|| format!("decoding cache entry {}", path.display()))?;
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading cache entry {}", path.display())),
        }
    }

    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let path = self.entry_path(key);
        write_atomic(&path, &serde_json::to_string(entry)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing cache entry {}", path.display())),
        }
    }
}

/// No durable tier: every lookup misses, writes vanish. For deployments
/// that run purely on the in-process tier.
pub struct NullStore;

#[async_trait::async_trait]
impl DurableStore for NullStore {
    async fn get(&self, _key: &str) -> Result<Option<StoredEntry>> {
        Ok(None)
    }
    async fn put(&self, _key: &str, _entry: &StoredEntry) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// tmp + rename so readers never observe a half-written entry.
fn write_atomic(path: &Path, json: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = std::fs::File::create(&tmp)
        .with_context(|| format!("creating {}", tmp.display()))?;
    f.write_all(json.as_bytes())?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
