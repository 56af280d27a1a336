use crate::components::ics_feed::models::Document;
use crate::error::{cache_error, FeedResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How long a fetched document stays fresh
pub const CACHE_TTL_SECS: i64 = 5 * 60;

/// Length of the file-name key derived from a URL
pub const CACHE_KEY_LEN: usize = 32;

/// On-disk record for one source URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDocument {
    pub url: String,
    /// Epoch milliseconds
    pub fetched_at: i64,
    pub document: Document,
}

impl CachedDocument {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.timestamp_millis() - self.fetched_at < ttl.num_milliseconds()
    }
}

/// File-backed document cache, one JSON file per URL
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, Duration::seconds(CACHE_TTL_SECS))
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { dir: dir.into(), ttl }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for `url`
    pub fn entry_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cache_key(url)))
    }

    pub fn get(&self, url: &str) -> Option<CachedDocument> {
        self.get_at(url, Utc::now())
    }

    /// Fresh entry for `url` as seen at `now`.
    ///
    /// Missing, expired, unreadable and foreign entries are all misses.
    pub fn get_at(&self, url: &str, now: DateTime<Utc>) -> Option<CachedDocument> {
        let path = self.entry_path(url);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache entry");
                return None;
            }
        };

        let entry: CachedDocument = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache entry");
                return None;
            }
        };

        // Two URLs sharing a truncated key
        if entry.url != url {
            debug!(url, cached = %entry.url, "Cache key collision");
            return None;
        }

        if !entry.is_fresh(now, self.ttl) {
            debug!(url, "Cache entry expired");
            return None;
        }

        Some(entry)
    }

    pub fn put(&self, url: &str, document: Document) -> FeedResult<()> {
        self.put_at(url, document, Utc::now())
    }

    /// Replace the entry for `url`, stamped with `now`
    pub fn put_at(&self, url: &str, document: Document, now: DateTime<Utc>) -> FeedResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| cache_error(&format!("Failed to create {}: {}", self.dir.display(), e)))?;

        let entry = CachedDocument {
            url: url.to_string(),
            fetched_at: now.timestamp_millis(),
            document,
        };
        let json = serde_json::to_string(&entry)?;

        // Readers never see a half-written file
        let path = self.entry_path(url);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| cache_error(&format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| cache_error(&format!("Failed to replace {}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Remove the entry for `url`; removing a missing entry succeeds
    pub fn invalidate(&self, url: &str) -> FeedResult<()> {
        let path = self.entry_path(url);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_error(&format!("Failed to remove {}: {}", path.display(), e))),
        }
    }
}

/// URL-safe, fixed-length key: base64url(sha256(url)) cut to [`CACHE_KEY_LEN`]
pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut key = URL_SAFE_NO_PAD.encode(digest);
    key.truncate(CACHE_KEY_LEN);
    key
}
