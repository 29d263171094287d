//! Static-content cache.
//!
//! Entries are keyed by absolute file path and fingerprinted by size and
//! mtime; a fingerprint change evicts and repopulates on the next request.
//! Files under the `max` ceiling are buffered with a pre-computed gzip
//! variant; larger files carry metadata only and are streamed. The entry
//! tag doubles as weak and strong ETag, with a `-gz` suffix for the
//! compressed variant.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use mime_guess::from_path;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Key for entry tags when no secret is configured. Deterministic so tags
/// agree across processes serving the same tree.
const DEFAULT_TAG_KEY: &str = "haven-static-content";

/// One cached file. Immutable once published; `raw`/`gzip` presence
/// distinguishes buffered from streaming serving.
pub struct CacheEntry {
    pub abs_path: PathBuf,
    pub url_path: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub mime: String,
    pub tag: String,
    pub raw: Option<Bytes>,
    pub gzip: Option<Bytes>,
}

impl CacheEntry {
    pub fn etag_strong(&self) -> String {
        format!("\"{}\"", self.tag)
    }

    pub fn etag_weak(&self) -> String {
        format!("W/\"{}\"", self.tag)
    }

    pub fn etag_gzip(&self) -> String {
        format!("\"{}-gz\"", self.tag)
    }

    /// Match a comma-separated `If-None-Match` list against the tag or its
    /// gzip variant, ignoring weak markers.
    pub fn matches_etag(&self, header: &str) -> bool {
        let gz = format!("{}-gz", self.tag);
        header.split(',').any(|candidate| {
            let candidate = candidate
                .trim()
                .trim_start_matches("W/")
                .trim_matches('"');
            candidate == "*" || candidate == self.tag || candidate == gz
        })
    }

    /// `If-Modified-Since` comparison at HTTP-date (second) precision.
    pub fn unmodified_since(&self, header: &str) -> bool {
        let Ok(since) = httpdate::parse_http_date(header) else {
            return false;
        };
        let mtime_secs = self
            .mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let since_secs = since
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        mtime_secs <= since_secs
    }

    /// Whether the request's conditional headers make a 304 appropriate.
    pub fn not_modified(
        &self,
        if_none_match: Option<&str>,
        if_modified_since: Option<&str>,
    ) -> bool {
        if let Some(inm) = if_none_match {
            return self.matches_etag(inm);
        }
        if let Some(ims) = if_modified_since {
            return self.unmodified_since(ims);
        }
        false
    }

    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(self.mtime)
    }

    /// True when the entry is buffered in memory.
    pub fn buffered(&self) -> bool {
        self.raw.is_some()
    }
}

/// Concurrent path→entry cache with atomic replace on fingerprint change.
pub struct FileCache {
    entries: DashMap<PathBuf, Arc<CacheEntry>>,
    tag_key: Vec<u8>,
    /// Payload ceiling above which entries are streaming-only.
    max: u64,
    /// Optional global entry count.
    limit: Option<usize>,
}

impl FileCache {
    pub fn new(secret: Option<&str>, max: u64, limit: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            tag_key: secret.unwrap_or(DEFAULT_TAG_KEY).as_bytes().to_vec(),
            max,
            limit,
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.entries.get(path).map(|e| Arc::clone(e.value()))
    }

    pub fn delete(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `hmac(path + size + mtime)`, hex-encoded.
    pub fn tag_for(&self, path: &Path, size: u64, mtime: SystemTime) -> String {
        let mtime_ms = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut mac =
            HmacSha256::new_from_slice(&self.tag_key).expect("hmac accepts any key length");
        mac.update(path.to_string_lossy().as_bytes());
        mac.update(size.to_string().as_bytes());
        mac.update(mtime_ms.to_string().as_bytes());
        hex(&mac.finalize().into_bytes())
    }

    /// Current entry for `abs_path`, repopulated when the file's size or
    /// mtime changed. `compressible` decides whether a gzip variant is
    /// pre-computed for buffered entries.
    pub async fn fetch(
        &self,
        abs_path: &Path,
        url_path: &str,
        compressible: bool,
    ) -> std::io::Result<Arc<CacheEntry>> {
        let meta = tokio::fs::metadata(abs_path).await?;
        let size = meta.len();
        let mtime = meta.modified()?;

        if let Some(entry) = self.get(abs_path) {
            if entry.size == size && entry.mtime == mtime {
                return Ok(entry);
            }
            debug!(path = %abs_path.display(), "fingerprint changed, entry evicted");
            self.delete(abs_path);
        }

        let mime = from_path(abs_path).first_or_octet_stream().to_string();
        let tag = self.tag_for(abs_path, size, mtime);

        let (raw, gzip) = if size < self.max {
            let content = Bytes::from(tokio::fs::read(abs_path).await?);
            let gzip = if compressible {
                compress(&content).map(Bytes::from)
            } else {
                None
            };
            (Some(content), gzip)
        } else {
            (None, None)
        };

        let entry = Arc::new(CacheEntry {
            abs_path: abs_path.to_path_buf(),
            url_path: url_path.to_string(),
            size,
            mtime,
            mime,
            tag,
            raw,
            gzip,
        });
        self.insert(entry.clone());
        Ok(entry)
    }

    fn insert(&self, entry: Arc<CacheEntry>) {
        if let Some(limit) = self.limit {
            while self.entries.len() >= limit {
                let victim = self.entries.iter().next().map(|e| e.key().clone());
                match victim {
                    Some(key) => {
                        self.entries.remove(&key);
                    }
                    None => break,
                }
            }
        }
        self.entries.insert(entry.abs_path.clone(), entry);
    }
}

/// Gzip a payload; `None` when compression does not shrink it.
fn compress(content: &Bytes) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < content.len()).then_some(compressed)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
