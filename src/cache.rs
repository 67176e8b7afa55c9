//! On-disk response cache
//!
//! Cacheable responses are written to a path derived from the request while
//! they stream to the client, and served straight from disk afterwards.
//! Entries are published with an exclusive link: the first complete writer
//! wins and an existing entry is never replaced.
//!
//! Layout: `<root>/<name>/<target_port>/<version>/gzip-<bool>/<encoded path>`

use crate::head::{leading_number, ParsedHead};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Longest encoded request path usable as a file name
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Identity of a cacheable response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey<'a> {
    pub name: &'a str,
    pub target_port: u16,
    pub version: &'a str,
    pub gzip: bool,
    pub path: &'a str,
}

impl CacheKey<'_> {
    /// Percent-encoded request path, used as the file name
    pub fn file_name(&self) -> String {
        urlencoding::encode(self.path).into_owned()
    }

    /// Whether the key maps to a safe, single-segment location
    pub fn is_storable(&self) -> bool {
        let file_name = self.file_name();
        let version_ok = !self.version.is_empty()
            && self.version.chars().all(|c| c.is_ascii_digit() || c == '.')
            && self.version != "."
            && self.version != "..";

        !self.name.is_empty()
            && !self.name.contains(['/', '\\'])
            && version_ok
            && !file_name.is_empty()
            && file_name.len() <= MAX_FILE_NAME_LEN
            && file_name != "."
            && file_name != ".."
    }

    /// Location of the entry relative to the cache root
    pub fn relative_path(&self) -> PathBuf {
        [
            self.name.to_string(),
            self.target_port.to_string(),
            self.version.to_string(),
            format!("gzip-{}", self.gzip),
            self.file_name(),
        ]
        .iter()
        .collect()
    }
}

/// Outcome of checking a response head against the cache policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cacheability {
    Cacheable,
    Status(u16),
    ContentType(String),
    ContentLength(u64),
    Directive(String),
}

impl Cacheability {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Cacheability::Cacheable)
    }
}

/// Conservative rules deciding which responses are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Seconds an entry stays fresh; also the minimum origin max-age accepted
    pub max_age: u64,
    /// Largest entry, head included, in bytes
    pub max_file_size: u64,
}

impl CachePolicy {
    pub fn evaluate(&self, head: &ParsedHead) -> Cacheability {
        let status = head.status().unwrap_or(0);
        if status != 200 {
            return Cacheability::Status(status);
        }

        if let Some(content_type) = head.header("content-type") {
            let content_type = content_type.first();
            if !content_type.to_ascii_lowercase().contains("text/html") {
                return Cacheability::ContentType(content_type.to_string());
            }
        }

        if let Some(length) = head.header("content-length") {
            let length = leading_number(length.first());
            if length > self.max_file_size {
                return Cacheability::ContentLength(length);
            }
        }

        if let Some(cache_control) = head.header("cache-control") {
            for value in cache_control.values() {
                if let Some(directive) = self.blocking_directive(value) {
                    return Cacheability::Directive(directive);
                }
            }
        }

        Cacheability::Cacheable
    }

    fn blocking_directive(&self, value: &str) -> Option<String> {
        let value: String = value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        value.split(',').find_map(|directive| {
            let (key, arg) = directive.split_once('=').unwrap_or((directive, ""));
            let blocked = match key {
                "private" | "no-store" | "no-cache" => true,
                "max-age" | "s-maxage" => !arg.is_empty() && leading_number(arg) < self.max_age,
                _ => false,
            };
            blocked.then(|| directive.to_string())
        })
    }

    /// `Cache-Control` value written into stored responses
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.max_age)
    }
}

/// Cache root plus the policy applied to it
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    policy: CachePolicy,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn path_for(&self, key: &CacheKey<'_>) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Open a stored entry for serving
    pub async fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path).await
    }

    /// Delete an entry that is older than the max-age or empty.
    ///
    /// Called after an entry has been served; returns whether it was removed.
    pub async fn evict_if_stale(&self, path: &Path) -> bool {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return false,
        };

        let born = metadata.created().or_else(|_| metadata.modified());
        let age = born
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or(Duration::ZERO);

        if metadata.len() == 0 || age > Duration::from_secs(self.policy.max_age) {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Evicted stale cache entry");
                    return true;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to evict cache entry");
                }
            }
        }
        false
    }

    /// Start storing a response whose rewritten head is `head`.
    ///
    /// The body is staged in a uniquely named file next to the entry and
    /// published by [`CacheWriter::finish`]. Returns `Ok(None)` when the entry
    /// already exists or the head alone exceeds the size limit.
    pub async fn begin_write(&self, path: &Path, head: &[u8]) -> io::Result<Option<CacheWriter>> {
        if tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "Cache entry already exists");
            return Ok(None);
        }

        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;

        let staging = parent.join(format!(".#{}", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;

        let mut writer = CacheWriter {
            path: path.to_path_buf(),
            staging,
            file: Some(file),
            written: 0,
            limit: self.policy.max_file_size,
        };

        if writer.append(head).await? {
            Ok(Some(writer))
        } else {
            writer.abort().await;
            Ok(None)
        }
    }
}

/// Writer for one cache entry.
///
/// Readers never observe a partial entry: bytes go to a staging file that is
/// hard-linked into place only once complete, and never over an existing
/// entry. A writer dropped without [`CacheWriter::finish`] removes its
/// staging file.
#[derive(Debug)]
pub struct CacheWriter {
    path: PathBuf,
    staging: PathBuf,
    file: Option<File>,
    written: u64,
    limit: u64,
}

impl CacheWriter {
    /// Final location of the entry
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a chunk; `Ok(false)` means the size limit would be exceeded
    /// and nothing was written.
    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<bool> {
        let next = self.written + chunk.len() as u64;
        if next > self.limit {
            return Ok(false);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "cache writer already closed"))?;
        file.write_all(chunk).await?;
        self.written = next;
        Ok(true)
    }

    /// Close and publish the entry.
    ///
    /// Returns `Ok(false)` when the on-disk size does not match the bytes
    /// written or another writer published the entry first.
    pub async fn finish(mut self) -> io::Result<bool> {
        let size = self.settle().await?;
        if size != self.written {
            warn!(
                path = %self.path.display(),
                expected = self.written,
                actual = size,
                "Failed to write cache file"
            );
            self.abort().await;
            return Ok(false);
        }

        self.file = None;
        let published = match tokio::fs::hard_link(&self.staging, &self.path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %self.path.display(), "Cache entry published by another connection");
                false
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&self.staging).await;
                return Err(e);
            }
        };
        let _ = tokio::fs::remove_file(&self.staging).await;

        if published {
            debug!(path = %self.path.display(), bytes = size, "Cache entry stored");
        }
        Ok(published)
    }

    async fn settle(&mut self) -> io::Result<u64> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "cache writer already closed"))?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    /// Discard the entry
    pub async fn abort(mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&self.staging).await {
                debug!(path = %self.staging.display(), error = %e, "Failed to remove cache file");
            }
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}
