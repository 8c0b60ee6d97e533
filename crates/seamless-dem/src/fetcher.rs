//! Streaming one tile to disk.
//!
//! The body is written to a temporary file next to the target and renamed
//! over it only once every byte has arrived, so a target path either holds a
//! complete tile or nothing. Any failed attempt deletes its temporary file.

use crate::config::{FetchConfig, RetryPolicy, DEFAULT_CHUNK_SIZE};
use crate::connection::{classify_read_error, Connection, ERROR_SNIPPET_LEN};
use crate::error::{FailureKind, FetchFailure};
use crate::orchestrator::{CancellationToken, FetchOutcome, SubTileRequest};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Statistics about downloads performed by a fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Number of tiles downloaded.
    pub tiles_downloaded: usize,
    /// Number of tiles kept because the target already existed.
    pub tiles_skipped: usize,
    /// Total bytes written to completed tiles.
    pub bytes_downloaded: u64,
}

/// Downloads single tiles with retries.
#[derive(Debug)]
pub struct StreamFetcher {
    retry: RetryPolicy,
    chunk_size: usize,
    skip_existing: bool,
    tiles_downloaded: AtomicUsize,
    tiles_skipped: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl Default for StreamFetcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_CHUNK_SIZE)
    }
}

impl StreamFetcher {
    /// Create a fetcher that always downloads.
    pub fn new(retry: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            retry,
            chunk_size: chunk_size.max(1),
            skip_existing: false,
            tiles_downloaded: AtomicUsize::new(0),
            tiles_skipped: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    /// Create a fetcher from the retry, chunk and skip settings of `config`.
    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.retry.clone(), config.chunk_size).with_skip_existing(config.skip_existing)
    }

    /// Keep existing non-empty targets instead of downloading them again.
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Get download statistics for this fetcher.
    pub fn download_stats(&self) -> DownloadStats {
        DownloadStats {
            tiles_downloaded: self.tiles_downloaded.load(Ordering::Relaxed),
            tiles_skipped: self.tiles_skipped.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Fetch one tile to its target path.
    ///
    /// Transient failures are retried with backoff until the policy's attempts
    /// run out; permanent failures return immediately. The outcome is
    /// `Success` only once the complete file is in place.
    pub fn fetch(
        &self,
        request: &SubTileRequest,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let target = request.target_path();
        if cancel.is_cancelled() {
            return FetchOutcome::Failure(FetchFailure::cancelled());
        }

        if self.skip_existing && is_complete_file(target) {
            debug!(index = request.sequence_index(), path = %target.display(), "tile already present");
            self.tiles_skipped.fetch_add(1, Ordering::Relaxed);
            return FetchOutcome::Success(target.to_path_buf());
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                return FetchOutcome::Failure(FetchFailure::permanent(
                    FailureKind::Io,
                    format!("cannot create {}: {}", parent.display(), e),
                ));
            }
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return FetchOutcome::Failure(FetchFailure::cancelled());
            }

            match self.attempt(request, connection, cancel) {
                Ok(bytes) => {
                    self.tiles_downloaded.fetch_add(1, Ordering::Relaxed);
                    self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
                    debug!(
                        index = request.sequence_index(),
                        bytes,
                        attempt,
                        path = %target.display(),
                        "tile downloaded"
                    );
                    return FetchOutcome::Success(target.to_path_buf());
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    return FetchOutcome::Failure(failure);
                }
                Err(failure) if failure.retriable && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt, &mut rand::thread_rng());
                    warn!(
                        index = request.sequence_index(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "tile fetch failed, retrying"
                    );
                    if cancel.wait_timeout(delay) {
                        return FetchOutcome::Failure(FetchFailure::cancelled());
                    }
                }
                Err(mut failure) => {
                    warn!(
                        index = request.sequence_index(),
                        attempt,
                        error = %failure,
                        "tile fetch failed"
                    );
                    if attempt > 1 {
                        failure.message = format!("{} (after {} attempts)", failure.message, attempt);
                    }
                    return FetchOutcome::Failure(failure);
                }
            }
        }
    }

    /// One attempt: open, stream into a temp file, check, rename into place.
    fn attempt(
        &self,
        request: &SubTileRequest,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchFailure> {
        let target = request.target_path();
        let mut body = connection.open(request.descriptor())?;
        if let Some(content_type) = body.content_type.as_deref().filter(|t| is_error_payload(t)) {
            // ArcGIS reports request errors as a JSON document with status 200
            let mut snippet = Vec::new();
            let _ = body
                .reader
                .by_ref()
                .take(ERROR_SNIPPET_LEN as u64)
                .read_to_end(&mut snippet);
            return Err(FetchFailure::permanent(
                FailureKind::ContentType,
                format!(
                    "expected raster data, got {}: {}",
                    content_type,
                    String::from_utf8_lossy(&snippet).trim()
                ),
            ));
        }

        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tile".to_string());
        let mut part = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| io_failure("create temporary file", dir, &e))?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchFailure::cancelled());
            }
            let n = match body.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_read_error(&e)),
            };
            part.write_all(&buf[..n])
                .map_err(|e| io_failure("write", part.path(), &e))?;
            written += n as u64;
        }

        if let Some(expected) = body.content_length {
            if written != expected {
                return Err(FetchFailure::transient(
                    FailureKind::Truncated,
                    format!("received {} of {} bytes", written, expected),
                ));
            }
        }
        if written == 0 {
            return Err(FetchFailure::transient(
                FailureKind::EmptyBody,
                "server returned an empty body",
            ));
        }

        part.as_file()
            .sync_all()
            .map_err(|e| io_failure("sync", part.path(), &e))?;
        part.persist(target)
            .map_err(|e| io_failure("move into place", target, &e.error))?;
        Ok(written)
    }
}

/// Media types a raster endpoint only sends when something went wrong.
fn is_error_payload(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media == "application/json" || media.ends_with("+json") || media.starts_with("text/")
}

fn is_complete_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn io_failure(action: &str, path: &Path, err: &std::io::Error) -> FetchFailure {
    FetchFailure::permanent(
        FailureKind::Io,
        format!("cannot {} {}: {}", action, path.display(), err),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::{BoundingBox, Resolution};
    use crate::connection::mock::{body, typed_body, DroppingReader, MockConnection};
    use crate::connection::RequestDescriptor;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn request(dir: &Path, name: &str) -> SubTileRequest {
        SubTileRequest::new(
            BoundingBox::new(-105.7, 39.85, -105.6, 39.95).unwrap(),
            Resolution::new(10.0).unwrap(),
            0,
            dir.join(name),
            RequestDescriptor::parse("http://tiles.test/tile/0").unwrap(),
        )
    }

    fn dir_entries(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn test_successful_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn = MockConnection::new(|_| Ok(body(b"elevation bytes")));
        // Small chunks so the body arrives in several pieces
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(3), 4);

        let outcome = fetcher.fetch(&req, &conn, &CancellationToken::new());
        assert_eq!(outcome, FetchOutcome::Success(dir.path().join("tile.tiff")));
        assert_eq!(fs::read(dir.path().join("tile.tiff")).unwrap(), b"elevation bytes");
        assert_eq!(dir_entries(dir.path()).len(), 1);

        let stats = fetcher.download_stats();
        assert_eq!(stats.tiles_downloaded, 1);
        assert_eq!(stats.bytes_downloaded, 15);
    }

    #[test]
    fn test_mid_stream_drop_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn = MockConnection::new(|_| Ok(DroppingReader::body(b"partial", 1000)));
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(2), 1024);

        let outcome = fetcher.fetch(&req, &conn, &CancellationToken::new());
        match outcome {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Stream);
                assert!(failure.retriable);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.opens(), 2);
        assert!(!dir.path().join("tile.tiff").exists());
        assert!(dir_entries(dir.path()).is_empty(), "temporary files left behind");
    }

    #[test]
    fn test_failed_download_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        fs::write(req.target_path(), b"previous").unwrap();
        let conn = MockConnection::new(|_| Ok(DroppingReader::body(b"new", 10)));
        let fetcher = StreamFetcher::new(RetryPolicy::no_retry(), 1024);

        assert!(!fetcher.fetch(&req, &conn, &CancellationToken::new()).is_success());
        assert_eq!(fs::read(req.target_path()).unwrap(), b"previous");
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn =
            MockConnection::new(|_| Err(FetchFailure::from_status(404, "404 Not Found")));
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(5), 1024);

        let outcome = fetcher.fetch(&req, &conn, &CancellationToken::new());
        match outcome {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Status(404));
                assert!(!failure.retriable);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.opens(), 1);
    }

    #[test]
    fn test_server_error_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let conn = MockConnection::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FetchFailure::from_status(503, "503 Service Unavailable"))
            } else {
                Ok(body(b"tile"))
            }
        });
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(5), 1024);

        let outcome = fetcher.fetch(&req, &conn, &CancellationToken::new());
        assert!(outcome.is_success());
        assert_eq!(conn.opens(), 3);
    }

    #[test]
    fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn = MockConnection::new(|_| Err(FetchFailure::from_status(502, "bad gateway")));
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(3), 1024);

        match fetcher.fetch(&req, &conn, &CancellationToken::new()) {
            FetchOutcome::Failure(failure) => {
                assert!(failure.retriable);
                assert!(failure.message.contains("after 3 attempts"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.opens(), 3);
    }

    #[test]
    fn test_truncated_and_empty_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let fetcher = StreamFetcher::new(RetryPolicy::no_retry(), 1024);

        let short = MockConnection::new(|_| {
            Ok(crate::connection::ResponseBody {
                reader: Box::new(std::io::Cursor::new(b"abc".to_vec())),
                content_length: Some(10),
                content_type: None,
            })
        });
        match fetcher.fetch(&req, &short, &CancellationToken::new()) {
            FetchOutcome::Failure(failure) => assert_eq!(failure.kind, FailureKind::Truncated),
            other => panic!("expected failure, got {:?}", other),
        }

        let empty = MockConnection::new(|_| Ok(body(b"")));
        match fetcher.fetch(&req, &empty, &CancellationToken::new()) {
            FetchOutcome::Failure(failure) => assert_eq!(failure.kind, FailureKind::EmptyBody),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_skip_existing() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        fs::write(req.target_path(), b"cached").unwrap();
        let conn = MockConnection::new(|_| Ok(body(b"fresh")));

        let skipping = StreamFetcher::new(RetryPolicy::no_retry(), 1024).with_skip_existing(true);
        assert!(skipping.fetch(&req, &conn, &CancellationToken::new()).is_success());
        assert_eq!(conn.opens(), 0);
        assert_eq!(skipping.download_stats().tiles_skipped, 1);
        assert_eq!(fs::read(req.target_path()).unwrap(), b"cached");

        let overwriting = StreamFetcher::new(RetryPolicy::no_retry(), 1024);
        assert!(overwriting.fetch(&req, &conn, &CancellationToken::new()).is_success());
        assert_eq!(fs::read(req.target_path()).unwrap(), b"fresh");
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn = MockConnection::new(|_| Ok(body(b"tile")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = StreamFetcher::default().fetch(&req, &conn, &cancel);
        assert_eq!(outcome, FetchOutcome::Failure(FetchFailure::cancelled()));
        assert_eq!(conn.opens(), 0);
    }

    #[test]
    fn test_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(&dir.path().join("a").join("b"), "tile.tiff");
        let conn = MockConnection::new(|_| Ok(body(b"tile")));

        assert!(StreamFetcher::default()
            .fetch(&req, &conn, &CancellationToken::new())
            .is_success());
        assert!(req.target_path().exists());
    }

    #[test]
    fn test_json_error_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tile.tiff");
        let conn = MockConnection::new(|_| {
            Ok(typed_body(
                br#"{"error":{"code":400,"message":"Invalid bbox"}}"#,
                "application/json; charset=utf-8",
            ))
        });
        let fetcher = StreamFetcher::new(RetryPolicy::immediate(3), 1024).with_skip_existing(true);

        match fetcher.fetch(&req, &conn, &CancellationToken::new()) {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::ContentType);
                assert!(!failure.retriable);
                assert!(failure.message.contains("Invalid bbox"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.opens(), 1);
        assert!(dir_entries(dir.path()).is_empty());

        let html = MockConnection::new(|_| Ok(typed_body(b"<html>maintenance</html>", "text/html")));
        assert!(!fetcher.fetch(&req, &html, &CancellationToken::new()).is_success());

        let tiff = MockConnection::new(|_| Ok(typed_body(b"II*\0", "image/tiff")));
        assert!(fetcher.fetch(&req, &tiff, &CancellationToken::new()).is_success());
    }
}
