//! HTTP connections used to stream tiles.
//!
//! A [`Connection`] opens a [`RequestDescriptor`] and hands back a streaming
//! body. [`HttpSession`] is the reqwest-backed implementation kept in the
//! session pool, one per connection group (URL origin).

use crate::config::FetchConfig;
use crate::error::{FailureKind, FetchFailure};
use crate::pool::PooledResource;
use crate::Result;
use reqwest::Url;
use std::fmt;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// Longest slice of an error response body kept in a failure message.
pub(crate) const ERROR_SNIPPET_LEN: usize = 512;

/// A fully formed request, executed verbatim by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    url: Url,
}

impl RequestDescriptor {
    /// Wrap an already built URL.
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Parse a URL string.
    pub fn parse(url: &str) -> Result<Self> {
        Url::parse(url).map(Self::new).map_err(|e| {
            crate::DemError::InvalidInput(format!("invalid request URL '{}': {}", url, e))
        })
    }

    /// The request URL, query included.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Key of the connection group serving this request (scheme, host and port).
    pub fn connection_key(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Body of a successful response, read incrementally.
pub struct ResponseBody {
    /// Streaming reader over the payload.
    pub reader: Box<dyn Read + Send>,
    /// Size announced by the server, if any.
    pub content_length: Option<u64>,
    /// `Content-Type` announced by the server, if any.
    pub content_type: Option<String>,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Something able to open a request and stream its body.
///
/// Implementations are shared between worker threads, so `open` takes `&self`.
pub trait Connection: Send + Sync {
    /// Issue the request. Non-success statuses are failures, classified by
    /// whether retrying could help.
    fn open(&self, request: &RequestDescriptor) -> std::result::Result<ResponseBody, FetchFailure>;
}

/// Pooled HTTP client for one connection group.
pub struct HttpSession {
    origin: String,
    client: reqwest::blocking::Client,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("origin", &self.origin)
            .finish()
    }
}

impl HttpSession {
    /// Build a session for `origin` using the timeouts and limits in `config`.
    pub fn new(origin: impl Into<String>, config: &FetchConfig) -> Result<Self> {
        let origin = origin.into();
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(config.user_agent.as_str())
            .build()?;
        debug!(origin = %origin, "opened HTTP session");
        Ok(Self { origin, client })
    }

    /// Connection group this session serves.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The underlying client, for non-tile requests such as service metadata.
    pub fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }
}

impl PooledResource for HttpSession {
    fn close(&mut self) {
        debug!(origin = %self.origin, "closing HTTP session");
    }
}

impl Connection for HttpSession {
    fn open(&self, request: &RequestDescriptor) -> std::result::Result<ResponseBody, FetchFailure> {
        let response = self
            .client
            .get(request.url().clone())
            .send()
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let snippet = error_snippet(response);
            return Err(FetchFailure::from_status(
                status.as_u16(),
                format!("{} from {}: {}", status, request.url().path(), snippet),
            ));
        }

        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(ResponseBody {
            reader: Box::new(response),
            content_length,
            content_type,
        })
    }
}

/// Map a reqwest error raised before the body is read to a tile failure.
pub(crate) fn classify_request_error(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::transient(FailureKind::Timeout, err.to_string())
    } else if err.is_connect() {
        FetchFailure::transient(FailureKind::Connect, err.to_string())
    } else if let Some(status) = err.status() {
        FetchFailure::from_status(status.as_u16(), err.to_string())
    } else if err.is_builder() {
        FetchFailure::permanent(FailureKind::Status(400), err.to_string())
    } else {
        // Resets and other transport errors
        FetchFailure::transient(FailureKind::Stream, err.to_string())
    }
}

/// Map an error reading the response body to a tile failure.
pub(crate) fn classify_read_error(err: &std::io::Error) -> FetchFailure {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            FetchFailure::transient(FailureKind::Timeout, err.to_string())
        }
        _ => FetchFailure::transient(FailureKind::Stream, err.to_string()),
    }
}

fn error_snippet(response: reqwest::blocking::Response) -> String {
    let mut buf = Vec::new();
    if response
        .take(ERROR_SNIPPET_LEN as u64)
        .read_to_end(&mut buf)
        .is_err()
    {
        return String::from("<unreadable body>");
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_key_is_origin() {
        let a = RequestDescriptor::parse(
            "https://elevation.nationalmap.gov/arcgis/rest/services/3DEPElevation/ImageServer/exportImage?bbox=1,2,3,4",
        )
        .unwrap();
        let b = RequestDescriptor::parse("https://elevation.nationalmap.gov/other").unwrap();
        let c = RequestDescriptor::parse("http://127.0.0.1:8080/exportImage").unwrap();

        assert_eq!(a.connection_key(), "https://elevation.nationalmap.gov");
        assert_eq!(a.connection_key(), b.connection_key());
        assert_eq!(c.connection_key(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_invalid_url() {
        assert!(RequestDescriptor::parse("not a url").is_err());
    }

    #[test]
    fn test_read_error_classification() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");

        let failure = classify_read_error(&timeout);
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.retriable);

        let failure = classify_read_error(&reset);
        assert_eq!(failure.kind, FailureKind::Stream);
        assert!(failure.retriable);
    }

    #[test]
    fn test_session_builds_from_default_config() {
        let session = HttpSession::new("https://example.com", &FetchConfig::default()).unwrap();
        assert_eq!(session.origin(), "https://example.com");
    }
}
