// src/error.rs

//! Unified error handling for the change-detection engine.

use std::error::Error as StdError;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Typed failure for a single HTTP fetch.
///
/// The fetcher never surfaces raw transport errors; every failure is folded
/// into one of these variants so callers can decide on retry and reporting
/// without string matching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Request exceeded the per-request timeout
    #[error("request timed out")]
    Timeout,

    /// DNS resolution failed
    #[error("DNS resolution failed")]
    Dns,

    /// TCP connection refused or reset
    #[error("connection refused")]
    ConnectionRefused,

    /// TLS handshake or certificate failure
    #[error("TLS failure")]
    Tls,

    /// HTTP 4xx response
    #[error("HTTP client error {0}")]
    HttpClient(u16),

    /// HTTP 5xx response
    #[error("HTTP server error {0}")]
    HttpServer(u16),

    /// Response body exceeds the configured size limit
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// Response body could not be read or decoded
    #[error("payload decode failed")]
    Decode,
}

impl FetchError {
    /// Whether the failure is worth retrying.
    ///
    /// 408 and 429 are the only 4xx codes treated as transient; all other
    /// client errors are permanent for the requested resource.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::ConnectionRefused | FetchError::HttpServer(_) => true,
            FetchError::HttpClient(code) => matches!(code, 408 | 429),
            _ => false,
        }
    }

    /// The HTTP status carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpClient(code) | FetchError::HttpServer(code) => Some(*code),
            _ => None,
        }
    }

    /// Map a reqwest error onto the fetch taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout;
        }
        if err.is_decode() || err.is_body() {
            return FetchError::Decode;
        }
        if err.is_redirect() {
            // Redirect cap exhausted; report the non-standard loop code.
            return FetchError::HttpClient(310);
        }

        // reqwest does not expose DNS/TLS failures as variants; inspect the
        // source chain instead.
        let mut chain = String::new();
        let mut source: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = source {
            chain.push_str(&e.to_string().to_ascii_lowercase());
            chain.push(' ');
            source = e.source();
        }

        if chain.contains("dns") || chain.contains("name resolution") || chain.contains("resolve") {
            FetchError::Dns
        } else if chain.contains("tls") || chain.contains("certificate") || chain.contains("handshake") {
            FetchError::Tls
        } else {
            FetchError::ConnectionRefused
        }
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed outside the fetch pipeline
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Typed fetch failure
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Neither the sitemap entry point nor any child sitemap yielded URLs
    #[error("sitemap unavailable for {url}: {reason}")]
    SitemapUnavailable { url: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another detection run holds the site lock
    #[error("site '{site}' is busy: another detection run is in progress")]
    BusySite { site: String },

    /// The run deadline expired before completion
    #[error("run deadline exceeded for site '{site}'")]
    DeadlineExceeded { site: String },

    /// Site id not present in the configuration
    #[error("unknown site '{0}'")]
    UnknownSite(String),

    /// Baseline identifier not found in the store
    #[error("baseline '{id}' not found for site '{site}'")]
    BaselineNotFound { site: String, id: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a sitemap-unavailable error.
    pub fn sitemap_unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SitemapUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::HttpServer(503).is_transient());
        assert!(FetchError::HttpClient(429).is_transient());
        assert!(FetchError::HttpClient(408).is_transient());
        assert!(!FetchError::HttpClient(404).is_transient());
        assert!(!FetchError::Tls.is_transient());
        assert!(!FetchError::TooLarge { limit: 1 }.is_transient());
    }

    #[test]
    fn test_status_extraction() {
        assert_eq!(FetchError::HttpClient(404).status(), Some(404));
        assert_eq!(FetchError::HttpServer(502).status(), Some(502));
        assert_eq!(FetchError::Timeout.status(), None);
    }
}
