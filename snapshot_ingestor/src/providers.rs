//! Provider abstraction for the ranked price source.
//!
//! This module defines the [`SnapshotProvider`] trait, the unified interface
//! over any upstream that can (a) page through assets ordered by market value
//! and (b) return current quotes for a comma-joined batch of asset IDs.
//!
//! Each concrete upstream implements [`SnapshotProvider`] to handle its own
//! URL layout, auth header and payload shape. The trait is object safe so the
//! runtime can pick an implementation (or a test double) behind
//! `Arc<dyn SnapshotProvider>`.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use indexmap::IndexMap;
//! use snapshot_ingestor::models::{ranking::RankedAsset, snapshot::RawQuote};
//! use snapshot_ingestor::providers::{ProviderError, SnapshotProvider};
//!
//! struct MyProvider;
//!
//! #[async_trait]
//! impl SnapshotProvider for MyProvider {
//!     async fn fetch_ranking_page(
//!         &self,
//!         _page: u32,
//!         _per_page: u32,
//!     ) -> Result<Vec<RankedAsset>, ProviderError> {
//!         Ok(vec![])
//!     }
//!
//!     async fn fetch_quotes(
//!         &self,
//!         _asset_ids: &[String],
//!     ) -> Result<IndexMap<String, RawQuote>, ProviderError> {
//!         Ok(IndexMap::new())
//!     }
//! }
//! ```

pub mod coingecko;

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use shared_utils::env::MissingEnvVarError;
use snafu::{Backtrace, Snafu};

use crate::models::{ranking::RankedAsset, snapshot::RawQuote};

/// Trait for reading rankings and current quotes from an upstream source.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Fetches one page (1-based) of assets ordered by descending market value.
    ///
    /// A page shorter than `per_page` means the catalog is exhausted.
    async fn fetch_ranking_page(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RankedAsset>, ProviderError>;

    /// Fetches current quotes for a batch of asset IDs in one upstream call.
    ///
    /// IDs the upstream does not know about are simply absent from the map.
    async fn fetch_quotes(
        &self,
        asset_ids: &[String],
    ) -> Result<IndexMap<String, RawQuote>, ProviderError>;
}

/// Errors that can occur during the creation of a provider instance
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderInitError {
    /// missed environment variable.
    #[snafu(display("Missing environment variable: {source}"))]
    MissingEnvVar {
        source: MissingEnvVarError,
        backtrace: Backtrace,
    },

    /// failed to init reqwest client
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// API key contains invalid characters.
    #[snafu(display("Invalid API key format: {source}"))]
    InvalidApiKey {
        source: reqwest::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },

    /// Configured auth header name is not a valid HTTP header name.
    #[snafu(display("Invalid API key header name {name:?}: {source}"))]
    InvalidHeaderName {
        name: String,
        source: reqwest::header::InvalidHeaderName,
        backtrace: Backtrace,
    },
}

/// Errors that can occur within a `SnapshotProvider` implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    /// The upstream signalled its own rate limit (HTTP 429 or equivalent).
    #[snafu(display("Upstream throttled the request (retry after {retry_after:?})"))]
    Throttled {
        retry_after: Option<Duration>,
        backtrace: Backtrace,
    },

    /// The upstream failed on its side (HTTP 5xx).
    #[snafu(display("Upstream server error {status}: {message}"))]
    Server {
        status: u16,
        message: String,
        backtrace: Backtrace,
    },

    /// Credentials were missing or rejected (HTTP 401/403).
    #[snafu(display("Upstream rejected credentials ({status}): {message}"))]
    Auth {
        status: u16,
        message: String,
        backtrace: Backtrace,
    },

    /// Any other non-success HTTP status.
    #[snafu(display("API error {status}: {message}"))]
    Api {
        status: u16,
        message: String,
        backtrace: Backtrace,
    },

    /// An error during an API request (e.g., network failure, timeout).
    #[snafu(display("API request failed: {source}"))]
    Reqwest {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// Transport failure reported without a reqwest error (connection reset, DNS...).
    #[snafu(display("Network error: {message}"))]
    Network {
        message: String,
        backtrace: Backtrace,
    },

    /// The response body did not have the expected shape.
    #[snafu(display("Malformed upstream payload: {message}"))]
    Decode {
        message: String,
        backtrace: Backtrace,
    },

    /// The request parameters were invalid for this specific provider.
    #[snafu(display("Invalid parameters for provider: {message}"))]
    Validation {
        message: String,
        backtrace: Backtrace,
    },

    /// An error during provider configuration or initialization.
    #[snafu(display("Provider initialization error: {source}"))]
    Init {
        #[snafu(backtrace)]
        source: ProviderInitError,
    },
}

impl ProviderError {
    /// Maps a non-success HTTP status (plus body and `Retry-After`) onto the taxonomy.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ThrottledSnafu { retry_after }.build(),
            401 | 403 => AuthSnafu { status, message }.build(),
            500..=599 => ServerSnafu { status, message }.build(),
            _ => ApiSnafu { status, message }.build(),
        }
    }

    /// Upstream hint for how long to wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert!(matches!(
            ProviderError::from_status(429, String::new(), Some(Duration::from_secs(7))),
            ProviderError::Throttled { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            ProviderError::from_status(401, "bad key".into(), None),
            ProviderError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(403, "forbidden".into(), None),
            ProviderError::Auth { status: 403, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(503, "down".into(), None),
            ProviderError::Server { status: 503, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(404, "nope".into(), None),
            ProviderError::Api { status: 404, .. }
        ));
    }

    #[test]
    fn retry_after_only_on_throttled() {
        let e = ProviderError::from_status(429, String::new(), Some(Duration::from_secs(3)));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));
        let e = ProviderError::from_status(500, String::new(), None);
        assert_eq!(e.retry_after(), None);
    }
}
