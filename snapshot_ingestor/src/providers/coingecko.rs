//! REST provider for CoinGecko-compatible price APIs.
//!
//! - [`params`] builds query strings for the two endpoints.
//! - [`response`] deserializes and converts the payloads.
//! - [`provider`] owns the HTTP client and maps status codes onto
//!   [`crate::providers::ProviderError`].

pub mod params;
pub mod provider;
pub mod response;

pub use provider::{CoinGeckoConfig, CoinGeckoProvider};
