//! Quote payloads before and after validation.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Magnitude fields that accompany a price. Any of them may be absent upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SecondaryMetrics {
    /// Market capitalisation in the quote currency.
    pub market_cap: Option<f64>,
    /// Trailing 24h traded volume in the quote currency.
    pub volume_24h: Option<f64>,
    /// Trailing 24h price change in percent.
    pub change_24h_pct: Option<f64>,
}

/// A quote exactly as the provider returned it, nothing checked yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQuote {
    /// Price in the quote currency.
    pub price: Option<f64>,
    /// Secondary magnitudes.
    pub metrics: SecondaryMetrics,
    /// Upstream "last updated" stamp, if the provider sends one.
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// A validated price observation for one asset.
///
/// Vendor-agnostic; the collector attaches bucket and rank when persisting it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSnapshot {
    /// Upstream asset identifier.
    pub asset_id: String,
    /// Strictly positive, finite price.
    pub price: f64,
    /// Secondary magnitudes.
    pub metrics: SecondaryMetrics,
    /// When the upstream observed the price.
    pub captured_at: DateTime<Utc>,
}
