//! One row of the upstream "ranked list" call.

/// An asset as reported by the ranking endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedAsset {
    /// Upstream asset identifier (e.g., "bitcoin").
    pub asset_id: String,
    /// Ticker-ish symbol (e.g., "btc").
    pub symbol: Option<String>,
    /// Human-readable name.
    pub name: Option<String>,
    /// Market rank; lower means larger market value. Unranked assets are `None`.
    pub rank: Option<u32>,
    /// Monetary magnitude used for ranking (market capitalisation).
    pub weight_metric: Option<f64>,
}
