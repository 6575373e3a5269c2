use serde::Serialize;

/// Sort order accepted by the markets endpoint. We only ever need one.
#[derive(Clone, Copy, Debug, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketOrder {
    #[default]
    MarketCapDesc,
}

/// Query parameters for `GET /coins/markets`.
#[derive(Clone, Debug, Serialize)]
pub struct MarketsParams<'a> {
    pub vs_currency: &'a str,
    pub order: MarketOrder,
    pub per_page: u32,
    pub page: u32,
    pub sparkline: bool,
}

impl<'a> MarketsParams<'a> {
    pub fn new(vs_currency: &'a str, page: u32, per_page: u32) -> Self {
        Self {
            vs_currency,
            order: MarketOrder::default(),
            per_page,
            page,
            sparkline: false,
        }
    }
}

/// Query parameters for `GET /simple/price`.
#[derive(Clone, Debug, Serialize)]
pub struct SimplePriceParams<'a> {
    /// Comma-joined asset IDs.
    pub ids: String,
    pub vs_currencies: &'a str,
    pub include_market_cap: bool,
    pub include_24hr_vol: bool,
    pub include_24hr_change: bool,
    pub include_last_updated_at: bool,
}

impl<'a> SimplePriceParams<'a> {
    pub fn new(asset_ids: &[String], vs_currency: &'a str) -> Self {
        Self {
            ids: asset_ids.join(","),
            vs_currencies: vs_currency,
            include_market_cap: true,
            include_24hr_vol: true,
            include_24hr_change: true,
            include_last_updated_at: true,
        }
    }
}
