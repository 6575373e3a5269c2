use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::models::{
    ranking::RankedAsset,
    snapshot::{RawQuote, SecondaryMetrics},
};

/// One element of the `/coins/markets` array. Unused fields are ignored.
#[derive(Deserialize, Debug)]
pub struct MarketRow {
    pub id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub market_cap_rank: Option<u32>,
    pub market_cap: Option<f64>,
}

impl From<MarketRow> for RankedAsset {
    fn from(r: MarketRow) -> Self {
        RankedAsset {
            asset_id: r.id,
            symbol: r.symbol,
            name: r.name,
            rank: r.market_cap_rank,
            weight_metric: r.market_cap,
        }
    }
}

/// `/simple/price` body: asset id -> field name -> numeric value.
///
/// Field names carry the quote currency as a prefix (`usd`, `usd_market_cap`,
/// ...), so the inner map stays untyped and [`into_raw_quotes`] picks fields
/// by name.
pub type SimplePriceResponse = IndexMap<String, IndexMap<String, Option<f64>>>;

/// Converts a `/simple/price` body into quotes keyed by asset id.
pub fn into_raw_quotes(body: SimplePriceResponse, vs_currency: &str) -> IndexMap<String, RawQuote> {
    let cap_key = format!("{vs_currency}_market_cap");
    let vol_key = format!("{vs_currency}_24h_vol");
    let chg_key = format!("{vs_currency}_24h_change");

    body.into_iter()
        .map(|(id, fields)| {
            let get = |k: &str| fields.get(k).copied().flatten();
            let last_updated_at = get("last_updated_at")
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
            let quote = RawQuote {
                price: get(vs_currency),
                metrics: SecondaryMetrics {
                    market_cap: get(&cap_key),
                    volume_24h: get(&vol_key),
                    change_24h_pct: get(&chg_key),
                },
                last_updated_at,
            };
            (id, quote)
        })
        .collect()
}
