use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Response, header};
use secrecy::{ExposeSecret, SecretString};
use shared_utils::env::{get_env_var, get_env_var_opt};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    models::{ranking::RankedAsset, snapshot::RawQuote},
    providers::{
        ClientBuildSnafu, DecodeSnafu, InvalidApiKeySnafu, InvalidHeaderNameSnafu, MissingEnvVarSnafu,
        ProviderError, ProviderInitError, ReqwestSnafu, SnapshotProvider,
        coingecko::{
            params::{MarketsParams, SimplePriceParams},
            response::{MarketRow, SimplePriceResponse, into_raw_quotes},
        },
    },
};

/// Public (keyless) base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Environment variable holding the optional API key.
pub const API_KEY_ENV: &str = "COLLECTOR_API_KEY";

/// Connection settings for [`CoinGeckoProvider`].
#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    /// API root, without trailing slash.
    pub base_url: String,
    /// Quote currency (lowercase, e.g. "usd").
    pub vs_currency: String,
    /// Header the key is sent in (e.g. "x-cg-demo-api-key").
    pub api_key_header: String,
    /// Optional key; keyless access is valid on the public tier.
    pub api_key: Option<SecretString>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            vs_currency: "usd".to_string(),
            api_key_header: "x-cg-demo-api-key".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CoinGeckoConfig {
    /// Fills `api_key` from [`API_KEY_ENV`] when it is set.
    pub fn with_env_key(mut self) -> Self {
        if let Some(k) = get_env_var_opt(API_KEY_ENV) {
            self.api_key = Some(SecretString::from(k));
        }
        self
    }

    /// Like [`Self::with_env_key`], but a missing key is an error.
    pub fn with_required_env_key(mut self) -> Result<Self, ProviderInitError> {
        let k = get_env_var(API_KEY_ENV).context(MissingEnvVarSnafu)?;
        self.api_key = Some(SecretString::from(k));
        Ok(self)
    }
}

pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
    vs_currency: String,
}

impl CoinGeckoProvider {
    /// Creates a provider. The API key, when present, is sent as a default header.
    pub fn new(cfg: CoinGeckoConfig) -> Result<Self, ProviderInitError> {
        let client = Client::builder()
            .default_headers(Self::default_headers(&cfg)?)
            .timeout(cfg.timeout)
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            vs_currency: cfg.vs_currency.to_lowercase(),
        })
    }

    /// Headers sent on every request; the key value is marked sensitive.
    fn default_headers(cfg: &CoinGeckoConfig) -> Result<header::HeaderMap, ProviderInitError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(key) = &cfg.api_key {
            let name = header::HeaderName::from_bytes(cfg.api_key_header.as_bytes()).context(
                InvalidHeaderNameSnafu {
                    name: cfg.api_key_header.clone(),
                },
            )?;
            let mut value =
                header::HeaderValue::from_str(key.expose_secret()).context(InvalidApiKeySnafu)?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Turns a non-success response into the matching [`ProviderError`].
    async fn status_error(response: Response) -> ProviderError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown API error".to_string());
        ProviderError::from_status(status, message, retry_after)
    }
}

#[async_trait]
impl SnapshotProvider for CoinGeckoProvider {
    async fn fetch_ranking_page(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RankedAsset>, ProviderError> {
        let url = format!("{}/coins/markets", self.base_url);
        let params = MarketsParams::new(&self.vs_currency, page, per_page);
        debug!(page, per_page, "requesting ranking page");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context(ReqwestSnafu)?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let rows: Vec<MarketRow> = response.json().await.map_err(|e| {
            DecodeSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_quotes(
        &self,
        asset_ids: &[String],
    ) -> Result<IndexMap<String, RawQuote>, ProviderError> {
        if asset_ids.is_empty() {
            return Ok(IndexMap::new());
        }
        let url = format!("{}/simple/price", self.base_url);
        let params = SimplePriceParams::new(asset_ids, &self.vs_currency);
        debug!(ids = asset_ids.len(), "requesting quotes");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context(ReqwestSnafu)?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: SimplePriceResponse = response.json().await.map_err(|e| {
            DecodeSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(into_raw_quotes(body, &self.vs_currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_builds_without_key() {
        let p = CoinGeckoProvider::new(CoinGeckoConfig::default()).expect("build");
        assert_eq!(p.base_url, DEFAULT_BASE_URL);
        assert_eq!(p.vs_currency, "usd");
    }

    #[test]
    fn api_key_goes_out_in_the_configured_header() {
        let cfg = CoinGeckoConfig {
            api_key: Some(SecretString::from("secret-key".to_string())),
            api_key_header: "x-cg-pro-api-key".into(),
            ..Default::default()
        };
        let headers = CoinGeckoProvider::default_headers(&cfg).expect("headers");
        let value = headers.get("x-cg-pro-api-key").expect("key header present");
        assert_eq!(value.to_str().unwrap(), "secret-key");
        assert!(value.is_sensitive());

        let keyless = CoinGeckoProvider::default_headers(&CoinGeckoConfig::default()).unwrap();
        assert!(keyless.get("x-cg-demo-api-key").is_none());
    }

    #[test]
    fn provider_rejects_bad_header_name() {
        let cfg = CoinGeckoConfig {
            api_key: Some(SecretString::from("k".to_string())),
            api_key_header: "bad header".into(),
            ..Default::default()
        };
        assert!(matches!(
            CoinGeckoProvider::new(cfg),
            Err(ProviderInitError::InvalidHeaderName { .. })
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let cfg = CoinGeckoConfig {
            base_url: "http://localhost:9999/api/".into(),
            ..Default::default()
        };
        let p = CoinGeckoProvider::new(cfg).expect("build");
        assert_eq!(p.base_url, "http://localhost:9999/api");
    }
}
