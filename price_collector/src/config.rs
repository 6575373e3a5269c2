//! Collector configuration: parsing, normalization, validation and loading.
//!
//! The TOML file describes what to collect (mode, pinned assets, batching),
//! how to talk to the upstream (`[upstream]`, `[retry]`) and how long each
//! granularity is kept (`[retention]`). Every key has a default, so an empty
//! file is a valid configuration.
//!
//! Key behaviors:
//! - Unknown keys are rejected.
//! - Normalization trims and lowercases pinned asset IDs and de-duplicates
//!   them while preserving order.
//! - `DATABASE_URL` overrides `database_url`; `COLLECTOR_API_KEY` supplies
//!   the upstream key (see [`CollectorConfig::apply_env`]).
//!
//! Entrypoints: [`load_config_str`] and [`load_config_path`].

use std::{collections::HashSet, num::NonZeroU32, path::Path, time::Duration as StdDuration};

use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use shared_utils::env::get_env_var_opt;
use snapshot_ingestor::{
    fetcher::FetcherConfig,
    providers::{
        ProviderInitError,
        coingecko::{CoinGeckoConfig, provider::DEFAULT_BASE_URL},
    },
    retry::{BackoffStrategy, RetryPolicy},
};
use thiserror::Error;

use crate::{
    aggregation::Retention,
    collection::CollectionSettings,
    gaps::DrainSettings,
    priority::{CollectionMode, RefreshSettings},
    scheduler::SchedulerSettings,
    tz,
};

/// Environment variable overriding `database_url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CollectorConfig {
    /// SQLite path (optionally `sqlite:`-prefixed).
    pub database_url: String,
    pub collection_mode: CollectionMode,
    /// Assets per upstream call.
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// Largest failed/attempted ratio of a completed run.
    pub failure_tolerance: f64,
    /// Assets always collected in the first batch.
    pub pinned_assets: Vec<String>,
    /// Local hour of the daily priority refresh.
    pub priority_refresh_hour: u32,
    /// IANA zone of `priority_refresh_hour`.
    pub priority_refresh_tz: String,
    /// Startup gap detection window; defaults to the minute retention.
    pub gap_lookback_minutes: Option<u32>,
    /// Recovery runs per gap before it is marked failed.
    pub gap_max_attempts: u32,
    /// Gaps handled per drain.
    pub gap_drain_limit: usize,
    pub persist_attempts: u32,
    pub resume_failed_subset: bool,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub retention: RetentionConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            database_url: "collector.db".to_string(),
            collection_mode: CollectionMode::Top100,
            batch_size: 250,
            inter_batch_delay_ms: 0,
            failure_tolerance: 0.05,
            pinned_assets: Vec::new(),
            priority_refresh_hour: 0,
            priority_refresh_tz: "UTC".to_string(),
            gap_lookback_minutes: None,
            gap_max_attempts: 3,
            gap_drain_limit: 5,
            persist_attempts: 3,
            resume_failed_subset: true,
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// `[upstream]`: the ranked-list / snapshot API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub vs_currency: String,
    /// Shared ceiling for every upstream call.
    pub calls_per_minute: u32,
    pub max_ids_per_call: usize,
    pub ranking_page_size: u32,
    pub clock_skew_tolerance_secs: u64,
    pub request_timeout_secs: u64,
    /// Header carrying `COLLECTOR_API_KEY`, when set.
    pub api_key_header: String,
    /// Refuse to start without `COLLECTOR_API_KEY` (paid tiers).
    pub require_api_key: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            vs_currency: "usd".to_string(),
            calls_per_minute: 30,
            max_ids_per_call: 250,
            ranking_page_size: 250,
            clock_skew_tolerance_secs: 300,
            request_timeout_secs: 30,
            api_key_header: "x-cg-demo-api-key".to_string(),
            require_api_key: false,
        }
    }
}

/// `[retry]`: per-call retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

/// `[retention]`: horizons per granularity; absent keeps rows forever.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetentionConfig {
    pub minute_minutes: Option<u32>,
    pub hour_hours: Option<u32>,
    pub day_days: Option<u32>,
    pub week_weeks: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute_minutes: Some(60),
            hour_hours: Some(24),
            day_days: Some(7),
            week_weeks: Some(52),
        }
    }
}

/// Parse, normalize and validate a TOML string.
pub fn load_config_str(s: &str) -> Result<CollectorConfig, ConfigError> {
    let mut cfg: CollectorConfig = toml::from_str(s)?;
    cfg.normalize();
    cfg.validate()?;
    Ok(cfg)
}

/// [`load_config_str`] on a file, then environment overrides.
pub fn load_config_path(path: impl AsRef<Path>) -> Result<CollectorConfig, ConfigError> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut cfg = load_config_str(&s)?;
    cfg.apply_env();
    Ok(cfg)
}

impl CollectorConfig {
    /// Trims, lowercases and de-duplicates pinned IDs; trims string keys.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.pinned_assets = std::mem::take(&mut self.pinned_assets)
            .into_iter()
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        self.database_url = self.database_url.trim().to_string();
        self.priority_refresh_tz = self.priority_refresh_tz.trim().to_string();
        self.upstream.base_url = self.upstream.base_url.trim().trim_end_matches('/').to_string();
        self.upstream.vs_currency = self.upstream.vs_currency.trim().to_lowercase();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(invalid("database_url is empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be > 0"));
        }
        if self.upstream.max_ids_per_call == 0 {
            return Err(invalid("upstream.max_ids_per_call must be > 0"));
        }
        if self.batch_size > self.upstream.max_ids_per_call {
            return Err(invalid(format!(
                "batch_size {} exceeds upstream.max_ids_per_call {}",
                self.batch_size, self.upstream.max_ids_per_call
            )));
        }
        if self.pinned_assets.len() > self.batch_size {
            return Err(invalid(format!(
                "{} pinned assets do not fit in one batch of {}",
                self.pinned_assets.len(),
                self.batch_size
            )));
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            return Err(invalid("failure_tolerance must be within [0, 1]"));
        }
        if self.priority_refresh_hour > 23 {
            return Err(invalid("priority_refresh_hour must be within 0..=23"));
        }
        tz::parse_tz(&self.priority_refresh_tz).map_err(|e| invalid(e.to_string()))?;
        if matches!(self.collection_mode, CollectionMode::Custom(0)) {
            return Err(invalid("custom collection mode needs at least one asset"));
        }
        if self.upstream.calls_per_minute == 0 {
            return Err(invalid("upstream.calls_per_minute must be > 0"));
        }
        if self.upstream.ranking_page_size == 0 {
            return Err(invalid("upstream.ranking_page_size must be > 0"));
        }
        if self.retry.max_attempts == 0 || self.gap_max_attempts == 0 || self.persist_attempts == 0
        {
            return Err(invalid("attempt budgets must be > 0"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier must be >= 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        Ok(())
    }

    /// Applies `DATABASE_URL`. The API key is read by [`Self::upstream_config`].
    pub fn apply_env(&mut self) {
        if let Some(url) = get_env_var_opt(DATABASE_URL_ENV) {
            self.database_url = url;
        }
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        tz::parse_tz(&self.priority_refresh_tz).map_err(|e| invalid(e.to_string()))
    }

    pub fn calls_per_minute(&self) -> Result<NonZeroU32, ConfigError> {
        NonZeroU32::new(self.upstream.calls_per_minute)
            .ok_or_else(|| invalid("upstream.calls_per_minute must be > 0"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: BackoffStrategy {
                base: StdDuration::from_millis(self.retry.base_delay_ms),
                multiplier: self.retry.multiplier,
                max: StdDuration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            max_ids_per_call: self.upstream.max_ids_per_call,
            clock_skew_tolerance: Duration::seconds(self.upstream.clock_skew_tolerance_secs as i64),
        }
    }

    /// Provider settings; picks up `COLLECTOR_API_KEY` from the environment.
    pub fn upstream_config(&self) -> Result<CoinGeckoConfig, ProviderInitError> {
        let cfg = CoinGeckoConfig {
            base_url: self.upstream.base_url.clone(),
            vs_currency: self.upstream.vs_currency.clone(),
            api_key_header: self.upstream.api_key_header.clone(),
            api_key: None,
            timeout: StdDuration::from_secs(self.upstream.request_timeout_secs),
        };
        if self.upstream.require_api_key {
            cfg.with_required_env_key()
        } else {
            Ok(cfg.with_env_key())
        }
    }

    pub fn retention(&self) -> Retention {
        let r = &self.retention;
        Retention {
            minute: r.minute_minutes.map(|m| Duration::minutes(m.into())),
            hour: r.hour_hours.map(|h| Duration::hours(h.into())),
            day: r.day_days.map(|d| Duration::days(d.into())),
            week: r.week_weeks.map(|w| Duration::weeks(w.into())),
        }
    }

    pub fn collection_settings(&self) -> CollectionSettings {
        CollectionSettings {
            batch_size: self.batch_size,
            inter_batch_delay: StdDuration::from_millis(self.inter_batch_delay_ms),
            failure_tolerance: self.failure_tolerance,
            persist_attempts: self.persist_attempts,
            resume_failed_subset: self.resume_failed_subset,
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            page_size: self.upstream.ranking_page_size,
            scope: self.collection_mode.scope(),
        }
    }

    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            max_attempts: self.gap_max_attempts,
            limit: self.gap_drain_limit,
            ..DrainSettings::default()
        }
    }

    /// Lookback of startup gap detection.
    pub fn gap_lookback(&self) -> Duration {
        let minutes = self
            .gap_lookback_minutes
            .or(self.retention.minute_minutes)
            .unwrap_or(60);
        Duration::minutes(minutes.into())
    }

    pub fn scheduler_settings(&self) -> Result<SchedulerSettings, ConfigError> {
        Ok(SchedulerSettings {
            mode: self.collection_mode,
            refresh_hour: self.priority_refresh_hour,
            refresh_tz: self.tz()?,
            gap_lookback: self.gap_lookback(),
        })
    }
}
