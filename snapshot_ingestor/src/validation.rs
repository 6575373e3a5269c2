//! Plausibility checks applied to every quote before it is accepted.
//!
//! A rejected quote is an asset-level failure: it is reported back to the
//! caller, never silently dropped, and never retried.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::snapshot::{PriceSnapshot, RawQuote};

/// Why a quote was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no price in upstream quote")]
    MissingPrice,

    #[error("price is not a finite number")]
    NonFinitePrice,

    #[error("non-positive price {0}")]
    NonPositivePrice(f64),

    #[error("captured_at {captured_at} is more than {tolerance_secs}s away from {now}")]
    ClockSkew {
        captured_at: DateTime<Utc>,
        now: DateTime<Utc>,
        tolerance_secs: i64,
    },
}

/// Validates one raw quote.
///
/// `captured_at` is the upstream `last_updated_at` when present, else `now`.
/// It must lie within `tolerance` of `now` in either direction.
pub fn validate_quote(
    asset_id: &str,
    raw: &RawQuote,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<PriceSnapshot, ValidationError> {
    let price = raw.price.ok_or(ValidationError::MissingPrice)?;
    if !price.is_finite() {
        return Err(ValidationError::NonFinitePrice);
    }
    if price <= 0.0 {
        return Err(ValidationError::NonPositivePrice(price));
    }

    let captured_at = raw.last_updated_at.unwrap_or(now);
    if (captured_at - now).abs() > tolerance {
        return Err(ValidationError::ClockSkew {
            captured_at,
            now,
            tolerance_secs: tolerance.num_seconds(),
        });
    }

    Ok(PriceSnapshot {
        asset_id: asset_id.to_string(),
        price,
        metrics: raw.metrics,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn quote(price: Option<f64>, at: Option<DateTime<Utc>>) -> RawQuote {
        RawQuote {
            price,
            last_updated_at: at,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_fresh_positive_price() {
        let snap = validate_quote("btc", &quote(Some(1.5), Some(now())), now(), Duration::minutes(5))
            .expect("valid");
        assert_eq!(snap.price, 1.5);
        assert_eq!(snap.captured_at, now());
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let snap = validate_quote("btc", &quote(Some(2.0), None), now(), Duration::minutes(5)).unwrap();
        assert_eq!(snap.captured_at, now());
    }

    #[test]
    fn rejects_zero_negative_nan_and_missing() {
        let tol = Duration::minutes(5);
        assert_eq!(
            validate_quote("a", &quote(Some(0.0), None), now(), tol),
            Err(ValidationError::NonPositivePrice(0.0))
        );
        assert_eq!(
            validate_quote("a", &quote(Some(-3.0), None), now(), tol),
            Err(ValidationError::NonPositivePrice(-3.0))
        );
        assert_eq!(
            validate_quote("a", &quote(Some(f64::NAN), None), now(), tol),
            Err(ValidationError::NonFinitePrice)
        );
        assert_eq!(
            validate_quote("a", &quote(None, None), now(), tol),
            Err(ValidationError::MissingPrice)
        );
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let tol = Duration::minutes(5);
        let stale = quote(Some(1.0), Some(now() - Duration::minutes(6)));
        let future = quote(Some(1.0), Some(now() + Duration::minutes(6)));
        let edge = quote(Some(1.0), Some(now() - Duration::minutes(5)));
        assert!(matches!(
            validate_quote("a", &stale, now(), tol),
            Err(ValidationError::ClockSkew { .. })
        ));
        assert!(matches!(
            validate_quote("a", &future, now(), tol),
            Err(ValidationError::ClockSkew { .. })
        ));
        assert!(validate_quote("a", &edge, now(), tol).is_ok());
    }
}
