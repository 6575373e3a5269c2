//! The five time resolutions of the store.
//!
//! Each [`Granularity`] owns one `snapshot_*` table. Coarser granularities are
//! derived from a finer *source* by the aggregation cascade:
//! hour ← minute, day ← hour, week ← day, month ← day. Months use days rather
//! than weeks because weeks do not nest in calendar months.
//!
//! ```
//! use price_collector::granularity::Granularity;
//!
//! let g: Granularity = "hour".parse().unwrap();
//! assert_eq!(g.source(), Some(Granularity::Minute));
//! assert_eq!(g.to_string(), "hour");
//! ```

use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Store resolution (all UTC; weeks start on Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// UTC minute; written directly by collection runs.
    Minute,
    /// UTC hour
    Hour,
    /// UTC day
    Day,
    /// Monday-based, UTC
    Week,
    /// Calendar month, UTC. Never swept.
    Month,
}

impl Granularity {
    /// All granularities, finest first.
    pub const ALL: [Granularity; 5] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    /// Derived granularities in cascade order. Each entry's source precedes it.
    pub const CASCADE: [Granularity; 4] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    /// Lowercase name used in config, CLI and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// Finer granularity this one is rolled up from; `None` for minute.
    pub const fn source(self) -> Option<Granularity> {
        match self {
            Granularity::Minute => None,
            Granularity::Hour => Some(Granularity::Minute),
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Week | Granularity::Month => Some(Granularity::Day),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "1m" | "m" => Granularity::Minute,
            "hour" | "1h" | "h" => Granularity::Hour,
            "day" | "1d" | "d" => Granularity::Day,
            "week" | "1w" | "w" => Granularity::Week,
            "month" | "1mo" | "mo" => Granularity::Month,
            other => bail!("unknown granularity: {other}"),
        })
    }
}
