//! Timestamp formatting and time zone helpers.
//!
//! All store writes are RFC-3339 UTC strings with millisecond precision, so
//! they sort lexicographically in SQL. Local wall-clock times only appear in
//! the daily priority-refresh schedule and must resolve deterministically:
//! - Ambiguous local times happen during "fall back" when a wall time occurs twice.
//! - Nonexistent local times happen during "spring forward" when a wall time is skipped.
//!
//! New York 2024-11-03 01:30 occurs twice and resolves to 05:30Z.

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// RFC-3339 with offset -> UTC.
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Resolves a local wall-clock time in `tz` to UTC.
///
/// Ambiguous times take the earlier instant; times inside a DST gap move
/// forward minute by minute (at most two hours) to the first valid one.
pub fn resolve_local(naive: NaiveDateTime, tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    use chrono::offset::LocalResult::*;
    match tz.from_local_datetime(&naive) {
        Single(dt) | Ambiguous(dt, _) => Ok(dt.with_timezone(&Utc)),
        None => {
            let mut t = naive;
            for _ in 0..120 {
                t += Duration::minutes(1);
                if let Single(dt) = tz.from_local_datetime(&t) {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            Err(anyhow!("nonexistent local time {naive} in {tz}"))
        }
    }
}

/// Parses an IANA zone name such as `"America/New_York"`.
pub fn parse_tz(name: &str) -> anyhow::Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("bad tz {name}: {e}"))
}

/// First instant strictly after `now` whose wall-clock time in `tz` is `hour:00`.
///
/// DST gaps shift forward and ambiguous hours take the earliest instant
/// (see [`resolve_local`]).
pub fn next_daily_at(now: DateTime<Utc>, hour: u32, tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).ok_or_else(|| anyhow!("bad hour {hour}"))?;
    let today = now.with_timezone(&tz).date_naive();
    // three days covers a skipped wall time on the first candidate day
    for offset in 0..3 {
        let day = today + Duration::days(offset);
        let candidate = resolve_local(day.and_time(at), tz)?;
        if candidate > now {
            return Ok(candidate);
        }
    }
    Err(anyhow!("no daily slot at {hour}:00 {tz} after {now}"))
}
