//! UTC bucket mapping utilities.
//!
//! - One stable epoch: Unix (1970-01-01T00:00:00Z).
//! - Fixed-size buckets (minute/hour/day): second-based math.
//! - Week: Monday 00:00:00Z aligned using a week epoch of 1969-12-29.
//! - Month: linear (year, month) indexing relative to 1970-01.
//!
//! All functions assume the input timestamp is UTC. Bucket ids are only
//! meaningful together with their granularity.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::granularity::Granularity;

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Number of seconds in a minute.
pub const SECS_PER_MINUTE: i64 = 60;
/// Number of seconds in an hour.
pub const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
/// Number of seconds in a day.
pub const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;
/// Number of seconds in a week.
pub const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

/// shift so Monday 1969-12-29 00:00Z becomes index 0
const WEEK_MONDAY_ANCHOR_OFFSET_SECS: i64 = 3 * SECS_PER_DAY;

/// Bucket id for a UTC timestamp. Timestamps before 1970 clamp to bucket 0.
pub fn bucket_id(ts_utc: DateTime<Utc>, g: Granularity) -> u64 {
    let id = match g {
        Granularity::Minute => id_fixed(ts_utc, SECS_PER_MINUTE),
        Granularity::Hour => id_fixed(ts_utc, SECS_PER_HOUR),
        Granularity::Day => id_fixed(ts_utc, SECS_PER_DAY),
        Granularity::Week => {
            (ts_utc.timestamp() + WEEK_MONDAY_ANCHOR_OFFSET_SECS).div_euclid(SECS_PER_WEEK)
        }
        Granularity::Month => (ts_utc.year() as i64 - 1970) * 12 + (ts_utc.month0() as i64),
    };
    id.max(0) as u64
}

/// UTC start instant of bucket `id`.
pub fn bucket_start_utc(id: u64, g: Granularity) -> DateTime<Utc> {
    let id = id as i64;
    match g {
        Granularity::Minute => EPOCH_UNIX + Duration::seconds(id * SECS_PER_MINUTE),
        Granularity::Hour => EPOCH_UNIX + Duration::seconds(id * SECS_PER_HOUR),
        Granularity::Day => EPOCH_UNIX + Duration::seconds(id * SECS_PER_DAY),
        Granularity::Week => {
            EPOCH_UNIX + Duration::seconds(id * SECS_PER_WEEK - WEEK_MONDAY_ANCHOR_OFFSET_SECS)
        }
        Granularity::Month => {
            let y = 1970 + id.div_euclid(12);
            let m = id.rem_euclid(12) as u32 + 1;
            // day 1 at midnight always exists in UTC
            Utc.with_ymd_and_hms(y as i32, m, 1, 0, 0, 0)
                .single()
                .unwrap_or(EPOCH_UNIX)
        }
    }
}

/// Exclusive end instant of bucket `id` (start of the next bucket).
pub fn bucket_end_exclusive_utc(id: u64, g: Granularity) -> DateTime<Utc> {
    bucket_start_utc(id + 1, g)
}

/// Aligned start of the bucket containing `ts`.
pub fn floor(ts: DateTime<Utc>, g: Granularity) -> DateTime<Utc> {
    bucket_start_utc(bucket_id(ts, g), g)
}

/// `[start, end)` of the bucket containing `ts`.
pub fn bounds(ts: DateTime<Utc>, g: Granularity) -> (DateTime<Utc>, DateTime<Utc>) {
    let id = bucket_id(ts, g);
    (bucket_start_utc(id, g), bucket_end_exclusive_utc(id, g))
}

/// Start of the most recent bucket that is closed at `now` (end <= now).
pub fn last_closed(now: DateTime<Utc>, g: Granularity) -> DateTime<Utc> {
    let id = bucket_id(now, g);
    bucket_start_utc(id.saturating_sub(1), g)
}

/// `true` once the bucket starting at `start` has fully elapsed at `now`.
pub fn is_closed(start: DateTime<Utc>, g: Granularity, now: DateTime<Utc>) -> bool {
    bucket_end_exclusive_utc(bucket_id(start, g), g) <= now
}

fn id_fixed(ts_utc: DateTime<Utc>, bucket_secs: i64) -> i64 {
    ts_utc.timestamp().div_euclid(bucket_secs)
}
