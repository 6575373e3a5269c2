//! Durable copy of the ranking in [`crate::schema::asset_priority`].

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::{
    models::AssetPriorityRow,
    schema::asset_priority::dsl as ap,
    tz,
};

use super::PriorityEntry;

// keeps each multi-row insert well under SQLite's bound-parameter limit
const INSERT_CHUNK: usize = 100;

/// Replaces the whole table with `entries`. Call inside a transaction.
pub fn replace_all(
    conn: &mut SqliteConnection,
    entries: &[PriorityEntry],
    refreshed_at: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let stamp = tz::to_rfc3339_millis(refreshed_at);
    diesel::delete(ap::asset_priority).execute(conn)?;

    let mut written = 0;
    for chunk in entries.chunks(INSERT_CHUNK) {
        let rows: Vec<AssetPriorityRow> = chunk
            .iter()
            .map(|e| AssetPriorityRow {
                asset_id: e.asset_id.clone(),
                rank: i32::try_from(e.rank).unwrap_or(i32::MAX),
                weight_metric: e.weight_metric,
                symbol: e.symbol.clone(),
                name: e.name.clone(),
                last_refreshed: stamp.clone(),
            })
            .collect();
        written += diesel::insert_into(ap::asset_priority)
            .values(&rows)
            .execute(conn)?;
    }
    Ok(written)
}

/// All stored entries by ascending rank, plus the newest refresh stamp.
pub fn load_all(
    conn: &mut SqliteConnection,
) -> anyhow::Result<(Vec<PriorityEntry>, Option<DateTime<Utc>>)> {
    let rows = ap::asset_priority
        .order((ap::rank.asc(), ap::asset_id.asc()))
        .select(AssetPriorityRow::as_select())
        .load::<AssetPriorityRow>(conn)?;

    let mut newest: Option<String> = None;
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        if newest.as_ref().is_none_or(|n| row.last_refreshed > *n) {
            newest = Some(row.last_refreshed.clone());
        }
        entries.push(PriorityEntry {
            asset_id: row.asset_id,
            rank: row.rank.max(1) as u32,
            weight_metric: row.weight_metric,
            symbol: row.symbol,
            name: row.name,
        });
    }
    let refreshed_at = newest.as_deref().map(tz::parse_ts_to_utc).transpose()?;
    Ok((entries, refreshed_at))
}
