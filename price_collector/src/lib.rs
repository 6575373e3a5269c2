//! Minute-resolution price collection for the top-ranked assets of an
//! upstream market-data API.
//!
//! A [`scheduler::Scheduler`] fires once per minute. Each tick runs a
//! [`collection::CollectionRunner`] over the assets chosen by the
//! [`priority::PriorityStore`], persists minute snapshots, rolls them up
//! through the [`aggregation::AggregationCascade`] and hands any bucket
//! without full coverage to the [`gaps::GapRecoveryQueue`]. Every run leaves
//! a [`runs::RunRecord`] behind.
//!
//! [`app::Collector`] wires the components from a [`config::CollectorConfig`];
//! [`query`] is the read side used by the CLI.

pub mod aggregation;
pub mod app;
pub mod bucket;
pub mod collection;
pub mod config;
pub mod db;
pub mod gaps;
pub mod granularity;
pub mod logging;
pub mod models;
pub mod priority;
pub mod query;
pub mod runs;
pub mod scheduler;
pub mod schema;
pub mod snapshots;
pub mod tz;
