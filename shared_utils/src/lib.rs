//! Small helpers shared by the ingestor and the collector.

pub mod clock;
pub mod env;
