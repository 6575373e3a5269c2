pub mod ranking;
pub mod snapshot;
