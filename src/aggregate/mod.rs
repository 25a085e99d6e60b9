//! Per-symbol aggregation state machines.
//!
//! Every aggregator instance is owned by exactly one shard task; nothing in
//! this module is shared across tasks or locked.

pub mod book;
pub mod klines;
pub mod metrics;
pub mod trades5s;

pub use book::{BookSync, DepthSnapshot, DiffOutcome, OrderBookState, SnapshotOutcome};
pub use trades5s::AggTradeRoller;
