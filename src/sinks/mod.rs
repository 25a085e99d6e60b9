//! Outbound sinks: batched ClickHouse inserts and pipelined Redis upserts.
//!
//! Each writer exposes a bounded enqueue channel and runs one flush task that
//! exclusively owns its buffers; producers never touch writer state directly.

pub mod clickhouse;
pub mod redis_cache;

/// Bound on each writer's enqueue channel; a full queue suspends producers
/// rather than dropping events.
pub const ENQUEUE_CAPACITY: usize = 8192;

/// Writers get this long to drain their buffers on shutdown.
pub const FINAL_FLUSH_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);
