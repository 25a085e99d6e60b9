//! Market-data ingestion pipeline for Binance-style derivatives streams.
//!
//! One process per preset: a sharded WebSocket fan-out parses vendor frames
//! into canonical events, per-symbol aggregators roll 5-second trade windows
//! and maintain local orderbooks from diff streams, and a router hands each
//! event to up to two sinks — a batched ClickHouse writer (line-delimited
//! JSON over HTTP) and a pipelined Redis cache writer (HSET/XADD with TTL).

pub mod aggregate;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod health;
pub mod router;
pub mod sinks;
pub mod supervisor;
pub mod time_util;

pub use error::{CollectorError, Result};
pub use events::{Channel, MarketEvent};
