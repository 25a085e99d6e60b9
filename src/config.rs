//! Static defaults document and preset definitions.
//!
//! Preset files and the interactive selector live outside this crate; the
//! process surface is a preset identifier plus a sink selection. Defaults
//! come from code and may be overridden through environment variables, which
//! keeps configuration faults fatal before any socket is opened.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CollectorError, Result};
use crate::events::Channel;

const TRUE_VALUES: [&str; 4] = ["1", "true", "yes", "on"];
const FALSE_VALUES: [&str; 4] = ["0", "false", "no", "off"];

/// Body compression for columnar inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Lz4,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnarConfig {
    /// HTTP endpoint, credentials via URL userinfo.
    pub url: String,
    pub database: String,
    pub batch_rows: usize,
    pub flush_interval_ms: u64,
    pub compression: Compression,
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            database: "marketdata".into(),
            batch_rows: 5000,
            flush_interval_ms: 250,
            compression: Compression::Lz4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    pub pipeline_size: usize,
    pub flush_interval_ms: u64,
    pub stream_maxlen: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".into(),
            pipeline_size: 200,
            flush_interval_ms: 50,
            stream_maxlen: 1000,
        }
    }
}

/// The static defaults document (§6 of the external contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub columnar: ColumnarConfig,
    pub cache: CacheConfig,
    pub enable_columnar: bool,
    pub enable_cache: bool,
    pub housekeep_interval_s: u64,
    /// WebSocket base, e.g. `wss://fstream.binance.com`.
    pub ws_base_url: String,
    /// REST base for depth snapshots, e.g. `https://fapi.binance.com`.
    pub rest_base_url: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            columnar: ColumnarConfig::default(),
            cache: CacheConfig::default(),
            enable_columnar: true,
            enable_cache: true,
            housekeep_interval_s: 30,
            ws_base_url: "wss://fstream.binance.com".into(),
            rest_base_url: "https://fapi.binance.com".into(),
        }
    }
}

impl Defaults {
    /// Build defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("CLICKHOUSE_URL") {
            if !v.trim().is_empty() {
                cfg.columnar.url = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("CLICKHOUSE_DB") {
            if !v.trim().is_empty() {
                cfg.columnar.database = v.trim().to_string();
            }
        }
        if let Some(v) = env_usize("CLICKHOUSE_BATCH_ROWS")? {
            cfg.columnar.batch_rows = v;
        }
        if let Some(v) = env_u64("CLICKHOUSE_FLUSH_MS")? {
            cfg.columnar.flush_interval_ms = v;
        }
        if let Ok(v) = env::var("CLICKHOUSE_COMPRESSION") {
            cfg.columnar.compression = match v.trim().to_ascii_lowercase().as_str() {
                "lz4" => Compression::Lz4,
                "" | "none" | "off" => Compression::None,
                other => {
                    return Err(CollectorError::Config(format!(
                        "unsupported compression: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = env::var("REDIS_URL") {
            if !v.trim().is_empty() {
                cfg.cache.url = v.trim().to_string();
            }
        }
        if let Some(v) = env_usize("REDIS_PIPELINE_SIZE")? {
            cfg.cache.pipeline_size = v;
        }
        if let Some(v) = env_u64("REDIS_FLUSH_MS")? {
            cfg.cache.flush_interval_ms = v;
        }
        if let Some(v) = env_usize("REDIS_STREAM_MAXLEN")? {
            cfg.cache.stream_maxlen = v;
        }
        if let Some(v) = env_bool("ENABLE_CLICKHOUSE")? {
            cfg.enable_columnar = v;
        }
        if let Some(v) = env_bool("ENABLE_REDIS")? {
            cfg.enable_cache = v;
        }
        if let Some(v) = env_u64("HOUSEKEEP_INTERVAL_S")? {
            cfg.housekeep_interval_s = v;
        }
        if let Ok(v) = env::var("WS_BASE_URL") {
            if !v.trim().is_empty() {
                cfg.ws_base_url = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("REST_BASE_URL") {
            if !v.trim().is_empty() {
                cfg.rest_base_url = v.trim().to_string();
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.columnar.url)
            .map_err(|e| CollectorError::Config(format!("columnar url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CollectorError::Config(format!(
                "columnar url must be http(s): {}",
                self.columnar.url
            )));
        }
        let cache = Url::parse(&self.cache.url)
            .map_err(|e| CollectorError::Config(format!("cache url: {e}")))?;
        if !cache.scheme().starts_with("redis") {
            return Err(CollectorError::Config(format!(
                "cache url must be redis://: {}",
                self.cache.url
            )));
        }
        if self.columnar.batch_rows == 0 || self.cache.pipeline_size == 0 {
            return Err(CollectorError::Config(
                "batch_rows and pipeline_size must be >= 1".into(),
            ));
        }
        if self.columnar.database.is_empty() {
            return Err(CollectorError::Config("columnar database is empty".into()));
        }
        Ok(())
    }
}

/// Sink selection given on the process surface at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSelection {
    Columnar,
    Cache,
    Both,
}

impl SinkSelection {
    pub fn columnar(&self) -> bool {
        matches!(self, SinkSelection::Columnar | SinkSelection::Both)
    }

    pub fn cache(&self) -> bool {
        matches!(self, SinkSelection::Cache | SinkSelection::Both)
    }
}

/// Per-channel sink routing inside a preset.
#[derive(Debug, Clone, Copy)]
pub struct ChannelRoute {
    pub channel: Channel,
    pub to_columnar: bool,
    pub to_cache: bool,
}

impl ChannelRoute {
    const fn both(channel: Channel) -> Self {
        Self {
            channel,
            to_columnar: true,
            to_cache: true,
        }
    }

    const fn cache_only(channel: Channel) -> Self {
        Self {
            channel,
            to_columnar: false,
            to_cache: true,
        }
    }

    const fn columnar_only(channel: Channel) -> Self {
        Self {
            channel,
            to_columnar: true,
            to_cache: false,
        }
    }
}

/// Named bundle of channels and reporting cadence; one process per preset.
#[derive(Debug, Clone)]
pub struct Preset {
    pub id: &'static str,
    pub label: &'static str,
    pub channels: Vec<ChannelRoute>,
    pub kline_interval: &'static str,
    pub log_interval_s: u64,
}

impl Preset {
    pub fn builtin(id: &str) -> Option<Preset> {
        let preset = match id {
            "agg" => Preset {
                id: "agg",
                label: "agg 5s aggregated trades",
                channels: vec![
                    ChannelRoute::both(Channel::AggTrades5s),
                    ChannelRoute::cache_only(Channel::Trades),
                ],
                kline_interval: "1m",
                log_interval_s: 5,
            },
            "tape" => Preset {
                id: "tape",
                label: "tape raw trades + liquidations",
                channels: vec![
                    ChannelRoute::both(Channel::Trades),
                    ChannelRoute::both(Channel::Liquidations),
                ],
                kline_interval: "1m",
                log_interval_s: 10,
            },
            "book" => Preset {
                id: "book",
                label: "book l1 + top5 + diffs",
                channels: vec![
                    ChannelRoute::both(Channel::L1),
                    ChannelRoute::both(Channel::ObTop5),
                    ChannelRoute::columnar_only(Channel::ObDiff),
                ],
                kline_interval: "1m",
                log_interval_s: 10,
            },
            "book20" => Preset {
                id: "book20",
                label: "book20 top20 snapshots",
                channels: vec![ChannelRoute::both(Channel::ObTop20)],
                kline_interval: "1m",
                log_interval_s: 10,
            },
            "mark" => Preset {
                id: "mark",
                label: "mark mark price + funding",
                channels: vec![
                    ChannelRoute::both(Channel::MarkPrice),
                    ChannelRoute::both(Channel::Funding),
                ],
                kline_interval: "1m",
                log_interval_s: 10,
            },
            "klines" => Preset {
                id: "klines",
                label: "klines 1m candles",
                channels: vec![ChannelRoute::both(Channel::Klines)],
                kline_interval: "1m",
                log_interval_s: 60,
            },
            "metrics" => Preset {
                id: "metrics",
                label: "metrics derived spread/imbalance",
                channels: vec![
                    ChannelRoute::cache_only(Channel::L1),
                    ChannelRoute::cache_only(Channel::ObTop5),
                    ChannelRoute::cache_only(Channel::AdvancedMetrics),
                ],
                kline_interval: "1m",
                log_interval_s: 10,
            },
            _ => return None,
        };
        Some(preset)
    }

    pub fn builtin_ids() -> &'static [&'static str] {
        &["agg", "tape", "book", "book20", "mark", "klines", "metrics"]
    }

    pub fn route(&self, channel: Channel) -> Option<&ChannelRoute> {
        self.channels.iter().find(|r| r.channel == channel)
    }

    pub fn enabled(&self, channel: Channel) -> bool {
        self.route(channel).is_some()
    }

    /// Apply the process-level sink selection on top of per-channel routes
    /// and the global enable switches.
    pub fn effective_routes(&self, defaults: &Defaults, sinks: SinkSelection) -> Vec<ChannelRoute> {
        self.channels
            .iter()
            .map(|r| ChannelRoute {
                channel: r.channel,
                to_columnar: r.to_columnar && defaults.enable_columnar && sinks.columnar(),
                to_cache: r.to_cache && defaults.enable_cache && sinks.cache(),
            })
            .filter(|r| r.to_columnar || r.to_cache)
            .collect()
    }

    /// Channels with a row-rate expectation, with their target interval in
    /// seconds (agg 5 s windows, mark price at 1 s, klines per interval).
    pub fn health_intervals(&self) -> Vec<(Channel, u64)> {
        let mut out = Vec::new();
        for route in &self.channels {
            match route.channel {
                Channel::AggTrades5s => out.push((Channel::AggTrades5s, 5)),
                Channel::MarkPrice => out.push((Channel::MarkPrice, 1)),
                Channel::Klines => {
                    let s = parse_interval_seconds(self.kline_interval).unwrap_or(60);
                    out.push((Channel::Klines, s));
                }
                _ => {}
            }
        }
        out
    }

    /// Channels tracked for per-symbol lag reporting.
    pub fn lag_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|r| r.channel)
            .filter(|c| {
                matches!(
                    c,
                    Channel::MarkPrice
                        | Channel::ObTop5
                        | Channel::L1
                        | Channel::Klines
                        | Channel::AggTrades5s
                )
            })
            .collect()
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_s.max(1))
    }
}

/// Parse `"5s"` / `"1m"` / `"4h"` / `"1d"` into seconds.
pub fn parse_interval_seconds(interval: &str) -> Option<u64> {
    let text = interval.trim().to_ascii_lowercase();
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = text.split_at(split);
    let value: u64 = num.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    Some(value * factor)
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CollectorError::Config(format!("{name} must be an integer: {v}"))),
        _ => Ok(None),
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CollectorError::Config(format!("{name} must be an integer: {v}"))),
        _ => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            let lower = v.trim().to_ascii_lowercase();
            if TRUE_VALUES.contains(&lower.as_str()) {
                Ok(Some(true))
            } else if FALSE_VALUES.contains(&lower.as_str()) {
                Ok(Some(false))
            } else {
                Err(CollectorError::Config(format!(
                    "{name} must be a boolean: {v}"
                )))
            }
        }
        _ => Ok(None),
    }
}
