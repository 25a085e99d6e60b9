//! Passive health accounting.
//!
//! Counters are plain relaxed atomics with one producer each: shards bump
//! `ws`/`discs`/parse counters, the router bumps `routed`, writers bump their
//! per-table counters. The monitor task only reads snapshots on its own
//! timer and emits the `[ingest] [diff] [loss] [errors] [discs] [health]
//! [sys]` log lines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Preset;
use crate::events::Channel;
use crate::time_util::normalize_event_ns;

/// Per-channel ingest counters.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    /// Frames accepted from the WebSocket.
    pub ws: AtomicU64,
    /// Events handed to the router.
    pub routed: AtomicU64,
    /// Connections opened.
    pub conns: AtomicU64,
    /// Disconnects observed.
    pub discs: AtomicU64,
    pub parse_errors: AtomicU64,
    pub validation_errors: AtomicU64,
    /// Protocol-level drops: late trades, stale diffs.
    pub lost: AtomicU64,
}

/// Registry of counters for all channels, shared across shards and router.
#[derive(Debug)]
pub struct HealthRegistry {
    channels: [ChannelCounters; Channel::ALL.len()],
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Default::default(),
        })
    }

    pub fn channel(&self, channel: Channel) -> &ChannelCounters {
        &self.channels[channel.index()]
    }

    pub fn incr_ws(&self, channel: Channel) {
        self.channel(channel).ws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_routed(&self, channel: Channel) {
        self.channel(channel).routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_conns(&self, channel: Channel) {
        self.channel(channel).conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_discs(&self, channel: Channel) {
        self.channel(channel).discs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_parse_errors(&self, channel: Channel) {
        self.channel(channel)
            .parse_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_validation_errors(&self, channel: Channel) {
        self.channel(channel)
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_lost(&self, channel: Channel) {
        self.channel(channel).lost.fetch_add(1, Ordering::Relaxed);
    }
}

/// Written/flushed/failed triple for one table or cache channel.
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub written: AtomicU64,
    pub flushed: AtomicU64,
    pub flush_failed: AtomicU64,
}

impl SinkCounters {
    pub fn pending(&self) -> u64 {
        self.written
            .load(Ordering::Relaxed)
            .saturating_sub(self.flushed.load(Ordering::Relaxed))
    }
}

/// Shared stats for one sink. Keys are table names for the columnar writer
/// and channel tags for the cache writer; loss is always computed per key so
/// multi-row events never produce cross-table negatives.
#[derive(Debug)]
pub struct SinkStats {
    pub name: &'static str,
    keys: DashMap<&'static str, Arc<SinkCounters>>,
    pub events: AtomicU64,
    pub flush_errors: AtomicU64,
}

impl SinkStats {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            keys: DashMap::new(),
            events: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
        })
    }

    pub fn key(&self, key: &'static str) -> Arc<SinkCounters> {
        self.keys.entry(key).or_default().clone()
    }

    pub fn written(&self, key: &'static str, n: u64) {
        self.key(key).written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn flushed(&self, key: &'static str, n: u64) {
        self.key(key).flushed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn failed(&self, key: &'static str, n: u64) {
        self.key(key).flush_failed.fetch_add(n, Ordering::Relaxed);
        self.flush_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        let mut written = 0;
        let mut flushed = 0;
        let mut failed = 0;
        for entry in self.keys.iter() {
            written += entry.written.load(Ordering::Relaxed);
            flushed += entry.flushed.load(Ordering::Relaxed);
            failed += entry.flush_failed.load(Ordering::Relaxed);
        }
        (written, flushed, failed)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, (u64, u64, u64)> {
        self.keys
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    (
                        e.written.load(Ordering::Relaxed),
                        e.flushed.load(Ordering::Relaxed),
                        e.flush_failed.load(Ordering::Relaxed),
                    ),
                )
            })
            .collect()
    }
}

/// Last (ts_event_ns, ts_recv_ns) per (channel, instrument), fed by the
/// router, read by the monitor for lag lines.
#[derive(Debug, Default)]
pub struct LastSeenMap {
    inner: DashMap<(Channel, String), (u64, u64)>,
}

impl LastSeenMap {
    pub fn record(&self, channel: Channel, instrument: &str, event_ns: u64, recv_ns: u64) {
        self.inner
            .insert((channel, instrument.to_string()), (event_ns, recv_ns));
    }

    /// Drop entries whose last receive stamp is older than `max_age_ns`, so
    /// delisted or renamed instruments stop skewing the lag lines.
    pub fn prune(&self, now_ns: u64, max_age_ns: u64) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|_, (_, recv_ns)| now_ns.saturating_sub(*recv_ns) <= max_age_ns);
        before - self.inner.len()
    }

    pub fn lag_stats_ms(&self, channel: Channel) -> Option<(f64, u64)> {
        let mut lags: Vec<u64> = Vec::new();
        for entry in self.inner.iter() {
            if entry.key().0 != channel {
                continue;
            }
            let (event_ns, recv_ns) = *entry.value();
            let event_ns = normalize_event_ns(event_ns);
            lags.push(recv_ns.saturating_sub(event_ns) / 1_000_000);
        }
        if lags.is_empty() {
            return None;
        }
        let max = *lags.iter().max().unwrap();
        let avg = lags.iter().sum::<u64>() as f64 / lags.len() as f64;
        Some((avg, max))
    }
}

/// Rows a channel should have produced over `elapsed_s` given its target
/// cadence (agg_trades_5s every 5 s, mark_price every 1 s, klines per
/// configured interval).
pub fn expected_rows(symbol_count: u64, elapsed_s: u64, target_interval_s: u64) -> u64 {
    let periods = ((elapsed_s as f64 / target_interval_s.max(1) as f64).round() as u64).max(1);
    symbol_count * periods
}

/// Exponentially-weighted deficit: half of the previous backlog plus the new
/// interval deficit, floored at zero.
pub fn decay_backlog(previous: u64, expected: u64, flushed: u64) -> u64 {
    let deficit = expected as i64 - flushed as i64;
    ((previous / 2) as i64 + deficit).max(0) as u64
}

#[derive(Default, Clone, Copy)]
struct ChannelSnapshot {
    ws: u64,
    routed: u64,
    discs: u64,
    parse_errors: u64,
    validation_errors: u64,
    lost: u64,
}

#[derive(Default)]
struct HealthWindow {
    elapsed_s: u64,
    ws: u64,
    written: u64,
    flushed: u64,
}

/// Periodic reporter. Owns no counters; reads registry and sink snapshots.
pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    columnar: Option<Arc<SinkStats>>,
    cache: Option<Arc<SinkStats>>,
    last_seen: Arc<LastSeenMap>,
    preset: Preset,
    symbol_count: u64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<HealthRegistry>,
        columnar: Option<Arc<SinkStats>>,
        cache: Option<Arc<SinkStats>>,
        last_seen: Arc<LastSeenMap>,
        preset: Preset,
        symbol_count: usize,
    ) -> Self {
        Self {
            registry,
            columnar,
            cache,
            last_seen,
            preset,
            symbol_count: symbol_count as u64,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval_s = self.preset.log_interval_s.max(1);
        let mut ticker = tokio::time::interval(self.preset.log_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_channels: [ChannelSnapshot; Channel::ALL.len()] = Default::default();
        let mut last_sink_events: HashMap<&'static str, (u64, u64, u64)> = HashMap::new();
        let mut last_tables: HashMap<&'static str, (u64, u64, u64)> = HashMap::new();
        let mut last_flush_errors: u64 = 0;
        let mut health_windows: HashMap<Channel, HealthWindow> = HashMap::new();
        let mut backlog: HashMap<Channel, u64> = HashMap::new();
        let mut backlog_ws: HashMap<Channel, u64> = HashMap::new();
        let mut sys = SysSampler::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            // [ingest] sink throughput deltas
            let mut ingest_parts = Vec::new();
            for stats in [self.columnar.as_ref(), self.cache.as_ref()]
                .into_iter()
                .flatten()
            {
                let events = stats.events.load(Ordering::Relaxed);
                let (written, flushed, _) = stats.totals();
                let prev = last_sink_events.get(stats.name).copied().unwrap_or_default();
                ingest_parts.push(format!(
                    "{}: events+{}/{}s items+{}/{}s flushed+{}/{}s",
                    stats.name,
                    events - prev.0,
                    interval_s,
                    written - prev.1,
                    interval_s,
                    flushed - prev.2,
                    interval_s,
                ));
                last_sink_events.insert(stats.name, (events, written, flushed));
            }
            if !ingest_parts.is_empty() {
                info!("[ingest] {}", ingest_parts.join(" | "));
            }

            let tables = self
                .columnar
                .as_ref()
                .map(|s| s.snapshot())
                .unwrap_or_default();

            let mut diff_lines = Vec::new();
            let mut loss_lines = Vec::new();
            let mut err_lines = Vec::new();
            let mut disc_lines = Vec::new();
            // per-channel (ws, written, flushed) deltas for the health windows
            let mut deltas: HashMap<Channel, (u64, u64, u64)> = HashMap::new();

            for channel in Channel::ALL {
                let counters = self.registry.channel(channel);
                let now = ChannelSnapshot {
                    ws: counters.ws.load(Ordering::Relaxed),
                    routed: counters.routed.load(Ordering::Relaxed),
                    discs: counters.discs.load(Ordering::Relaxed),
                    parse_errors: counters.parse_errors.load(Ordering::Relaxed),
                    validation_errors: counters.validation_errors.load(Ordering::Relaxed),
                    lost: counters.lost.load(Ordering::Relaxed),
                };
                let prev = last_channels[channel.index()];
                let table = channel.table();
                let (written, flushed, _) = tables.get(table).copied().unwrap_or_default();
                let (prev_written, prev_flushed, _) =
                    last_tables.get(table).copied().unwrap_or_default();
                let written_d = written - prev_written;
                let flushed_d = flushed - prev_flushed;
                let ws_d = now.ws - prev.ws;
                let routed_d = now.routed - prev.routed;
                let lost_d = now.lost - prev.lost;

                if ws_d != 0 || routed_d != 0 || written_d != 0 || lost_d != 0 {
                    diff_lines.push(format!(
                        "{channel}: ws+{ws_d} routed+{routed_d} written+{written_d} lost+{lost_d}"
                    ));
                }
                let loss_ws_router = ws_d as i64 - routed_d as i64;
                let loss_router_writer = routed_d as i64 - written_d as i64;
                let loss_writer_ch = written_d as i64 - flushed_d as i64;
                if self.columnar.is_some()
                    && (loss_ws_router != 0 || loss_router_writer != 0 || loss_writer_ch != 0)
                {
                    loss_lines.push(format!(
                        "{channel}: ws->router {loss_ws_router} | router->writer {loss_router_writer} | writer->ch {loss_writer_ch}"
                    ));
                }
                let parse_d = now.parse_errors - prev.parse_errors;
                let val_d = now.validation_errors - prev.validation_errors;
                if parse_d != 0 || val_d != 0 {
                    err_lines.push(format!(
                        "{channel}: parse_error+{parse_d}/{interval_s}s validation_error+{val_d}/{interval_s}s"
                    ));
                }
                let disc_d = now.discs - prev.discs;
                if disc_d != 0 {
                    disc_lines.push(format!("{channel}: discs+{disc_d}/{interval_s}s"));
                }

                deltas.insert(channel, (ws_d, written_d, flushed_d));
                last_channels[channel.index()] = now;
            }
            last_tables = tables;

            if !diff_lines.is_empty() {
                info!("[diff] {}", diff_lines.join(" | "));
            }
            if !loss_lines.is_empty() {
                info!("[loss] {}", loss_lines.join(" | "));
            }
            if !err_lines.is_empty() {
                warn!("[errors] {}", err_lines.join(" | "));
            }
            if let Some(stats) = &self.columnar {
                let flush_errors = stats.flush_errors.load(Ordering::Relaxed);
                if flush_errors != last_flush_errors {
                    warn!(
                        "[errors] clickhouse_flush_errors+{}/{}s",
                        flush_errors - last_flush_errors,
                        interval_s
                    );
                    last_flush_errors = flush_errors;
                }
            }
            if !disc_lines.is_empty() {
                warn!("[discs] {}", disc_lines.join(" | "));
            }

            // [health] expected-vs-flushed per rate-bearing channel
            let mut health_lines = Vec::new();
            for (channel, target_interval_s) in self.preset.health_intervals() {
                let (ws_d, written_d, flushed_d) =
                    deltas.get(&channel).copied().unwrap_or_default();
                let window = health_windows.entry(channel).or_default();
                window.elapsed_s += interval_s;
                window.ws += ws_d;
                window.written += written_d;
                window.flushed += flushed_d;
                if window.elapsed_s < target_interval_s {
                    continue;
                }
                let expected =
                    expected_rows(self.symbol_count, window.elapsed_s, target_interval_s);
                let pending = window.written.saturating_sub(window.flushed);
                let missing = expected.saturating_sub(window.flushed);
                let b = backlog.entry(channel).or_insert(0);
                *b = decay_backlog(*b, expected, window.flushed);
                let bw = backlog_ws.entry(channel).or_insert(0);
                *bw = decay_backlog(*bw, window.ws, window.flushed);
                health_lines.push(format!(
                    "{channel}: expected={expected}/{}s flushed={} pending={pending} missing={missing} backlog={} backlog_ws={}",
                    window.elapsed_s, window.flushed, *b, *bw
                ));
                *window = HealthWindow::default();
            }
            if !health_lines.is_empty() {
                info!("[health] {}", health_lines.join(" | "));
            }

            for channel in self.preset.lag_channels() {
                if let Some((avg, max)) = self.last_seen.lag_stats_ms(channel) {
                    info!("[health] channel={channel} lag_ms avg={avg:.1} max={max}");
                }
            }

            if let Some(line) = sys.sample(interval_s) {
                info!("[sys] {line}");
            }
        }
    }
}

/// Process CPU/RSS/IO sampler backed by procfs. On non-Linux hosts sampling
/// is a no-op and the `[sys]` line is skipped.
struct SysSampler {
    #[cfg(target_os = "linux")]
    last_cpu_ticks: Option<u64>,
    #[cfg(target_os = "linux")]
    last_io: Option<(u64, u64)>,
    #[cfg(target_os = "linux")]
    ticks_per_sec: u64,
}

impl SysSampler {
    fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            last_cpu_ticks: None,
            #[cfg(target_os = "linux")]
            last_io: None,
            #[cfg(target_os = "linux")]
            ticks_per_sec: unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64,
        }
    }

    #[cfg(target_os = "linux")]
    fn sample(&mut self, interval_s: u64) -> Option<String> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // utime and stime are fields 14 and 15; the command field may contain
        // spaces so split after the closing paren.
        let rest = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let ticks = utime + stime;
        let cpu_pct = self.last_cpu_ticks.map(|prev| {
            let delta = ticks.saturating_sub(prev);
            delta as f64 * 100.0 / (self.ticks_per_sec * interval_s.max(1)) as f64
        });
        self.last_cpu_ticks = Some(ticks);

        let rss_mb = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| {
                s.lines()
                    .find(|l| l.starts_with("VmRSS:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
            .map(|kb| kb as f64 / 1024.0);

        let mut parts = Vec::new();
        if let Some(cpu) = cpu_pct {
            parts.push(format!("cpu={cpu:.1}%"));
        }
        if let Some(rss) = rss_mb {
            parts.push(format!("rss={rss:.1}MB"));
        }
        if let Ok(io) = std::fs::read_to_string("/proc/self/io") {
            let mut read_bytes = None;
            let mut write_bytes = None;
            for line in io.lines() {
                if let Some(v) = line.strip_prefix("read_bytes: ") {
                    read_bytes = v.trim().parse::<u64>().ok();
                } else if let Some(v) = line.strip_prefix("write_bytes: ") {
                    write_bytes = v.trim().parse::<u64>().ok();
                }
            }
            if let (Some(r), Some(w)) = (read_bytes, write_bytes) {
                if let Some((pr, pw)) = self.last_io {
                    let rd = (r.saturating_sub(pr)) as f64 / (1024.0 * 1024.0);
                    let wr = (w.saturating_sub(pw)) as f64 / (1024.0 * 1024.0);
                    parts.push(format!("io_read={rd:.2}MB/{interval_s}s"));
                    parts.push(format!("io_write={wr:.2}MB/{interval_s}s"));
                }
                self.last_io = Some((r, w));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" | "))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self, _interval_s: u64) -> Option<String> {
        None
    }
}
