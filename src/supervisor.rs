//! Per-preset process lifecycle.
//!
//! One supervisor per process: pin the core, build the writer set from the
//! sink selection, wire the router, start the shard pool and the health
//! monitor, then wait for interrupt. Shutdown is ordered: shards first, then
//! the router handles drop (closing the writer queues), then each writer
//! drains its buffers against the final-flush deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Defaults, Preset, SinkSelection};
use crate::error::{CollectorError, Result};
use crate::exchange::spawn_adapter;
use crate::health::{HealthMonitor, HealthRegistry, LastSeenMap, SinkStats};
use crate::router::Router;
use crate::sinks::clickhouse::ClickHouseWriter;
use crate::sinks::redis_cache::RedisWriter;

pub struct Supervisor {
    pub defaults: Defaults,
    pub preset: Preset,
    pub sinks: SinkSelection,
    pub symbols: Vec<String>,
    pub cpu_core: Option<usize>,
}

impl Supervisor {
    /// Run until interrupt. Configuration faults return before any socket
    /// is opened; the process exit code is non-zero for those.
    pub async fn run(self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(CollectorError::Config("no symbols configured".into()));
        }
        let routes = self.preset.effective_routes(&self.defaults, self.sinks);
        if routes.is_empty() {
            return Err(CollectorError::Config(format!(
                "preset {} has no channel with an enabled sink",
                self.preset.id
            )));
        }

        set_cpu_affinity(self.cpu_core);
        info!(
            "LOG LEGEND: ws=websocket input, routed=router accepted, written=buffered rows, \
             flushed=rows inserted into the sink. pending=written-flushed (buffer), \
             missing=expected-flushed (per interval), backlog=decaying deficit vs expected, \
             backlog_ws=decaying deficit vs ws."
        );
        info!(
            "preset config: label={} log_interval_s={} symbols={} channels={}",
            self.preset.label,
            self.preset.log_interval_s,
            self.symbols.len(),
            routes.len(),
        );

        let registry = HealthRegistry::new();
        let last_seen = Arc::new(LastSeenMap::default());

        let need_columnar = routes.iter().any(|r| r.to_columnar);
        let need_cache = routes.iter().any(|r| r.to_cache);

        let mut columnar_stats = None;
        let mut columnar_task = None;
        let columnar_tx = if need_columnar {
            let stats = SinkStats::new("clickhouse");
            let (tx, task) = ClickHouseWriter::spawn(self.defaults.columnar.clone(), stats.clone())?;
            columnar_stats = Some(stats);
            columnar_task = Some(task);
            Some(tx)
        } else {
            None
        };
        let mut cache_stats = None;
        let mut cache_task = None;
        let cache_tx = if need_cache {
            let stats = SinkStats::new("redis");
            let (tx, task) = RedisWriter::spawn(self.defaults.cache.clone(), stats.clone())?;
            cache_stats = Some(stats);
            cache_task = Some(task);
            Some(tx)
        } else {
            None
        };

        let router = Router::new(
            &routes,
            columnar_tx.clone(),
            cache_tx.clone(),
            registry.clone(),
            last_seen.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shard_tasks = spawn_adapter(
            &self.defaults,
            &self.preset,
            &routes,
            &self.symbols,
            router.clone(),
            registry.clone(),
            shutdown_rx.clone(),
        )?;
        info!("adapter up: {} shards", shard_tasks.len());

        let monitor = HealthMonitor::new(
            registry,
            columnar_stats.clone(),
            cache_stats.clone(),
            last_seen.clone(),
            self.preset.clone(),
            self.symbols.len(),
        );
        let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

        let housekeep_task = tokio::spawn(housekeep(
            last_seen,
            self.defaults.housekeep_interval_s,
            shutdown_rx,
        ));

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; shutting down"),
            Err(e) => warn!("signal listener failed ({e}); shutting down"),
        }

        // 1. stop the adapter: shards observe the flag and exit
        let _ = shutdown_tx.send(true);
        for task in shard_tasks {
            let _ = task.await;
        }
        // 2. drain the router: dropping every enqueue handle closes the
        //    writer queues once buffered events are consumed
        drop(router);
        drop(columnar_tx);
        drop(cache_tx);
        // 3. writers run their final flush against the 5 s deadline
        if let Some(task) = columnar_task {
            let _ = task.await;
        }
        if let Some(task) = cache_task {
            let _ = task.await;
        }
        let _ = monitor_task.await;
        let _ = housekeep_task.await;

        for stats in [columnar_stats, cache_stats].into_iter().flatten() {
            let (written, flushed, failed) = stats.totals();
            let pending = written.saturating_sub(flushed + failed);
            info!(
                "{} summary: written={written} flushed={flushed} flush_failed={failed} pending={pending}",
                stats.name
            );
            if pending > 0 {
                warn!("{} exited with {pending} rows unaccounted", stats.name);
            }
        }
        info!("clean shutdown");
        Ok(())
    }
}

/// Periodic housekeeping: drop lag-map entries for instruments that have
/// gone silent (delistings, renames) so health lines track live symbols.
async fn housekeep(
    last_seen: Arc<LastSeenMap>,
    interval_s: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = std::time::Duration::from_secs(interval_s.max(5));
    let max_age_ns = interval.as_nanos() as u64 * 10;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = last_seen.prune(crate::time_util::now_ns(), max_age_ns);
                if removed > 0 {
                    info!("housekeeping: pruned {removed} stale lag entries");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(core: Option<usize>) {
    let Some(core) = core else { return };
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc == 0 {
            info!("CPU affinity set: core={core}");
        } else {
            warn!("CPU affinity failed: core={core}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(core: Option<usize>) {
    if core.is_some() {
        warn!("CPU affinity is only supported on Linux");
    }
}
