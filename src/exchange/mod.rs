//! Exchange adapter: plans the shard pool for a preset and spawns one task
//! per WebSocket connection.

pub mod parse;
pub mod rest;
pub mod shard;
pub mod streams;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ChannelRoute, Defaults, Preset};
use crate::error::Result;
use crate::events::Channel;
use crate::exchange::rest::SnapshotClient;
use crate::exchange::shard::{Shard, ShardCore, ShardFlags};
use crate::exchange::streams::{combined_stream_url, StreamKind};
use crate::health::HealthRegistry;
use crate::router::Router;

const ALL_KINDS: [StreamKind; 8] = [
    StreamKind::AggTrade,
    StreamKind::BookTicker,
    StreamKind::Top5,
    StreamKind::Top20,
    StreamKind::Diff,
    StreamKind::ForceOrder,
    StreamKind::MarkPrice,
    StreamKind::Kline,
];

/// A planned shard before it is bound to a socket.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub shard_id: usize,
    pub kind: StreamKind,
    pub flags: ShardFlags,
    pub symbols: Vec<String>,
}

/// Partition the preset's channels and symbols into shards. Stream families
/// shared by several channels (aggTrade, markPrice) collapse into one shard
/// set; symbol chunks follow the per-family connection policy.
///
/// When both `ob_diff` and `l1` are enabled, L1 is derived from the local
/// diff book and no bookTicker connection is opened; otherwise `l1` rides
/// the bookTicker stream.
pub fn plan_shards(routes: &[ChannelRoute], symbols: &[String]) -> Vec<ShardPlan> {
    let enabled: HashSet<Channel> = routes.iter().map(|r| r.channel).collect();
    let diff_l1 = enabled.contains(&Channel::ObDiff) && enabled.contains(&Channel::L1);
    let metrics = enabled.contains(&Channel::AdvancedMetrics);

    let mut plans = Vec::new();
    let mut shard_id = 0;
    for kind in ALL_KINDS {
        let flags = match kind {
            StreamKind::AggTrade => ShardFlags {
                emit_trades: enabled.contains(&Channel::Trades),
                emit_agg: enabled.contains(&Channel::AggTrades5s),
                ..Default::default()
            },
            StreamKind::BookTicker => ShardFlags {
                emit_l1: enabled.contains(&Channel::L1) && !diff_l1,
                emit_metrics: metrics && !diff_l1,
                ..Default::default()
            },
            StreamKind::Top5 => ShardFlags {
                emit_top5: enabled.contains(&Channel::ObTop5),
                emit_metrics: metrics,
                ..Default::default()
            },
            StreamKind::Top20 => ShardFlags {
                emit_top20: enabled.contains(&Channel::ObTop20),
                ..Default::default()
            },
            StreamKind::Diff => ShardFlags {
                emit_diff: enabled.contains(&Channel::ObDiff),
                derive_l1: diff_l1,
                ..Default::default()
            },
            StreamKind::ForceOrder => ShardFlags {
                emit_liquidations: enabled.contains(&Channel::Liquidations),
                ..Default::default()
            },
            StreamKind::MarkPrice => ShardFlags {
                emit_mark: enabled.contains(&Channel::MarkPrice),
                emit_funding: enabled.contains(&Channel::Funding),
                ..Default::default()
            },
            StreamKind::Kline => ShardFlags {
                emit_klines: enabled.contains(&Channel::Klines),
                ..Default::default()
            },
        };
        if !shard_is_active(kind, flags) {
            continue;
        }
        for chunk in symbols.chunks(kind.max_streams_per_conn()) {
            plans.push(ShardPlan {
                shard_id,
                kind,
                flags,
                symbols: chunk.to_vec(),
            });
            shard_id += 1;
        }
    }
    plans
}

fn shard_is_active(kind: StreamKind, flags: ShardFlags) -> bool {
    match kind {
        StreamKind::AggTrade => flags.emit_trades || flags.emit_agg,
        StreamKind::BookTicker => flags.emit_l1,
        StreamKind::Top5 => flags.emit_top5,
        StreamKind::Top20 => flags.emit_top20,
        StreamKind::Diff => flags.emit_diff || flags.derive_l1,
        StreamKind::ForceOrder => flags.emit_liquidations,
        StreamKind::MarkPrice => flags.emit_mark || flags.emit_funding,
        StreamKind::Kline => flags.emit_klines,
    }
}

/// Spawn every shard of the preset. Shards are independent: one failing
/// connection never touches another shard's reconnect loop.
pub fn spawn_adapter(
    defaults: &Defaults,
    preset: &Preset,
    routes: &[ChannelRoute],
    symbols: &[String],
    router: Router,
    health: Arc<HealthRegistry>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    let plans = plan_shards(routes, symbols);
    let needs_snapshots = plans.iter().any(|p| p.kind == StreamKind::Diff);
    let snapshots = if needs_snapshots {
        Some(Arc::new(SnapshotClient::new(&defaults.rest_base_url)?))
    } else {
        None
    };

    let mut tasks = Vec::with_capacity(plans.len());
    for plan in plans {
        let stream_names: Vec<String> = plan
            .symbols
            .iter()
            .map(|s| plan.kind.stream_name(s, preset.kline_interval))
            .collect();
        let ws_url = combined_stream_url(&defaults.ws_base_url, &stream_names);
        info!(
            "shard {} channel={} symbols={} url={}",
            plan.shard_id,
            plan.kind.primary_channel(),
            plan.symbols.len(),
            ws_url.split('?').next().unwrap_or(&ws_url),
        );
        let shard = Shard {
            core: ShardCore::new(
                plan.shard_id,
                plan.kind,
                plan.flags,
                router.clone(),
                health.clone(),
            ),
            streams: stream_names,
            ws_url,
            snapshots: snapshots.clone(),
        };
        tasks.push(tokio::spawn(shard.run(shutdown.clone())));
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(channel: Channel) -> ChannelRoute {
        ChannelRoute {
            channel,
            to_columnar: true,
            to_cache: true,
        }
    }

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i}USDT")).collect()
    }

    #[test]
    fn trades_and_agg_share_one_upstream() {
        let plans = plan_shards(
            &[route(Channel::Trades), route(Channel::AggTrades5s)],
            &symbols(10),
        );
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].kind, StreamKind::AggTrade);
        assert!(plans[0].flags.emit_trades && plans[0].flags.emit_agg);
    }

    #[test]
    fn shard_counts_follow_per_channel_policy() {
        // 120 symbols: aggTrade at 50/conn → 3 shards; markPrice at 100 → 2
        let plans = plan_shards(
            &[route(Channel::Trades), route(Channel::MarkPrice)],
            &symbols(120),
        );
        let agg: Vec<_> = plans
            .iter()
            .filter(|p| p.kind == StreamKind::AggTrade)
            .collect();
        let mark: Vec<_> = plans
            .iter()
            .filter(|p| p.kind == StreamKind::MarkPrice)
            .collect();
        assert_eq!(agg.len(), 3);
        assert_eq!(agg[0].symbols.len(), 50);
        assert_eq!(agg[2].symbols.len(), 20);
        assert_eq!(mark.len(), 2);
    }

    #[test]
    fn diff_plus_l1_derives_from_local_book() {
        let plans = plan_shards(&[route(Channel::ObDiff), route(Channel::L1)], &symbols(5));
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].kind, StreamKind::Diff);
        assert!(plans[0].flags.derive_l1);
        // no bookTicker connection in this configuration
        assert!(!plans.iter().any(|p| p.kind == StreamKind::BookTicker));
    }

    #[test]
    fn l1_without_diff_uses_book_ticker() {
        let plans = plan_shards(&[route(Channel::L1)], &symbols(5));
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].kind, StreamKind::BookTicker);
        assert!(plans[0].flags.emit_l1);
    }

    #[test]
    fn advanced_metrics_alone_opens_no_stream() {
        let plans = plan_shards(&[route(Channel::AdvancedMetrics)], &symbols(5));
        assert!(plans.is_empty());
    }

    #[test]
    fn shard_ids_are_unique() {
        let plans = plan_shards(
            &[
                route(Channel::Trades),
                route(Channel::MarkPrice),
                route(Channel::Klines),
            ],
            &symbols(250),
        );
        let mut ids: Vec<_> = plans.iter().map(|p| p.shard_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), plans.len());
    }
}
