//! Vendor stream naming and sharding policy.

use crate::events::Channel;

/// One upstream WebSocket stream family. Several logical channels can share
/// a family: the aggTrade stream feeds both the raw tape and the 5 s roller,
/// and the mark-price stream carries funding data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    AggTrade,
    BookTicker,
    Top5,
    Top20,
    Diff,
    ForceOrder,
    MarkPrice,
    Kline,
}

impl StreamKind {
    /// Upstream family serving a logical channel, if it has one.
    /// `advanced_metrics` is derived locally and has no stream of its own.
    pub fn for_channel(channel: Channel) -> Option<StreamKind> {
        match channel {
            Channel::Trades | Channel::AggTrades5s => Some(StreamKind::AggTrade),
            Channel::L1 => Some(StreamKind::BookTicker),
            Channel::ObTop5 => Some(StreamKind::Top5),
            Channel::ObTop20 => Some(StreamKind::Top20),
            Channel::ObDiff => Some(StreamKind::Diff),
            Channel::Liquidations => Some(StreamKind::ForceOrder),
            Channel::MarkPrice | Channel::Funding => Some(StreamKind::MarkPrice),
            Channel::Klines => Some(StreamKind::Kline),
            Channel::AdvancedMetrics => None,
        }
    }

    /// Per-symbol stream name as it appears in the combined-stream URL.
    pub fn stream_name(&self, symbol: &str, kline_interval: &str) -> String {
        let s = symbol.to_lowercase();
        match self {
            StreamKind::AggTrade => format!("{s}@aggTrade"),
            StreamKind::BookTicker => format!("{s}@bookTicker"),
            StreamKind::Top5 => format!("{s}@depth5@100ms"),
            StreamKind::Top20 => format!("{s}@depth20@100ms"),
            StreamKind::Diff => format!("{s}@depth@100ms"),
            StreamKind::ForceOrder => format!("{s}@forceOrder"),
            StreamKind::MarkPrice => format!("{s}@markPrice@1s"),
            StreamKind::Kline => format!("{s}@kline_{kline_interval}"),
        }
    }

    /// Shard size policy: at most this many per-symbol streams share one
    /// connection.
    pub fn max_streams_per_conn(&self) -> usize {
        match self {
            StreamKind::AggTrade => 50,
            StreamKind::BookTicker => 100,
            StreamKind::Top5 => 50,
            StreamKind::Top20 => 50,
            StreamKind::Diff => 50,
            StreamKind::ForceOrder => 200,
            StreamKind::MarkPrice => 100,
            StreamKind::Kline => 200,
        }
    }

    /// Channel under which connection-level counters (conns/discs, parse
    /// errors) are booked for this family.
    pub fn primary_channel(&self) -> Channel {
        match self {
            StreamKind::AggTrade => Channel::Trades,
            StreamKind::BookTicker => Channel::L1,
            StreamKind::Top5 => Channel::ObTop5,
            StreamKind::Top20 => Channel::ObTop20,
            StreamKind::Diff => Channel::ObDiff,
            StreamKind::ForceOrder => Channel::Liquidations,
            StreamKind::MarkPrice => Channel::MarkPrice,
            StreamKind::Kline => Channel::Klines,
        }
    }
}

/// Build the combined-stream URL for one shard.
pub fn combined_stream_url(ws_base: &str, streams: &[String]) -> String {
    format!("{}/stream?streams={}", ws_base, streams.join("/"))
}
