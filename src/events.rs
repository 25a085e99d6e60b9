//! Canonical event model.
//!
//! Every vendor frame is normalized into one (or, for the mark-price stream,
//! two) `MarketEvent`s before it reaches the router. All prices and sizes are
//! `rust_decimal::Decimal`, parsed from the exchange's string fields; floats
//! never touch the pipeline between the parser and the sinks.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Closed set of logical streams handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Trades,
    AggTrades5s,
    L1,
    ObTop5,
    ObTop20,
    ObDiff,
    Liquidations,
    Klines,
    MarkPrice,
    Funding,
    AdvancedMetrics,
}

impl Channel {
    pub const ALL: [Channel; 11] = [
        Channel::Trades,
        Channel::AggTrades5s,
        Channel::L1,
        Channel::ObTop5,
        Channel::ObTop20,
        Channel::ObDiff,
        Channel::Liquidations,
        Channel::Klines,
        Channel::MarkPrice,
        Channel::Funding,
        Channel::AdvancedMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::AggTrades5s => "agg_trades_5s",
            Channel::L1 => "l1",
            Channel::ObTop5 => "ob_top5",
            Channel::ObTop20 => "ob_top20",
            Channel::ObDiff => "ob_diff",
            Channel::Liquidations => "liquidations",
            Channel::Klines => "klines",
            Channel::MarkPrice => "mark_price",
            Channel::Funding => "funding",
            Channel::AdvancedMetrics => "advanced_metrics",
        }
    }

    /// ClickHouse table this channel inserts into.
    pub fn table(&self) -> &'static str {
        match self {
            Channel::ObDiff => "order_book_diffs",
            other => other.as_str(),
        }
    }

    pub fn index(&self) -> usize {
        Channel::ALL.iter().position(|c| c == self).unwrap_or(0)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Shared header carried by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub instrument: String,
    pub channel: Channel,
    /// Exchange-originated timestamp, nanosecond-typed.
    ///
    /// Schema note: the vendor streams carry millisecond resolution, and the
    /// raw millisecond count is stored here unscaled on every channel.
    /// Consumers that need real nanoseconds must scale values below 10^15
    /// themselves (`time_util::normalize_event_ns`). This mirrors the
    /// upstream schema and is kept for compatibility.
    pub ts_event_ns: u64,
    /// Collector wall-clock nanoseconds at parse time (monotonic-backed).
    pub ts_recv_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(flatten)]
    pub header: Header,
    pub price: Decimal,
    pub qty: Decimal,
    pub side: Side,
    pub trade_id: Option<String>,
    pub is_aggressor: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrades5sEvent {
    #[serde(flatten)]
    pub header: Header,
    pub interval_s: u32,
    pub window_start_ns: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub notional: Decimal,
    pub trade_count: u64,
    pub buy_qty: Decimal,
    pub sell_qty: Decimal,
    pub buy_notional: Decimal,
    pub sell_notional: Decimal,
    pub first_trade_id: Option<String>,
    pub last_trade_id: Option<String>,
}

/// Book snapshot at fixed depth. Bids sorted descending, asks ascending,
/// prices and sizes kept as parallel arrays like the columnar schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookDepthEvent {
    #[serde(flatten)]
    pub header: Header,
    pub depth: u16,
    pub bid_prices: Vec<Decimal>,
    pub bid_qtys: Vec<Decimal>,
    pub ask_prices: Vec<Decimal>,
    pub ask_qtys: Vec<Decimal>,
}

/// Incremental book update. `qty == 0` deletes the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookDiffEvent {
    #[serde(flatten)]
    pub header: Header,
    /// Final update id of this diff (vendor `u`).
    pub sequence: u64,
    /// First update id of this diff (vendor `U`).
    pub prev_sequence: u64,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    #[serde(flatten)]
    pub header: Header,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineEvent {
    #[serde(flatten)]
    pub header: Header,
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub trade_count: u64,
    pub is_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPriceEvent {
    #[serde(flatten)]
    pub header: Header,
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingEvent {
    #[serde(flatten)]
    pub header: Header,
    pub funding_rate: Decimal,
    pub next_funding_ts_ns: u64,
}

/// Derived per-symbol metrics keyed by metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetricsEvent {
    #[serde(flatten)]
    pub header: Header,
    pub metrics: BTreeMap<String, Decimal>,
}

/// Tagged union over all event kinds. Writers switch on the tag; there is no
/// other dispatch mechanism.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade(TradeEvent),
    AggTrades5s(AggTrades5sEvent),
    Depth(OrderBookDepthEvent),
    Diff(OrderBookDiffEvent),
    Liquidation(LiquidationEvent),
    Kline(KlineEvent),
    MarkPrice(MarkPriceEvent),
    Funding(FundingEvent),
    AdvancedMetrics(AdvancedMetricsEvent),
}

impl MarketEvent {
    pub fn header(&self) -> &Header {
        match self {
            MarketEvent::Trade(e) => &e.header,
            MarketEvent::AggTrades5s(e) => &e.header,
            MarketEvent::Depth(e) => &e.header,
            MarketEvent::Diff(e) => &e.header,
            MarketEvent::Liquidation(e) => &e.header,
            MarketEvent::Kline(e) => &e.header,
            MarketEvent::MarkPrice(e) => &e.header,
            MarketEvent::Funding(e) => &e.header,
            MarketEvent::AdvancedMetrics(e) => &e.header,
        }
    }

    pub fn channel(&self) -> Channel {
        self.header().channel
    }

    pub fn instrument(&self) -> &str {
        &self.header().instrument
    }
}
