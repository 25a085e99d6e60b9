//! Pipelined Redis cache writer.
//!
//! Hash keys hold the last state per symbol; streams hold a bounded tape of
//! trades and liquidations. TTLs are short on purpose: mark price 3 s,
//! agg_trades_5s 10 s, klines 120 s, refreshed on every write. Cache data is
//! ephemeral by design — a failed pipeline is counted and dropped, never
//! retried.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::events::{Channel, MarketEvent};
use crate::health::SinkStats;
use crate::sinks::{ENQUEUE_CAPACITY, FINAL_FLUSH_DEADLINE};

pub const PIPELINE_TIMEOUT: Duration = Duration::from_secs(3);
pub const MARK_PRICE_TTL_S: u64 = 3;
pub const AGG_TRADES_5S_TTL_S: u64 = 10;
pub const KLINES_TTL_S: u64 = 120;
const NAMESPACE: &str = "marketdata";
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// One buffered cache command, tagged with its channel for accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl_s: Option<u64>,
        channel: Channel,
    },
    XAdd {
        key: String,
        fields: Vec<(String, String)>,
        maxlen: usize,
        channel: Channel,
    },
}

impl CacheCommand {
    pub fn channel(&self) -> Channel {
        match self {
            CacheCommand::HSet { channel, .. } | CacheCommand::XAdd { channel, .. } => *channel,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            CacheCommand::HSet { key, .. } | CacheCommand::XAdd { key, .. } => key,
        }
    }
}

pub struct RedisWriter;

impl RedisWriter {
    pub fn spawn(
        cfg: CacheConfig,
        stats: Arc<SinkStats>,
    ) -> Result<(mpsc::Sender<Arc<MarketEvent>>, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(ENQUEUE_CAPACITY);
        let client = redis::Client::open(cfg.url.as_str())?;
        let task = WriterTask {
            client,
            conn: None,
            pipeline_size: cfg.pipeline_size,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            stream_maxlen: cfg.stream_maxlen,
            buffer: Vec::new(),
            stats,
            next_connect: Instant::now(),
            connect_failures: 0,
        };
        let handle = tokio::spawn(task.run(rx));
        Ok((tx, handle))
    }
}

struct WriterTask {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    pipeline_size: usize,
    flush_interval: Duration,
    stream_maxlen: usize,
    buffer: Vec<CacheCommand>,
    stats: Arc<SinkStats>,
    next_connect: Instant,
    connect_failures: u32,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Arc<MarketEvent>>) {
        info!(
            "redis writer up pipeline_size={} flush_interval={:?} stream_maxlen={}",
            self.pipeline_size, self.flush_interval, self.stream_maxlen
        );
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => {
                        self.enqueue(&event);
                        if self.buffer.len() >= self.pipeline_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
        if tokio::time::timeout(FINAL_FLUSH_DEADLINE, self.flush())
            .await
            .is_err()
        {
            warn!("redis final flush hit the shutdown deadline");
        }
        info!("redis writer stopped");
    }

    fn enqueue(&mut self, event: &MarketEvent) {
        let commands = build_commands(event, self.stream_maxlen);
        if commands.is_empty() {
            return;
        }
        self.stats
            .events
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        for command in commands {
            self.stats.written(command.channel().as_str(), 1);
            self.buffer.push(command);
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(mut conn) = self.connection().await else {
            // connection is down: cache data is ephemeral, drop the batch
            self.fail_buffer("no connection");
            return;
        };
        let commands = std::mem::take(&mut self.buffer);
        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                CacheCommand::HSet {
                    key,
                    fields,
                    ttl_s,
                    ..
                } => {
                    pipe.hset_multiple(key, fields).ignore();
                    if let Some(ttl) = ttl_s {
                        pipe.expire(key, *ttl as i64).ignore();
                    }
                }
                CacheCommand::XAdd {
                    key,
                    fields,
                    maxlen,
                    ..
                } => {
                    let cmd = pipe.cmd("XADD");
                    cmd.arg(key)
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(*maxlen)
                        .arg("*");
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
            }
        }
        let result =
            tokio::time::timeout(PIPELINE_TIMEOUT, pipe.query_async::<()>(&mut conn)).await;
        match result {
            Ok(Ok(())) => {
                for command in &commands {
                    self.stats.flushed(command.channel().as_str(), 1);
                }
            }
            Ok(Err(e)) => {
                error!("pipeline failed commands={} error={e}", commands.len());
                self.buffer = commands;
                self.fail_buffer("pipeline error");
                self.conn = None;
            }
            Err(_) => {
                error!("pipeline timeout commands={}", commands.len());
                self.buffer = commands;
                self.fail_buffer("pipeline timeout");
                self.conn = None;
            }
        }
    }

    fn fail_buffer(&mut self, _reason: &str) {
        for command in self.buffer.drain(..) {
            self.stats.failed(command.channel().as_str(), 1);
        }
    }

    async fn connection(&mut self) -> Option<MultiplexedConnection> {
        if let Some(conn) = &self.conn {
            return Some(conn.clone());
        }
        if Instant::now() < self.next_connect {
            return None;
        }
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                info!("redis connected");
                self.connect_failures = 0;
                self.conn = Some(conn.clone());
                Some(conn)
            }
            Err(e) => {
                let backoff = reconnect_backoff(self.connect_failures);
                self.connect_failures = self.connect_failures.saturating_add(1);
                self.next_connect = Instant::now() + backoff;
                warn!("redis connect failed: {e}; retry in {backoff:?}");
                None
            }
        }
    }
}

fn reconnect_backoff(failures: u32) -> Duration {
    let secs = RECONNECT_BASE.as_secs() << failures.min(5);
    Duration::from_secs(secs.min(RECONNECT_CAP.as_secs()))
}

fn key(parts: &[&str]) -> String {
    let mut out = String::from(NAMESPACE);
    for part in parts {
        out.push(':');
        out.push_str(part);
    }
    out
}

/// Translate one event into its cache commands. Every numeric value is the
/// decimal's exact string form.
pub fn build_commands(event: &MarketEvent, stream_maxlen: usize) -> Vec<CacheCommand> {
    let header = event.header();
    let mut base = vec![
        ("ts_event_ns".to_string(), header.ts_event_ns.to_string()),
        ("ts_recv_ns".to_string(), header.ts_recv_ns.to_string()),
    ];
    match event {
        MarketEvent::Trade(e) => {
            base.push(("px".into(), e.price.to_string()));
            base.push(("qty".into(), e.qty.to_string()));
            base.push(("side".into(), e.side.as_str().to_string()));
            if let Some(trade_id) = &e.trade_id {
                base.push(("trade_id".into(), trade_id.clone()));
            }
            if let Some(is_aggressor) = e.is_aggressor {
                base.push((
                    "is_aggressor".into(),
                    if is_aggressor { "1" } else { "0" }.to_string(),
                ));
            }
            vec![CacheCommand::XAdd {
                key: key(&["stream", "trades", &header.instrument]),
                fields: base,
                maxlen: stream_maxlen,
                channel: Channel::Trades,
            }]
        }
        MarketEvent::Liquidation(e) => {
            base.push(("side".into(), e.side.as_str().to_string()));
            base.push(("px".into(), e.price.to_string()));
            base.push(("qty".into(), e.qty.to_string()));
            if let Some(order_id) = &e.order_id {
                base.push(("order_id".into(), order_id.clone()));
            }
            if let Some(reason) = &e.reason {
                base.push(("reason".into(), reason.clone()));
            }
            vec![CacheCommand::XAdd {
                key: key(&["stream", "liquidations", &header.instrument]),
                fields: base,
                maxlen: stream_maxlen,
                channel: Channel::Liquidations,
            }]
        }
        MarketEvent::Depth(e) => {
            let prefix = match e.depth {
                1 => "last:l1",
                5 => "last:top5",
                20 => "last:top20",
                50 => "last:top50",
                100 => "last:top100",
                _ => return Vec::new(),
            };
            for (idx, (price, qty)) in e.bid_prices.iter().zip(&e.bid_qtys).enumerate() {
                base.push((format!("b{}_px", idx + 1), price.to_string()));
                base.push((format!("b{}_sz", idx + 1), qty.to_string()));
            }
            for (idx, (price, qty)) in e.ask_prices.iter().zip(&e.ask_qtys).enumerate() {
                base.push((format!("a{}_px", idx + 1), price.to_string()));
                base.push((format!("a{}_sz", idx + 1), qty.to_string()));
            }
            vec![CacheCommand::HSet {
                key: key(&[prefix, &header.instrument]),
                fields: base,
                ttl_s: None,
                channel: header.channel,
            }]
        }
        MarketEvent::MarkPrice(e) => {
            base.push(("mark_px".into(), e.mark_price.to_string()));
            if let Some(index_price) = &e.index_price {
                base.push(("index_px".into(), index_price.to_string()));
            }
            vec![CacheCommand::HSet {
                key: key(&["last:mark", &header.instrument]),
                fields: base,
                ttl_s: Some(MARK_PRICE_TTL_S),
                channel: Channel::MarkPrice,
            }]
        }
        MarketEvent::Funding(e) => {
            base.push(("funding_rate".into(), e.funding_rate.to_string()));
            base.push((
                "next_funding_ts_ns".into(),
                e.next_funding_ts_ns.to_string(),
            ));
            vec![CacheCommand::HSet {
                key: key(&["last:funding", &header.instrument]),
                fields: base,
                ttl_s: None,
                channel: Channel::Funding,
            }]
        }
        MarketEvent::AggTrades5s(e) => {
            base.push(("interval_s".into(), e.interval_s.to_string()));
            base.push(("window_start_ns".into(), e.window_start_ns.to_string()));
            base.push(("open".into(), e.open.to_string()));
            base.push(("high".into(), e.high.to_string()));
            base.push(("low".into(), e.low.to_string()));
            base.push(("close".into(), e.close.to_string()));
            base.push(("volume".into(), e.volume.to_string()));
            base.push(("notional".into(), e.notional.to_string()));
            base.push(("trade_count".into(), e.trade_count.to_string()));
            base.push(("buy_qty".into(), e.buy_qty.to_string()));
            base.push(("sell_qty".into(), e.sell_qty.to_string()));
            base.push(("buy_notional".into(), e.buy_notional.to_string()));
            base.push(("sell_notional".into(), e.sell_notional.to_string()));
            if let Some(first_trade_id) = &e.first_trade_id {
                base.push(("first_trade_id".into(), first_trade_id.clone()));
            }
            if let Some(last_trade_id) = &e.last_trade_id {
                base.push(("last_trade_id".into(), last_trade_id.clone()));
            }
            vec![CacheCommand::HSet {
                key: key(&["last:agg_trades_5s", &header.instrument]),
                fields: base,
                ttl_s: Some(AGG_TRADES_5S_TTL_S),
                channel: Channel::AggTrades5s,
            }]
        }
        MarketEvent::Kline(e) => {
            base.push(("interval".into(), e.interval.clone()));
            base.push(("open".into(), e.open.to_string()));
            base.push(("high".into(), e.high.to_string()));
            base.push(("low".into(), e.low.to_string()));
            base.push(("close".into(), e.close.to_string()));
            base.push(("volume".into(), e.volume.to_string()));
            base.push(("quote_volume".into(), e.quote_volume.to_string()));
            base.push((
                "taker_buy_base_volume".into(),
                e.taker_buy_base_volume.to_string(),
            ));
            base.push((
                "taker_buy_quote_volume".into(),
                e.taker_buy_quote_volume.to_string(),
            ));
            base.push(("trade_count".into(), e.trade_count.to_string()));
            base.push((
                "is_closed".into(),
                if e.is_closed { "1" } else { "0" }.to_string(),
            ));
            vec![CacheCommand::HSet {
                key: key(&["last:klines", &e.interval, &header.instrument]),
                fields: base,
                ttl_s: Some(KLINES_TTL_S),
                channel: Channel::Klines,
            }]
        }
        MarketEvent::AdvancedMetrics(e) => {
            for (name, value) in &e.metrics {
                base.push((name.clone(), value.to_string()));
            }
            vec![CacheCommand::HSet {
                key: key(&["last:adv", &header.instrument]),
                fields: base,
                ttl_s: None,
                channel: Channel::AdvancedMetrics,
            }]
        }
        MarketEvent::Diff(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        AggTrades5sEvent, Header, KlineEvent, MarkPriceEvent, OrderBookDepthEvent, Side,
        TradeEvent,
    };
    use rust_decimal_macros::dec;

    fn header(channel: Channel) -> Header {
        Header {
            instrument: "BTCUSDT".into(),
            channel,
            ts_event_ns: 1_700_000_001_000,
            ts_recv_ns: 1_700_000_001_050_000_000,
        }
    }

    fn fields_of(command: &CacheCommand) -> &[(String, String)] {
        match command {
            CacheCommand::HSet { fields, .. } | CacheCommand::XAdd { fields, .. } => fields,
        }
    }

    fn field<'a>(command: &'a CacheCommand, name: &str) -> Option<&'a str> {
        fields_of(command)
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn trade_goes_to_its_stream() {
        let event = MarketEvent::Trade(TradeEvent {
            header: header(Channel::Trades),
            price: dec!(0.0010),
            qty: dec!(100),
            side: Side::Sell,
            trade_id: Some("42".into()),
            is_aggressor: Some(false),
        });
        let commands = build_commands(&event, 1000);
        assert_eq!(commands.len(), 1);
        let CacheCommand::XAdd { key, maxlen, .. } = &commands[0] else {
            panic!("expected XADD");
        };
        assert_eq!(key, "marketdata:stream:trades:BTCUSDT");
        assert_eq!(*maxlen, 1000);
        assert_eq!(field(&commands[0], "px"), Some("0.0010"));
        assert_eq!(field(&commands[0], "side"), Some("SELL"));
        assert_eq!(field(&commands[0], "is_aggressor"), Some("0"));
    }

    #[test]
    fn mark_price_key_and_ttl() {
        let event = MarketEvent::MarkPrice(MarkPriceEvent {
            header: header(Channel::MarkPrice),
            mark_price: dec!(45000.10),
            index_price: Some(dec!(44999.90)),
        });
        let commands = build_commands(&event, 1000);
        let CacheCommand::HSet { key, ttl_s, .. } = &commands[0] else {
            panic!("expected HSET");
        };
        assert_eq!(key, "marketdata:last:mark:BTCUSDT");
        assert_eq!(*ttl_s, Some(3));
        assert_eq!(field(&commands[0], "mark_px"), Some("45000.10"));
        assert_eq!(field(&commands[0], "index_px"), Some("44999.90"));
    }

    #[test]
    fn depth_keys_by_level_count() {
        let event = MarketEvent::Depth(OrderBookDepthEvent {
            header: header(Channel::ObTop5),
            depth: 5,
            bid_prices: vec![dec!(100), dec!(99)],
            bid_qtys: vec![dec!(1), dec!(2)],
            ask_prices: vec![dec!(101)],
            ask_qtys: vec![dec!(3)],
        });
        let commands = build_commands(&event, 1000);
        let CacheCommand::HSet { key, ttl_s, .. } = &commands[0] else {
            panic!("expected HSET");
        };
        assert_eq!(key, "marketdata:last:top5:BTCUSDT");
        assert!(ttl_s.is_none());
        assert_eq!(field(&commands[0], "b1_px"), Some("100"));
        assert_eq!(field(&commands[0], "b2_sz"), Some("2"));
        assert_eq!(field(&commands[0], "a1_px"), Some("101"));
    }

    #[test]
    fn l1_depth_uses_l1_key() {
        let event = MarketEvent::Depth(OrderBookDepthEvent {
            header: header(Channel::L1),
            depth: 1,
            bid_prices: vec![dec!(100)],
            bid_qtys: vec![dec!(1)],
            ask_prices: vec![dec!(101)],
            ask_qtys: vec![dec!(2)],
        });
        let commands = build_commands(&event, 1000);
        assert_eq!(commands[0].key(), "marketdata:last:l1:BTCUSDT");
    }

    #[test]
    fn agg_trades_key_and_ttl() {
        let event = MarketEvent::AggTrades5s(AggTrades5sEvent {
            header: header(Channel::AggTrades5s),
            interval_s: 5,
            window_start_ns: 1_700_000_000_000_000_000,
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(90),
            volume: dec!(6),
            notional: dec!(590),
            trade_count: 3,
            buy_qty: dec!(4),
            sell_qty: dec!(2),
            buy_notional: dec!(370),
            sell_notional: dec!(220),
            first_trade_id: None,
            last_trade_id: None,
        });
        let commands = build_commands(&event, 1000);
        let CacheCommand::HSet { key, ttl_s, .. } = &commands[0] else {
            panic!("expected HSET");
        };
        assert_eq!(key, "marketdata:last:agg_trades_5s:BTCUSDT");
        assert_eq!(*ttl_s, Some(10));
        assert_eq!(field(&commands[0], "window_start_ns"), Some("1700000000000000000"));
        assert_eq!(field(&commands[0], "buy_qty"), Some("4"));
    }

    #[test]
    fn kline_key_includes_interval() {
        let event = MarketEvent::Kline(KlineEvent {
            header: header(Channel::Klines),
            interval: "1m".into(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(42),
            quote_volume: dec!(4300),
            taker_buy_base_volume: dec!(20),
            taker_buy_quote_volume: dec!(2100),
            trade_count: 7,
            is_closed: false,
        });
        let commands = build_commands(&event, 1000);
        let CacheCommand::HSet { key, ttl_s, .. } = &commands[0] else {
            panic!("expected HSET");
        };
        assert_eq!(key, "marketdata:last:klines:1m:BTCUSDT");
        assert_eq!(*ttl_s, Some(120));
        assert_eq!(field(&commands[0], "is_closed"), Some("0"));
    }

    #[test]
    fn diffs_never_reach_the_cache() {
        use crate::events::OrderBookDiffEvent;
        let event = MarketEvent::Diff(OrderBookDiffEvent {
            header: header(Channel::ObDiff),
            sequence: 2,
            prev_sequence: 1,
            bids: Default::default(),
            asks: Default::default(),
        });
        assert!(build_commands(&event, 1000).is_empty());
    }

    #[test]
    fn reconnect_backoff_is_capped() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(30));
    }
}
