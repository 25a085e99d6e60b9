//! One shard: a single WebSocket connection carrying up to N per-symbol
//! streams of one family, plus the per-symbol aggregation state those
//! streams feed.
//!
//! `ShardCore` is the I/O-free part — frame handling, aggregation, routing —
//! so tests can drive it with raw JSON. `Shard::run` wraps it in the
//! connect/reconnect loop with backoff, heartbeat supervision, the 1 s
//! window-closer tick, and snapshot dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::aggregate::{klines, metrics, AggTradeRoller, DepthSnapshot, DiffOutcome, OrderBookState, SnapshotOutcome};
use crate::error::Result;
use crate::events::{Channel, MarketEvent};
use crate::exchange::parse;
use crate::exchange::rest::SnapshotClient;
use crate::exchange::streams::StreamKind;
use crate::health::HealthRegistry;
use crate::router::Router;
use crate::time_util::now_ns;

pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(60);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which logical outputs this shard produces from its stream family.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardFlags {
    pub emit_trades: bool,
    pub emit_agg: bool,
    pub emit_l1: bool,
    pub emit_top5: bool,
    pub emit_top20: bool,
    pub emit_diff: bool,
    /// Derive L1 from the local diff book when its top changes.
    pub derive_l1: bool,
    pub emit_liquidations: bool,
    pub emit_mark: bool,
    pub emit_funding: bool,
    pub emit_klines: bool,
    pub emit_metrics: bool,
}

/// Frame handling and per-symbol state, independent of the socket.
pub struct ShardCore {
    pub shard_id: usize,
    pub kind: StreamKind,
    flags: ShardFlags,
    router: Router,
    health: Arc<HealthRegistry>,
    rollers: HashMap<String, AggTradeRoller>,
    books: HashMap<String, OrderBookState>,
    snapshot_wanted: Vec<String>,
    snapshot_inflight: HashSet<String>,
}

impl ShardCore {
    pub fn new(
        shard_id: usize,
        kind: StreamKind,
        flags: ShardFlags,
        router: Router,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            shard_id,
            kind,
            flags,
            router,
            health,
            rollers: HashMap::new(),
            books: HashMap::new(),
            snapshot_wanted: Vec::new(),
            snapshot_inflight: HashSet::new(),
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Process one text frame. Parse failures are counted and swallowed;
    /// only a closed sink propagates, which tears the shard down.
    pub async fn handle_frame(&mut self, raw: &str, recv_ns: u64) -> Result<()> {
        let primary = self.kind.primary_channel();
        let (stream, data) = match parse::frame_payload(raw) {
            Ok(parts) => parts,
            Err(e) => {
                self.health.incr_parse_errors(primary);
                warn!("parse_error channel={primary} error={e}");
                return Ok(());
            }
        };
        if data.get("result").is_some() {
            debug!("subscription ack channel={primary}");
            return Ok(());
        }
        self.count_ws();
        let symbol_hint = stream
            .as_deref()
            .and_then(|s| s.split('@').next())
            .unwrap_or("")
            .to_uppercase();

        match self.kind {
            StreamKind::AggTrade => match parse::trade_event(data, recv_ns) {
                Ok(trade) => {
                    if self.flags.emit_agg {
                        let roller = self
                            .rollers
                            .entry(trade.header.instrument.clone())
                            .or_insert_with(|| AggTradeRoller::new(trade.header.instrument.clone()));
                        let lost_before = roller.lost;
                        let closed = roller.on_trade(&trade);
                        if roller.lost > lost_before {
                            self.health.incr_lost(Channel::AggTrades5s);
                        }
                        if let Some(row) = closed {
                            self.router.publish(MarketEvent::AggTrades5s(row)).await?;
                        }
                    }
                    if self.flags.emit_trades {
                        self.router.publish(MarketEvent::Trade(trade)).await?;
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
            StreamKind::BookTicker => match parse::l1_event(data, recv_ns) {
                Ok(l1) => {
                    let derived = if self.flags.emit_metrics {
                        metrics::from_depth(&l1)
                    } else {
                        None
                    };
                    if self.flags.emit_l1 {
                        self.router.publish(MarketEvent::Depth(l1)).await?;
                    }
                    if let Some(m) = derived {
                        self.router.publish(MarketEvent::AdvancedMetrics(m)).await?;
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
            StreamKind::Top5 | StreamKind::Top20 => {
                let (depth, channel) = if self.kind == StreamKind::Top5 {
                    (5, Channel::ObTop5)
                } else {
                    (20, Channel::ObTop20)
                };
                match parse::depth_event(data, &symbol_hint, depth, channel, recv_ns) {
                    Ok(event) => {
                        let derived = if self.flags.emit_metrics {
                            metrics::from_depth(&event)
                        } else {
                            None
                        };
                        self.router.publish(MarketEvent::Depth(event)).await?;
                        if let Some(m) = derived {
                            self.router.publish(MarketEvent::AdvancedMetrics(m)).await?;
                        }
                    }
                    Err(e) => self.parse_error(primary, e),
                }
            }
            StreamKind::Diff => match parse::diff_event(data, recv_ns) {
                Ok(diff) => {
                    let instrument = diff.header.instrument.clone();
                    let book = self
                        .books
                        .entry(instrument.clone())
                        .or_insert_with(|| OrderBookState::new(instrument.clone()));
                    let outcome = book.on_diff(&diff);
                    match outcome {
                        DiffOutcome::Stale => {
                            self.health.incr_lost(Channel::ObDiff);
                            return Ok(());
                        }
                        DiffOutcome::Gap => {
                            warn!(
                                "orderbook gap symbol={instrument} U={} last_u={}; resyncing",
                                diff.prev_sequence,
                                book.last_sequence()
                            );
                            self.request_snapshot(&instrument);
                        }
                        DiffOutcome::Buffered => {
                            self.request_snapshot(&instrument);
                        }
                        DiffOutcome::Applied { top_changed } => {
                            let crossed = {
                                let book = &self.books[&instrument];
                                book.is_crossed()
                            };
                            if crossed {
                                self.health.incr_validation_errors(Channel::ObDiff);
                                warn!("crossed book symbol={instrument}; resyncing");
                                if let Some(book) = self.books.get_mut(&instrument) {
                                    book.force_resync();
                                }
                                self.request_snapshot(&instrument);
                            } else if top_changed && self.flags.derive_l1 {
                                let l1 = self
                                    .books
                                    .get(&instrument)
                                    .and_then(|b| b.l1_event(diff.header.ts_event_ns, recv_ns));
                                if let Some(l1) = l1 {
                                    self.router.publish(MarketEvent::Depth(l1)).await?;
                                }
                            }
                        }
                    }
                    if self.flags.emit_diff {
                        self.router.publish(MarketEvent::Diff(diff)).await?;
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
            StreamKind::ForceOrder => match parse::liquidation_event(data, recv_ns) {
                Ok(liq) => {
                    if self.flags.emit_liquidations {
                        self.router.publish(MarketEvent::Liquidation(liq)).await?;
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
            StreamKind::MarkPrice => match parse::mark_and_funding_events(data, recv_ns) {
                Ok((mark, funding)) => {
                    if self.flags.emit_mark {
                        self.router.publish(MarketEvent::MarkPrice(mark)).await?;
                    }
                    if self.flags.emit_funding {
                        if let Some(funding) = funding {
                            self.router.publish(MarketEvent::Funding(funding)).await?;
                        }
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
            StreamKind::Kline => match parse::kline_event(data, recv_ns) {
                Ok(kline) => {
                    if let Err(reason) = klines::validate(&kline) {
                        self.health.incr_validation_errors(Channel::Klines);
                        warn!(
                            "validation_error channel=klines symbol={} reason={reason}",
                            kline.header.instrument
                        );
                        return Ok(());
                    }
                    if self.flags.emit_klines {
                        self.router.publish(MarketEvent::Kline(kline)).await?;
                    }
                }
                Err(e) => self.parse_error(primary, e),
            },
        }
        Ok(())
    }

    /// Wall-clock pass: emit 5 s windows that idled past their grace period.
    pub async fn tick(&mut self, now_ns: u64) -> Result<()> {
        let mut closed = Vec::new();
        for roller in self.rollers.values_mut() {
            if let Some(row) = roller.close_expired(now_ns) {
                closed.push(row);
            }
        }
        for row in closed {
            self.router.publish(MarketEvent::AggTrades5s(row)).await?;
        }
        Ok(())
    }

    /// Shutdown path: flush whatever windows are still open.
    pub async fn finish(&mut self) -> Result<()> {
        let mut closed = Vec::new();
        for roller in self.rollers.values_mut() {
            if let Some(row) = roller.force_close() {
                closed.push(row);
            }
        }
        for row in closed {
            self.router.publish(MarketEvent::AggTrades5s(row)).await?;
        }
        Ok(())
    }

    pub fn integrate_snapshot(&mut self, symbol: &str, snapshot: Option<DepthSnapshot>) {
        self.snapshot_inflight.remove(symbol);
        let Some(snapshot) = snapshot else {
            // fetch failed; the next diff re-requests, gated by the cooldown
            return;
        };
        if let Some(book) = self.books.get_mut(symbol) {
            match book.apply_snapshot(snapshot) {
                SnapshotOutcome::Synced { applied } => {
                    info!(
                        "orderbook synced symbol={symbol} last_u={} replayed={applied}",
                        book.last_sequence()
                    );
                }
                SnapshotOutcome::Gap => {
                    warn!("snapshot behind stream symbol={symbol}; fetching again");
                    self.request_snapshot_unchecked(symbol);
                }
            }
        }
    }

    /// Symbols whose book wants a snapshot and has none in flight.
    pub fn take_snapshot_requests(&mut self) -> Vec<String> {
        std::mem::take(&mut self.snapshot_wanted)
    }

    pub fn mark_inflight(&mut self, symbol: &str) {
        self.snapshot_inflight.insert(symbol.to_string());
    }

    fn request_snapshot(&mut self, symbol: &str) {
        let needs = self
            .books
            .get(symbol)
            .map(|b| b.needs_snapshot())
            .unwrap_or(false);
        if needs {
            self.request_snapshot_unchecked(symbol);
        }
    }

    fn request_snapshot_unchecked(&mut self, symbol: &str) {
        if !self.snapshot_inflight.contains(symbol)
            && !self.snapshot_wanted.iter().any(|s| s == symbol)
        {
            self.snapshot_wanted.push(symbol.to_string());
        }
    }

    fn parse_error(&self, channel: Channel, error: crate::error::CollectorError) {
        self.health.incr_parse_errors(channel);
        warn!("parse_error channel={channel} error={error}");
    }

    fn count_ws(&self) {
        match self.kind {
            StreamKind::AggTrade => {
                if self.flags.emit_trades {
                    self.health.incr_ws(Channel::Trades);
                }
                if self.flags.emit_agg {
                    self.health.incr_ws(Channel::AggTrades5s);
                }
            }
            StreamKind::BookTicker => self.health.incr_ws(Channel::L1),
            StreamKind::Top5 => self.health.incr_ws(Channel::ObTop5),
            StreamKind::Top20 => self.health.incr_ws(Channel::ObTop20),
            StreamKind::Diff => self.health.incr_ws(Channel::ObDiff),
            StreamKind::ForceOrder => self.health.incr_ws(Channel::Liquidations),
            StreamKind::MarkPrice => {
                if self.flags.emit_mark {
                    self.health.incr_ws(Channel::MarkPrice);
                }
                if self.flags.emit_funding {
                    self.health.incr_ws(Channel::Funding);
                }
            }
            StreamKind::Kline => self.health.incr_ws(Channel::Klines),
        }
    }
}

/// A shard bound to its connection parameters.
pub struct Shard {
    pub core: ShardCore,
    pub streams: Vec<String>,
    pub ws_url: String,
    pub snapshots: Option<Arc<SnapshotClient>>,
}

impl Shard {
    /// Connect/reconnect loop. Runs until shutdown flips or the router's
    /// writers go away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let primary = self.core.kind.primary_channel();
        let shard_id = self.core.shard_id;
        let (snap_tx, mut snap_rx) = mpsc::channel::<(String, Option<DepthSnapshot>)>(16);
        let mut attempt: u32 = 0;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            let connected = tokio::select! {
                res = connect_async(self.ws_url.as_str()) => res,
                _ = shutdown.changed() => break,
            };
            match connected {
                Ok((ws, _)) => {
                    self.core.health().incr_conns(primary);
                    info!(
                        "connect shard={shard_id} channel={primary} streams={}",
                        self.streams.len()
                    );
                    attempt = 0;
                    let (mut sink, mut stream) = ws.split();
                    let subscribe = json!({
                        "method": "SUBSCRIBE",
                        "params": self.streams,
                        "id": 1,
                    });
                    if let Err(e) = sink.send(Message::Text(subscribe.to_string())).await {
                        warn!("subscribe failed shard={shard_id}: {e}");
                    } else {
                        let mut ticker = tokio::time::interval(Duration::from_secs(1));
                        ticker
                            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        let mut last_frame = Instant::now();
                        loop {
                            tokio::select! {
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        break 'outer;
                                    }
                                }
                                res = tokio::time::timeout(FRAME_TIMEOUT, stream.next()) => {
                                    match res {
                                        Err(_) => {
                                            warn!("frame timeout shard={shard_id} channel={primary}");
                                            break;
                                        }
                                        Ok(None) => {
                                            warn!("stream ended shard={shard_id} channel={primary}");
                                            break;
                                        }
                                        Ok(Some(Err(e))) => {
                                            warn!("read error shard={shard_id} channel={primary}: {e}");
                                            break;
                                        }
                                        Ok(Some(Ok(msg))) => {
                                            last_frame = Instant::now();
                                            match msg {
                                                Message::Text(text) => {
                                                    if let Err(e) =
                                                        self.core.handle_frame(&text, now_ns()).await
                                                    {
                                                        error!("shard={shard_id} stopping: {e}");
                                                        break 'outer;
                                                    }
                                                    self.dispatch_snapshots(&snap_tx);
                                                }
                                                Message::Ping(payload) => {
                                                    let _ = sink.send(Message::Pong(payload)).await;
                                                }
                                                Message::Close(frame) => {
                                                    info!("close frame shard={shard_id}: {frame:?}");
                                                    break;
                                                }
                                                _ => {}
                                            }
                                        }
                                    }
                                }
                                _ = ticker.tick() => {
                                    if last_frame.elapsed() > HEARTBEAT_TIMEOUT {
                                        warn!("heartbeat lost shard={shard_id} channel={primary}");
                                        break;
                                    }
                                    if let Err(e) = self.core.tick(now_ns()).await {
                                        error!("shard={shard_id} stopping: {e}");
                                        break 'outer;
                                    }
                                    self.dispatch_snapshots(&snap_tx);
                                }
                                Some((symbol, snapshot)) = snap_rx.recv() => {
                                    self.core.integrate_snapshot(&symbol, snapshot);
                                    self.dispatch_snapshots(&snap_tx);
                                }
                            }
                        }
                    }
                    self.core.health().incr_discs(primary);
                }
                Err(e) => {
                    self.core.health().incr_discs(primary);
                    warn!("connect failed shard={shard_id} channel={primary}: {e}");
                }
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!("disconnect shard={shard_id} channel={primary}; reconnect in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.core.finish().await {
            debug!("final window flush skipped shard={shard_id}: {e}");
        }
    }

    fn dispatch_snapshots(&mut self, tx: &mpsc::Sender<(String, Option<DepthSnapshot>)>) {
        let wanted = self.core.take_snapshot_requests();
        if wanted.is_empty() {
            return;
        }
        let Some(client) = self.snapshots.clone() else {
            return;
        };
        for symbol in wanted {
            if !client.begin(&symbol) {
                continue;
            }
            self.core.mark_inflight(&symbol);
            let client = client.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client.fetch(&symbol).await.ok();
                let _ = tx.send((symbol, result)).await;
            });
        }
    }
}

/// Exponential backoff: base 1 s doubling to a 30 s cap, ±20 % jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = RECONNECT_BASE.as_secs_f64() * 2f64.powi(attempt.min(6) as i32);
    let capped = base.min(RECONNECT_CAP.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(capped * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelRoute;
    use crate::health::LastSeenMap;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn routes_all() -> Vec<ChannelRoute> {
        Channel::ALL
            .iter()
            .map(|&channel| ChannelRoute {
                channel,
                to_columnar: true,
                to_cache: false,
            })
            .collect()
    }

    fn test_core(kind: StreamKind, flags: ShardFlags) -> (ShardCore, mpsc::Receiver<Arc<MarketEvent>>) {
        let (tx, rx) = mpsc::channel(256);
        let health = HealthRegistry::new();
        let router = Router::new(
            &routes_all(),
            Some(tx),
            None,
            health.clone(),
            Arc::new(LastSeenMap::default()),
        );
        (ShardCore::new(0, kind, flags, router, health), rx)
    }

    fn agg_trade_frame(ts_ms: u64, price: &str, qty: &str, buyer_maker: bool) -> String {
        format!(
            r#"{{"stream":"btcusdt@aggTrade","data":{{"e":"aggTrade","E":{ts},"s":"BTCUSDT","a":{ts},"p":"{price}","q":"{qty}","f":1,"l":2,"T":{ts},"m":{m}}}}}"#,
            ts = ts_ms,
            price = price,
            qty = qty,
            m = buyer_maker,
        )
    }

    fn diff_frame(symbol: &str, first: u64, last: u64, bids: &str, asks: &str) -> String {
        format!(
            r#"{{"stream":"{s}@depth@100ms","data":{{"e":"depthUpdate","E":1700000001000,"s":"{S}","U":{first},"u":{last},"b":{bids},"a":{asks}}}}}"#,
            s = symbol.to_lowercase(),
            S = symbol,
        )
    }

    #[tokio::test]
    async fn agg_shard_rolls_five_second_windows() {
        let flags = ShardFlags {
            emit_trades: true,
            emit_agg: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::AggTrade, flags);

        for (ts, price, qty, maker) in [
            (1_700_000_001_000u64, "100", "1", false), // aggressive buy
            (1_700_000_002_500, "110", "2", true),     // aggressive sell
            (1_700_000_004_999, "90", "3", false),     // aggressive buy
        ] {
            core.handle_frame(&agg_trade_frame(ts, price, qty, maker), now_ns())
                .await
                .unwrap();
        }
        // three raw trades routed so far
        for _ in 0..3 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.channel(), Channel::Trades);
        }
        // clock passes the window end plus grace; the closer emits the row
        core.tick(1_700_000_007_001 * 1_000_000).await.unwrap();
        let ev = rx.recv().await.unwrap();
        let MarketEvent::AggTrades5s(row) = ev.as_ref() else {
            panic!("expected agg row, got {ev:?}");
        };
        assert_eq!(row.window_start_ns, 1_700_000_000 * 1_000_000_000);
        assert_eq!(row.open, dec!(100));
        assert_eq!(row.high, dec!(110));
        assert_eq!(row.low, dec!(90));
        assert_eq!(row.close, dec!(90));
        assert_eq!(row.volume, dec!(6));
        assert_eq!(row.trade_count, 3);
        assert_eq!(row.buy_qty, dec!(4));
        assert_eq!(row.sell_qty, dec!(2));
    }

    #[tokio::test]
    async fn late_trade_increments_lost_counter() {
        let flags = ShardFlags {
            emit_agg: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::AggTrade, flags);
        core.handle_frame(&agg_trade_frame(1_700_000_001_000, "100", "1", false), now_ns())
            .await
            .unwrap();
        core.tick(1_700_000_007_001 * 1_000_000).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::AggTrades5s);

        // a trade for the closed window arrives after emission
        core.handle_frame(&agg_trade_frame(1_700_000_008_000, "101", "1", false), now_ns())
            .await
            .unwrap();
        core.handle_frame(&agg_trade_frame(1_700_000_003_000, "99", "1", false), now_ns())
            .await
            .unwrap();
        assert_eq!(
            core.health()
                .channel(Channel::AggTrades5s)
                .lost
                .load(Ordering::Relaxed),
            1
        );
        // no second row for the old window
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn diff_gap_triggers_resync_and_buffers() {
        let flags = ShardFlags {
            emit_diff: true,
            derive_l1: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::Diff, flags);

        // first diff: bootstrap begins, snapshot requested
        core.handle_frame(
            &diff_frame("BTCUSDT", 999, 1000, r#"[["100","1"]]"#, r#"[["101","1"]]"#),
            now_ns(),
        )
        .await
        .unwrap();
        assert_eq!(core.take_snapshot_requests(), vec!["BTCUSDT".to_string()]);
        // buffered diff still routed to the columnar sink
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::ObDiff);

        core.integrate_snapshot(
            "BTCUSDT",
            Some(DepthSnapshot {
                last_update_id: 1000,
                bids: vec![(dec!(100), dec!(1))],
                asks: vec![(dec!(101), dec!(1))],
            }),
        );

        // contiguous diff applies; top change derives an L1 event
        core.handle_frame(
            &diff_frame("BTCUSDT", 1001, 1001, r#"[["100.5","2"]]"#, "[]"),
            now_ns(),
        )
        .await
        .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let channels = [first.channel(), second.channel()];
        assert!(channels.contains(&Channel::L1));
        assert!(channels.contains(&Channel::ObDiff));

        // gap: U=1005 > last_u+1=1002
        core.handle_frame(
            &diff_frame("BTCUSDT", 1005, 1010, r#"[["100","1"]]"#, "[]"),
            now_ns(),
        )
        .await
        .unwrap();
        assert_eq!(core.take_snapshot_requests(), vec!["BTCUSDT".to_string()]);
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::ObDiff);

        // while resyncing, diffs buffer (and route) but stale ones still drop
        core.handle_frame(
            &diff_frame("BTCUSDT", 1011, 1012, "[]", r#"[["101.5","3"]]"#),
            now_ns(),
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::ObDiff);

        core.integrate_snapshot(
            "BTCUSDT",
            Some(DepthSnapshot {
                last_update_id: 1009,
                bids: vec![(dec!(100), dec!(1))],
                asks: vec![(dec!(101), dec!(1))],
            }),
        );
        // synced again; sequence continues from the replayed buffer
        core.handle_frame(
            &diff_frame("BTCUSDT", 1013, 1013, r#"[["99","1"]]"#, "[]"),
            now_ns(),
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::ObDiff);
    }

    #[tokio::test]
    async fn stale_diff_is_dropped_not_routed() {
        let flags = ShardFlags {
            emit_diff: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::Diff, flags);
        core.handle_frame(
            &diff_frame("BTCUSDT", 999, 1000, r#"[["100","1"]]"#, r#"[["101","1"]]"#),
            now_ns(),
        )
        .await
        .unwrap();
        core.take_snapshot_requests();
        rx.recv().await.unwrap();
        core.integrate_snapshot(
            "BTCUSDT",
            Some(DepthSnapshot {
                last_update_id: 1005,
                bids: vec![(dec!(100), dec!(1))],
                asks: vec![(dec!(101), dec!(1))],
            }),
        );
        // entirely behind the snapshot
        core.handle_frame(
            &diff_frame("BTCUSDT", 1002, 1003, r#"[["100","9"]]"#, "[]"),
            now_ns(),
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            core.health()
                .channel(Channel::ObDiff)
                .lost
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn mark_frame_fans_out_to_mark_and_funding() {
        let flags = ShardFlags {
            emit_mark: true,
            emit_funding: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::MarkPrice, flags);
        let frame = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate",
            "E":1700000001000,"s":"BTCUSDT","p":"45000.10","i":"44999.90",
            "r":"0.0001","T":1700028800000}}"#;
        core.handle_frame(frame, now_ns()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::MarkPrice);
        assert_eq!(rx.recv().await.unwrap().channel(), Channel::Funding);
        assert_eq!(
            core.health()
                .channel(Channel::MarkPrice)
                .ws
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            core.health()
                .channel(Channel::Funding)
                .ws
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn malformed_frame_counts_parse_error() {
        let flags = ShardFlags {
            emit_trades: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::AggTrade, flags);
        core.handle_frame(
            r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","p":"oops"}}"#,
            now_ns(),
        )
        .await
        .unwrap();
        assert_eq!(
            core.health()
                .channel(Channel::Trades)
                .parse_errors
                .load(Ordering::Relaxed),
            1
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_kline_counts_validation_error() {
        let flags = ShardFlags {
            emit_klines: true,
            ..Default::default()
        };
        let (mut core, mut rx) = test_core(StreamKind::Kline, flags);
        let frame = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1700000060001,
            "s":"BTCUSDT","k":{"i":"1m","o":"100","c":"105","h":"90","l":"80","v":"10",
            "n":5,"x":true,"q":"1","V":"5","Q":"0.5"}}}"#;
        core.handle_frame(frame, now_ns()).await.unwrap();
        assert_eq!(
            core.health()
                .channel(Channel::Klines)
                .validation_errors
                .load(Ordering::Relaxed),
            1
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn backoff_stays_inside_envelope() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt);
            let ideal = (1u64 << attempt.min(6)).min(30) as f64;
            assert!(delay.as_secs_f64() >= ideal * 0.8 - f64::EPSILON);
            assert!(delay.as_secs_f64() <= ideal * 1.2 + f64::EPSILON);
        }
    }
}
