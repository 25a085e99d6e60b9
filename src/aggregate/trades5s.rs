//! 5-second aggregated-trade roller.
//!
//! One open accumulator per symbol, keyed by the grid-aligned window start.
//! A newer trade closes and emits the current window; a late trade (older
//! window) is dropped and counted. Idle windows are elided, never
//! zero-filled: the wall-clock closer only emits windows that saw trades.

use rust_decimal::Decimal;

use crate::events::{AggTrades5sEvent, Channel, Header, TradeEvent};
use crate::time_util::{normalize_event_ns, now_ns, window_start_ns, WINDOW_NS};

/// Grace period past a window's end before the closer force-emits it.
pub const CLOSE_GRACE_NS: u64 = 2_000_000_000;

#[derive(Debug)]
struct Window {
    window_start_ns: u64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    notional: Decimal,
    trade_count: u64,
    buy_qty: Decimal,
    sell_qty: Decimal,
    buy_notional: Decimal,
    sell_notional: Decimal,
    first_trade_id: Option<String>,
    last_trade_id: Option<String>,
    last_event_ns: u64,
}

impl Window {
    fn open_with(trade: &TradeEvent, start_ns: u64) -> Self {
        let mut window = Self {
            window_start_ns: start_ns,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: Decimal::ZERO,
            notional: Decimal::ZERO,
            trade_count: 0,
            buy_qty: Decimal::ZERO,
            sell_qty: Decimal::ZERO,
            buy_notional: Decimal::ZERO,
            sell_notional: Decimal::ZERO,
            first_trade_id: trade.trade_id.clone(),
            last_trade_id: None,
            last_event_ns: trade.header.ts_event_ns,
        };
        window.fold(trade);
        window
    }

    fn fold(&mut self, trade: &TradeEvent) {
        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        let notional = trade.price * trade.qty;
        self.volume += trade.qty;
        self.notional += notional;
        self.trade_count += 1;
        // Unknown-aggressor trades are excluded from both side buckets.
        match trade.is_aggressor {
            Some(true) => {
                self.buy_qty += trade.qty;
                self.buy_notional += notional;
            }
            Some(false) => {
                self.sell_qty += trade.qty;
                self.sell_notional += notional;
            }
            None => {}
        }
        self.last_trade_id = trade.trade_id.clone();
        self.last_event_ns = trade.header.ts_event_ns;
    }

    fn into_event(self, instrument: &str) -> AggTrades5sEvent {
        AggTrades5sEvent {
            header: Header {
                instrument: instrument.to_string(),
                channel: Channel::AggTrades5s,
                ts_event_ns: self.last_event_ns,
                ts_recv_ns: now_ns(),
            },
            interval_s: 5,
            window_start_ns: self.window_start_ns,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            notional: self.notional,
            trade_count: self.trade_count,
            buy_qty: self.buy_qty,
            sell_qty: self.sell_qty,
            buy_notional: self.buy_notional,
            sell_notional: self.sell_notional,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
        }
    }
}

/// Per-symbol roller. At most one row is emitted per (symbol, window start).
#[derive(Debug)]
pub struct AggTradeRoller {
    instrument: String,
    current: Option<Window>,
    /// Late trades dropped after their window already closed.
    pub lost: u64,
}

impl AggTradeRoller {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            current: None,
            lost: 0,
        }
    }

    /// Fold a trade into the roller. Returns the closed window's event when
    /// the trade opens a newer window.
    ///
    /// Trade headers carry the vendor's raw millisecond timestamp; the grid
    /// key is computed on the normalized nanosecond value so windows align
    /// to the 5 s grid regardless.
    pub fn on_trade(&mut self, trade: &TradeEvent) -> Option<AggTrades5sEvent> {
        use std::cmp::Ordering;

        let start_ns = window_start_ns(normalize_event_ns(trade.header.ts_event_ns));
        match self.current.as_ref().map(|w| start_ns.cmp(&w.window_start_ns)) {
            None => {
                self.current = Some(Window::open_with(trade, start_ns));
                None
            }
            Some(Ordering::Equal) => {
                if let Some(window) = self.current.as_mut() {
                    window.fold(trade);
                }
                None
            }
            Some(Ordering::Greater) => {
                let closed = self.current.replace(Window::open_with(trade, start_ns));
                closed.map(|w| w.into_event(&self.instrument))
            }
            Some(Ordering::Less) => {
                self.lost += 1;
                None
            }
        }
    }

    /// Wall-clock closer: emit the open window once `now_ns` is past its end
    /// plus the grace period, so idle symbols still flush their last window.
    pub fn close_expired(&mut self, now_ns: u64) -> Option<AggTrades5sEvent> {
        let expired = match &self.current {
            Some(w) => now_ns > w.window_start_ns + WINDOW_NS + CLOSE_GRACE_NS,
            None => false,
        };
        if expired {
            self.current
                .take()
                .map(|w| w.into_event(&self.instrument))
        } else {
            None
        }
    }

    /// Emit the open window regardless of age (shutdown path).
    pub fn force_close(&mut self) -> Option<AggTrades5sEvent> {
        self.current.take().map(|w| w.into_event(&self.instrument))
    }

    pub fn has_open_window(&self) -> bool {
        self.current.is_some()
    }
}
