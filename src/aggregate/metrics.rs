//! Derived per-symbol metrics from top-of-book state.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::events::{AdvancedMetricsEvent, Channel, Header, OrderBookDepthEvent};

/// Derive spread/mid metrics from a depth event; top-5 snapshots also yield
/// a size imbalance. Returns `None` when either side is missing.
pub fn from_depth(event: &OrderBookDepthEvent) -> Option<AdvancedMetricsEvent> {
    let best_bid = *event.bid_prices.first()?;
    let best_ask = *event.ask_prices.first()?;
    let spread = best_ask - best_bid;
    let mid = (best_ask + best_bid) / Decimal::TWO;

    let mut metrics: BTreeMap<String, Decimal> = BTreeMap::new();
    metrics.insert("spread_px".into(), spread);
    metrics.insert("mid_px".into(), mid);
    let spread_bps = if mid > Decimal::ZERO {
        spread / mid * Decimal::from(10_000)
    } else {
        Decimal::ZERO
    };
    metrics.insert("spread_bps".into(), spread_bps);

    if event.depth == 5 {
        let bid_total: Decimal = event.bid_qtys.iter().copied().sum();
        let ask_total: Decimal = event.ask_qtys.iter().copied().sum();
        let total = bid_total + ask_total;
        if total > Decimal::ZERO {
            metrics.insert("imbalance_5".into(), (bid_total - ask_total) / total);
        }
    }

    Some(AdvancedMetricsEvent {
        header: Header {
            instrument: event.header.instrument.clone(),
            channel: Channel::AdvancedMetrics,
            ts_event_ns: event.header.ts_event_ns,
            ts_recv_ns: event.header.ts_recv_ns,
        },
        metrics,
    })
}
