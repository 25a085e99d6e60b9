//! Vendor frame parsing into canonical events.
//!
//! Combined-stream frames arrive as `{"stream": "...", "data": {...}}`; bare
//! payloads are accepted too. Numeric fields come in as strings and are
//! deserialized straight into `Decimal` — no float ever sees a price.
//!
//! Timestamp handling follows the upstream schema: every vendor stream
//! delivers millisecond resolution, and that raw millisecond count is stored
//! unscaled in the ns-typed `ts_event_ns` field on all channels (see
//! `Header::ts_event_ns`). Consumers that need real nanoseconds — lag math,
//! window alignment — normalize on read.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CollectorError, Result};
use crate::events::{
    Channel, FundingEvent, Header, KlineEvent, LiquidationEvent, MarkPriceEvent,
    OrderBookDepthEvent, OrderBookDiffEvent, Side, TradeEvent,
};
/// Split a raw frame into (stream name, payload), unwrapping the
/// combined-stream envelope when present. The stream name carries the symbol
/// for payloads that omit one.
pub fn frame_payload(raw: &str) -> Result<(Option<String>, Value)> {
    let mut value: Value = serde_json::from_str(raw)?;
    let stream = value
        .get("stream")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());
    if let Some(data) = value.get_mut("data") {
        return Ok((stream, data.take()));
    }
    Ok((None, value))
}

#[derive(Debug, Deserialize)]
pub struct AggTradeMsg {
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub agg_trade_id: u64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "T", default)]
    pub trade_time: Option<u64>,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
pub struct BookTickerMsg {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: Decimal,
    #[serde(rename = "B")]
    pub bid_qty: Decimal,
    #[serde(rename = "a")]
    pub ask_price: Decimal,
    #[serde(rename = "A")]
    pub ask_qty: Decimal,
    #[serde(rename = "E", default)]
    pub event_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDepthMsg {
    #[serde(rename = "s", alias = "symbol", default)]
    pub symbol: Option<String>,
    #[serde(rename = "E", default)]
    pub event_time: Option<u64>,
    #[serde(rename = "bids", alias = "b", default)]
    pub bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "asks", alias = "a", default)]
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
pub struct DiffDepthMsg {
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b", default)]
    pub bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a", default)]
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
pub struct ForceOrderMsg {
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "o")]
    pub order: ForceOrderDetail,
}

#[derive(Debug, Deserialize)]
pub struct ForceOrderDetail {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "T")]
    pub trade_time: u64,
    #[serde(rename = "L")]
    pub last_price: Decimal,
    #[serde(rename = "z")]
    pub filled_qty: Decimal,
    #[serde(rename = "i", default)]
    pub order_id: Option<u64>,
    #[serde(rename = "X", default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkPriceMsg {
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: Decimal,
    #[serde(rename = "i", default)]
    pub index_price: Option<Decimal>,
    #[serde(rename = "r", alias = "f", default)]
    pub funding_rate: Option<Decimal>,
    #[serde(rename = "T", default)]
    pub next_funding_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct KlineMsg {
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineDetail,
}

#[derive(Debug, Deserialize)]
pub struct KlineDetail {
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    #[serde(rename = "V")]
    pub taker_buy_base_volume: Decimal,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: Decimal,
    #[serde(rename = "n")]
    pub trade_count: u64,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

fn header(instrument: &str, channel: Channel, ts_event_ns: u64, ts_recv_ns: u64) -> Header {
    Header {
        instrument: instrument.to_uppercase(),
        channel,
        ts_event_ns,
        ts_recv_ns,
    }
}

pub fn trade_event(data: Value, ts_recv_ns: u64) -> Result<TradeEvent> {
    let msg: AggTradeMsg = serde_json::from_value(data)?;
    // legacy: raw vendor ms stored unscaled
    let ts_ms = msg.trade_time.unwrap_or(msg.event_time);
    Ok(TradeEvent {
        header: header(&msg.symbol, Channel::Trades, ts_ms, ts_recv_ns),
        price: msg.price,
        qty: msg.quantity,
        side: if msg.is_buyer_maker { Side::Sell } else { Side::Buy },
        trade_id: Some(msg.agg_trade_id.to_string()),
        is_aggressor: Some(!msg.is_buyer_maker),
    })
}

pub fn l1_event(data: Value, ts_recv_ns: u64) -> Result<OrderBookDepthEvent> {
    let msg: BookTickerMsg = serde_json::from_value(data)?;
    // legacy: vendor ms (or receive-derived ms) stored unscaled
    let ts_event = msg.event_time.unwrap_or(ts_recv_ns / 1_000_000);
    Ok(OrderBookDepthEvent {
        header: header(&msg.symbol, Channel::L1, ts_event, ts_recv_ns),
        depth: 1,
        bid_prices: vec![msg.bid_price],
        bid_qtys: vec![msg.bid_qty],
        ask_prices: vec![msg.ask_price],
        ask_qtys: vec![msg.ask_qty],
    })
}

pub fn depth_event(
    data: Value,
    symbol_hint: &str,
    depth: u16,
    channel: Channel,
    ts_recv_ns: u64,
) -> Result<OrderBookDepthEvent> {
    let msg: PartialDepthMsg = serde_json::from_value(data)?;
    let symbol = msg.symbol.as_deref().unwrap_or(symbol_hint);
    if symbol.is_empty() {
        return Err(CollectorError::parse(channel, "missing symbol"));
    }
    let ts_event = msg.event_time.unwrap_or(ts_recv_ns / 1_000_000);
    let take = depth as usize;
    let bids: Vec<(Decimal, Decimal)> = msg.bids.into_iter().take(take).collect();
    let asks: Vec<(Decimal, Decimal)> = msg.asks.into_iter().take(take).collect();
    Ok(OrderBookDepthEvent {
        header: header(symbol, channel, ts_event, ts_recv_ns),
        depth,
        bid_prices: bids.iter().map(|(p, _)| *p).collect(),
        bid_qtys: bids.iter().map(|(_, q)| *q).collect(),
        ask_prices: asks.iter().map(|(p, _)| *p).collect(),
        ask_qtys: asks.iter().map(|(_, q)| *q).collect(),
    })
}

pub fn diff_event(data: Value, ts_recv_ns: u64) -> Result<OrderBookDiffEvent> {
    let msg: DiffDepthMsg = serde_json::from_value(data)?;
    Ok(OrderBookDiffEvent {
        // legacy: raw vendor ms stored unscaled
        header: header(&msg.symbol, Channel::ObDiff, msg.event_time, ts_recv_ns),
        sequence: msg.final_update_id,
        prev_sequence: msg.first_update_id,
        bids: msg.bids.into_iter().collect(),
        asks: msg.asks.into_iter().collect(),
    })
}

pub fn liquidation_event(data: Value, ts_recv_ns: u64) -> Result<LiquidationEvent> {
    let msg: ForceOrderMsg = serde_json::from_value(data)?;
    let order = msg.order;
    let side = match order.side.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => {
            return Err(CollectorError::parse(
                Channel::Liquidations,
                format!("unknown side: {other}"),
            ))
        }
    };
    Ok(LiquidationEvent {
        // legacy: raw vendor ms stored unscaled
        header: header(
            &order.symbol,
            Channel::Liquidations,
            order.trade_time,
            ts_recv_ns,
        ),
        side,
        price: order.last_price,
        qty: order.filled_qty,
        order_id: order.order_id.map(|id| id.to_string()),
        reason: order.status,
    })
}

/// The mark-price stream yields a mark event and, when the frame carries a
/// funding rate, a funding event as well.
pub fn mark_and_funding_events(
    data: Value,
    ts_recv_ns: u64,
) -> Result<(MarkPriceEvent, Option<FundingEvent>)> {
    let msg: MarkPriceMsg = serde_json::from_value(data)?;
    // legacy: mark/funding event times stay in raw vendor milliseconds
    let mark = MarkPriceEvent {
        header: header(&msg.symbol, Channel::MarkPrice, msg.event_time, ts_recv_ns),
        mark_price: msg.mark_price,
        index_price: msg.index_price,
    };
    let funding = match (msg.funding_rate, msg.next_funding_time) {
        (Some(rate), Some(next)) => Some(FundingEvent {
            header: header(&msg.symbol, Channel::Funding, msg.event_time, ts_recv_ns),
            funding_rate: rate,
            next_funding_ts_ns: next,
        }),
        _ => None,
    };
    Ok((mark, funding))
}

pub fn kline_event(data: Value, ts_recv_ns: u64) -> Result<KlineEvent> {
    let msg: KlineMsg = serde_json::from_value(data)?;
    let k = msg.kline;
    Ok(KlineEvent {
        // legacy: raw vendor ms stored unscaled
        header: header(&msg.symbol, Channel::Klines, msg.event_time, ts_recv_ns),
        interval: k.interval,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        quote_volume: k.quote_volume,
        taker_buy_base_volume: k.taker_buy_base_volume,
        taker_buy_quote_volume: k.taker_buy_quote_volume,
        trade_count: k.trade_count,
        is_closed: k.is_closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const RECV: u64 = 1_700_000_001_234_000_000;

    #[test]
    fn combined_envelope_is_unwrapped() {
        let (stream, payload) =
            frame_payload(r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","x":1}}"#)
                .unwrap();
        assert_eq!(stream.as_deref(), Some("btcusdt@aggTrade"));
        assert_eq!(payload["e"], "aggTrade");
        let (stream, bare) = frame_payload(r#"{"e":"aggTrade","x":1}"#).unwrap();
        assert!(stream.is_none());
        assert_eq!(bare["e"], "aggTrade");
    }

    #[test]
    fn agg_trade_frame() {
        let data: Value = serde_json::from_str(
            r#"{"e":"aggTrade","E":1700000001010,"s":"BTCUSDT","a":5933014,
                "p":"0.0010","q":"100","f":100,"l":105,"T":1700000001000,"m":true,"M":true}"#,
        )
        .unwrap();
        let trade = trade_event(data, RECV).unwrap();
        assert_eq!(trade.header.instrument, "BTCUSDT");
        // raw vendor ms, deliberately unscaled
        assert_eq!(trade.header.ts_event_ns, 1_700_000_001_000);
        assert_eq!(trade.header.ts_recv_ns, RECV);
        assert_eq!(trade.price, dec!(0.0010));
        assert_eq!(trade.price.to_string(), "0.0010");
        assert_eq!(trade.qty, dec!(100));
        // buyer is maker: the seller was the aggressor
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.is_aggressor, Some(false));
        assert_eq!(trade.trade_id.as_deref(), Some("5933014"));
    }

    #[test]
    fn book_ticker_keeps_millisecond_timestamp() {
        let data: Value = serde_json::from_str(
            r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000",
                "a":"25.36520000","A":"40.66000000","E":1700000001000}"#,
        )
        .unwrap();
        let l1 = l1_event(data, RECV).unwrap();
        // raw vendor ms, deliberately unscaled
        assert_eq!(l1.header.ts_event_ns, 1_700_000_001_000);
        assert_eq!(l1.depth, 1);
        assert_eq!(l1.bid_prices[0].to_string(), "25.35190000");
        assert_eq!(l1.ask_qtys[0].to_string(), "40.66000000");
    }

    #[test]
    fn partial_depth_frame() {
        let data: Value = serde_json::from_str(
            r#"{"lastUpdateId":160,"bids":[["0.0024","10"],["0.0023","5"],["0.0022","1"]],
                "asks":[["0.0026","100"],["0.0027","3"]]}"#,
        )
        .unwrap();
        let depth = depth_event(data, "BTCUSDT", 5, Channel::ObTop5, RECV).unwrap();
        assert_eq!(depth.header.instrument, "BTCUSDT");
        assert_eq!(depth.bid_prices.len(), 3);
        assert_eq!(depth.bid_prices[0], dec!(0.0024));
        assert_eq!(depth.ask_prices[0], dec!(0.0026));
        // no E field: receive-derived milliseconds
        assert_eq!(depth.header.ts_event_ns, RECV / 1_000_000);
    }

    #[test]
    fn diff_frame_keeps_millisecond_timestamp() {
        let data: Value = serde_json::from_str(
            r#"{"e":"depthUpdate","E":1700000001000,"s":"BTCUSDT","U":157,"u":160,
                "b":[["0.0024","10"],["0.0025","0"]],"a":[["0.0026","100"]]}"#,
        )
        .unwrap();
        let diff = diff_event(data, RECV).unwrap();
        assert_eq!(diff.header.ts_event_ns, 1_700_000_001_000);
        assert_eq!(diff.prev_sequence, 157);
        assert_eq!(diff.sequence, 160);
        assert_eq!(diff.bids[&dec!(0.0025)], dec!(0));
    }

    #[test]
    fn force_order_frame() {
        let data: Value = serde_json::from_str(
            r#"{"e":"forceOrder","E":1700000001000,"o":{"s":"BTCUSDT","S":"SELL",
                "o":"LIMIT","f":"IOC","q":"0.014","p":"9910","ap":"9910",
                "X":"FILLED","l":"0.014","z":"0.014","T":1700000000990}}"#,
        )
        .unwrap();
        let liq = liquidation_event(data, RECV).unwrap();
        assert_eq!(liq.side, Side::Sell);
        assert_eq!(liq.price, dec!(9910));
        assert_eq!(liq.qty, dec!(0.014));
        assert_eq!(liq.reason.as_deref(), Some("FILLED"));
        // raw vendor ms, deliberately unscaled
        assert_eq!(liq.header.ts_event_ns, 1_700_000_000_990);
    }

    #[test]
    fn mark_price_frame_emits_both_events() {
        let data: Value = serde_json::from_str(
            r#"{"e":"markPriceUpdate","E":1700000001000,"s":"BTCUSDT","p":"11794.15000000",
                "i":"11784.62659091","P":"11784.25641265","r":"0.00038167","T":1700028800000}"#,
        )
        .unwrap();
        let (mark, funding) = mark_and_funding_events(data, RECV).unwrap();
        // legacy ms-in-ns for both events
        assert_eq!(mark.header.ts_event_ns, 1_700_000_001_000);
        assert_eq!(mark.mark_price.to_string(), "11794.15000000");
        assert_eq!(mark.index_price.unwrap().to_string(), "11784.62659091");
        let funding = funding.unwrap();
        assert_eq!(funding.funding_rate, dec!(0.00038167));
        assert_eq!(funding.next_funding_ts_ns, 1_700_028_800_000);
    }

    #[test]
    fn kline_frame() {
        let data: Value = serde_json::from_str(
            r#"{"e":"kline","E":1700000060001,"s":"BTCUSDT","k":{
                "t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","f":100,"L":200,
                "o":"0.0010","c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","n":100,
                "x":true,"q":"1.0000","V":"500","Q":"0.500","B":"123456"}}"#,
        )
        .unwrap();
        let kline = kline_event(data, RECV).unwrap();
        assert_eq!(kline.interval, "1m");
        assert!(kline.is_closed);
        assert_eq!(kline.open, dec!(0.0010));
        assert_eq!(kline.quote_volume, dec!(1.0000));
        assert_eq!(kline.taker_buy_base_volume, dec!(500));
        // raw vendor ms, deliberately unscaled
        assert_eq!(kline.header.ts_event_ns, 1_700_000_060_001);
    }

    #[test]
    fn malformed_frame_is_a_parse_error() {
        let data: Value = serde_json::from_str(r#"{"e":"aggTrade","p":"not-a-number"}"#).unwrap();
        assert!(trade_event(data, RECV).is_err());
    }

    #[test]
    fn kline_low_above_close_fails_validation() {
        // parse succeeds, validation catches the inversion downstream
        let data: Value = serde_json::from_str(
            r#"{"e":"kline","E":1700000060001,"s":"BTCUSDT","k":{
                "i":"1m","o":"0.0010","c":"0.0020","h":"0.0025","l":"0.0022","v":"1000",
                "n":100,"x":true,"q":"1.0","V":"500","Q":"0.5"}}"#,
        )
        .unwrap();
        let kline = kline_event(data, RECV).unwrap();
        assert!(crate::aggregate::klines::validate(&kline).is_err());
    }
}
