//! Kline passthrough validation.
//!
//! Vendor candles are forwarded as-is; rows that violate basic OHLC sanity
//! are dropped and counted as validation errors rather than poisoning the
//! columnar store.

use crate::events::KlineEvent;

/// Check OHLC ordering and volume sanity. Returns the violated constraint.
pub fn validate(kline: &KlineEvent) -> Result<(), &'static str> {
    if kline.high < kline.low {
        return Err("high < low");
    }
    if kline.high < kline.open || kline.high < kline.close {
        return Err("high below open/close");
    }
    if kline.low > kline.open || kline.low > kline.close {
        return Err("low above open/close");
    }
    if kline.volume.is_sign_negative() || kline.quote_volume.is_sign_negative() {
        return Err("negative volume");
    }
    if kline.taker_buy_base_volume > kline.volume {
        return Err("taker buy volume exceeds volume");
    }
    if kline.interval.is_empty() {
        return Err("empty interval");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Channel, Header};
    use rust_decimal_macros::dec;

    fn kline() -> KlineEvent {
        KlineEvent {
            header: Header {
                instrument: "BTCUSDT".into(),
                channel: Channel::Klines,
                ts_event_ns: 1_700_000_060_000_000_000,
                ts_recv_ns: 1_700_000_060_100_000_000,
            },
            interval: "1m".into(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(42),
            quote_volume: dec!(4300),
            taker_buy_base_volume: dec!(20),
            taker_buy_quote_volume: dec!(2100),
            trade_count: 1234,
            is_closed: true,
        }
    }

    #[test]
    fn well_formed_candle_passes() {
        assert!(validate(&kline()).is_ok());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut k = kline();
        k.high = dec!(90);
        assert!(validate(&k).is_err());
    }

    #[test]
    fn close_outside_range_is_rejected() {
        let mut k = kline();
        k.close = dec!(120);
        assert_eq!(validate(&k), Err("high below open/close"));
    }

    #[test]
    fn taker_volume_cannot_exceed_total() {
        let mut k = kline();
        k.taker_buy_base_volume = dec!(50);
        assert_eq!(validate(&k), Err("taker buy volume exceeds volume"));
    }
}
