//! REST depth snapshots for orderbook bootstrap.
//!
//! Deliberately throttled: per-symbol cooldown of 30 s, a small jitter before
//! the first attempt to decouple shards, and a short backoff on failures or
//! IP-limit responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::aggregate::DepthSnapshot;
use crate::error::{CollectorError, Result};

pub const SNAPSHOT_DEPTH_LIMIT: u32 = 200;
pub const SNAPSHOT_COOLDOWN: Duration = Duration::from_secs(30);
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct DepthSnapshotMsg {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

pub struct SnapshotClient {
    http: reqwest::Client,
    endpoint: String,
    limit: u32,
    cooldown: Duration,
    last_attempt: Mutex<HashMap<String, Instant>>,
}

impl SnapshotClient {
    pub fn new(rest_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/fapi/v1/depth", rest_base.trim_end_matches('/')),
            limit: SNAPSHOT_DEPTH_LIMIT,
            cooldown: SNAPSHOT_COOLDOWN,
            last_attempt: Mutex::new(HashMap::new()),
        })
    }

    /// Cooldown gate; returns false while the symbol's last fetch is recent.
    /// Marks the attempt time on success so concurrent callers do not stack.
    pub fn begin(&self, symbol: &str) -> bool {
        let mut guard = match self.last_attempt.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if let Some(last) = guard.get(symbol) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }
        guard.insert(symbol.to_string(), now);
        true
    }

    /// Fetch one depth snapshot, with jitter and bounded retries.
    pub async fn fetch(&self, symbol: &str) -> Result<DepthSnapshot> {
        let jitter_ms = rand::thread_rng().gen_range(200..500);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut last_error = String::new();
        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            let response = self
                .http
                .get(&self.endpoint)
                .query(&[("symbol", symbol), ("limit", &self.limit.to_string())])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    last_error = "rate limited".into();
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => {
                        let msg: DepthSnapshotMsg = resp.json().await?;
                        return Ok(DepthSnapshot {
                            last_update_id: msg.last_update_id,
                            bids: msg
                                .bids
                                .into_iter()
                                .filter(|(_, q)| !q.is_zero())
                                .collect(),
                            asks: msg
                                .asks
                                .into_iter()
                                .filter(|(_, q)| !q.is_zero())
                                .collect(),
                        });
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
        warn!("depth snapshot failed symbol={symbol} error={last_error}");
        Err(CollectorError::Snapshot {
            symbol: symbol.to_string(),
            message: last_error,
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt).min(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_gates_repeat_fetches() {
        let client = SnapshotClient::new("https://fapi.binance.com").unwrap();
        assert!(client.begin("BTCUSDT"));
        assert!(!client.begin("BTCUSDT"));
        // independent per symbol
        assert!(client.begin("ETHUSDT"));
    }

    #[test]
    fn snapshot_payload_parses() {
        let msg: DepthSnapshotMsg = serde_json::from_str(
            r#"{"lastUpdateId":1027024,"E":1589436922972,"T":1589436922959,
                "bids":[["4.00000000","431.00000000"],["3.90000000","0.00000000"]],
                "asks":[["4.00000200","12.00000000"]]}"#,
        )
        .unwrap();
        assert_eq!(msg.last_update_id, 1_027_024);
        assert_eq!(msg.bids.len(), 2);
    }
}
