//! End-to-end: vendor frames through the shard core, router, and columnar
//! writer down to the NDJSON insert body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use marketdata_collector::config::{ChannelRoute, ColumnarConfig, Compression};
use marketdata_collector::events::Channel;
use marketdata_collector::exchange::shard::{ShardCore, ShardFlags};
use marketdata_collector::exchange::streams::StreamKind;
use marketdata_collector::health::{HealthRegistry, LastSeenMap, SinkStats};
use marketdata_collector::router::Router;
use marketdata_collector::sinks::clickhouse::ClickHouseWriter;
use marketdata_collector::time_util::now_ns;

async fn spawn_endpoint() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos;
                    }
                };
                let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                let mut body = buf[header_end + 4..].to_vec();
                while body.len() < content_length {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                let _ = tx.send(String::from_utf8_lossy(&body).to_string());
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            });
        }
    });
    (format!("http://{addr}"), rx)
}

fn agg_frame(ts_ms: u64, price: &str, qty: &str, buyer_maker: bool) -> String {
    format!(
        r#"{{"stream":"btcusdt@aggTrade","data":{{"e":"aggTrade","E":{ts},"s":"BTCUSDT","a":{ts},"p":"{price}","q":"{qty}","f":1,"l":2,"T":{ts},"m":{buyer_maker}}}}}"#,
        ts = ts_ms,
    )
}

#[tokio::test]
async fn three_trades_become_one_agg_row_in_the_insert_body() {
    let (url, mut inserts) = spawn_endpoint().await;
    let stats = SinkStats::new("clickhouse");
    let cfg = ColumnarConfig {
        url,
        database: "marketdata".into(),
        batch_rows: 1,
        flush_interval_ms: 60_000,
        compression: Compression::None,
    };
    let (tx, writer) = ClickHouseWriter::spawn(cfg, stats.clone()).unwrap();

    let routes = vec![ChannelRoute {
        channel: Channel::AggTrades5s,
        to_columnar: true,
        to_cache: false,
    }];
    let health = HealthRegistry::new();
    let router = Router::new(
        &routes,
        Some(tx.clone()),
        None,
        health.clone(),
        Arc::new(LastSeenMap::default()),
    );
    let flags = ShardFlags {
        emit_agg: true,
        ..Default::default()
    };
    let mut core = ShardCore::new(0, StreamKind::AggTrade, flags, router, health);

    // S1: three trades inside one 5 s window
    core.handle_frame(&agg_frame(1_700_000_001_000, "100", "1", false), now_ns())
        .await
        .unwrap();
    core.handle_frame(&agg_frame(1_700_000_002_500, "110", "2", true), now_ns())
        .await
        .unwrap();
    core.handle_frame(&agg_frame(1_700_000_004_999, "90", "3", false), now_ns())
        .await
        .unwrap();
    // clock advances past the window end plus the 2 s grace
    core.tick(1_700_000_007_001 * 1_000_000).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let body = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let body = tokio::time::timeout(remaining, inserts.recv())
            .await
            .expect("insert before deadline")
            .expect("insert body");
        if body.contains("window_start_ns") {
            break body;
        }
    };
    let row: Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
    assert_eq!(row["instrument"], "BTCUSDT");
    assert_eq!(row["window_start_ns"], 1_700_000_000_000_000_000u64);
    assert_eq!(row["interval_s"], 5);
    assert_eq!(row["open"], "100");
    assert_eq!(row["high"], "110");
    assert_eq!(row["low"], "90");
    assert_eq!(row["close"], "90");
    assert_eq!(row["volume"], "6");
    assert_eq!(row["trade_count"], 3);
    assert_eq!(row["buy_qty"], "4");
    assert_eq!(row["sell_qty"], "2");

    // S2: a late trade for the emitted window produces no further row
    core.handle_frame(&agg_frame(1_700_000_008_000, "101", "1", false), now_ns())
        .await
        .unwrap();
    core.handle_frame(&agg_frame(1_700_000_003_000, "99", "1", false), now_ns())
        .await
        .unwrap();
    assert_eq!(
        core.health()
            .channel(Channel::AggTrades5s)
            .lost
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    drop(core);
    drop(tx);
    writer.await.unwrap();
    // exactly the rows that reached the writer were flushed
    let counters = stats.key("agg_trades_5s");
    assert_eq!(counters.pending(), 0);
}
