//! Typed dispatch from canonical events to the configured writers.
//!
//! The router owns no buffers. Each enqueue awaits space on the target
//! writer's bounded channel, so backpressure from a slow sink suspends the
//! producing shard instead of dropping data. Ordering per (instrument,
//! channel) follows from shards being the sole producers for their symbols.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ChannelRoute;
use crate::error::{CollectorError, Result};
use crate::events::{Channel, MarketEvent};
use crate::health::{HealthRegistry, LastSeenMap};

#[derive(Debug, Clone, Copy, Default)]
struct RouteMask {
    to_columnar: bool,
    to_cache: bool,
}

/// Cheap-to-clone handle shared by all shards.
#[derive(Clone)]
pub struct Router {
    masks: Arc<[RouteMask; Channel::ALL.len()]>,
    columnar: Option<mpsc::Sender<Arc<MarketEvent>>>,
    cache: Option<mpsc::Sender<Arc<MarketEvent>>>,
    registry: Arc<HealthRegistry>,
    last_seen: Arc<LastSeenMap>,
}

impl Router {
    pub fn new(
        routes: &[ChannelRoute],
        columnar: Option<mpsc::Sender<Arc<MarketEvent>>>,
        cache: Option<mpsc::Sender<Arc<MarketEvent>>>,
        registry: Arc<HealthRegistry>,
        last_seen: Arc<LastSeenMap>,
    ) -> Self {
        let mut masks = [RouteMask::default(); Channel::ALL.len()];
        for route in routes {
            masks[route.channel.index()] = RouteMask {
                to_columnar: route.to_columnar && columnar.is_some(),
                to_cache: route.to_cache && cache.is_some(),
            };
        }
        Self {
            masks: Arc::new(masks),
            columnar,
            cache,
            registry,
            last_seen,
        }
    }

    /// Whether any writer accepts this channel.
    pub fn accepts(&self, channel: Channel) -> bool {
        let mask = self.masks[channel.index()];
        mask.to_columnar || mask.to_cache
    }

    /// Hand an event to zero, one, or two writers. Suspends while a selected
    /// writer's queue is full; errors only when a writer has gone away.
    pub async fn publish(&self, event: MarketEvent) -> Result<()> {
        let channel = event.channel();
        let mask = self.masks[channel.index()];
        if !mask.to_columnar && !mask.to_cache {
            return Ok(());
        }
        self.registry.incr_routed(channel);
        let header = event.header();
        self.last_seen.record(
            channel,
            &header.instrument,
            header.ts_event_ns,
            header.ts_recv_ns,
        );
        let event = Arc::new(event);
        if mask.to_columnar {
            let tx = self.columnar.as_ref().expect("mask implies writer");
            tx.send(event.clone())
                .await
                .map_err(|_| CollectorError::SinkClosed("clickhouse"))?;
        }
        if mask.to_cache {
            let tx = self.cache.as_ref().expect("mask implies writer");
            tx.send(event)
                .await
                .map_err(|_| CollectorError::SinkClosed("redis"))?;
        }
        Ok(())
    }
}
