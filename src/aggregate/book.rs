//! Local orderbook built from the diff stream.
//!
//! Per-symbol state machine: UNINIT until the first diff arrives, then
//! BOOTSTRAPPING while diffs are buffered against the pending REST snapshot,
//! SYNCED while sequence numbers chain, RESYNCING after a gap until a fresh
//! snapshot integrates. The sequence contract follows the vendor's futures
//! depth stream: a diff applies when `U <= last_u + 1 <= u`.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;

use crate::events::{Channel, Header, OrderBookDepthEvent, OrderBookDiffEvent};

/// Upper bound on diffs buffered while waiting for a snapshot.
const MAX_BUFFERED: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSync {
    Uninit,
    Bootstrapping,
    Synced,
    Resyncing,
}

/// REST depth snapshot, already parsed.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// What happened to an incoming diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Applied to the live book; `top_changed` when best bid or ask moved.
    Applied { top_changed: bool },
    /// Held back until the snapshot arrives.
    Buffered,
    /// Entirely behind the book; dropped.
    Stale,
    /// Sequence gap; book cleared, resync required.
    Gap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Book is live; `applied` buffered diffs were replayed.
    Synced { applied: usize },
    /// Buffered diffs no longer chain onto this snapshot; fetch again.
    Gap,
}

#[derive(Debug)]
pub struct OrderBookState {
    instrument: String,
    sync: BookSync,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_u: u64,
    buffered: VecDeque<OrderBookDiffEvent>,
    /// Diffs evicted from a full bootstrap buffer.
    pub buffered_dropped: u64,
}

impl OrderBookState {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            sync: BookSync::Uninit,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_u: 0,
            buffered: VecDeque::new(),
            buffered_dropped: 0,
        }
    }

    pub fn sync(&self) -> BookSync {
        self.sync
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_u
    }

    /// True while the state machine is waiting on a REST snapshot.
    pub fn needs_snapshot(&self) -> bool {
        matches!(self.sync, BookSync::Bootstrapping | BookSync::Resyncing)
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Feed one diff through the state machine.
    pub fn on_diff(&mut self, diff: &OrderBookDiffEvent) -> DiffOutcome {
        match self.sync {
            BookSync::Uninit => {
                self.sync = BookSync::Bootstrapping;
                self.buffer(diff.clone());
                DiffOutcome::Buffered
            }
            BookSync::Bootstrapping | BookSync::Resyncing => {
                self.buffer(diff.clone());
                DiffOutcome::Buffered
            }
            BookSync::Synced => {
                if diff.sequence <= self.last_u {
                    return DiffOutcome::Stale;
                }
                if diff.prev_sequence > self.last_u + 1 {
                    self.enter_resync(diff.clone());
                    return DiffOutcome::Gap;
                }
                let top_changed = self.apply(diff);
                DiffOutcome::Applied { top_changed }
            }
        }
    }

    /// Integrate a REST snapshot, replaying buffered diffs with
    /// `U <= snapshot_last + 1 <= u` and discarding earlier ones.
    pub fn apply_snapshot(&mut self, snapshot: DepthSnapshot) -> SnapshotOutcome {
        self.bids = snapshot
            .bids
            .into_iter()
            .filter(|(_, q)| !q.is_zero())
            .collect();
        self.asks = snapshot
            .asks
            .into_iter()
            .filter(|(_, q)| !q.is_zero())
            .collect();
        self.last_u = snapshot.last_update_id;

        let mut applied = 0;
        while let Some(diff) = self.buffered.pop_front() {
            if diff.sequence <= self.last_u {
                continue;
            }
            if diff.prev_sequence > self.last_u + 1 {
                // Snapshot is already behind the buffered stream.
                self.buffered.push_front(diff);
                self.bids.clear();
                self.asks.clear();
                self.sync = BookSync::Resyncing;
                return SnapshotOutcome::Gap;
            }
            self.apply(&diff);
            applied += 1;
        }
        self.sync = BookSync::Synced;
        SnapshotOutcome::Synced { applied }
    }

    /// Top-of-book event derived from the local book, if both sides exist.
    pub fn l1_event(&self, ts_event_ns: u64, ts_recv_ns: u64) -> Option<OrderBookDepthEvent> {
        let (bid_px, bid_qty) = self.best_bid()?;
        let (ask_px, ask_qty) = self.best_ask()?;
        Some(OrderBookDepthEvent {
            header: Header {
                instrument: self.instrument.clone(),
                channel: Channel::L1,
                ts_event_ns,
                ts_recv_ns,
            },
            depth: 1,
            bid_prices: vec![bid_px],
            bid_qtys: vec![bid_qty],
            ask_prices: vec![ask_px],
            ask_qtys: vec![ask_qty],
        })
    }

    /// Discard the book and start over (e.g. a crossed book after replay).
    pub fn force_resync(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.buffered.clear();
        self.sync = BookSync::Resyncing;
    }

    fn buffer(&mut self, diff: OrderBookDiffEvent) {
        if self.buffered.len() >= MAX_BUFFERED {
            self.buffered.pop_front();
            self.buffered_dropped += 1;
        }
        self.buffered.push_back(diff);
    }

    fn enter_resync(&mut self, pending: OrderBookDiffEvent) {
        self.bids.clear();
        self.asks.clear();
        self.sync = BookSync::Resyncing;
        self.buffered.clear();
        self.buffer(pending);
    }

    fn apply(&mut self, diff: &OrderBookDiffEvent) -> bool {
        let top_before = (self.best_bid(), self.best_ask());
        for (price, qty) in &diff.bids {
            if qty.is_zero() {
                self.bids.remove(price);
            } else {
                self.bids.insert(*price, *qty);
            }
        }
        for (price, qty) in &diff.asks {
            if qty.is_zero() {
                self.asks.remove(price);
            } else {
                self.asks.insert(*price, *qty);
            }
        }
        self.last_u = diff.sequence;
        top_before != (self.best_bid(), self.best_ask())
    }
}
