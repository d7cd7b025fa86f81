use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{BlockId, CompletionCallback, LinkHandle};

const DEFAULT_BANDWIDTH: f64 = 1_000_000.0;

struct Pending {
    payload: Vec<u8>,
    on_complete: Option<CompletionCallback>,
}

/// In-process link. Queued blocks are delivered to the peer end on `tick`,
/// at most `max_in_flight` per tick, in priority order.
pub struct LoopbackLink {
    name: String,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: BTreeMap<(u32, BlockId), Pending>,
    next_id: BlockId,
    bandwidth: f64,
    bytes_sent: u64,
    started: Instant,
}

impl LoopbackLink {
    /// Two connected ends.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (Self::new(a, a_tx, a_rx), Self::new(b, b_tx, b_rx))
    }

    /// A link whose peer discards everything.
    pub fn sink(name: &str) -> Self {
        let (tx, _) = crossbeam_channel::unbounded();
        let (_, rx) = crossbeam_channel::unbounded();
        Self::new(name, tx, rx)
    }

    fn new(name: &str, tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            tx,
            rx,
            pending: BTreeMap::new(),
            next_id: 1,
            bandwidth: DEFAULT_BANDWIDTH,
            bytes_sent: 0,
            started: Instant::now(),
        }
    }

    pub fn with_bandwidth(mut self, bytes_per_sec: f64) -> Self {
        self.bandwidth = bytes_per_sec;
        self
    }
}

impl LinkHandle for LoopbackLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, max_in_flight: usize, max_queue: usize) {
        while self.pending.len() > max_queue {
            if let Some((key, _)) = self.pending.pop_last() {
                log::debug!("{}: trimmed block {}", self.name, key.1);
            }
        }
        for _ in 0..max_in_flight {
            let Some(((_, id), block)) = self.pending.pop_first() else {
                break;
            };
            self.bytes_sent += block.payload.len() as u64;
            // A dropped peer behaves like a sink.
            let _ = self.tx.send(block.payload);
            if let Some(cb) = block.on_complete {
                cb(id);
            }
        }
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        if timeout.is_zero() {
            return self.rx.try_recv().ok();
        }
        self.rx.recv_timeout(timeout).ok()
    }

    fn send(
        &mut self,
        payload: Vec<u8>,
        priority: u32,
        on_complete: Option<CompletionCallback>,
    ) -> Result<BlockId> {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            (priority, id),
            Pending {
                payload,
                on_complete,
            },
        );
        Ok(id)
    }

    fn queued(&self) -> usize {
        self.pending.len()
    }

    fn bandwidth_budget(&self) -> f64 {
        self.bandwidth
    }

    fn efficiency(&self) -> f64 {
        1.0
    }

    fn bandwidth_used(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes_sent as f64 / secs
        } else {
            0.0
        }
    }

    fn rtt_estimate(&self) -> f64 {
        0.0
    }

    fn cancel(&mut self, block: BlockId) -> bool {
        let key = self.pending.keys().find(|(_, id)| *id == block).copied();
        key.and_then(|key| self.pending.remove(&key)).is_some()
    }
}
