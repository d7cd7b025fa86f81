//! Bounded stage queues and the cooperative stop signal.
//!
//! Every pair of adjacent pipeline stages is connected by a
//! `BoundedStageQueue`. Producers never block: a full queue rejects the new
//! item and the caller decides how to count the shed. Consumers block for at
//! most one poll interval at a time so a stop request is always observed.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Default capacity used between stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Fixed-capacity FIFO shared by any number of producers and consumers.
///
/// Cloning yields another handle to the same queue.
pub struct BoundedStageQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for BoundedStageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedStageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Offer an item. Returns false (and drops the item) when the queue is full.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            // Both ends live in `self`, so the channel cannot disconnect.
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Like `push`, but hands the rejected item back to the caller.
    pub fn offer(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|err| err.into_inner())
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Pop, waiting at most `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop, waiting in `poll` slices until an item arrives or `stop` is raised.
    ///
    /// Returns `None` only when the stop signal was observed.
    pub fn pop(&self, stop: &StopSignal, poll: Duration) -> Option<T> {
        loop {
            if stop.is_set() {
                return None;
            }
            if let Some(item) = self.pop_timeout(poll) {
                return Some(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard everything currently queued. Returns the number of items dropped.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.try_pop().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// Shared cooperative stop flag with a bounded wait.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *stopped = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for up to `timeout`, waking early if the signal is raised.
    ///
    /// Returns true when the signal is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let stopped = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *stopped {
            return true;
        }
        let (stopped, _) = cvar
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn full_queue_rejects_without_touching_contents() {
        let queue = BoundedStageQueue::new(3);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert!(queue.is_full());
        assert!(!queue.push(4));
        assert!(!queue.push(5));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn offer_returns_rejected_item() {
        let queue = BoundedStageQueue::new(1);
        assert!(queue.offer("a").is_ok());
        assert_eq!(queue.offer("b"), Err("b"));
    }

    #[test]
    fn pop_observes_stop_signal() {
        let queue: BoundedStageQueue<u32> = BoundedStageQueue::new(4);
        let stop = StopSignal::new();
        let stopper = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stopper.set();
        });
        let started = Instant::now();
        assert_eq!(queue.pop(&stop, Duration::from_millis(10)), None);
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn fifo_holds_across_producers_and_consumers() {
        let queue = BoundedStageQueue::new(10_000);
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let q = queue.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        assert!(q.push((p, i)));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = q.pop_timeout(Duration::from_millis(20)) {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();

        let mut total = 0;
        for handle in consumers {
            let seen = handle.join().unwrap();
            total += seen.len();
            // Each consumer sees every producer's items in push order.
            for p in 0..4u64 {
                let per_producer: Vec<u64> =
                    seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
                assert!(per_producer.windows(2).all(|w| w[0] < w[1]));
            }
        }
        assert_eq!(total, 2000);
    }

    #[test]
    fn stop_wait_returns_early() {
        let stop = StopSignal::new();
        stop.set();
        let started = Instant::now();
        assert!(stop.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
