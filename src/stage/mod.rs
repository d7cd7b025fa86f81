//! Worker framework shared by every pipeline stage.
//!
//! A stage is one named thread that pops from an input queue, applies one
//! transformation and pushes downstream. Per-item failures become counter
//! increments; the worker only exits when the stop signal is raised.

pub mod chain;
pub mod scan;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::queue::{BoundedStageQueue, StopSignal};

pub use chain::{CaptureChain, ChainOptions, Demosaic, NearestDemosaic};
pub use scan::{ScanContext, ScanStage, TerrainAltitude};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Counters shared by the capture, scan and chain stages.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub captured: AtomicU64,
    pub capture_shed: AtomicU64,
    pub capture_errors: AtomicU64,
    pub frames_lost: AtomicU64,
    pub scanned: AtomicU64,
    pub scan_errors: AtomicU64,
    pub regions: AtomicU64,
    pub outbound_shed: AtomicU64,
    pub saved: AtomicU64,
    pub chain_shed: AtomicU64,
    pub chain_errors: AtomicU64,
    scan_fps: AtomicU64,
}

/// Point-in-time copy of `StageCounters`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub captured: u64,
    pub capture_shed: u64,
    pub capture_errors: u64,
    pub frames_lost: u64,
    pub scanned: u64,
    pub scan_errors: u64,
    pub regions: u64,
    pub outbound_shed: u64,
    pub saved: u64,
    pub chain_shed: u64,
    pub chain_errors: u64,
    pub scan_fps: f64,
}

impl StageCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_scan_fps(&self, fps: f64) {
        self.scan_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            captured: load(&self.captured),
            capture_shed: load(&self.capture_shed),
            capture_errors: load(&self.capture_errors),
            frames_lost: load(&self.frames_lost),
            scanned: load(&self.scanned),
            scan_errors: load(&self.scan_errors),
            regions: load(&self.regions),
            outbound_shed: load(&self.outbound_shed),
            saved: load(&self.saved),
            chain_shed: load(&self.chain_shed),
            chain_errors: load(&self.chain_errors),
            scan_fps: f64::from_bits(load(&self.scan_fps)),
        }
    }
}

/// A running stage thread.
#[derive(Debug)]
pub struct StageHandle {
    name: String,
    join: Option<JoinHandle<()>>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// Returns false when the thread is still running; it is then detached.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("stage {} did not stop within {:?}; abandoning it", self.name, timeout);
                return false;
            }
            std::thread::sleep(JOIN_POLL);
        }
        if join.join().is_err() {
            log::error!("stage {} panicked", self.name);
        }
        true
    }
}

/// Spawn a named stage thread.
pub fn spawn_stage<F>(name: &str, body: F) -> Result<StageHandle>
where
    F: FnOnce() + Send + 'static,
{
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| anyhow!("failed to spawn stage {}: {}", name, e))?;
    log::debug!("stage {} started", name);
    Ok(StageHandle {
        name: name.to_string(),
        join: Some(join),
    })
}

/// Join every handle, sharing one overall timeout. Returns how many were abandoned.
pub fn join_all(handles: Vec<StageHandle>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut abandoned = 0;
    for handle in handles {
        let left = deadline.saturating_duration_since(Instant::now());
        if !handle.join_timeout(left) {
            abandoned += 1;
        }
    }
    abandoned
}

/// Generic one-in/one-out worker loop.
///
/// `transform` returning `Ok(None)` consumes the item without output.
/// A full `output` sheds the item and bumps `shed`.
#[allow(clippy::too_many_arguments)]
pub fn run_transform<I, O, F>(
    name: &str,
    input: &BoundedStageQueue<I>,
    output: Option<&BoundedStageQueue<O>>,
    stop: &StopSignal,
    poll: Duration,
    errors: &AtomicU64,
    shed: &AtomicU64,
    mut transform: F,
) where
    F: FnMut(I) -> Result<Option<O>>,
{
    while let Some(item) = input.pop(stop, poll) {
        match transform(item) {
            Ok(Some(out)) => {
                if let Some(output) = output {
                    if !output.push(out) {
                        StageCounters::bump(shed);
                        log::warn!("{}: downstream queue full, dropping item", name);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                StageCounters::bump(errors);
                log::warn!("{}: {}", name, err);
            }
        }
    }
    log::debug!("{}: stopped", name);
}
