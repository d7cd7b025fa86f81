//! Outbound dispatch and the per-link cycle.
//!
//! One `DispatchController` owns every link. Each cycle it ticks the links,
//! routes inbound blocks to the `CommandRouter`, sends heartbeats, drains
//! the outbound queue with per-link backpressure and processes completions.
//! Link statistics are only recomputed here.

mod disk;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub use disk::free_bytes;

use crate::command::CommandRouter;
use crate::frame::wall_clock;
use crate::queue::{BoundedStageQueue, StopSignal};
use crate::settings::{CameraSettings, SettingsStore};
use crate::stage::{spawn_stage, StageHandle};
use crate::transport::{BlockId, CompletionCallback, LinkHandle, LinkId, LinkState};
use crate::wire::{Message, DEFAULT_PRIORITY};
use anyhow::Result;

/// Blocks read from one link per cycle, so a chatty peer cannot starve the others.
const MAX_RECEIVE_PER_CYCLE: usize = 64;
/// Objects whose redundant sends are remembered for cancellation.
const MAX_TRACKED_OBJECTS: usize = 4096;

/// Which links an object goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    Only(LinkId),
    AllExcept(LinkId),
}

/// One entry of the outbound queue.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub message: Message,
    pub priority: u32,
    pub target: Target,
}

impl DispatchRequest {
    /// All links at the default priority.
    pub fn broadcast(message: Message) -> Self {
        Self {
            message,
            priority: DEFAULT_PRIORITY,
            target: Target::All,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

/// What happens to the other copies of an object once one link completes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedePolicy {
    /// Every copy runs to completion.
    #[default]
    LeaveInFlight,
    /// The first completion cancels the copies still queued on other links.
    CancelRedundant,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Passed to `LinkHandle::tick`.
    pub max_in_flight: usize,
    pub heartbeat: Duration,
    /// Share of `maxqueue` at which a link stops taking broadcast objects.
    pub backlog_high_water_pct: u32,
    pub supersede: SupersedePolicy,
    /// Free-space threshold for the one-shot low-disk warning.
    pub low_disk_bytes: u64,
    /// Directory checked for free space. Defaults to the directory of `imagefile`.
    pub disk_path: Option<PathBuf>,
    pub cycle: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
            heartbeat: Duration::from_secs(5),
            backlog_high_water_pct: 100,
            supersede: SupersedePolicy::LeaveInFlight,
            low_disk_bytes: 20 * 1024 * 1024,
            disk_path: None,
            cycle: Duration::from_millis(50),
        }
    }
}

/// Aggregate dispatch statistics, refreshed at the end of every cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub links: Vec<LinkState>,
    pub outbound_depth: usize,
    pub sent: u64,
    pub skipped_backpressure: u64,
    pub send_errors: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub heartbeats: u64,
    pub cycles: u64,
}

struct Completion {
    object: u64,
    link: LinkId,
}

pub struct DispatchController {
    links: Vec<Box<dyn LinkHandle>>,
    outbound: BoundedStageQueue<DispatchRequest>,
    router: CommandRouter,
    camera: Arc<SettingsStore>,
    config: DispatchConfig,
    stats: Arc<RwLock<DispatchStats>>,
    totals: DispatchStats,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    redundant: BTreeMap<u64, Vec<(LinkId, BlockId)>>,
    next_object: u64,
    last_heartbeat: Option<Instant>,
    disk_warned: bool,
}

impl DispatchController {
    pub fn new(
        links: Vec<Box<dyn LinkHandle>>,
        outbound: BoundedStageQueue<DispatchRequest>,
        router: CommandRouter,
        camera: Arc<SettingsStore>,
        config: DispatchConfig,
    ) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            links,
            outbound,
            router,
            camera,
            config,
            stats: Arc::new(RwLock::new(DispatchStats::default())),
            totals: DispatchStats::default(),
            done_tx,
            done_rx,
            redundant: BTreeMap::new(),
            next_object: 0,
            last_heartbeat: None,
            disk_warned: false,
        }
    }

    /// Shared view of the statistics, readable from any thread.
    pub fn stats_handle(&self) -> Arc<RwLock<DispatchStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Run one dispatch cycle.
    pub fn cycle(&mut self) {
        let camera = CameraSettings::snapshot(&self.camera);
        let backlog_limit = camera.maxqueue * self.config.backlog_high_water_pct as usize / 100;

        for link in self.links.iter_mut() {
            link.tick(self.config.max_in_flight, camera.maxqueue);
        }
        self.receive_all();
        self.maybe_heartbeat(backlog_limit);
        self.check_disk(&camera.imagefile);

        while let Some(request) = self.outbound.try_pop() {
            self.dispatch(request, backlog_limit);
        }
        self.process_completions();
        self.totals.cycles += 1;
        self.publish_stats();
    }

    /// Cycle until `stop` is raised, then run one final cycle to flush the queue.
    pub fn spawn(mut self, stop: StopSignal) -> Result<StageHandle> {
        spawn_stage("dispatch", move || {
            log::info!("dispatch started with {} link(s)", self.links.len());
            loop {
                self.cycle();
                if stop.wait(self.config.cycle) {
                    break;
                }
            }
            self.cycle();
            log::info!("dispatch stopped");
        })
    }

    fn receive_all(&mut self) {
        for id in 0..self.links.len() {
            for _ in 0..MAX_RECEIVE_PER_CYCLE {
                let Some(block) = self.links[id].receive(Duration::ZERO) else {
                    break;
                };
                let outcome = self.router.handle_bytes(&block, id);
                log::trace!("link {}: {:?}", id, outcome);
            }
        }
    }

    fn maybe_heartbeat(&mut self, backlog_limit: usize) {
        let due = self
            .last_heartbeat
            .map_or(true, |last| last.elapsed() >= self.config.heartbeat);
        if !due {
            return;
        }
        self.last_heartbeat = Some(Instant::now());
        self.totals.heartbeats += 1;
        let heartbeat = Message::HeartBeat {
            timestamp: wall_clock(),
        };
        self.dispatch(DispatchRequest::broadcast(heartbeat), backlog_limit);
    }

    fn check_disk(&mut self, imagefile: &str) {
        if self.disk_warned {
            return;
        }
        let dir = match &self.config.disk_path {
            Some(dir) => dir.clone(),
            None if imagefile.is_empty() => return,
            None => match Path::new(imagefile).parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };
        match free_bytes(&dir) {
            Ok(free) if free < self.config.low_disk_bytes => {
                self.disk_warned = true;
                let text = format!(
                    "Warning: {} MiB disk space left in {}",
                    free / (1024 * 1024),
                    dir.display()
                );
                log::warn!("{}", text);
                if !self.outbound.push(DispatchRequest::broadcast(Message::text(text))) {
                    log::debug!("outbound queue full, low-disk warning dropped");
                }
            }
            Ok(_) => {}
            Err(err) => log::trace!("disk check: {}", err),
        }
    }

    fn dispatch(&mut self, request: DispatchRequest, backlog_limit: usize) {
        let payload = match request.message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                self.totals.send_errors += 1;
                log::warn!("dispatch: {}", err);
                return;
            }
        };
        let object = self.next_object;
        self.next_object += 1;
        let mut blocks = Vec::new();

        for (id, link) in self.links.iter_mut().enumerate() {
            let targeted = match request.target {
                Target::All => false,
                Target::Only(only) if only == id => true,
                Target::Only(_) => continue,
                Target::AllExcept(skip) if skip == id => continue,
                Target::AllExcept(_) => false,
            };
            if !targeted && link.queued() >= backlog_limit {
                self.totals.skipped_backpressure += 1;
                log::debug!(
                    "{}: {} queued, skipping {}",
                    link.name(),
                    link.queued(),
                    request.message.kind()
                );
                continue;
            }
            let done = self.done_tx.clone();
            let on_complete: CompletionCallback = Box::new(move |_block: BlockId| {
                let _ = done.send(Completion { object, link: id });
            });
            match link.send(payload.clone(), request.priority, Some(on_complete)) {
                Ok(block) => {
                    self.totals.sent += 1;
                    blocks.push((id, block));
                }
                Err(err) => {
                    self.totals.send_errors += 1;
                    log::warn!("{}: send failed: {}", link.name(), err);
                }
            }
        }

        if self.config.supersede == SupersedePolicy::CancelRedundant && blocks.len() > 1 {
            self.redundant.insert(object, blocks);
            while self.redundant.len() > MAX_TRACKED_OBJECTS {
                self.redundant.pop_first();
            }
        }
    }

    fn process_completions(&mut self) {
        while let Ok(done) = self.done_rx.try_recv() {
            self.totals.completed += 1;
            let Some(blocks) = self.redundant.remove(&done.object) else {
                continue;
            };
            for (id, block) in blocks {
                if id != done.link && self.links[id].cancel(block) {
                    self.totals.cancelled += 1;
                    log::debug!("{}: cancelled redundant block {}", self.links[id].name(), block);
                }
            }
        }
    }

    fn publish_stats(&mut self) {
        self.totals.links = self
            .links
            .iter()
            .enumerate()
            .map(|(id, link)| LinkState::observe(link.as_ref(), self.router.last_heartbeat(id)))
            .collect();
        self.totals.outbound_depth = self.outbound.len();
        *self.stats.write().unwrap_or_else(|p| p.into_inner()) = self.totals.clone();
    }
}
