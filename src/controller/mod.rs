//! Pipeline lifecycle.
//!
//! ```text
//!            start                       stop / unload
//!   Idle ----------------------> Running -------------> Idle
//!    |                              ^
//!    | airstart                     | speed > minspeed
//!    v                              |
//!   Armed --------------------------+
//!
//!   any state --unload--> Stopping
//! ```
//!
//! Dispatch starts with the first `start` or `airstart` and keeps running
//! until unload, so replies and heartbeats still flow while idle.

mod status;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use status::{PipelineState, PipelineStatus};

use crate::camera::CameraParams;
use crate::codec::ImageCodec;
use crate::command::{CommandRouter, ControlCommand, DedupCache, RouterCounters};
use crate::config::AirConfig;
use crate::detect::{detector_by_name, Detector, Polygon};
use crate::dispatch::{DispatchController, DispatchRequest, DispatchStats, Target};
use crate::frame::{wall_clock, Frame, ImageIndex, PixelFormat};
use crate::ingest::{
    run_capture, CaptureOptions, CaptureSource, DeviceCaptureSource, FileWatchSource,
    SyntheticFrameSource,
};
use crate::position::PositionSource;
use crate::queue::{BoundedStageQueue, StopSignal};
use crate::region_log::RegionLog;
use crate::settings::{CameraSettings, ChangeOrigin, SettingsStore};
use crate::stage::{
    join_all, spawn_stage, CaptureChain, ChainOptions, Demosaic, NearestDemosaic, ScanContext,
    ScanStage, StageCounters, StageHandle, TerrainAltitude,
};
use crate::transport::{open_links, LinkHandle};
use crate::wire::Message;

pub type DetectorFactory = Box<dyn Fn() -> Result<Box<dyn Detector>> + Send>;
pub type SourceFactory =
    Box<dyn Fn(&AirConfig, &Arc<SettingsStore>) -> Result<Box<dyn CaptureSource>> + Send>;
pub type LinkFactory = Box<dyn Fn(&str) -> Vec<Box<dyn LinkHandle>> + Send>;
pub type DemosaicFactory = Box<dyn Fn() -> Box<dyn Demosaic> + Send>;

const SYNTHETIC_INTERVAL: Duration = Duration::from_millis(100);
const DEVICE_TIMEOUT: Duration = Duration::from_secs(1);

/// External collaborators the controller wires into the pipeline.
pub struct Collaborators {
    pub codec: Arc<dyn ImageCodec>,
    pub position: Arc<dyn PositionSource>,
    /// Defaults to the detector named in the config.
    pub detector: Option<DetectorFactory>,
    /// Defaults to `default_source`.
    pub source: Option<SourceFactory>,
    /// Defaults to `open_links` over the `gcs_address` setting.
    pub links: Option<LinkFactory>,
    pub demosaic: Option<DemosaicFactory>,
}

impl Collaborators {
    pub fn new(codec: Arc<dyn ImageCodec>, position: Arc<dyn PositionSource>) -> Self {
        Self {
            codec,
            position,
            detector: None,
            source: None,
            links: None,
            demosaic: None,
        }
    }

    pub fn with_detector(
        mut self,
        factory: impl Fn() -> Result<Box<dyn Detector>> + Send + 'static,
    ) -> Self {
        self.detector = Some(Box::new(factory));
        self
    }

    pub fn with_source(
        mut self,
        factory: impl Fn(&AirConfig, &Arc<SettingsStore>) -> Result<Box<dyn CaptureSource>>
            + Send
            + 'static,
    ) -> Self {
        self.source = Some(Box::new(factory));
        self
    }

    pub fn with_links(
        mut self,
        factory: impl Fn(&str) -> Vec<Box<dyn LinkHandle>> + Send + 'static,
    ) -> Self {
        self.links = Some(Box::new(factory));
        self
    }

    pub fn with_demosaic(mut self, factory: impl Fn() -> Box<dyn Demosaic> + Send + 'static) -> Self {
        self.demosaic = Some(Box::new(factory));
        self
    }
}

/// Capture source named by `capture.source`.
pub fn default_source(
    config: &AirConfig,
    camera: &Arc<SettingsStore>,
) -> Result<Box<dyn CaptureSource>> {
    match config.capture.source.as_str() {
        "file" => Ok(Box::new(FileWatchSource::new(camera.clone()))),
        s if s.starts_with("stub://") => {
            let format = if config.chain.is_some() {
                PixelFormat::Bayer8
            } else {
                PixelFormat::Mono8
            };
            let device = SyntheticFrameSource::new(640, 480, format, SYNTHETIC_INTERVAL);
            Ok(Box::new(DeviceCaptureSource::new(device, DEVICE_TIMEOUT)))
        }
        other => bail!("unsupported capture source {:?}", other),
    }
}

/// Flight telemetry the controller reacts to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Telemetry {
    Velocity { airspeed: f64, groundspeed: f64 },
    /// Height above terrain, metres.
    TerrainHeight(f64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandReply {
    pub accepted: bool,
    pub message: String,
}

impl CommandReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    fn refused(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Threads sharing one stop signal.
struct Workers {
    stop: StopSignal,
    handles: Vec<StageHandle>,
}

impl Workers {
    fn new() -> Self {
        Self {
            stop: StopSignal::new(),
            handles: Vec::new(),
        }
    }

    /// Raise the stop signal and join. Returns how many threads were abandoned.
    fn shutdown(self, timeout: Duration) -> usize {
        self.stop.set();
        join_all(self.handles, timeout)
    }
}

pub struct PipelineController {
    config: AirConfig,
    codec: Arc<dyn ImageCodec>,
    position: Arc<dyn PositionSource>,
    detector: DetectorFactory,
    source: SourceFactory,
    links: LinkFactory,
    demosaic: DemosaicFactory,
    camera: Arc<SettingsStore>,
    image: Arc<SettingsStore>,
    state: PipelineState,
    armed_params: Option<CameraParams>,
    scan_queue: BoundedStageQueue<Frame>,
    outbound: BoundedStageQueue<DispatchRequest>,
    index: Arc<ImageIndex>,
    counters: Arc<StageCounters>,
    router_counters: Arc<RouterCounters>,
    dedup: Arc<DedupCache>,
    terrain: Arc<TerrainAltitude>,
    boundary: Arc<RwLock<Option<Arc<Polygon>>>>,
    commands_tx: Sender<ControlCommand>,
    commands_rx: Receiver<ControlCommand>,
    pipeline: Option<Workers>,
    dispatch: Option<Workers>,
    dispatch_stats: Option<Arc<RwLock<DispatchStats>>>,
}

impl PipelineController {
    pub fn new(config: AirConfig, collab: Collaborators) -> Result<Self> {
        let camera = SettingsStore::camera();
        let image = SettingsStore::image();
        config.apply_settings(&camera, &image)?;

        let outbound = BoundedStageQueue::new(config.queues.outbound);
        for store in [&camera, &image] {
            echo_changes(store, outbound.clone());
        }

        let detector = match collab.detector {
            Some(factory) => factory,
            None => {
                let name = config.capture.detector.clone();
                Box::new(move || detector_by_name(&name)) as DetectorFactory
            }
        };
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            codec: collab.codec,
            position: collab.position,
            detector,
            source: collab
                .source
                .unwrap_or_else(|| Box::new(default_source) as SourceFactory),
            links: collab
                .links
                .unwrap_or_else(|| Box::new(open_links) as LinkFactory),
            demosaic: collab
                .demosaic
                .unwrap_or_else(|| Box::new(|| Box::new(NearestDemosaic) as Box<dyn Demosaic>)),
            camera,
            image,
            state: PipelineState::Idle,
            armed_params: None,
            scan_queue: BoundedStageQueue::new(config.queues.scan),
            outbound,
            index: Arc::new(ImageIndex::new(config.queues.image_index)),
            counters: Arc::new(StageCounters::default()),
            router_counters: Arc::new(RouterCounters::default()),
            dedup: Arc::new(DedupCache::new(config.dedup.horizon_secs, config.dedup.capacity)),
            terrain: Arc::new(TerrainAltitude::default()),
            boundary: Arc::new(RwLock::new(None)),
            commands_tx,
            commands_rx,
            pipeline: None,
            dispatch: None,
            dispatch_stats: None,
            config,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn camera(&self) -> &Arc<SettingsStore> {
        &self.camera
    }

    pub fn image(&self) -> &Arc<SettingsStore> {
        &self.image
    }

    pub fn index(&self) -> &Arc<ImageIndex> {
        &self.index
    }

    /// Sender for commands from outside the dispatch path (operator console).
    pub fn command_sender(&self) -> Sender<ControlCommand> {
        self.commands_tx.clone()
    }

    /// Execute every command queued by the router or the console.
    pub fn pump_commands(&mut self) -> usize {
        let mut executed = 0;
        while let Ok(cmd) = self.commands_rx.try_recv() {
            self.execute(cmd);
            executed += 1;
        }
        executed
    }

    /// Run one command. The reply text is also sent to every link.
    pub fn execute(&mut self, cmd: ControlCommand) -> CommandReply {
        let label = cmd.to_string();
        let reply = match cmd {
            ControlCommand::Start => self.start(),
            ControlCommand::Stop => self.stop(),
            ControlCommand::Status => CommandReply::ok(self.status().summary()),
            ControlCommand::Queue => CommandReply::ok(self.status().queue_summary()),
            ControlCommand::Airstart => self.airstart(),
            ControlCommand::Set { name, value } => self.set(&name, &value),
            ControlCommand::Boundary(path) => self.load_boundary(&path),
        };
        if reply.accepted {
            log::info!("{}: {}", label, reply.message);
        } else {
            log::warn!("{}: {}", label, reply.message);
        }
        self.notify(&reply.message);
        reply
    }

    pub fn on_telemetry(&mut self, telemetry: Telemetry) {
        match telemetry {
            Telemetry::TerrainHeight(height) => self.terrain.set(height),
            Telemetry::Velocity {
                airspeed,
                groundspeed,
            } => {
                if self.state != PipelineState::Armed {
                    return;
                }
                let minspeed = CameraSettings::snapshot(&self.camera).minspeed;
                if airspeed <= minspeed && groundspeed <= minspeed {
                    return;
                }
                let params = self.armed_params.clone();
                match params.ok_or_else(|| anyhow!("armed without camera parameters")) {
                    Ok(params) => match self.start_pipeline(params) {
                        Ok(()) => {
                            self.state = PipelineState::Running;
                            log::info!("airstart: flying, capture started");
                            self.notify("started running");
                        }
                        Err(err) => log::warn!("airstart: failed to start capture: {:#}", err),
                    },
                    Err(err) => log::warn!("airstart: {}", err),
                }
            }
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let dispatch = self
            .dispatch_stats
            .as_ref()
            .map(|stats| stats.read().unwrap_or_else(|p| p.into_inner()).clone())
            .unwrap_or_default();
        PipelineStatus {
            state: self.state,
            stages: self.counters.snapshot(),
            router: self.router_counters.snapshot(),
            dispatch,
            scan_queue: self.scan_queue.len(),
            outbound_queue: self.outbound.len(),
        }
    }

    /// Stop every worker, dispatch last. Returns how many threads were abandoned.
    pub fn unload(&mut self) -> usize {
        if self.state == PipelineState::Stopping {
            return 0;
        }
        self.state = PipelineState::Stopping;
        let timeout = self.config.join_timeout;
        let mut abandoned = self.pipeline.take().map_or(0, |w| w.shutdown(timeout));
        self.notify("unloading");
        abandoned += self.dispatch.take().map_or(0, |w| w.shutdown(timeout));
        log::info!("unload complete, {} worker(s) abandoned", abandoned);
        abandoned
    }

    fn start(&mut self) -> CommandReply {
        match self.state {
            PipelineState::Running => return CommandReply::refused("already running"),
            PipelineState::Stopping => return CommandReply::refused("unloading"),
            PipelineState::Idle | PipelineState::Armed => {}
        }
        let params = match self.check_camera_params() {
            Ok(params) => params,
            Err(err) => return CommandReply::refused(format!("incorrect camera params: {:#}", err)),
        };
        if let Err(err) = self.ensure_dispatch() {
            return CommandReply::refused(format!("failed to start dispatch: {:#}", err));
        }
        if let Err(err) = self.start_pipeline(params) {
            return CommandReply::refused(format!("failed to start: {:#}", err));
        }
        self.state = PipelineState::Running;
        CommandReply::ok("started running")
    }

    fn airstart(&mut self) -> CommandReply {
        match self.state {
            PipelineState::Armed => return CommandReply::refused("airstart already running"),
            PipelineState::Running => return CommandReply::refused("already running"),
            PipelineState::Stopping => return CommandReply::refused("unloading"),
            PipelineState::Idle => {}
        }
        let params = match self.check_camera_params() {
            Ok(params) => params,
            Err(err) => return CommandReply::refused(format!("incorrect camera params: {:#}", err)),
        };
        if let Err(err) = self.ensure_dispatch() {
            return CommandReply::refused(format!("failed to start dispatch: {:#}", err));
        }
        self.armed_params = Some(params);
        self.state = PipelineState::Armed;
        CommandReply::ok("airstart ready")
    }

    fn stop(&mut self) -> CommandReply {
        match self.state {
            PipelineState::Running | PipelineState::Armed => {}
            PipelineState::Idle => return CommandReply::refused("not running"),
            PipelineState::Stopping => return CommandReply::refused("unloading"),
        }
        let abandoned = self
            .pipeline
            .take()
            .map_or(0, |w| w.shutdown(self.config.join_timeout));
        let dropped = self.scan_queue.clear();
        if dropped > 0 {
            log::debug!("stop: discarded {} queued frame(s)", dropped);
        }
        self.armed_params = None;
        self.state = PipelineState::Idle;
        if abandoned > 0 {
            CommandReply::ok(format!("stopped, {} worker(s) abandoned", abandoned))
        } else {
            CommandReply::ok("stopped")
        }
    }

    fn set(&mut self, name: &str, value: &str) -> CommandReply {
        let store = if self.camera.spec(name).is_some() {
            &self.camera
        } else if self.image.spec(name).is_some() {
            &self.image
        } else {
            return CommandReply::refused(format!("unknown setting {:?}", name));
        };
        match store.set_str(name, value, ChangeOrigin::Local) {
            Ok(change) => CommandReply::ok(format!("{} = {}", change.name, change.value)),
            Err(err) => CommandReply::refused(err.to_string()),
        }
    }

    fn load_boundary(&mut self, path: &Path) -> CommandReply {
        match Polygon::load(path) {
            Ok(polygon) => {
                let points = polygon.points().len();
                *self.boundary.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(polygon));
                CommandReply::ok(format!("boundary of {} points loaded", points))
            }
            Err(err) => CommandReply::refused(format!("{:#}", err)),
        }
    }

    fn check_camera_params(&self) -> Result<CameraParams> {
        let camparms = CameraSettings::snapshot(&self.camera).camparms;
        if camparms.is_empty() {
            bail!("camparms not set");
        }
        CameraParams::load(Path::new(&camparms))
    }

    fn ensure_dispatch(&mut self) -> Result<()> {
        if self.dispatch.is_some() {
            return Ok(());
        }
        let gcs_address = CameraSettings::snapshot(&self.camera).gcs_address;
        let links = (self.links)(&gcs_address);
        if links.is_empty() {
            log::warn!("no ground links configured; objects will only be counted");
        }
        let router = CommandRouter::new(
            self.camera.clone(),
            self.image.clone(),
            self.index.clone(),
            self.codec.clone(),
            self.outbound.clone(),
            self.commands_tx.clone(),
            self.dedup.clone(),
            self.router_counters.clone(),
        );
        let controller = DispatchController::new(
            links,
            self.outbound.clone(),
            router,
            self.camera.clone(),
            self.config.dispatch.clone(),
        );
        self.dispatch_stats = Some(controller.stats_handle());
        let mut workers = Workers::new();
        workers.handles.push(controller.spawn(workers.stop.clone())?);
        self.dispatch = Some(workers);
        Ok(())
    }

    fn start_pipeline(&mut self, camera_params: CameraParams) -> Result<()> {
        let mut workers = Workers::new();
        match self.spawn_pipeline(&mut workers, camera_params) {
            Ok(()) => {
                self.pipeline = Some(workers);
                Ok(())
            }
            Err(err) => {
                workers.shutdown(self.config.join_timeout);
                Err(err)
            }
        }
    }

    fn spawn_pipeline(&mut self, workers: &mut Workers, camera_params: CameraParams) -> Result<()> {
        let poll = self.config.capture.poll;
        let region_log = match &self.config.capture.region_log {
            Some(path) => Some(Arc::new(RegionLog::open(path)?)),
            None => None,
        };
        let ctx = ScanContext {
            camera: self.camera.clone(),
            image: self.image.clone(),
            codec: self.codec.clone(),
            position: self.position.clone(),
            camera_params: Some(camera_params),
            terrain: self.terrain.clone(),
            boundary: self.boundary.clone(),
            region_log,
            outbound: self.outbound.clone(),
            counters: self.counters.clone(),
        };
        let scan = ScanStage::new(ctx, (self.detector)()?);
        let (input, stop) = (self.scan_queue.clone(), workers.stop.clone());
        workers
            .handles
            .push(spawn_stage("scan", move || scan.run(input, stop, poll))?);

        let capture_out = match &self.config.chain {
            Some(chain) => {
                let opts = ChainOptions {
                    compress: chain.compress,
                    save: chain.save,
                    quality: chain.quality,
                    output_dir: chain.output_dir.clone(),
                    queue_capacity: self.config.queues.scan,
                    poll,
                };
                let chain = CaptureChain::spawn(
                    opts,
                    (self.demosaic)(),
                    self.codec.clone(),
                    self.index.clone(),
                    Some(self.scan_queue.clone()),
                    self.counters.clone(),
                    workers.stop.clone(),
                )?;
                let input = chain.input().clone();
                workers.handles.extend(chain.into_handles());
                input
            }
            None => self.scan_queue.clone(),
        };

        let mut source = (self.source)(&self.config, &self.camera)?;
        let opts = CaptureOptions {
            poll,
            reopen_threshold: self.config.capture.reopen_threshold,
            backoff: self.config.capture.backoff,
            max_backoff: self.config.capture.max_backoff,
            shed_threshold: capture_out.capacity(),
        };
        let (index, counters, stop) = (
            self.index.clone(),
            self.counters.clone(),
            workers.stop.clone(),
        );
        workers.handles.push(spawn_stage("capture", move || {
            run_capture(
                source.as_mut(),
                &capture_out,
                Some(&index),
                &counters,
                &stop,
                &opts,
            )
        })?);
        Ok(())
    }

    fn notify(&self, text: &str) {
        if !self.outbound.push(DispatchRequest::broadcast(Message::text(text))) {
            log::debug!("outbound queue full, status text dropped");
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Queue a `SettingChange` object for every change made to `store`.
/// Changes that arrived over a link are not sent back to that link.
fn echo_changes(store: &SettingsStore, outbound: BoundedStageQueue<DispatchRequest>) {
    store.on_change(move |change| {
        let target = match change.origin {
            ChangeOrigin::Local => Target::All,
            ChangeOrigin::Link(link) => Target::AllExcept(link),
        };
        let message = Message::SettingChange {
            timestamp: wall_clock(),
            scope: change.scope,
            name: change.name.clone(),
            value: change.value.clone(),
        };
        if !outbound.push(DispatchRequest::broadcast(message).to(target)) {
            log::debug!("outbound queue full, setting echo for {} dropped", change.name);
        }
    });
}
