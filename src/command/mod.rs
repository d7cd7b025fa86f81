//! Inbound object handling.
//!
//! Every block received on a link is decoded into a `Message`, checked
//! against the dedup cache, and routed to exactly one handler per variant.
//! Failures end here as counters and log lines.

mod control;
mod dedup;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use control::{ControlCommand, USAGE};
pub use dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_HORIZON};

use crate::codec::ImageCodec;
use crate::dispatch::{DispatchRequest, Target};
use crate::frame::{wall_clock, ImageIndex, Timestamp};
use crate::queue::BoundedStageQueue;
use crate::settings::{CameraSettings, ChangeOrigin, SettingValue, SettingsScope, SettingsStore};
use crate::transport::LinkId;
use crate::wire::{ImagePacket, Message, REQUEST_PRIORITY};

#[derive(Debug, Default)]
pub struct RouterCounters {
    pub handled: AtomicU64,
    pub decode_errors: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected_settings: AtomicU64,
    pub rejected_commands: AtomicU64,
    pub images_sent: AtomicU64,
    pub image_errors: AtomicU64,
    jpeg_size: Mutex<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouterSnapshot {
    pub handled: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    pub rejected_settings: u64,
    pub rejected_commands: u64,
    pub images_sent: u64,
    pub image_errors: u64,
    /// Smoothed size of re-sent JPEGs, bytes.
    pub jpeg_size: f64,
}

impl RouterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_jpeg(&self, len: usize) {
        let mut size = self.jpeg_size.lock().unwrap_or_else(|p| p.into_inner());
        *size = 0.95 * *size + 0.05 * len as f64;
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RouterSnapshot {
            handled: load(&self.handled),
            decode_errors: load(&self.decode_errors),
            duplicates: load(&self.duplicates),
            rejected_settings: load(&self.rejected_settings),
            rejected_commands: load(&self.rejected_commands),
            images_sent: load(&self.images_sent),
            image_errors: load(&self.image_errors),
            jpeg_size: *self.jpeg_size.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// What happened to one inbound block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled(&'static str),
    Duplicate,
    Malformed,
    Failed(&'static str),
}

pub struct CommandRouter {
    camera: Arc<SettingsStore>,
    image: Arc<SettingsStore>,
    index: Arc<ImageIndex>,
    codec: Arc<dyn ImageCodec>,
    outbound: BoundedStageQueue<DispatchRequest>,
    commands: Sender<ControlCommand>,
    dedup: Arc<DedupCache>,
    counters: Arc<RouterCounters>,
    liveness: HashMap<LinkId, f64>,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Arc<SettingsStore>,
        image: Arc<SettingsStore>,
        index: Arc<ImageIndex>,
        codec: Arc<dyn ImageCodec>,
        outbound: BoundedStageQueue<DispatchRequest>,
        commands: Sender<ControlCommand>,
        dedup: Arc<DedupCache>,
        counters: Arc<RouterCounters>,
    ) -> Self {
        Self {
            camera,
            image,
            index,
            codec,
            outbound,
            commands,
            dedup,
            counters,
            liveness: HashMap::new(),
        }
    }

    pub fn counters(&self) -> &Arc<RouterCounters> {
        &self.counters
    }

    /// Wall-clock time of the last heartbeat seen on `link`.
    pub fn last_heartbeat(&self, link: LinkId) -> Option<f64> {
        self.liveness.get(&link).copied()
    }

    pub fn handle_bytes(&mut self, bytes: &[u8], origin: LinkId) -> RouteOutcome {
        match Message::decode(bytes) {
            Ok(msg) => self.handle(msg, origin),
            Err(err) => {
                RouterCounters::bump(&self.counters.decode_errors);
                log::debug!("link {}: dropping block: {}", origin, err);
                RouteOutcome::Malformed
            }
        }
    }

    pub fn handle(&mut self, msg: Message, origin: LinkId) -> RouteOutcome {
        if let Some(stamp) = msg.stamp() {
            if !self.dedup.check_and_insert(stamp, wall_clock()) {
                RouterCounters::bump(&self.counters.duplicates);
                log::trace!("link {}: duplicate {} {:.2}", origin, msg.kind(), stamp);
                return RouteOutcome::Duplicate;
            }
        }
        let kind = msg.kind();
        let outcome = match msg {
            Message::ImageRequest {
                frame_time,
                fullres,
                priority,
                ..
            } => match self.resend_image(frame_time, fullres, priority, origin) {
                Ok(()) => RouteOutcome::Handled(kind),
                Err(err) => {
                    RouterCounters::bump(&self.counters.image_errors);
                    log::warn!("link {}: image request: {:#}", origin, err);
                    self.reply(origin, format!("image {:.2} unavailable: {}", frame_time, err));
                    RouteOutcome::Failed(kind)
                }
            },
            Message::SettingChange {
                scope, name, value, ..
            } => self.change_setting(scope, &name, value, origin),
            Message::HeartBeat { .. } => {
                self.liveness.insert(origin, wall_clock());
                RouteOutcome::Handled(kind)
            }
            Message::Command { command, .. } => self.forward_command(&command, origin),
            Message::Text { message } => {
                log::info!("link {}: {}", origin, message);
                RouteOutcome::Handled(kind)
            }
            Message::Thumbnail(_) | Message::FullImage(_) => {
                log::debug!("link {}: ignoring inbound {}", origin, kind);
                RouteOutcome::Handled(kind)
            }
        };
        if let RouteOutcome::Handled(_) = outcome {
            RouterCounters::bump(&self.counters.handled);
        }
        outcome
    }

    fn resend_image(
        &mut self,
        frame_time: Timestamp,
        fullres: bool,
        priority: Option<u32>,
        origin: LinkId,
    ) -> Result<()> {
        let path = self
            .index
            .lookup(frame_time)
            .ok_or_else(|| anyhow!("no image recorded for frame"))?;
        let mut image = self.codec.decode_file(&path)?;
        if !fullres {
            image = image.half_size();
        }
        let quality = CameraSettings::snapshot(&self.camera).quality_send;
        let jpeg = self
            .codec
            .encode_jpeg(&image, quality)
            .with_context(|| format!("failed to encode {}", path.display()))?;
        self.counters.record_jpeg(jpeg.len());
        log::info!("sending image {} to link {}", path.display(), origin);
        let request = DispatchRequest::broadcast(Message::FullImage(ImagePacket {
            timestamp: wall_clock(),
            frame_time,
            jpeg,
        }))
        .with_priority(priority.unwrap_or(REQUEST_PRIORITY))
        .to(Target::Only(origin));
        if !self.outbound.push(request) {
            anyhow::bail!("outbound queue full");
        }
        RouterCounters::bump(&self.counters.images_sent);
        Ok(())
    }

    fn change_setting(
        &mut self,
        scope: SettingsScope,
        name: &str,
        value: SettingValue,
        origin: LinkId,
    ) -> RouteOutcome {
        let store = match scope {
            SettingsScope::Camera => &self.camera,
            SettingsScope::Image => &self.image,
        };
        match store.set(name, value, ChangeOrigin::Link(origin)) {
            Ok(_) => RouteOutcome::Handled("setting_change"),
            Err(err) => {
                RouterCounters::bump(&self.counters.rejected_settings);
                log::warn!("link {}: {}", origin, err);
                self.reply(origin, err.to_string());
                RouteOutcome::Failed("setting_change")
            }
        }
    }

    fn forward_command(&mut self, line: &str, origin: LinkId) -> RouteOutcome {
        let cmd = match ControlCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(err) => {
                RouterCounters::bump(&self.counters.rejected_commands);
                log::warn!("link {}: {}", origin, err);
                self.reply(origin, err.to_string());
                return RouteOutcome::Failed("command");
            }
        };
        log::info!("link {}: command {}", origin, cmd);
        if self.commands.send(cmd).is_err() {
            RouterCounters::bump(&self.counters.rejected_commands);
            log::warn!("link {}: controller gone, command dropped", origin);
            return RouteOutcome::Failed("command");
        }
        RouteOutcome::Handled("command")
    }

    fn reply(&self, origin: LinkId, text: String) {
        let request = DispatchRequest::broadcast(Message::text(text)).to(Target::Only(origin));
        if !self.outbound.push(request) {
            log::debug!("outbound queue full, reply to link {} dropped", origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Image, PixelFormat};
    use crossbeam_channel::{unbounded, Receiver};
    use std::path::Path;

    struct FlatCodec;

    impl ImageCodec for FlatCodec {
        fn decode_file(&self, path: &Path) -> Result<Image> {
            let data = std::fs::read(path)?;
            Image::new(4, 4, PixelFormat::Mono8, data)
        }

        fn encode_jpeg(&self, image: &Image, _quality: u8) -> Result<Vec<u8>> {
            Ok(image.data.clone())
        }

        fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
            Ok(image.data.clone())
        }
    }

    struct Fixture {
        router: CommandRouter,
        camera: Arc<SettingsStore>,
        outbound: BoundedStageQueue<DispatchRequest>,
        commands: Receiver<ControlCommand>,
        index: Arc<ImageIndex>,
    }

    fn fixture() -> Fixture {
        let camera = SettingsStore::camera();
        let outbound = BoundedStageQueue::new(16);
        let index = Arc::new(ImageIndex::new(16));
        let (tx, rx) = unbounded();
        let router = CommandRouter::new(
            camera.clone(),
            SettingsStore::image(),
            index.clone(),
            Arc::new(FlatCodec),
            outbound.clone(),
            tx,
            Arc::new(DedupCache::default()),
            Arc::new(RouterCounters::default()),
        );
        Fixture {
            router,
            camera,
            outbound,
            commands: rx,
            index,
        }
    }

    fn command(timestamp: f64, command: &str) -> Message {
        Message::Command {
            timestamp,
            command: command.into(),
        }
    }

    #[test]
    fn duplicate_stamp_reaches_handler_once() {
        let mut f = fixture();
        assert_eq!(f.router.handle(command(7.5, "status"), 0), RouteOutcome::Handled("command"));
        assert_eq!(f.router.handle(command(7.5, "status"), 1), RouteOutcome::Duplicate);
        assert_eq!(f.commands.try_iter().count(), 1);
        assert_eq!(f.router.counters().snapshot().duplicates, 1);
    }

    #[test]
    fn malformed_blocks_are_counted() {
        let mut f = fixture();
        assert_eq!(f.router.handle_bytes(b"{\"type\":\"warp\"}", 0), RouteOutcome::Malformed);
        assert_eq!(f.router.handle_bytes(b"\xff\x00", 0), RouteOutcome::Malformed);
        assert_eq!(f.router.counters().snapshot().decode_errors, 2);
    }

    #[test]
    fn setting_change_applies_with_link_origin() {
        let mut f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.camera.on_change(move |c| sink.lock().unwrap().push(c.origin));

        let msg = Message::SettingChange {
            timestamp: 1.0,
            scope: SettingsScope::Camera,
            name: "minscore".into(),
            value: SettingValue::Int(500),
        };
        assert_eq!(f.router.handle(msg, 2), RouteOutcome::Handled("setting_change"));
        assert_eq!(f.camera.get("minscore"), Some(SettingValue::Int(500)));
        assert_eq!(*seen.lock().unwrap(), vec![ChangeOrigin::Link(2)]);

        let bad = Message::SettingChange {
            timestamp: 2.0,
            scope: SettingsScope::Camera,
            name: "qualitysend".into(),
            value: SettingValue::Int(1000),
        };
        assert_eq!(f.router.handle(bad, 2), RouteOutcome::Failed("setting_change"));
        assert_eq!(f.router.counters().snapshot().rejected_settings, 1);
        let reply = f.outbound.try_pop().unwrap();
        assert_eq!(reply.target, Target::Only(2));
    }

    #[test]
    fn image_request_replies_only_to_origin() {
        let mut f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2024061512301542Z.pgm");
        std::fs::write(&path, [9u8; 16]).unwrap();
        f.index.record(1_718_454_615.42, path);

        let req = Message::ImageRequest {
            timestamp: 3.0,
            frame_time: 1_718_454_615.42,
            fullres: true,
            priority: None,
        };
        assert_eq!(f.router.handle(req, 1), RouteOutcome::Handled("image_request"));
        let sent = f.outbound.try_pop().unwrap();
        assert_eq!(sent.target, Target::Only(1));
        assert_eq!(sent.priority, REQUEST_PRIORITY);
        match sent.message {
            Message::FullImage(pkt) => assert_eq!(pkt.jpeg, vec![9u8; 16]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.router.counters().snapshot().jpeg_size > 0.0);
    }

    #[test]
    fn missing_image_gets_text_reply() {
        let mut f = fixture();
        let req = Message::ImageRequest {
            timestamp: 4.0,
            frame_time: 99.0,
            fullres: false,
            priority: Some(5),
        };
        assert_eq!(f.router.handle(req, 0), RouteOutcome::Failed("image_request"));
        let reply = f.outbound.try_pop().unwrap();
        assert!(matches!(reply.message, Message::Text { .. }));
    }

    #[test]
    fn heartbeat_updates_liveness() {
        let mut f = fixture();
        assert_eq!(f.router.last_heartbeat(3), None);
        f.router.handle(Message::HeartBeat { timestamp: 5.0 }, 3);
        assert!(f.router.last_heartbeat(3).is_some());
        assert_eq!(f.router.last_heartbeat(0), None);
    }

    #[test]
    fn unknown_command_is_rejected_not_forwarded() {
        let mut f = fixture();
        assert_eq!(f.router.handle(command(6.0, "reboot"), 0), RouteOutcome::Failed("command"));
        assert!(f.commands.try_recv().is_err());
    }
}
