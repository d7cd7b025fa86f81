use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skyscan::codec::ImageCodec;
use skyscan::detect::{RawRegion, StubDetector};
use skyscan::frame::{BoundingBox, Frame, FrameData, Image, PixelFormat};
use skyscan::ingest::{CaptureSource, CapturedUnit, UnitIdentity};
use skyscan::position::NoPositionSource;
use skyscan::stage::{Demosaic, NearestDemosaic};
use skyscan::transport::LoopbackLink;
use skyscan::{
    AirConfig, Collaborators, ControlCommand, Detector, LinkHandle, Message, PipelineController,
    PipelineState, SettingValue,
};

const WAIT: Duration = Duration::from_secs(5);

struct TinyCodec;

impl ImageCodec for TinyCodec {
    fn decode_file(&self, _path: &Path) -> Result<Image> {
        Ok(Image::zeroed(32, 24, PixelFormat::Rgb8))
    }

    fn encode_jpeg(&self, image: &Image, _quality: u8) -> Result<Vec<u8>> {
        Ok(vec![0xff, 0xd8, image.width as u8])
    }

    fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
        Ok(image.data.clone())
    }
}

/// New frame every poll, timestamps 0.1 s apart.
struct CountingSource {
    next: u64,
    format: PixelFormat,
}

impl CaptureSource for CountingSource {
    fn describe(&self) -> String {
        "counting".into()
    }

    fn poll(&mut self) -> Result<Option<CapturedUnit>> {
        self.next += 1;
        std::thread::sleep(Duration::from_millis(20));
        Ok(Some(CapturedUnit {
            identity: UnitIdentity::Sequence(self.next),
            frame: Frame {
                capture_timestamp: 1_000.0 + self.next as f64 / 10.0,
                sequence: self.next,
                data: FrameData::Pixels(Image::zeroed(32, 24, self.format)),
            },
        }))
    }
}

fn camparms_file(dir: &Path) -> PathBuf {
    let path = dir.join("camera.json");
    std::fs::write(
        &path,
        r#"{"lens": 4.0, "sensorwidth": 5.0, "xresolution": 32, "yresolution": 24}"#,
    )
    .unwrap();
    path
}

/// Controller with one loopback link; returns the ground end.
fn controller(dir: &Path) -> (PipelineController, LoopbackLink) {
    let (collab, ground) = collaborators(PixelFormat::Mono8);
    (PipelineController::new(config(dir), collab).unwrap(), ground)
}

fn config(dir: &Path) -> AirConfig {
    let mut config = AirConfig::default();
    config.join_timeout = Duration::from_secs(2);
    config.camera_settings.insert(
        "camparms".into(),
        SettingValue::Str(camparms_file(dir).display().to_string()),
    );
    config
}

fn collaborators(format: PixelFormat) -> (Collaborators, LoopbackLink) {
    let (air, ground) = LoopbackLink::pair("air", "ground");
    let slot = Mutex::new(Some(air));
    let region = RawRegion {
        bbox: BoundingBox {
            x1: 4,
            y1: 4,
            x2: 12,
            y2: 12,
        },
        score: 800.0,
    };
    let collab = Collaborators::new(Arc::new(TinyCodec), Arc::new(NoPositionSource))
        .with_detector(move || {
            Ok(Box::new(StubDetector::with_regions(vec![region.clone()])) as Box<dyn Detector>)
        })
        .with_source(move |_, _| {
            Ok(Box::new(CountingSource { next: 0, format }) as Box<dyn CaptureSource>)
        })
        .with_links(move |_| {
            slot.lock()
                .unwrap()
                .take()
                .map(|link| Box::new(link) as Box<dyn LinkHandle>)
                .into_iter()
                .collect()
        });
    (collab, ground)
}

/// Receive on `ground` until `pred` matches, pumping controller commands meanwhile.
fn wait_for(
    ctl: &mut PipelineController,
    ground: &mut LoopbackLink,
    mut pred: impl FnMut(&Message) -> bool,
) -> Message {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        ctl.pump_commands();
        if let Some(block) = ground.receive(Duration::from_millis(20)) {
            let msg = Message::decode(&block).unwrap();
            if pred(&msg) {
                return msg;
            }
        }
    }
    panic!("timed out waiting on the ground link");
}

fn is_text(msg: &Message, text: &str) -> bool {
    matches!(msg, Message::Text { message } if message == text)
}

#[test]
fn start_stop_start_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let (mut ctl, mut ground) = controller(dir.path());

    let reply = ctl.execute(ControlCommand::Start);
    assert!(reply.accepted, "{}", reply.message);
    assert_eq!(reply.message, "started running");
    assert_eq!(ctl.state(), PipelineState::Running);

    let again = ctl.execute(ControlCommand::Start);
    assert!(!again.accepted);
    assert_eq!(again.message, "already running");

    wait_for(&mut ctl, &mut ground, |m| is_text(m, "started running"));
    wait_for(&mut ctl, &mut ground, |m| matches!(m, Message::Thumbnail(_)));

    let stopped = ctl.execute(ControlCommand::Stop);
    assert!(stopped.accepted);
    assert_eq!(stopped.message, "stopped");
    assert_eq!(ctl.state(), PipelineState::Idle);
    assert!(!ctl.execute(ControlCommand::Stop).accepted);

    let captured = ctl.status().stages.captured;
    assert!(captured > 0);
    assert!(ctl.execute(ControlCommand::Start).accepted);
    assert_eq!(ctl.state(), PipelineState::Running);

    let deadline = Instant::now() + WAIT;
    while ctl.status().stages.captured == captured && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(ctl.status().stages.captured > captured);
    assert_eq!(ctl.unload(), 0);
    assert_eq!(ctl.state(), PipelineState::Stopping);
    assert!(!ctl.execute(ControlCommand::Start).accepted);
}

#[test]
fn airstart_twice_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (mut ctl, _ground) = controller(dir.path());

    let first = ctl.execute(ControlCommand::Airstart);
    assert!(first.accepted);
    assert_eq!(first.message, "airstart ready");
    let second = ctl.execute(ControlCommand::Airstart);
    assert!(!second.accepted);
    assert_eq!(second.message, "airstart already running");
    assert_eq!(ctl.state(), PipelineState::Armed);

    // Armed does not capture.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ctl.status().stages.captured, 0);

    assert!(ctl.execute(ControlCommand::Stop).accepted);
    assert_eq!(ctl.state(), PipelineState::Idle);
}

#[test]
fn commands_over_the_link_are_executed_and_answered() {
    let dir = tempfile::tempdir().unwrap();
    let (mut ctl, mut ground) = controller(dir.path());
    // Dispatch runs once armed.
    assert!(ctl.execute(ControlCommand::Airstart).accepted);
    wait_for(&mut ctl, &mut ground, |m| is_text(m, "airstart ready"));

    let cmd = Message::Command {
        timestamp: 77.0,
        command: "set thumbsize 80".into(),
    };
    ground.send(cmd.encode().unwrap(), 1, None).unwrap();
    ground.tick(10, 10);

    wait_for(&mut ctl, &mut ground, |m| is_text(m, "thumbsize = 80"));
    assert_eq!(ctl.camera().get("thumbsize"), Some(SettingValue::Int(80)));

    let status = Message::Command {
        timestamp: 78.0,
        command: "status".into(),
    };
    ground.send(status.encode().unwrap(), 1, None).unwrap();
    ground.tick(10, 10);
    wait_for(&mut ctl, &mut ground, |m| {
        matches!(m, Message::Text { message } if message.starts_with("armed "))
    });
    assert_eq!(ctl.status().router.handled, 2);
}

/// Demosaic that counts its calls.
struct CountingDemosaic(Arc<AtomicUsize>);

impl Demosaic for CountingDemosaic {
    fn demosaic(&mut self, raw: &Image) -> Result<Image> {
        self.0.fetch_add(1, Ordering::SeqCst);
        NearestDemosaic.demosaic(raw)
    }
}

#[test]
fn capture_chain_saves_and_indexes_frames() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("images");
    let mut config = config(dir.path());
    config.capture.source = "stub://counting".into();
    config.chain = Some(skyscan::config::ChainConfig {
        compress: true,
        save: true,
        quality: 80,
        output_dir: out.clone(),
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let demosaic_calls = calls.clone();
    let (collab, _ground) = collaborators(PixelFormat::Bayer8);
    let collab = collab.with_demosaic(move || {
        Box::new(CountingDemosaic(demosaic_calls.clone())) as Box<dyn Demosaic>
    });
    let mut ctl = PipelineController::new(config, collab).unwrap();

    assert!(ctl.execute(ControlCommand::Start).accepted);
    let deadline = Instant::now() + WAIT;
    while ctl.status().stages.scanned < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(ctl.execute(ControlCommand::Stop).accepted);

    let status = ctl.status();
    assert!(status.stages.saved >= 2);
    assert!(status.stages.scanned >= 2);
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(!ctl.index().is_empty());
    let saved: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(saved.iter().all(|name| name.starts_with('i') && name.ends_with("Z.jpg")));
    assert!(saved.len() >= 2);
}
