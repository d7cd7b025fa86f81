use anyhow::Result;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use skyscan::codec::ImageCodec;
use skyscan::detect::{Detector, RawRegion, ScanParams};
use skyscan::frame::{BoundingBox, Frame, FrameData, Image, PixelFormat};
use skyscan::ingest::{run_capture, CaptureOptions, CaptureSource, CapturedUnit, UnitIdentity};
use skyscan::position::NoPositionSource;
use skyscan::region_log::RegionLog;
use skyscan::settings::{ChangeOrigin, SettingValue, SettingsStore};
use skyscan::stage::{join_all, spawn_stage, ScanContext, ScanStage, StageCounters, TerrainAltitude};
use skyscan::{BoundedStageQueue, DispatchRequest, Message, StopSignal};

const POLL: Duration = Duration::from_millis(5);

/// Yields each scripted unit once, then repeats the last one forever.
struct ScriptedSource {
    script: Vec<(u64, f64)>,
    next: usize,
}

impl CaptureSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".into()
    }

    fn poll(&mut self) -> Result<Option<CapturedUnit>> {
        let Some(&(seq, t)) = self.script.get(self.next).or(self.script.last()) else {
            return Ok(None);
        };
        self.next += 1;
        // The frame width carries the sequence so the detector can see it.
        let image = Image::zeroed(10 + seq as u32, 8, PixelFormat::Mono8);
        Ok(Some(CapturedUnit {
            identity: UnitIdentity::Sequence(seq),
            frame: Frame {
                capture_timestamp: t,
                sequence: seq,
                data: FrameData::Pixels(image),
            },
        }))
    }
}

/// Records the width of every frame it scans.
struct RecordingDetector {
    seen: Arc<Mutex<Vec<u32>>>,
    regions: Vec<RawRegion>,
}

impl Detector for RecordingDetector {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn scan(&mut self, image: &Image, _params: &ScanParams) -> Result<Vec<RawRegion>> {
        self.seen.lock().unwrap().push(image.width);
        Ok(self.regions.clone())
    }
}

struct EchoCodec;

impl ImageCodec for EchoCodec {
    fn decode_file(&self, path: &Path) -> Result<Image> {
        anyhow::bail!("no decoder for {}", path.display())
    }

    fn encode_jpeg(&self, image: &Image, _quality: u8) -> Result<Vec<u8>> {
        Ok(vec![0xff, 0xd8, image.width as u8])
    }

    fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
        Ok(image.data.clone())
    }
}

fn region(score: f64) -> RawRegion {
    RawRegion {
        bbox: BoundingBox {
            x1: 1,
            y1: 1,
            x2: 5,
            y2: 5,
        },
        score,
    }
}

struct Harness {
    outbound: BoundedStageQueue<DispatchRequest>,
    counters: Arc<StageCounters>,
    camera: Arc<SettingsStore>,
    seen: Arc<Mutex<Vec<u32>>>,
    region_log: Option<Arc<RegionLog>>,
}

impl Harness {
    fn new(region_log: Option<&Path>) -> Self {
        Self {
            outbound: BoundedStageQueue::new(16),
            counters: Arc::new(StageCounters::default()),
            camera: SettingsStore::camera(),
            seen: Arc::new(Mutex::new(Vec::new())),
            region_log: region_log.map(|p| Arc::new(RegionLog::open(p).unwrap())),
        }
    }

    /// Run capture and scan until `frames` frames have been scanned.
    fn run(&self, script: Vec<(u64, f64)>, regions: Vec<RawRegion>, frames: u64) {
        let ctx = ScanContext {
            camera: self.camera.clone(),
            image: SettingsStore::image(),
            codec: Arc::new(EchoCodec),
            position: Arc::new(NoPositionSource),
            camera_params: None,
            terrain: Arc::new(TerrainAltitude::default()),
            boundary: Arc::new(RwLock::new(None)),
            region_log: self.region_log.clone(),
            outbound: self.outbound.clone(),
            counters: self.counters.clone(),
        };
        let detector = RecordingDetector {
            seen: self.seen.clone(),
            regions,
        };
        let stop = StopSignal::new();
        let scan_queue = BoundedStageQueue::new(8);

        let scan = ScanStage::new(ctx, Box::new(detector));
        let (input, scan_stop) = (scan_queue.clone(), stop.clone());
        let scan_handle = spawn_stage("scan", move || scan.run(input, scan_stop, POLL)).unwrap();

        let mut source = ScriptedSource { script, next: 0 };
        let (counters, capture_stop) = (self.counters.clone(), stop.clone());
        let capture_handle = spawn_stage("capture", move || {
            let opts = CaptureOptions {
                poll: POLL,
                ..CaptureOptions::default()
            };
            run_capture(&mut source, &scan_queue, None, &counters, &capture_stop, &opts)
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.counters.snapshot().scanned < frames && Instant::now() < deadline {
            std::thread::sleep(POLL);
        }
        // A few more polls so any duplicate would have been captured.
        std::thread::sleep(POLL * 10);
        stop.set();
        assert_eq!(join_all(vec![capture_handle, scan_handle], Duration::from_secs(2)), 0);
    }
}

#[test]
fn repeated_unit_is_captured_once_and_scanned_in_order() {
    let harness = Harness::new(None);
    harness.run(vec![(1, 100.00), (2, 100.05), (2, 100.05)], vec![region(900.0)], 2);

    assert_eq!(*harness.seen.lock().unwrap(), vec![11, 12]);
    let counters = harness.counters.snapshot();
    assert_eq!(counters.captured, 2);
    assert_eq!(counters.scanned, 2);
    assert_eq!(counters.capture_shed, 0);

    let mut frame_times = Vec::new();
    while let Some(request) = harness.outbound.try_pop() {
        match request.message {
            Message::Thumbnail(pkt) => frame_times.push(pkt.frame_time),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(frame_times, vec![100.00, 100.05]);
}

#[test]
fn below_minscore_counts_regions_but_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("regions.ndjson");
    let harness = Harness::new(Some(&log_path));
    harness
        .camera
        .set("minscore", SettingValue::Int(400), ChangeOrigin::Local)
        .unwrap();
    harness.run(vec![(1, 200.0)], vec![region(350.0), region(120.0)], 1);

    assert!(harness.outbound.is_empty());
    let counters = harness.counters.snapshot();
    assert_eq!(counters.scanned, 1);
    assert_eq!(counters.regions, 2);
    assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "");
}

#[test]
fn qualifying_frames_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("regions.ndjson");
    let harness = Harness::new(Some(&log_path));
    harness.run(vec![(1, 300.0), (2, 301.0)], vec![region(450.0)], 2);

    let log = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["timestamp"], 300.0);
    assert_eq!(lines[1]["regions"][0]["score"], 450.0);
    assert_eq!(harness.outbound.len(), 2);
}
