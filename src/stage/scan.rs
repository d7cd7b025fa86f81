//! Scan stage: detection, geolocation, filtering and thumbnail dispatch.

use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::StageCounters;
use crate::camera::CameraParams;
use crate::codec::{ImageCodec, THUMBNAIL_QUALITY};
use crate::detect::{DetectionResult, Detector, FilterChain, Polygon, Region, RegionFilter, ScanParams};
use crate::dispatch::DispatchRequest;
use crate::frame::{wall_clock, Frame, FrameData, Image};
use crate::position::{locate_pixel, Position, PositionSource};
use crate::queue::{BoundedStageQueue, StopSignal};
use crate::region_log::RegionLog;
use crate::settings::{CameraSettings, ImageSettings, SettingsStore};
use crate::wire::{Message, ThumbPacket, DEFAULT_PRIORITY};

/// Latest terrain clearance reported by telemetry, in metres.
#[derive(Debug, Default)]
pub struct TerrainAltitude(RwLock<Option<f64>>);

impl TerrainAltitude {
    pub fn set(&self, metres: f64) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Some(metres);
    }

    pub fn get(&self) -> Option<f64> {
        *self.0.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// Everything the scan stage reads besides its input queue.
#[derive(Clone)]
pub struct ScanContext {
    pub camera: Arc<SettingsStore>,
    pub image: Arc<SettingsStore>,
    pub codec: Arc<dyn ImageCodec>,
    pub position: Arc<dyn PositionSource>,
    pub camera_params: Option<CameraParams>,
    pub terrain: Arc<TerrainAltitude>,
    pub boundary: Arc<RwLock<Option<Arc<Polygon>>>>,
    pub region_log: Option<Arc<RegionLog>>,
    pub outbound: BoundedStageQueue<DispatchRequest>,
    pub counters: Arc<StageCounters>,
}

pub struct ScanStage {
    ctx: ScanContext,
    detector: Box<dyn Detector>,
}

impl ScanStage {
    pub fn new(ctx: ScanContext, detector: Box<dyn Detector>) -> Self {
        Self { ctx, detector }
    }

    /// Scan frames until `stop` is raised.
    pub fn run(mut self, input: BoundedStageQueue<Frame>, stop: StopSignal, poll: Duration) {
        if let Err(err) = self.detector.warm_up() {
            log::warn!("scan: detector warm-up failed: {}", err);
        }
        log::info!("scan started with detector {}", self.detector.name());
        while let Some(frame) = input.pop(&stop, poll) {
            if let Err(err) = self.process(frame) {
                StageCounters::bump(&self.ctx.counters.scan_errors);
                log::warn!("scan: {}", err);
            }
        }
        log::info!("scan stopped");
    }

    /// Scan one frame and dispatch its thumbnail when it qualifies.
    pub fn process(&mut self, frame: Frame) -> Result<DetectionResult> {
        let camera = CameraSettings::snapshot(&self.ctx.camera);
        let image_settings = ImageSettings::snapshot(&self.ctx.image);

        let mut params = ScanParams::new(&image_settings, &camera, ScanParams::default().meters_per_pixel);
        if let (Some(altitude), Some(cp)) = (self.ctx.terrain.get(), &self.ctx.camera_params) {
            params.meters_per_pixel = cp.meters_per_pixel(altitude.max(camera.minalt));
        }

        let mut image = match frame.data {
            FrameData::File(ref path) => self.ctx.codec.decode_file(path)?,
            FrameData::Pixels(image) => image,
        };
        if camera.rotate180 {
            image = image.rotate_180();
        }

        let started = Instant::now();
        let raw = self.detector.scan(&image, &params)?;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.ctx.counters.set_scan_fps(1.0 / elapsed);
        }
        StageCounters::bump(&self.ctx.counters.scanned);
        StageCounters::add(&self.ctx.counters.regions, raw.len() as u64);

        let roll = camera.roll_stabilised.then_some(0.0);
        let position = match self.ctx.position.position_at(
            frame.capture_timestamp,
            0.0,
            roll,
            camera.roll_limit,
        ) {
            Ok(pos) => Some(pos),
            Err(err) => {
                log::debug!("scan: {}", err);
                None
            }
        };

        let mut regions: Vec<Region> = raw.into_iter().map(Region::from).collect();
        if let Some(pos) = &position {
            self.georeference(&mut regions, pos, &image, camera.minalt);
        }
        let regions = self.filter_chain(&camera).apply(regions, position.is_some());

        let result = DetectionResult {
            frame_timestamp: frame.capture_timestamp,
            position,
            regions,
        };
        if result.is_empty() {
            return Ok(result);
        }

        if let Some(log) = &self.ctx.region_log {
            if let Err(err) = log.append(&result) {
                log::warn!("scan: region log {}: {}", log.path().display(), err);
            }
        }

        let high_score = result.max_score();
        if camera.transmit && high_score >= camera.minscore {
            self.send_thumbnail(&image, &result, camera.thumbsize, high_score)?;
        }
        Ok(result)
    }

    fn georeference(&self, regions: &mut [Region], pos: &Position, image: &Image, minalt: f64) {
        let Some(cp) = &self.ctx.camera_params else {
            return;
        };
        let mpp = cp.meters_per_pixel(pos.altitude.max(minalt));
        for region in regions {
            let (cx, cy) = region.bbox.center();
            region.latlon = Some(locate_pixel(pos, cx, cy, image.width, image.height, mpp));
        }
    }

    fn filter_chain(&self, camera: &CameraSettings) -> FilterChain {
        let mut chain = FilterChain::new().then(RegionFilter::Score(camera.minscore));
        if camera.target_radius > 0.0 {
            chain = chain.then(RegionFilter::Radius {
                center: (camera.target_latitude, camera.target_longitude),
                radius_m: camera.target_radius,
            });
        }
        let boundary = self
            .ctx
            .boundary
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(polygon) = boundary {
            chain = chain
                .then(RegionFilter::Boundary(polygon))
                .then(RegionFilter::Score(camera.minscore));
        }
        chain
    }

    fn send_thumbnail(
        &self,
        image: &Image,
        result: &DetectionResult,
        thumbsize: u32,
        high_score: f64,
    ) -> Result<()> {
        let rects: Vec<_> = result.regions.iter().map(|r| r.bbox).collect();
        let thumb = image.composite_thumbnail(&rects, thumbsize);
        let jpeg = self.ctx.codec.encode_jpeg(&thumb, THUMBNAIL_QUALITY)?;
        let message = Message::Thumbnail(ThumbPacket {
            timestamp: wall_clock(),
            frame_time: result.frame_timestamp,
            regions: result.regions.clone(),
            jpeg,
            position: result.position,
            high_score,
        });
        let request = DispatchRequest::broadcast(message).with_priority(DEFAULT_PRIORITY);
        if !self.ctx.outbound.push(request) {
            StageCounters::bump(&self.ctx.counters.outbound_shed);
            log::warn!("scan: image tx queue too long, dropping thumbnail");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{RawRegion, StubDetector};
    use crate::frame::{BoundingBox, PixelFormat};
    use crate::position::{NoPositionSource, PositionHistory};
    use crate::settings::{ChangeOrigin, SettingValue};
    use std::path::Path;

    struct FakeCodec;

    impl ImageCodec for FakeCodec {
        fn decode_file(&self, path: &Path) -> Result<Image> {
            anyhow::bail!("no decoder for {}", path.display())
        }

        fn encode_jpeg(&self, image: &Image, _quality: u8) -> Result<Vec<u8>> {
            Ok(vec![image.width as u8, image.height as u8])
        }

        fn encode_pnm(&self, image: &Image) -> Result<Vec<u8>> {
            Ok(image.data.clone())
        }
    }

    fn region(score: f64) -> RawRegion {
        RawRegion {
            bbox: BoundingBox {
                x1: 10,
                y1: 10,
                x2: 20,
                y2: 20,
            },
            score,
        }
    }

    fn context(position: Arc<dyn PositionSource>) -> ScanContext {
        ScanContext {
            camera: SettingsStore::camera(),
            image: SettingsStore::image(),
            codec: Arc::new(FakeCodec),
            position,
            camera_params: Some(CameraParams {
                lens: 4.0,
                sensor_width: 5.0,
                x_resolution: 64,
                y_resolution: 48,
            }),
            terrain: Arc::new(TerrainAltitude::default()),
            boundary: Arc::new(RwLock::new(None)),
            region_log: None,
            outbound: BoundedStageQueue::new(4),
            counters: Arc::new(StageCounters::default()),
        }
    }

    fn frame(t: f64) -> Frame {
        Frame {
            capture_timestamp: t,
            sequence: 1,
            data: FrameData::Pixels(Image::zeroed(64, 48, PixelFormat::Mono8)),
        }
    }

    #[test]
    fn low_score_region_is_counted_but_not_sent() {
        let ctx = context(Arc::new(NoPositionSource));
        let outbound = ctx.outbound.clone();
        let counters = ctx.counters.clone();
        let mut stage = ScanStage::new(ctx, Box::new(StubDetector::with_regions(vec![region(350.0)])));
        let result = stage.process(frame(100.0)).unwrap();
        assert!(result.is_empty());
        assert!(outbound.is_empty());
        assert_eq!(counters.snapshot().regions, 1);
    }

    #[test]
    fn qualifying_region_produces_thumbnail() {
        let ctx = context(Arc::new(NoPositionSource));
        let outbound = ctx.outbound.clone();
        let mut stage = ScanStage::new(ctx, Box::new(StubDetector::with_regions(vec![region(450.0)])));
        let result = stage.process(frame(100.0)).unwrap();
        assert_eq!(result.regions.len(), 1);
        let request = outbound.try_pop().unwrap();
        match request.message {
            Message::Thumbnail(pkt) => {
                assert_eq!(pkt.frame_time, 100.0);
                assert_eq!(pkt.high_score, 450.0);
                assert_eq!(pkt.jpeg, vec![60, 60]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transmit_off_still_scans() {
        let ctx = context(Arc::new(NoPositionSource));
        ctx.camera
            .set("transmit", SettingValue::Bool(false), ChangeOrigin::Local)
            .unwrap();
        let outbound = ctx.outbound.clone();
        let mut stage = ScanStage::new(ctx, Box::new(StubDetector::with_regions(vec![region(900.0)])));
        assert_eq!(stage.process(frame(1.0)).unwrap().regions.len(), 1);
        assert!(outbound.is_empty());
    }

    #[test]
    fn boundary_drops_regions_outside_when_position_known() {
        let history = Arc::new(PositionHistory::default());
        history.add_fix(Position {
            time: 50.0,
            lat: -35.0,
            lon: 149.0,
            altitude: 100.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        let ctx = context(history);
        let far_away =
            Polygon::parse("10.0 10.0\n10.0 10.1\n10.1 10.1\n10.1 10.0\n").unwrap();
        *ctx.boundary.write().unwrap() = Some(Arc::new(far_away));
        let mut stage = ScanStage::new(ctx, Box::new(StubDetector::with_regions(vec![region(900.0)])));

        assert!(stage.process(frame(50.0)).unwrap().is_empty());
        // No fix at t=500: geographic filters are skipped, region survives.
        assert_eq!(stage.process(frame(500.0)).unwrap().regions.len(), 1);
    }

    #[test]
    fn full_outbound_queue_sheds_thumbnail() {
        let ctx = context(Arc::new(NoPositionSource));
        let counters = ctx.counters.clone();
        let mut stage = ScanStage::new(ctx, Box::new(StubDetector::with_regions(vec![region(900.0)])));
        for i in 0..5 {
            stage.process(frame(i as f64)).unwrap();
        }
        assert_eq!(counters.snapshot().outbound_shed, 1);
    }
}
