use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_HORIZON};
use crate::detect::backends::DETECTOR_NAMES;
use crate::dispatch::{DispatchConfig, SupersedePolicy};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::settings::{ChangeOrigin, SettingValue, SettingsStore};

const DEFAULT_SOURCE: &str = "file";
const DEFAULT_DETECTOR: &str = "contrast";
const DEFAULT_POLL_MS: u64 = 10;
const DEFAULT_REOPEN_THRESHOLD: u32 = 5;
const DEFAULT_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_BACKOFF_MS: u64 = 8_000;
const DEFAULT_IMAGE_INDEX: usize = 2_000;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_CHAIN_QUALITY: u8 = 95;

#[derive(Debug, Deserialize, Default)]
struct AirConfigFile {
    capture: Option<CaptureConfigFile>,
    chain: Option<ChainConfigFile>,
    queues: Option<QueueConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    dedup: Option<DedupConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    settings: Option<SettingsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    image_file: Option<String>,
    camera_params: Option<String>,
    detector: Option<String>,
    region_log: Option<PathBuf>,
    poll_ms: Option<u64>,
    reopen_threshold: Option<u32>,
    backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ChainConfigFile {
    compress: Option<bool>,
    save: Option<bool>,
    quality: Option<u8>,
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    scan: Option<usize>,
    outbound: Option<usize>,
    image_index: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    max_in_flight: Option<usize>,
    heartbeat_secs: Option<f64>,
    backlog_high_water_pct: Option<u32>,
    supersede: Option<SupersedePolicy>,
    low_disk_bytes: Option<u64>,
    disk_path: Option<PathBuf>,
    cycle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DedupConfigFile {
    horizon_secs: Option<f64>,
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    join_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SettingsConfigFile {
    camera: Option<BTreeMap<String, SettingValue>>,
    image: Option<BTreeMap<String, SettingValue>>,
}

#[derive(Debug, Clone)]
pub struct AirConfig {
    pub capture: CaptureConfig,
    /// Bayer/encode/save chain between capture and scan. Off when `None`.
    pub chain: Option<ChainConfig>,
    pub queues: QueueConfig,
    pub dispatch: DispatchConfig,
    pub dedup: DedupConfig,
    pub join_timeout: Duration,
    /// Initial values for the camera settings store.
    pub camera_settings: BTreeMap<String, SettingValue>,
    /// Initial values for the image settings store.
    pub image_settings: BTreeMap<String, SettingValue>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// `file` watches `imagefile`; `stub://synthetic` runs the synthetic frame grabber.
    pub source: String,
    pub detector: String,
    pub region_log: Option<PathBuf>,
    pub poll: Duration,
    pub reopen_threshold: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub compress: bool,
    pub save: bool,
    pub quality: u8,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub scan: usize,
    pub outbound: usize,
    pub image_index: usize,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub horizon_secs: f64,
    pub capacity: usize,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self::from_file(AirConfigFile::default())
    }
}

impl AirConfig {
    /// Config file named by `SKYSCAN_CONFIG`, then environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SKYSCAN_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file instead of `SKYSCAN_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AirConfigFile) -> Self {
        let capture_file = file.capture.unwrap_or_default();
        let mut camera_settings = file
            .settings
            .as_ref()
            .and_then(|s| s.camera.clone())
            .unwrap_or_default();
        if let Some(image_file) = capture_file.image_file {
            camera_settings.insert("imagefile".into(), SettingValue::Str(image_file));
        }
        if let Some(params) = capture_file.camera_params {
            camera_settings.insert("camparms".into(), SettingValue::Str(params));
        }
        let capture = CaptureConfig {
            source: capture_file
                .source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            detector: capture_file
                .detector
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            region_log: capture_file.region_log,
            poll: Duration::from_millis(capture_file.poll_ms.unwrap_or(DEFAULT_POLL_MS)),
            reopen_threshold: capture_file
                .reopen_threshold
                .unwrap_or(DEFAULT_REOPEN_THRESHOLD),
            backoff: Duration::from_millis(capture_file.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS)),
            max_backoff: Duration::from_millis(
                capture_file.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
        };
        let chain = file.chain.map(|chain| ChainConfig {
            compress: chain.compress.unwrap_or(true),
            save: chain.save.unwrap_or(true),
            quality: chain.quality.unwrap_or(DEFAULT_CHAIN_QUALITY),
            output_dir: chain.output_dir.unwrap_or_else(|| PathBuf::from("images")),
        });
        let queues_file = file.queues.unwrap_or_default();
        let queues = QueueConfig {
            scan: queues_file.scan.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            outbound: queues_file.outbound.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            image_index: queues_file.image_index.unwrap_or(DEFAULT_IMAGE_INDEX),
        };
        let defaults = DispatchConfig::default();
        let dispatch_file = file.dispatch.unwrap_or_default();
        // Unrepresentable values become zero and fail validation.
        let heartbeat = dispatch_file.heartbeat_secs.map_or(defaults.heartbeat, |secs| {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
        });
        let dispatch = DispatchConfig {
            max_in_flight: dispatch_file.max_in_flight.unwrap_or(defaults.max_in_flight),
            heartbeat,
            backlog_high_water_pct: dispatch_file
                .backlog_high_water_pct
                .unwrap_or(defaults.backlog_high_water_pct),
            supersede: dispatch_file.supersede.unwrap_or(defaults.supersede),
            low_disk_bytes: dispatch_file.low_disk_bytes.unwrap_or(defaults.low_disk_bytes),
            disk_path: dispatch_file.disk_path,
            cycle: dispatch_file
                .cycle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.cycle),
        };
        let dedup_file = file.dedup.unwrap_or_default();
        let dedup = DedupConfig {
            horizon_secs: dedup_file.horizon_secs.unwrap_or(DEFAULT_DEDUP_HORIZON),
            capacity: dedup_file.capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY),
        };
        let join_timeout = Duration::from_millis(
            file.shutdown
                .and_then(|s| s.join_timeout_ms)
                .unwrap_or(DEFAULT_JOIN_TIMEOUT_MS),
        );
        Self {
            capture,
            chain,
            queues,
            dispatch,
            dedup,
            join_timeout,
            camera_settings,
            image_settings: file.settings.and_then(|s| s.image).unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SKYSCAN_IMAGE_FILE") {
            if !path.trim().is_empty() {
                self.camera_settings
                    .insert("imagefile".into(), SettingValue::Str(path));
            }
        }
        if let Ok(path) = std::env::var("SKYSCAN_CAMERA_PARAMS") {
            if !path.trim().is_empty() {
                self.camera_settings
                    .insert("camparms".into(), SettingValue::Str(path));
            }
        }
        if let Ok(links) = std::env::var("SKYSCAN_GCS_ADDRESS") {
            let parsed = split_csv(&links);
            if !parsed.is_empty() {
                self.camera_settings
                    .insert("gcs_address".into(), SettingValue::Str(parsed.join(",")));
            }
        }
        if let Ok(path) = std::env::var("SKYSCAN_REGION_LOG") {
            if !path.trim().is_empty() {
                self.capture.region_log = Some(PathBuf::from(path));
            }
        }
        if let Ok(poll) = std::env::var("SKYSCAN_POLL_MS") {
            let ms: u64 = poll
                .parse()
                .map_err(|_| anyhow!("SKYSCAN_POLL_MS must be an integer number of milliseconds"))?;
            self.capture.poll = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.capture.source != DEFAULT_SOURCE && !self.capture.source.starts_with("stub://") {
            return Err(anyhow!(
                "capture.source must be \"file\" or stub://, got {:?}",
                self.capture.source
            ));
        }
        if !DETECTOR_NAMES.contains(&self.capture.detector.as_str()) {
            return Err(anyhow!(
                "capture.detector must be one of {:?}, got {:?}",
                DETECTOR_NAMES,
                self.capture.detector
            ));
        }
        if self.capture.poll.is_zero() {
            return Err(anyhow!("capture.poll_ms must be greater than zero"));
        }
        if self.capture.reopen_threshold == 0 {
            return Err(anyhow!("capture.reopen_threshold must be greater than zero"));
        }
        if self.capture.max_backoff < self.capture.backoff {
            return Err(anyhow!("capture.max_backoff_ms must be at least capture.backoff_ms"));
        }
        if let Some(chain) = &self.chain {
            if self.capture.source == DEFAULT_SOURCE {
                return Err(anyhow!(
                    "chain requires a device capture source; capture.source {:?} yields files",
                    self.capture.source
                ));
            }
            if !(1..=100).contains(&chain.quality) {
                return Err(anyhow!("chain.quality must be within 1..=100"));
            }
        }
        for (key, value) in [
            ("queues.scan", self.queues.scan),
            ("queues.outbound", self.queues.outbound),
            ("queues.image_index", self.queues.image_index),
            ("dispatch.max_in_flight", self.dispatch.max_in_flight),
            ("dedup.capacity", self.dedup.capacity),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", key));
            }
        }
        if !(1..=100).contains(&self.dispatch.backlog_high_water_pct) {
            return Err(anyhow!("dispatch.backlog_high_water_pct must be within 1..=100"));
        }
        if self.dispatch.heartbeat.is_zero() {
            return Err(anyhow!("dispatch.heartbeat_secs must be positive"));
        }
        if self.dispatch.cycle.is_zero() {
            return Err(anyhow!("dispatch.cycle_ms must be greater than zero"));
        }
        if self.dedup.horizon_secs.is_nan() || self.dedup.horizon_secs <= 0.0 {
            return Err(anyhow!("dedup.horizon_secs must be positive"));
        }
        // Every override must be accepted by a fresh store.
        self.apply_settings(&SettingsStore::camera(), &SettingsStore::image())?;
        Ok(())
    }

    /// Write the configured initial values into the two stores.
    pub fn apply_settings(&self, camera: &SettingsStore, image: &SettingsStore) -> Result<()> {
        for (store, values, section) in [
            (camera, &self.camera_settings, "settings.camera"),
            (image, &self.image_settings, "settings.image"),
        ] {
            for (name, value) in values {
                store
                    .set(name, value.clone(), ChangeOrigin::Local)
                    .map_err(|e| anyhow!("{}.{}: {}", section, name, e))?;
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AirConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
