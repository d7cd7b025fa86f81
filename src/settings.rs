//! Typed, validated key/value settings stores.
//!
//! Two independent stores exist at runtime: camera/pipeline settings and
//! image-processing settings. `set` is the only writer; it validates type and
//! range, swaps the value under a lock and then runs the change hooks (which
//! is how setting changes get relayed to the ground station).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::transport::LinkId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::Str(_) => SettingKind::Str,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Float(x) => write!(f, "{x}"),
            SettingValue::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int,
    Float,
    Str,
}

/// Which store a setting belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsScope {
    Camera,
    Image,
}

/// Where a change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Link(LinkId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SettingChange {
    pub scope: SettingsScope,
    pub name: String,
    pub value: SettingValue,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("unknown setting {0:?}")]
    Unknown(String),
    #[error("setting {name:?} expects {expected:?}, got {value}")]
    WrongType {
        name: String,
        expected: SettingKind,
        value: SettingValue,
    },
    #[error("setting {name:?} value {value} outside {min}..={max}")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("setting {name:?} must be a finite number, got {value}")]
    NotFinite { name: String, value: f64 },
    #[error("setting {name:?} must be one of {choices:?}")]
    BadChoice {
        name: String,
        choices: &'static [&'static str],
    },
    #[error("cannot parse {raw:?} for setting {name:?}")]
    Parse { name: String, raw: String },
}

/// Static description of one setting.
#[derive(Clone, Debug)]
pub struct SettingSpec {
    pub name: &'static str,
    pub kind: SettingKind,
    pub default: SettingValue,
    pub range: Option<(f64, f64)>,
    pub choices: Option<&'static [&'static str]>,
    pub description: &'static str,
}

impl SettingSpec {
    fn new(name: &'static str, default: SettingValue, description: &'static str) -> Self {
        Self {
            name,
            kind: default.kind(),
            default,
            range: None,
            choices: None,
            description,
        }
    }

    fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    fn choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = Some(choices);
        self
    }

    fn validate(&self, value: SettingValue) -> Result<SettingValue, SettingsError> {
        let value = match (self.kind, value) {
            (SettingKind::Float, SettingValue::Int(i)) => SettingValue::Float(i as f64),
            (kind, value) if kind == value.kind() => value,
            (_, value) => {
                return Err(SettingsError::WrongType {
                    name: self.name.to_string(),
                    expected: self.kind,
                    value,
                })
            }
        };
        if let SettingValue::Float(x) = value {
            if !x.is_finite() {
                return Err(SettingsError::NotFinite {
                    name: self.name.to_string(),
                    value: x,
                });
            }
        }
        if let (Some((min, max)), Some(x)) = (self.range, value.as_f64()) {
            if x < min || x > max {
                return Err(SettingsError::OutOfRange {
                    name: self.name.to_string(),
                    value: x,
                    min,
                    max,
                });
            }
        }
        if let (Some(choices), Some(s)) = (self.choices, value.as_str()) {
            if !choices.contains(&s) {
                return Err(SettingsError::BadChoice {
                    name: self.name.to_string(),
                    choices,
                });
            }
        }
        Ok(value)
    }

    fn parse(&self, raw: &str) -> Result<SettingValue, SettingsError> {
        let err = || SettingsError::Parse {
            name: self.name.to_string(),
            raw: raw.to_string(),
        };
        let raw = raw.trim();
        match self.kind {
            SettingKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(SettingValue::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(SettingValue::Bool(false)),
                _ => Err(err()),
            },
            SettingKind::Int => raw.parse().map(SettingValue::Int).map_err(|_| err()),
            SettingKind::Float => raw.parse().map(SettingValue::Float).map_err(|_| err()),
            SettingKind::Str => Ok(SettingValue::Str(raw.to_string())),
        }
    }
}

type ChangeHook = Box<dyn Fn(&SettingChange) + Send + Sync>;

/// One settings store.
pub struct SettingsStore {
    scope: SettingsScope,
    specs: Vec<SettingSpec>,
    values: RwLock<BTreeMap<&'static str, SettingValue>>,
    hooks: RwLock<Vec<ChangeHook>>,
}

impl SettingsStore {
    pub fn new(scope: SettingsScope, specs: Vec<SettingSpec>) -> Self {
        let values = specs.iter().map(|s| (s.name, s.default.clone())).collect();
        Self {
            scope,
            specs,
            values: RwLock::new(values),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn camera() -> Arc<Self> {
        Arc::new(Self::new(SettingsScope::Camera, camera_specs()))
    }

    pub fn image() -> Arc<Self> {
        Arc::new(Self::new(SettingsScope::Image, image_specs()))
    }

    pub fn scope(&self) -> SettingsScope {
        self.scope
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name)
    }

    pub fn spec(&self, name: &str) -> Option<&SettingSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<SettingValue> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Consistent copy of every value.
    pub fn snapshot(&self) -> BTreeMap<&'static str, SettingValue> {
        self.values.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Register a change hook. Hooks run on the writer's thread after the swap.
    pub fn on_change(&self, hook: impl Fn(&SettingChange) + Send + Sync + 'static) {
        self.hooks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(hook));
    }

    pub fn set(
        &self,
        name: &str,
        value: SettingValue,
        origin: ChangeOrigin,
    ) -> Result<SettingChange, SettingsError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| SettingsError::Unknown(name.to_string()))?;
        let value = spec.validate(value)?;
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(spec.name, value.clone());
        let change = SettingChange {
            scope: self.scope,
            name: spec.name.to_string(),
            value,
            origin,
        };
        log::info!("{:?} setting {} = {}", self.scope, change.name, change.value);
        for hook in self.hooks.read().unwrap_or_else(|p| p.into_inner()).iter() {
            hook(&change);
        }
        Ok(change)
    }

    /// Parse a textual value according to the setting's type, then `set` it.
    pub fn set_str(
        &self,
        name: &str,
        raw: &str,
        origin: ChangeOrigin,
    ) -> Result<SettingChange, SettingsError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| SettingsError::Unknown(name.to_string()))?;
        let value = spec.parse(raw)?;
        self.set(name, value, origin)
    }

    fn bool_or(&self, values: &BTreeMap<&'static str, SettingValue>, name: &str) -> bool {
        values
            .get(name)
            .and_then(SettingValue::as_bool)
            .or_else(|| self.spec(name).and_then(|s| s.default.as_bool()))
            .unwrap_or(false)
    }

    fn i64_or(&self, values: &BTreeMap<&'static str, SettingValue>, name: &str) -> i64 {
        values
            .get(name)
            .and_then(SettingValue::as_i64)
            .or_else(|| self.spec(name).and_then(|s| s.default.as_i64()))
            .unwrap_or(0)
    }

    fn f64_or(&self, values: &BTreeMap<&'static str, SettingValue>, name: &str) -> f64 {
        values
            .get(name)
            .and_then(SettingValue::as_f64)
            .or_else(|| self.spec(name).and_then(|s| s.default.as_f64()))
            .unwrap_or(0.0)
    }

    fn string_or(&self, values: &BTreeMap<&'static str, SettingValue>, name: &str) -> String {
        values
            .get(name)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

fn camera_specs() -> Vec<SettingSpec> {
    use SettingValue::*;
    vec![
        SettingSpec::new("roll_stabilised", Bool(false), "Roll stabilised"),
        SettingSpec::new("roll_limit", Float(30.0), "Roll stabilisation limit"),
        SettingSpec::new("minspeed", Int(20), "Airstart: minimum speed for capture to start"),
        SettingSpec::new("minalt", Int(30), "Minimum altitude of images").range(0.0, 10000.0),
        SettingSpec::new("rotate180", Bool(false), "Rotate images by 180"),
        SettingSpec::new("ignoretimestamps", Bool(false), "Ignore image timestamps"),
        SettingSpec::new("camparms", Str(String::new()), "Camera parameters file (json)"),
        SettingSpec::new("imagefile", Str(String::new()), "Latest captured image"),
        SettingSpec::new("filter_type", Str("simple".into()), "Filter type").choices(&["simple"]),
        SettingSpec::new("blue_emphasis", Bool(false), "Blue emphasis"),
        SettingSpec::new("use_capture_time", Bool(true), "Use capture time (false for sim)"),
        SettingSpec::new("target_latitude", Float(0.0), "Filter detections to latitude"),
        SettingSpec::new("target_longitude", Float(0.0), "Filter detections to longitude"),
        SettingSpec::new("target_radius", Float(0.0), "Filter detections to radius (m)"),
        SettingSpec::new(
            "gcs_address",
            Str(String::new()),
            "Ground links as remIP:remPort:localPort:bandwidth, comma separated",
        ),
        SettingSpec::new("qualitysend", Int(90), "Compression quality for send").range(1.0, 100.0),
        SettingSpec::new("transmit", Bool(true), "Transmit enable for thumbnails"),
        SettingSpec::new("maxqueue", Int(100), "Maximum link send queue"),
        SettingSpec::new("thumbsize", Int(60), "Thumbnail size").range(10.0, 200.0),
        SettingSpec::new("minscore", Int(400), "Min score to pass detection").range(0.0, 5000.0),
    ]
}

fn image_specs() -> Vec<SettingSpec> {
    use SettingValue::Float;
    vec![
        SettingSpec::new("min_region_area", Float(0.15), "Min region area").range(0.0, 100.0),
        SettingSpec::new("max_region_area", Float(1.0), "Max region area").range(0.0, 100.0),
        SettingSpec::new("min_region_size", Float(0.2), "Min region size").range(0.0, 100.0),
        SettingSpec::new("max_region_size", Float(1.0), "Max region size").range(0.0, 100.0),
        SettingSpec::new("max_rarity_pct", Float(0.02), "Max rarity percent").range(0.0, 100.0),
        SettingSpec::new("region_merge_size", Float(1.0), "Region merge size").range(0.0, 100.0),
    ]
}

/// By-value copy of the camera store, taken under one read lock.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub roll_stabilised: bool,
    pub roll_limit: f64,
    pub minspeed: f64,
    pub minalt: f64,
    pub rotate180: bool,
    pub ignore_timestamps: bool,
    pub camparms: String,
    pub imagefile: String,
    pub blue_emphasis: bool,
    pub use_capture_time: bool,
    pub target_latitude: f64,
    pub target_longitude: f64,
    pub target_radius: f64,
    pub gcs_address: String,
    pub quality_send: u8,
    pub transmit: bool,
    pub maxqueue: usize,
    pub thumbsize: u32,
    pub minscore: f64,
}

impl CameraSettings {
    pub fn snapshot(store: &SettingsStore) -> Self {
        let v = store.snapshot();
        Self {
            roll_stabilised: store.bool_or(&v, "roll_stabilised"),
            roll_limit: store.f64_or(&v, "roll_limit"),
            minspeed: store.i64_or(&v, "minspeed") as f64,
            minalt: store.i64_or(&v, "minalt") as f64,
            rotate180: store.bool_or(&v, "rotate180"),
            ignore_timestamps: store.bool_or(&v, "ignoretimestamps"),
            camparms: store.string_or(&v, "camparms"),
            imagefile: store.string_or(&v, "imagefile"),
            blue_emphasis: store.bool_or(&v, "blue_emphasis"),
            use_capture_time: store.bool_or(&v, "use_capture_time"),
            target_latitude: store.f64_or(&v, "target_latitude"),
            target_longitude: store.f64_or(&v, "target_longitude"),
            target_radius: store.f64_or(&v, "target_radius"),
            gcs_address: store.string_or(&v, "gcs_address"),
            quality_send: store.i64_or(&v, "qualitysend").clamp(1, 100) as u8,
            transmit: store.bool_or(&v, "transmit"),
            maxqueue: store.i64_or(&v, "maxqueue").max(0) as usize,
            thumbsize: store.i64_or(&v, "thumbsize").clamp(1, 4096) as u32,
            minscore: store.i64_or(&v, "minscore") as f64,
        }
    }
}

/// By-value copy of the image-processing store.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSettings {
    pub min_region_area: f64,
    pub max_region_area: f64,
    pub min_region_size: f64,
    pub max_region_size: f64,
    pub max_rarity_pct: f64,
    pub region_merge_size: f64,
}

impl ImageSettings {
    pub fn snapshot(store: &SettingsStore) -> Self {
        let v = store.snapshot();
        Self {
            min_region_area: store.f64_or(&v, "min_region_area"),
            max_region_area: store.f64_or(&v, "max_region_area"),
            min_region_size: store.f64_or(&v, "min_region_size"),
            max_region_size: store.f64_or(&v, "max_region_size"),
            max_rarity_pct: store.f64_or(&v, "max_rarity_pct"),
            region_merge_size: store.f64_or(&v, "region_merge_size"),
        }
    }
}
