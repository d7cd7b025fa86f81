//! skyscan: air-side imaging control plane
//!
//! Frames are captured, scanned for regions of interest, and the
//! interesting results are delivered to the ground station over one or more
//! bandwidth-limited links. Operator commands and setting changes travel the
//! other way.
//!
//! # Architecture
//!
//! ```text
//! CaptureSource -> [capture] -> queue -> ([bayer] -> [encode] -> [save]) -> queue -> [scan]
//!                                                                                     |
//!                                                                              outbound queue
//!                                                                                     |
//! ground <-> LinkHandle(s) <-> [dispatch] -> CommandRouter -> PipelineController / settings
//! ```
//!
//! Every stage is one thread connected to its neighbours by a
//! `BoundedStageQueue`. A full queue sheds the new item instead of blocking
//! the producer. Every wait is bounded, so a raised `StopSignal` is observed
//! within one poll interval.
//!
//! # Module Structure
//!
//! - `queue`: bounded stage queues and the stop signal
//! - `frame`: frames, images, frame-time file names, the image index
//! - `settings`: camera and image settings stores with change hooks
//! - `ingest`: capture sources and the capture loop
//! - `detect`: detector contract, regions, region filters
//! - `stage`: worker framework, scan stage, capture chain
//! - `transport`: `LinkHandle` contract, UDP and loopback links
//! - `dispatch`: outbound fan-out with per-link backpressure
//! - `command`: inbound routing and deduplication
//! - `controller`: start/stop/airstart lifecycle and status

pub mod camera;
pub mod codec;
pub mod command;
pub mod config;
pub mod controller;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod ingest;
pub mod position;
pub mod queue;
pub mod region_log;
pub mod settings;
pub mod stage;
pub mod transport;
pub mod wire;

pub use camera::CameraParams;
pub use codec::{default_codec, ImageCodec};
pub use command::{CommandRouter, ControlCommand, DedupCache, RouteOutcome};
pub use config::AirConfig;
pub use controller::{
    Collaborators, CommandReply, PipelineController, PipelineState, PipelineStatus, Telemetry,
};
pub use detect::{DetectionResult, Detector, Region};
pub use dispatch::{DispatchController, DispatchRequest, SupersedePolicy, Target};
pub use frame::{Frame, FrameData, Image, ImageIndex, PixelFormat, Timestamp};
pub use position::{Position, PositionError, PositionHistory, PositionSource};
pub use queue::{BoundedStageQueue, StopSignal};
pub use settings::{CameraSettings, ImageSettings, SettingValue, SettingsStore};
pub use transport::{LinkHandle, LinkId, LinkState};
pub use wire::Message;
