//! oakd-core — Self-healing capture pipeline for stereo depth devices.
//!
//! A [`PipelineWorker`] drives a device session on a background thread,
//! publishing the latest color image, depth map and point cloud into a
//! [`FrameStore`]. Failures are retried in place; past the failure
//! threshold the worker escalates to an external reconfigure action that
//! the supervisor watchdog runs on its own thread.

pub mod config;
pub mod plan;
pub mod state;
pub mod store;
pub mod watchdog;
pub mod worker;

pub use config::{CaptureConfig, ConfigError, WorkerOptions};
pub use plan::{BuildPlan, PipelineBuildError, PipelineHandles, PlannedNode};
pub use state::{WorkerPhase, WorkerState};
pub use store::{DepthMap, FrameCounts, FrameReader, FrameSnapshot, FrameStore};
pub use watchdog::{BoxError, ReconfigureActionError};
pub use worker::{DrainError, PipelineError, PipelineWorker, SessionOpenError, WorkerError, WorkerStatus};
