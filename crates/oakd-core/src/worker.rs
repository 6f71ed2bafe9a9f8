//! Background pipeline worker.
//!
//! The worker runs two OS threads: the pipeline thread, which opens device
//! sessions and drains their outputs into the frame store, and the
//! watchdog thread (see [`crate::watchdog`]). Errors from opening,
//! building or draining a session are counted; once the count exceeds the
//! failure threshold the pipeline thread raises the reconfigure flag and
//! waits for the watchdog to run the reconfigure action before it builds
//! another session.
//!
//! The failure counter tracks consecutive failures across rebuilds. It is
//! reset when a session completes a full drain iteration, and when a
//! reconfiguration releases an escalated worker.

use crate::config::{CaptureConfig, ConfigError, WorkerOptions};
use crate::plan::{self, PipelineBuildError, PipelineHandles};
use crate::state::{SharedState, WorkerPhase, WorkerState};
use crate::store::{DepthMap, FrameCounts, FrameReader, FrameStore};
use crate::watchdog::{self, BoxError, ReconfigureFn};
use crossbeam_channel::TryRecvError;
use image::RgbImage;
use oakd_hw::{Device, DeviceSession, FrameError, Packet, PointCloud, QueueOptions, SessionError};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Host queue depth for the depth stream.
const DEPTH_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum SessionOpenError {
    #[error("failed to open device session: {0}")]
    Open(#[source] SessionError),
    #[error("failed to start pipeline: {0}")]
    Start(#[source] SessionError),
}

#[derive(Error, Debug)]
pub enum DrainError {
    #[error("color stream: {0}")]
    Color(#[source] SessionError),
    #[error("depth stream: {0}")]
    Depth(#[source] SessionError),
    #[error("point cloud pump: {0}")]
    PointCloud(#[source] SessionError),
    #[error("frame conversion: {0}")]
    Frame(#[from] FrameError),
    #[error("unexpected {kind} packet on stream {stream}")]
    UnexpectedPacket {
        stream: &'static str,
        kind: &'static str,
    },
    #[error("point cloud queue disconnected")]
    PointCloudQueueClosed,
}

/// Any failure of one pipeline session. All of these are retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    SessionOpen(#[from] SessionOpenError),
    #[error(transparent)]
    Build(#[from] PipelineBuildError),
    #[error(transparent)]
    Drain(#[from] DrainError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker already started")]
    AlreadyStarted,
    #[error("invalid capture config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// Point-in-time view of a worker for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub phase: WorkerPhase,
    pub failures: u32,
    pub reconfigure_pending: bool,
    pub sessions_opened: u64,
    pub reconfigurations: u64,
    pub frames: FrameCounts,
}

/// Owns the frame store and the two background threads driving a device.
pub struct PipelineWorker {
    config: CaptureConfig,
    options: WorkerOptions,
    device: Arc<dyn Device>,
    store: Arc<FrameStore>,
    shared: Arc<SharedState>,
    reconfigure: Option<ReconfigureFn>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineWorker {
    pub fn new<F>(config: CaptureConfig, device: Arc<dyn Device>, reconfigure: F) -> Self
    where
        F: FnMut() -> Result<(), BoxError> + Send + 'static,
    {
        tracing::info!(
            device = device.name(),
            width = config.width,
            height = config.height,
            frame_rate = config.frame_rate,
            color = config.capture_color,
            depth = config.capture_depth,
            "initializing camera pipeline worker"
        );
        Self {
            config,
            options: WorkerOptions::default(),
            device,
            store: Arc::new(FrameStore::new()),
            shared: Arc::new(SharedState::new()),
            reconfigure: Some(Box::new(reconfigure)),
            threads: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Spawn the watchdog and pipeline threads.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        self.config.validate()?;
        let reconfigure = self.reconfigure.take().ok_or(WorkerError::AlreadyStarted)?;

        let watchdog = watchdog::spawn_watchdog(
            Arc::clone(&self.shared),
            self.options.watchdog_period,
            reconfigure,
        )
        .map_err(|source| WorkerError::Spawn {
            name: "watchdog",
            source,
        })?;
        self.threads.push(watchdog);

        let pipeline = PipelineLoop {
            config: self.config,
            options: self.options,
            device: Arc::clone(&self.device),
            store: Arc::clone(&self.store),
            shared: Arc::clone(&self.shared),
        };
        let spawned = thread::Builder::new()
            .name("oakd-pipeline".into())
            .spawn(move || pipeline.run());
        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(source) => {
                self.stop();
                self.join();
                Err(WorkerError::Spawn {
                    name: "pipeline",
                    source,
                })
            }
        }
    }

    /// Request a graceful shutdown. Non-blocking and idempotent; see [`join`](Self::join).
    pub fn stop(&self) {
        if self.shared.request_stop() {
            tracing::info!("stopping worker");
        }
    }

    /// Wait for both threads to exit. Blocks until a stop has been requested
    /// and observed by both threads.
    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "worker thread panicked");
            }
        }
        if self.shared.stop_requested() {
            self.shared.mark_stopped();
        }
    }

    /// Read-only handle for consumers on other threads.
    pub fn reader(&self) -> FrameReader {
        FrameReader::new(Arc::clone(&self.store))
    }

    pub fn get_color_image(&self) -> Option<Arc<RgbImage>> {
        self.store.get_color()
    }

    pub fn get_depth_map(&self) -> Option<Arc<DepthMap>> {
        self.store.get_depth()
    }

    pub fn get_point_cloud(&self) -> Option<Arc<PointCloud>> {
        self.store.get_point_cloud()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.phase()
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.failures()
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.shared.reconfigure_pending()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.shared.state(),
            phase: self.shared.phase(),
            failures: self.shared.failures(),
            reconfigure_pending: self.shared.reconfigure_pending(),
            sessions_opened: self.shared.sessions_opened(),
            reconfigurations: self.shared.reconfigurations(),
            frames: self.store.counts(),
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
            self.join();
        }
    }
}

/// Everything the pipeline thread needs, moved onto that thread.
struct PipelineLoop {
    config: CaptureConfig,
    options: WorkerOptions,
    device: Arc<dyn Device>,
    store: Arc<FrameStore>,
    shared: Arc<SharedState>,
}

impl PipelineLoop {
    fn run(self) {
        tracing::info!("pipeline thread started");
        while !self.shared.stop_requested() {
            self.shared.set_phase(WorkerPhase::Idle);
            let Err(err) = self.run_session() else {
                continue;
            };
            if self.shared.stop_requested() {
                tracing::debug!(error = %err, "session ended during shutdown");
                break;
            }

            let failures = self.shared.record_failure();
            if failures <= self.options.failure_threshold {
                tracing::warn!(failures, error = %err, "pipeline failure; rebuilding session");
                continue;
            }

            tracing::error!(
                failures,
                error = %err,
                "exceeded max failures on pipeline loop; requesting reconfigure"
            );
            let escalation = self.shared.escalate();
            self.shared.set_phase(WorkerPhase::Escalated);
            if !self
                .shared
                .wait_for_reconfigure(escalation, self.options.escalation_poll)
            {
                break;
            }
            self.shared.reset_failures();
            self.store.clear();
            tracing::info!(escalation, "reconfigured; restarting pipeline");
        }
        self.shared.set_phase(WorkerPhase::Stopping);
        tracing::info!("stopped and exited pipeline thread");
    }

    /// Open, build and drain one session. Returns `Ok` only when stopped.
    fn run_session(&self) -> Result<(), PipelineError> {
        tracing::debug!(device = self.device.name(), "opening device session");
        let mut session = self
            .device
            .open_session()
            .map_err(SessionOpenError::Open)?;
        let result = self.drive(session.as_mut());
        session.close();
        tracing::debug!("exiting worker camera loop");
        result
    }

    fn drive(&self, session: &mut dyn DeviceSession) -> Result<(), PipelineError> {
        let handles = plan::build(session, &self.config)?;
        let opened = self.shared.record_session_opened();
        if self.shared.clear_reconfigure_flag() {
            tracing::info!(session = opened, "reconfigure flag cleared after rebuild");
        }
        self.shared.set_phase(WorkerPhase::SessionOpen);
        tracing::info!(
            session = opened,
            color = handles.color_stream.is_some(),
            depth = handles.depth_stream.is_some(),
            point_cloud = handles.point_clouds.is_some(),
            "pipeline session open"
        );

        session.start().map_err(SessionOpenError::Start)?;
        self.shared.set_phase(WorkerPhase::Draining);

        let mut healthy = false;
        while !self.shared.stop_requested() {
            let produced = self.drain_once(session, &handles)?;
            if !healthy {
                healthy = true;
                let previous = self.shared.reset_failures();
                if previous > 0 {
                    tracing::info!(previous, "session healthy; failure counter reset");
                }
            }
            if !produced {
                thread::sleep(self.options.idle_backoff);
            }
        }
        Ok(())
    }

    /// Poll each enabled output once. Returns whether any frame was published.
    fn drain_once(
        &self,
        session: &mut dyn DeviceSession,
        handles: &PipelineHandles,
    ) -> Result<bool, DrainError> {
        let mut produced = false;

        if let Some(stream) = handles.color_stream {
            match session
                .try_get(stream, QueueOptions::default())
                .map_err(DrainError::Color)?
            {
                Some(Packet::Color(frame)) => {
                    let rgb = frame.to_rgb()?;
                    tracing::trace!(sequence = frame.sequence, "setting current color image");
                    self.store.set_color(rgb);
                    produced = true;
                }
                Some(other) => {
                    return Err(DrainError::UnexpectedPacket {
                        stream,
                        kind: other.kind(),
                    })
                }
                None => {}
            }
        }

        if let Some(stream) = handles.depth_stream {
            match session
                .try_get(stream, QueueOptions::non_blocking(DEPTH_QUEUE_DEPTH))
                .map_err(DrainError::Depth)?
            {
                Some(Packet::Depth(frame)) => {
                    let depth = frame.resized(self.config.width, self.config.height)?;
                    tracing::trace!(sequence = frame.sequence, "setting current depth map");
                    self.store.set_depth(depth);
                    produced = true;
                }
                Some(other) => {
                    return Err(DrainError::UnexpectedPacket {
                        stream,
                        kind: other.kind(),
                    })
                }
                None => {}
            }
        }

        if let Some(queue) = &handles.point_clouds {
            session.poll().map_err(DrainError::PointCloud)?;
            let mut latest = None;
            loop {
                match queue.try_recv() {
                    Ok(packet) => latest = Some(packet),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(DrainError::PointCloudQueueClosed)
                    }
                }
            }
            if let Some(packet) = latest {
                tracing::trace!(
                    sequence = packet.sequence,
                    points = packet.cloud.len(),
                    "setting current point cloud"
                );
                self.store.set_point_cloud(packet.cloud);
                produced = true;
            }
        }

        Ok(produced)
    }
}
