//! Device-session capability: the contract between the pipeline supervisor
//! and a stereo depth device.
//!
//! A [`Device`] opens [`DeviceSession`]s. On a session the caller registers
//! pipeline nodes, links node outputs to named streams, starts delivery and
//! then polls streams without blocking.

use crate::frame::{BgrFrame, DepthFrame, PointCloudPacket};
use crossbeam_channel::Sender;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("unknown output stream: {0}")]
    UnknownStream(String),
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("pipeline not started")]
    NotStarted,
    #[error("device link lost: {0}")]
    LinkLost(String),
}

/// Identity of a node registered on a session. Only meaningful within that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub u32);

/// Board socket of a mono camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonoSocket {
    Left,
    Right,
}

/// Color camera node producing a preview at a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorCameraSpec {
    pub preview_width: u32,
    pub preview_height: u32,
    pub fps: f32,
}

/// Stereo depth node fed by two mono cameras.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StereoSpec {
    pub left: NodeId,
    pub right: NodeId,
    pub fps: f32,
    /// Node whose reference frame the depth output is aligned to.
    pub align_to: Option<NodeId>,
}

/// Point-cloud node computed from a stereo node's depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointCloudSpec {
    pub stereo: NodeId,
    /// Color camera used to colorize points.
    pub colorize: Option<NodeId>,
}

/// Host-side output queue settings for [`DeviceSession::try_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_size: usize,
    /// Blocking queues stall the device when full; non-blocking ones drop the oldest packet.
    pub blocking: bool,
}

impl QueueOptions {
    pub fn non_blocking(max_size: usize) -> Self {
        Self {
            max_size,
            blocking: false,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            blocking: true,
        }
    }
}

/// A packet read from a named output stream.
pub enum Packet {
    Color(BgrFrame),
    Depth(DepthFrame),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Color(_) => "color",
            Packet::Depth(_) => "depth",
        }
    }
}

/// An open handle to a capture device.
///
/// Node registration is only valid before [`start`](Self::start).
pub trait DeviceSession: Send {
    fn create_color_camera(&mut self, spec: ColorCameraSpec) -> Result<NodeId, SessionError>;

    fn create_mono_camera(&mut self, socket: MonoSocket, fps: f32)
        -> Result<NodeId, SessionError>;

    fn create_stereo(&mut self, spec: StereoSpec) -> Result<NodeId, SessionError>;

    /// Register a point-cloud node. Completed packets are pushed into `sink`
    /// with `try_send` during [`poll`](Self::poll); a full sink drops the packet.
    fn create_pointcloud(
        &mut self,
        spec: PointCloudSpec,
        sink: Sender<PointCloudPacket>,
    ) -> Result<NodeId, SessionError>;

    /// Route a node's primary output to a named host stream.
    fn link_output(&mut self, node: NodeId, stream: &str) -> Result<(), SessionError>;

    /// Start delivery in non-blocking mode.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Take the next packet from `stream` if one is available. Never waits for one.
    fn try_get(
        &mut self,
        stream: &str,
        queue: QueueOptions,
    ) -> Result<Option<Packet>, SessionError>;

    /// Run pending device callbacks once.
    fn poll(&mut self) -> Result<(), SessionError>;

    /// Release the device. Further calls fail with [`SessionError::NotStarted`].
    fn close(&mut self);
}

/// Factory for sessions on one physical (or simulated) device.
pub trait Device: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    fn open_session(&self) -> Result<Box<dyn DeviceSession>, SessionError>;
}
