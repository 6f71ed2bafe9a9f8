//! Simulated stereo depth device.
//!
//! Produces synthetic color, depth and point-cloud frames paced at the
//! requested frame rate, and supports fault injection (open failures,
//! node rejection, link loss while draining) so the supervisor's recovery
//! paths can be exercised without hardware.

use crate::frame::{self, BgrFrame, CameraIntrinsics, DepthFrame, PointCloud, PointCloudPacket};
use crate::session::{
    ColorCameraSpec, Device, DeviceSession, MonoSocket, NodeId, Packet, PointCloudSpec,
    QueueOptions, SessionError, StereoSpec,
};
use crossbeam_channel::{Sender, TrySendError};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Native resolution of the simulated mono sensors (400p).
const MONO_WIDTH: u32 = 640;
const MONO_HEIGHT: u32 = 400;
const MONO_HFOV_DEG: f32 = 72.0;
/// Largest preview the simulated color sensor (12 MP) accepts.
const MAX_PREVIEW_WIDTH: u32 = 4056;
const MAX_PREVIEW_HEIGHT: u32 = 3040;
const MAX_FPS: f32 = 120.0;
/// Point clouds are computed on every Nth depth pixel.
const POINTCLOUD_STRIDE: usize = 8;

/// A node registered on a simulated session, as recorded for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SimulatedNode {
    Color(ColorCameraSpec),
    Mono { socket: MonoSocket, fps: f32 },
    Stereo(StereoSpec),
    PointCloud(PointCloudSpec),
    Output { node: NodeId, stream: String },
}

#[derive(Default)]
struct SimShared {
    open_failures: AtomicU32,
    build_rejections: AtomicU32,
    drain_failures: AtomicU32,
    sessions_opened: AtomicU32,
    open_sessions: AtomicU32,
    last_nodes: Mutex<Vec<SimulatedNode>>,
}

/// Decrement an injected-fault budget, returning whether a fault fires.
fn take_fault(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Simulated device handle. Clones share state, so a test can keep one
/// clone for fault injection and inspection while the worker owns another.
#[derive(Clone)]
pub struct SimulatedDevice {
    name: String,
    shared: Arc<SimShared>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new("sim-oak")
    }
}

impl SimulatedDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::new(SimShared::default()),
        }
    }

    /// Make the next `n` session opens fail with [`SessionError::DeviceBusy`].
    pub fn inject_open_failures(&self, n: u32) {
        self.shared.open_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next `n` node registrations fail with [`SessionError::UnsupportedConfig`].
    pub fn inject_build_rejections(&self, n: u32) {
        self.shared.build_rejections.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next `n` stream reads or event pumps fail with [`SessionError::LinkLost`].
    pub fn inject_drain_failures(&self, n: u32) {
        self.shared.drain_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Total sessions successfully opened since creation.
    pub fn sessions_opened(&self) -> u32 {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open (0 or 1).
    pub fn open_sessions(&self) -> u32 {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Nodes registered on the most recently opened session.
    pub fn registered_nodes(&self) -> Vec<SimulatedNode> {
        match self.shared.last_nodes.lock() {
            Ok(nodes) => nodes.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl Device for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_session(&self) -> Result<Box<dyn DeviceSession>, SessionError> {
        if take_fault(&self.shared.open_failures) {
            tracing::debug!(device = %self.name, "injected open failure");
            return Err(SessionError::DeviceBusy);
        }
        // The device accepts a single host connection.
        if self
            .shared
            .open_sessions
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::DeviceBusy);
        }

        let session_id = self.shared.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut nodes) = self.shared.last_nodes.lock() {
            nodes.clear();
        }
        tracing::debug!(device = %self.name, session = session_id, "simulated session opened");

        Ok(Box::new(SimulatedSession {
            shared: Arc::clone(&self.shared),
            nodes: HashMap::new(),
            outputs: HashMap::new(),
            pointclouds: Vec::new(),
            next_id: 0,
            started: false,
            closed: false,
        }))
    }
}

/// Pacing and sequence state for one output stream or point-cloud node.
struct Pacer {
    interval: Duration,
    next_due: Instant,
    sequence: u32,
}

impl Pacer {
    fn new(fps: f32) -> Self {
        Self {
            interval: Duration::from_secs_f32(1.0 / fps),
            next_due: Instant::now(),
            sequence: 0,
        }
    }

    /// Returns the next sequence number if a frame is due.
    fn tick(&mut self, now: Instant) -> Option<u32> {
        if now < self.next_due {
            return None;
        }
        // Late frames are dropped, not queued up.
        self.next_due = now + self.interval;
        self.sequence = self.sequence.wrapping_add(1);
        Some(self.sequence)
    }
}

struct StreamState {
    node: NodeId,
    pacer: Option<Pacer>,
}

struct PointCloudNode {
    spec: PointCloudSpec,
    sink: Sender<PointCloudPacket>,
    pacer: Option<Pacer>,
}

struct SimulatedSession {
    shared: Arc<SimShared>,
    nodes: HashMap<NodeId, SimulatedNode>,
    outputs: HashMap<String, StreamState>,
    pointclouds: Vec<PointCloudNode>,
    next_id: u32,
    started: bool,
    closed: bool,
}

impl SimulatedSession {
    fn ensure_configurable(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::NotStarted);
        }
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        if take_fault(&self.shared.build_rejections) {
            return Err(SessionError::UnsupportedConfig(
                "injected node rejection".into(),
            ));
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.closed || !self.started {
            return Err(SessionError::NotStarted);
        }
        if take_fault(&self.shared.drain_failures) {
            return Err(SessionError::LinkLost("injected link loss".into()));
        }
        Ok(())
    }

    fn register(&mut self, node: SimulatedNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        if let Ok(mut nodes) = self.shared.last_nodes.lock() {
            nodes.push(node.clone());
        }
        self.nodes.insert(id, node);
        id
    }

    fn color_spec(&self, id: NodeId) -> Result<ColorCameraSpec, SessionError> {
        match self.nodes.get(&id) {
            Some(SimulatedNode::Color(spec)) => Ok(*spec),
            _ => Err(SessionError::UnknownNode(id)),
        }
    }

    fn stereo_spec(&self, id: NodeId) -> Result<StereoSpec, SessionError> {
        match self.nodes.get(&id) {
            Some(SimulatedNode::Stereo(spec)) => Ok(*spec),
            _ => Err(SessionError::UnknownNode(id)),
        }
    }

    /// Output size of a stereo node: the color preview when aligned, else the mono sensor.
    fn depth_size(&self, stereo: &StereoSpec) -> (u32, u32) {
        stereo
            .align_to
            .and_then(|id| self.color_spec(id).ok())
            .map(|c| (c.preview_width, c.preview_height))
            .unwrap_or((MONO_WIDTH, MONO_HEIGHT))
    }

    fn node_fps(&self, id: NodeId) -> Option<f32> {
        match self.nodes.get(&id)? {
            SimulatedNode::Color(spec) => Some(spec.fps),
            SimulatedNode::Stereo(spec) => Some(spec.fps),
            _ => None,
        }
    }

    fn make_packet(&self, node: NodeId, sequence: u32) -> Option<Packet> {
        match self.nodes.get(&node)? {
            SimulatedNode::Color(spec) => Some(Packet::Color(synth_color(
                spec.preview_width,
                spec.preview_height,
                sequence,
            ))),
            SimulatedNode::Stereo(spec) => {
                let (w, h) = self.depth_size(spec);
                Some(Packet::Depth(synth_depth(w, h, sequence)))
            }
            _ => None,
        }
    }
}

impl DeviceSession for SimulatedSession {
    fn create_color_camera(&mut self, spec: ColorCameraSpec) -> Result<NodeId, SessionError> {
        self.ensure_configurable()?;
        if spec.preview_width == 0
            || spec.preview_height == 0
            || spec.preview_width > MAX_PREVIEW_WIDTH
            || spec.preview_height > MAX_PREVIEW_HEIGHT
        {
            return Err(SessionError::UnsupportedConfig(format!(
                "preview {}x{} outside 1x1..{MAX_PREVIEW_WIDTH}x{MAX_PREVIEW_HEIGHT}",
                spec.preview_width, spec.preview_height
            )));
        }
        check_fps(spec.fps)?;
        Ok(self.register(SimulatedNode::Color(spec)))
    }

    fn create_mono_camera(
        &mut self,
        socket: MonoSocket,
        fps: f32,
    ) -> Result<NodeId, SessionError> {
        self.ensure_configurable()?;
        check_fps(fps)?;
        Ok(self.register(SimulatedNode::Mono { socket, fps }))
    }

    fn create_stereo(&mut self, spec: StereoSpec) -> Result<NodeId, SessionError> {
        self.ensure_configurable()?;
        check_fps(spec.fps)?;
        for (id, expected) in [(spec.left, MonoSocket::Left), (spec.right, MonoSocket::Right)] {
            match self.nodes.get(&id) {
                Some(SimulatedNode::Mono { socket, .. }) if *socket == expected => {}
                _ => return Err(SessionError::UnknownNode(id)),
            }
        }
        if let Some(align) = spec.align_to {
            self.color_spec(align)?;
        }
        Ok(self.register(SimulatedNode::Stereo(spec)))
    }

    fn create_pointcloud(
        &mut self,
        spec: PointCloudSpec,
        sink: Sender<PointCloudPacket>,
    ) -> Result<NodeId, SessionError> {
        self.ensure_configurable()?;
        self.stereo_spec(spec.stereo)?;
        if let Some(color) = spec.colorize {
            self.color_spec(color)?;
        }
        let id = self.register(SimulatedNode::PointCloud(spec));
        self.pointclouds.push(PointCloudNode {
            spec,
            sink,
            pacer: None,
        });
        Ok(id)
    }

    fn link_output(&mut self, node: NodeId, stream: &str) -> Result<(), SessionError> {
        self.ensure_configurable()?;
        if self.node_fps(node).is_none() {
            return Err(SessionError::UnknownNode(node));
        }
        self.register(SimulatedNode::Output {
            node,
            stream: stream.to_string(),
        });
        self.outputs
            .insert(stream.to_string(), StreamState { node, pacer: None });
        Ok(())
    }

    fn start(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::NotStarted);
        }
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        let fps: HashMap<NodeId, f32> = self
            .nodes
            .keys()
            .filter_map(|id| self.node_fps(*id).map(|f| (*id, f)))
            .collect();
        for stream in self.outputs.values_mut() {
            stream.pacer = fps.get(&stream.node).map(|f| Pacer::new(*f));
        }
        for pc in &mut self.pointclouds {
            pc.pacer = fps.get(&pc.spec.stereo).map(|f| Pacer::new(*f));
        }
        self.started = true;
        tracing::debug!(
            nodes = self.nodes.len(),
            streams = self.outputs.len(),
            "simulated pipeline started"
        );
        Ok(())
    }

    fn try_get(
        &mut self,
        stream: &str,
        queue: QueueOptions,
    ) -> Result<Option<Packet>, SessionError> {
        self.ensure_running()?;
        if queue.max_size == 0 {
            return Err(SessionError::UnsupportedConfig(
                "output queue size must be at least 1".into(),
            ));
        }
        let now = Instant::now();
        let Some(state) = self.outputs.get_mut(stream) else {
            return Err(SessionError::UnknownStream(stream.to_string()));
        };
        let node = state.node;
        let Some(sequence) = state.pacer.as_mut().and_then(|p| p.tick(now)) else {
            return Ok(None);
        };
        Ok(self.make_packet(node, sequence))
    }

    fn poll(&mut self) -> Result<(), SessionError> {
        self.ensure_running()?;
        let now = Instant::now();

        let mut due = Vec::new();
        for (idx, pc) in self.pointclouds.iter_mut().enumerate() {
            if let Some(sequence) = pc.pacer.as_mut().and_then(|p| p.tick(now)) {
                due.push((idx, sequence));
            }
        }

        for (idx, sequence) in due {
            let spec = self.pointclouds[idx].spec;
            let stereo = self.stereo_spec(spec.stereo)?;
            let (w, h) = self.depth_size(&stereo);
            let depth = synth_depth(w, h, sequence);
            let intrinsics = CameraIntrinsics::from_hfov(w, h, MONO_HFOV_DEG);
            let points = frame::unproject_depth(&depth.data, w, h, &intrinsics, POINTCLOUD_STRIDE)
                .map_err(|e| SessionError::LinkLost(format!("point cloud: {e}")))?;
            let colors = match spec.colorize {
                Some(_) => Some(synth_point_colors(w, h, POINTCLOUD_STRIDE, sequence)),
                None => None,
            };
            let packet = PointCloudPacket {
                cloud: PointCloud { points, colors },
                timestamp: now,
                sequence,
            };
            match self.pointclouds[idx].sink.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(sequence, "point cloud queue full; dropping packet");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.started = false;
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("simulated session closed");
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_fps(fps: f32) -> Result<(), SessionError> {
    if !(fps.is_finite() && fps > 0.0 && fps <= MAX_FPS) {
        return Err(SessionError::UnsupportedConfig(format!(
            "frame rate {fps} outside (0, {MAX_FPS}]"
        )));
    }
    Ok(())
}

/// Diagonal BGR gradient that scrolls with the sequence number.
fn synth_color(width: u32, height: u32, sequence: u32) -> BgrFrame {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            data.push((x.wrapping_add(sequence) & 0xff) as u8);
            data.push((y & 0xff) as u8);
            data.push(128);
        }
    }
    BgrFrame {
        data,
        width,
        height,
        timestamp: Instant::now(),
        sequence,
    }
}

/// Tilted plane between roughly 0.8 m and 2.1 m; never zero.
fn synth_depth(width: u32, height: u32, sequence: u32) -> DepthFrame {
    let mut data = Vec::with_capacity(width as usize * height as usize);
    let wobble = (sequence % 50) as u16;
    for y in 0..height {
        for x in 0..width {
            let ramp = (x * 1000 / width.max(1)) as u16;
            let tilt = (y * 200 / height.max(1)) as u16;
            data.push(800 + ramp + tilt + wobble);
        }
    }
    DepthFrame {
        data,
        width,
        height,
        timestamp: Instant::now(),
        sequence,
    }
}

/// Per-point RGB colors in the same sampling order as `unproject_depth`.
fn synth_point_colors(width: u32, height: u32, stride: usize, sequence: u32) -> Array2<u8> {
    let mut flat = Vec::new();
    for v in (0..height).step_by(stride) {
        for u in (0..width).step_by(stride) {
            flat.push(128);
            flat.push((v & 0xff) as u8);
            flat.push((u.wrapping_add(sequence) & 0xff) as u8);
        }
    }
    let rows = flat.len() / 3;
    Array2::from_shape_vec((rows, 3), flat).unwrap_or_else(|_| Array2::zeros((0, 3)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn color_spec(w: u32, h: u32) -> ColorCameraSpec {
        ColorCameraSpec {
            preview_width: w,
            preview_height: h,
            fps: 30.0,
        }
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out waiting for packet");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_single_host_connection() {
        let device = SimulatedDevice::default();
        let first = device.open_session().unwrap();
        assert!(matches!(device.open_session(), Err(SessionError::DeviceBusy)));
        drop(first);
        assert_eq!(device.open_sessions(), 0);
        assert!(device.open_session().is_ok());
        assert_eq!(device.sessions_opened(), 2);
    }

    #[test]
    fn test_injected_open_failures_are_consumed() {
        let device = SimulatedDevice::default();
        device.inject_open_failures(2);
        assert!(device.open_session().is_err());
        assert!(device.open_session().is_err());
        assert!(device.open_session().is_ok());
        assert_eq!(device.sessions_opened(), 1);
    }

    #[test]
    fn test_color_stream_delivers_preview_size() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let color = session.create_color_camera(color_spec(64, 48)).unwrap();
        session.link_output(color, "rgb").unwrap();
        session.start().unwrap();

        let packet = wait_for(|| session.try_get("rgb", QueueOptions::default()).unwrap());
        let Packet::Color(frame) = packet else {
            panic!("expected color packet");
        };
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn test_try_get_before_start_fails() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let color = session.create_color_camera(color_spec(8, 8)).unwrap();
        session.link_output(color, "rgb").unwrap();
        assert!(matches!(
            session.try_get("rgb", QueueOptions::default()),
            Err(SessionError::NotStarted)
        ));
    }

    #[test]
    fn test_unknown_stream() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        session.start().unwrap();
        assert!(matches!(
            session.try_get("depth", QueueOptions::non_blocking(4)),
            Err(SessionError::UnknownStream(_))
        ));
    }

    #[test]
    fn test_unsupported_preview_rejected() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        assert!(matches!(
            session.create_color_camera(color_spec(8000, 8000)),
            Err(SessionError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn test_stereo_requires_mono_inputs() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let color = session.create_color_camera(color_spec(8, 8)).unwrap();
        let result = session.create_stereo(StereoSpec {
            left: color,
            right: color,
            fps: 30.0,
            align_to: None,
        });
        assert!(matches!(result, Err(SessionError::UnknownNode(_))));
    }

    #[test]
    fn test_aligned_depth_uses_color_size() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let color = session.create_color_camera(color_spec(32, 24)).unwrap();
        let left = session.create_mono_camera(MonoSocket::Left, 30.0).unwrap();
        let right = session.create_mono_camera(MonoSocket::Right, 30.0).unwrap();
        let stereo = session
            .create_stereo(StereoSpec {
                left,
                right,
                fps: 30.0,
                align_to: Some(color),
            })
            .unwrap();
        session.link_output(stereo, "depth").unwrap();
        session.start().unwrap();

        let packet = wait_for(|| session.try_get("depth", QueueOptions::non_blocking(4)).unwrap());
        let Packet::Depth(depth) = packet else {
            panic!("expected depth packet");
        };
        assert_eq!((depth.width, depth.height), (32, 24));
        assert!(depth.data.iter().all(|&d| d > 0));
    }

    #[test]
    fn test_pointcloud_delivered_on_poll() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let left = session.create_mono_camera(MonoSocket::Left, 30.0).unwrap();
        let right = session.create_mono_camera(MonoSocket::Right, 30.0).unwrap();
        let stereo = session
            .create_stereo(StereoSpec {
                left,
                right,
                fps: 30.0,
                align_to: None,
            })
            .unwrap();
        let (tx, rx) = crossbeam_channel::bounded(4);
        session
            .create_pointcloud(
                PointCloudSpec {
                    stereo,
                    colorize: None,
                },
                tx,
            )
            .unwrap();
        session.start().unwrap();

        let packet = wait_for(|| {
            session.poll().unwrap();
            rx.try_recv().ok()
        });
        let expected = (MONO_WIDTH as usize / POINTCLOUD_STRIDE) * (MONO_HEIGHT as usize / POINTCLOUD_STRIDE);
        assert_eq!(packet.cloud.len(), expected);
        assert!(packet.cloud.colors.is_none());
    }

    #[test]
    fn test_injected_drain_failure() {
        let device = SimulatedDevice::default();
        device.inject_drain_failures(1);
        let mut session = device.open_session().unwrap();
        session.start().unwrap();
        assert!(matches!(session.poll(), Err(SessionError::LinkLost(_))));
        assert!(session.poll().is_ok());
    }

    #[test]
    fn test_registered_nodes_recorded() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        session.create_color_camera(color_spec(8, 8)).unwrap();
        assert_eq!(
            device.registered_nodes(),
            vec![SimulatedNode::Color(color_spec(8, 8))]
        );
    }

    #[test]
    fn test_colored_points_match_point_count() {
        let colors = synth_point_colors(64, 40, 8, 1);
        let depth = synth_depth(64, 40, 1);
        let k = CameraIntrinsics::from_hfov(64, 40, MONO_HFOV_DEG);
        let points = frame::unproject_depth(&depth.data, 64, 40, &k, 8).unwrap();
        assert_eq!(colors.nrows(), points.nrows());
    }
}
