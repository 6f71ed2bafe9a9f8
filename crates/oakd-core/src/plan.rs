//! Conditional pipeline construction.
//!
//! Capture flags are turned into a [`BuildPlan`]: an ordered list of the
//! nodes a session needs. The plan makes the cross-node dependencies
//! explicit (point cloud needs depth, alignment and colorization need
//! color) and is checked before anything is registered on the device.

use crate::config::CaptureConfig;
use crossbeam_channel::Receiver;
use oakd_hw::{
    ColorCameraSpec, DeviceSession, MonoSocket, NodeId, PointCloudPacket, PointCloudSpec,
    SessionError, StereoSpec,
};
use serde::Serialize;
use thiserror::Error;

pub const RGB_STREAM: &str = "rgb";
pub const DEPTH_STREAM: &str = "depth";
/// Capacity of the point-cloud delivery queue between device and drain loop.
pub const POINTCLOUD_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum PipelineBuildError {
    #[error("invalid build plan: {0}")]
    InvalidPlan(String),
    #[error("{node} node rejected by device: {source}")]
    NodeRejected {
        node: &'static str,
        source: SessionError,
    },
}

fn rejected(node: &'static str) -> impl FnOnce(SessionError) -> PipelineBuildError {
    move |source| PipelineBuildError::NodeRejected { node, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlannedNode {
    /// Color camera with a `width × height` preview.
    Color { width: u32, height: u32, fps: f32 },
    /// Left/right mono cameras feeding a stereo depth node.
    StereoDepth { fps: f32, align_to_color: bool },
    /// Point cloud computed from the stereo depth node.
    PointCloud { colorize: bool },
}

impl PlannedNode {
    fn label(&self) -> &'static str {
        match self {
            PlannedNode::Color { .. } => "color",
            PlannedNode::StereoDepth { .. } => "stereo",
            PlannedNode::PointCloud { .. } => "point_cloud",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildPlan {
    pub nodes: Vec<PlannedNode>,
}

impl BuildPlan {
    pub fn from_config(config: &CaptureConfig) -> Self {
        let mut nodes = Vec::with_capacity(3);
        if config.capture_color {
            nodes.push(PlannedNode::Color {
                width: config.width,
                height: config.height,
                fps: config.frame_rate,
            });
        }
        if config.capture_depth {
            nodes.push(PlannedNode::StereoDepth {
                fps: config.frame_rate,
                align_to_color: config.capture_color,
            });
            nodes.push(PlannedNode::PointCloud {
                colorize: config.capture_color,
            });
        }
        Self { nodes }
    }

    /// Check node order and dependencies. Every node may appear at most once.
    pub fn validate(&self) -> Result<(), PipelineBuildError> {
        let mut color = false;
        let mut depth = false;
        let mut point_cloud = false;

        for node in &self.nodes {
            match *node {
                PlannedNode::Color { width, height, fps } => {
                    if color {
                        return Err(duplicate(node));
                    }
                    if width == 0 || height == 0 || !(fps.is_finite() && fps > 0.0) {
                        return Err(PipelineBuildError::InvalidPlan(format!(
                            "color node {width}x{height} @ {fps} fps"
                        )));
                    }
                    color = true;
                }
                PlannedNode::StereoDepth { fps, align_to_color } => {
                    if depth {
                        return Err(duplicate(node));
                    }
                    if !(fps.is_finite() && fps > 0.0) {
                        return Err(PipelineBuildError::InvalidPlan(format!(
                            "stereo node @ {fps} fps"
                        )));
                    }
                    if align_to_color && !color {
                        return Err(PipelineBuildError::InvalidPlan(
                            "depth alignment requires a preceding color node".into(),
                        ));
                    }
                    depth = true;
                }
                PlannedNode::PointCloud { colorize } => {
                    if point_cloud {
                        return Err(duplicate(node));
                    }
                    if !depth {
                        return Err(PipelineBuildError::InvalidPlan(
                            "point cloud requires a preceding stereo depth node".into(),
                        ));
                    }
                    if colorize && !color {
                        return Err(PipelineBuildError::InvalidPlan(
                            "point cloud colorization requires a preceding color node".into(),
                        ));
                    }
                    point_cloud = true;
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_color(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n, PlannedNode::Color { .. }))
    }

    pub fn has_depth(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n, PlannedNode::StereoDepth { .. }))
    }

    pub fn has_point_cloud(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n, PlannedNode::PointCloud { .. }))
    }
}

fn duplicate(node: &PlannedNode) -> PipelineBuildError {
    PipelineBuildError::InvalidPlan(format!("duplicate {} node", node.label()))
}

/// What the drain loop polls for one session.
#[derive(Default)]
pub struct PipelineHandles {
    pub color_stream: Option<&'static str>,
    pub depth_stream: Option<&'static str>,
    pub point_clouds: Option<Receiver<PointCloudPacket>>,
}

impl PipelineHandles {
    pub fn is_empty(&self) -> bool {
        self.color_stream.is_none() && self.depth_stream.is_none() && self.point_clouds.is_none()
    }
}

/// Wire the nodes requested by `config` onto `session`.
pub fn build(
    session: &mut dyn DeviceSession,
    config: &CaptureConfig,
) -> Result<PipelineHandles, PipelineBuildError> {
    build_plan(session, &BuildPlan::from_config(config))
}

pub fn build_plan(
    session: &mut dyn DeviceSession,
    plan: &BuildPlan,
) -> Result<PipelineHandles, PipelineBuildError> {
    plan.validate()?;

    let mut handles = PipelineHandles::default();
    let mut color: Option<NodeId> = None;
    let mut stereo: Option<NodeId> = None;

    for node in &plan.nodes {
        match *node {
            PlannedNode::Color { width, height, fps } => {
                tracing::debug!(width, height, fps, "creating pipeline node: color camera");
                let id = session
                    .create_color_camera(ColorCameraSpec {
                        preview_width: width,
                        preview_height: height,
                        fps,
                    })
                    .map_err(rejected("color"))?;
                session
                    .link_output(id, RGB_STREAM)
                    .map_err(rejected("color"))?;
                color = Some(id);
                handles.color_stream = Some(RGB_STREAM);
            }
            PlannedNode::StereoDepth {
                fps,
                align_to_color,
            } => {
                tracing::debug!(fps, align_to_color, "creating pipeline node: stereo depth");
                let left = session
                    .create_mono_camera(MonoSocket::Left, fps)
                    .map_err(rejected("mono_left"))?;
                let right = session
                    .create_mono_camera(MonoSocket::Right, fps)
                    .map_err(rejected("mono_right"))?;
                let align_to = if align_to_color { color } else { None };
                let id = session
                    .create_stereo(StereoSpec {
                        left,
                        right,
                        fps,
                        align_to,
                    })
                    .map_err(rejected("stereo"))?;
                session
                    .link_output(id, DEPTH_STREAM)
                    .map_err(rejected("stereo"))?;
                stereo = Some(id);
                handles.depth_stream = Some(DEPTH_STREAM);
            }
            PlannedNode::PointCloud { colorize } => {
                tracing::debug!(colorize, "creating pipeline node: point cloud");
                let Some(stereo) = stereo else {
                    return Err(PipelineBuildError::InvalidPlan(
                        "point cloud requires a stereo node".into(),
                    ));
                };
                let (tx, rx) = crossbeam_channel::bounded(POINTCLOUD_QUEUE_DEPTH);
                session
                    .create_pointcloud(
                        PointCloudSpec {
                            stereo,
                            colorize: if colorize { color } else { None },
                        },
                        tx,
                    )
                    .map_err(rejected("point_cloud"))?;
                handles.point_clouds = Some(rx);
            }
        }
    }

    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakd_hw::{Device, SimulatedDevice, SimulatedNode};

    fn config(capture_color: bool, capture_depth: bool) -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 48,
            frame_rate: 30.0,
            capture_color,
            capture_depth,
        }
    }

    #[test]
    fn test_plan_color_and_depth() {
        let plan = BuildPlan::from_config(&config(true, true));
        assert_eq!(
            plan.nodes,
            vec![
                PlannedNode::Color {
                    width: 64,
                    height: 48,
                    fps: 30.0
                },
                PlannedNode::StereoDepth {
                    fps: 30.0,
                    align_to_color: true
                },
                PlannedNode::PointCloud { colorize: true },
            ]
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_depth_only_is_not_aligned_or_colorized() {
        let plan = BuildPlan::from_config(&config(false, true));
        assert!(!plan.has_color());
        assert!(plan.has_point_cloud());
        assert!(plan.nodes.contains(&PlannedNode::StereoDepth {
            fps: 30.0,
            align_to_color: false
        }));
        assert!(plan.nodes.contains(&PlannedNode::PointCloud { colorize: false }));
    }

    #[test]
    fn test_plan_neither_is_empty_but_valid() {
        let plan = BuildPlan::from_config(&config(false, false));
        assert!(plan.is_empty());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_point_cloud_without_depth() {
        let plan = BuildPlan {
            nodes: vec![PlannedNode::PointCloud { colorize: false }],
        };
        assert!(matches!(
            plan.validate(),
            Err(PipelineBuildError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_validate_alignment_without_color() {
        let plan = BuildPlan {
            nodes: vec![PlannedNode::StereoDepth {
                fps: 30.0,
                align_to_color: true,
            }],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_node() {
        let node = PlannedNode::StereoDepth {
            fps: 30.0,
            align_to_color: false,
        };
        let plan = BuildPlan {
            nodes: vec![node, node],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_serializes_tagged() {
        let plan = BuildPlan::from_config(&config(false, true));
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["nodes"][0]["node"], "stereo_depth");
        assert_eq!(json["nodes"][1]["colorize"], false);
    }

    #[test]
    fn test_build_neither_gives_empty_handles() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let handles = build(session.as_mut(), &config(false, false)).unwrap();
        assert!(handles.is_empty());
        assert!(device.registered_nodes().is_empty());
    }

    #[test]
    fn test_build_color_only() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let handles = build(session.as_mut(), &config(true, false)).unwrap();
        assert_eq!(handles.color_stream, Some(RGB_STREAM));
        assert!(handles.depth_stream.is_none());
        assert!(handles.point_clouds.is_none());
    }

    #[test]
    fn test_build_depth_only_wiring() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        let handles = build(session.as_mut(), &config(false, true)).unwrap();
        assert!(handles.color_stream.is_none());
        assert_eq!(handles.depth_stream, Some(DEPTH_STREAM));
        assert!(handles.point_clouds.is_some());

        let nodes = device.registered_nodes();
        assert!(!nodes.iter().any(|n| matches!(n, SimulatedNode::Color(_))));
        assert!(nodes
            .iter()
            .any(|n| matches!(n, SimulatedNode::Stereo(s) if s.align_to.is_none())));
        assert!(nodes
            .iter()
            .any(|n| matches!(n, SimulatedNode::PointCloud(p) if p.colorize.is_none())));
    }

    #[test]
    fn test_build_color_and_depth_aligns_to_color() {
        let device = SimulatedDevice::default();
        let mut session = device.open_session().unwrap();
        build(session.as_mut(), &config(true, true)).unwrap();

        let nodes = device.registered_nodes();
        let color_id = NodeId(0);
        assert_eq!(
            nodes[0],
            SimulatedNode::Color(ColorCameraSpec {
                preview_width: 64,
                preview_height: 48,
                fps: 30.0
            })
        );
        assert!(nodes
            .iter()
            .any(|n| matches!(n, SimulatedNode::Stereo(s) if s.align_to == Some(color_id))));
        assert!(nodes
            .iter()
            .any(|n| matches!(n, SimulatedNode::PointCloud(p) if p.colorize == Some(color_id))));
    }

    #[test]
    fn test_build_surfaces_node_rejection() {
        let device = SimulatedDevice::default();
        device.inject_build_rejections(1);
        let mut session = device.open_session().unwrap();
        let err = build(session.as_mut(), &config(true, false)).err().unwrap();
        assert!(matches!(
            err,
            PipelineBuildError::NodeRejected { node: "color", .. }
        ));
    }
}
