//! oakd-hw — Hardware abstraction for stereo depth capture devices.
//!
//! Defines the device-session capability the pipeline supervisor drives
//! (node registration, output queues, event pump), the frame types those
//! queues carry, and a simulated device implementing the capability.

pub mod frame;
pub mod session;
pub mod sim;

pub use frame::{BgrFrame, CameraIntrinsics, DepthFrame, FrameError, PointCloud, PointCloudPacket};
pub use session::{
    ColorCameraSpec, Device, DeviceSession, MonoSocket, NodeId, Packet, PointCloudSpec,
    QueueOptions, SessionError, StereoSpec,
};
pub use sim::{SimulatedDevice, SimulatedNode};
