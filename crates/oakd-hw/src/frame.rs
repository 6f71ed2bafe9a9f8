//! Frame types and conversions — BGR to RGB, depth resizing, depth unprojection.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use ndarray::Array2;
use std::time::Instant;

/// A color frame as delivered by the device: packed 8-bit BGR, row-major.
#[derive(Clone)]
pub struct BgrFrame {
    /// Pixel data (width * height * 3 bytes, B G R order).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl BgrFrame {
    /// Convert to an RGB image (the order readers expect).
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        bgr_to_rgb(&self.data, self.width, self.height)
    }
}

/// A stereo depth frame: 16-bit depth in millimetres, row-major.
///
/// Zero means "no depth" (invalid disparity).
#[derive(Clone)]
pub struct DepthFrame {
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl DepthFrame {
    /// Resize to `(width, height)` and return as a `height × width` array.
    pub fn resized(&self, width: u32, height: u32) -> Result<Array2<u16>, FrameError> {
        resize_depth(&self.data, self.width, self.height, width, height)
    }
}

/// A point cloud: one row per point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    /// N×3 positions in metres (x right, y down, z forward).
    pub points: Array2<f32>,
    /// N×3 RGB colors, present when the cloud was colorized by the color camera.
    pub colors: Option<Array2<u8>>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }
}

/// A completed packet from the device's point-cloud node.
#[derive(Debug, Clone)]
pub struct PointCloudPacket {
    pub cloud: PointCloud,
    pub timestamp: Instant,
    pub sequence: u32,
}

/// Pinhole intrinsics of the depth reference camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl CameraIntrinsics {
    /// Intrinsics for a sensor of the given size with a horizontal field of view in degrees.
    pub fn from_hfov(width: u32, height: u32, hfov_deg: f32) -> Self {
        let fx = (width as f32 / 2.0) / (hfov_deg.to_radians() / 2.0).tan();
        Self {
            fx,
            fy: fx,
            cx: width as f32 / 2.0,
            cy: height as f32 / 2.0,
        }
    }
}

/// Convert packed BGR to an RGB image by swapping the first and third channel.
pub fn bgr_to_rgb(bgr: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize * 3;
    if bgr.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: bgr.len(),
        });
    }
    let mut rgb = bgr[..expected].to_vec();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidDimensions { width, height })
}

/// Resize a depth buffer with nearest-neighbour sampling.
///
/// Interpolating filters would invent depths across object edges, so only
/// nearest is used. Returns a `dst_height × dst_width` array.
pub fn resize_depth(
    depth: &[u16],
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Result<Array2<u16>, FrameError> {
    let expected = src_width as usize * src_height as usize;
    if depth.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: depth.len(),
        });
    }
    if dst_width == 0 || dst_height == 0 {
        return Err(FrameError::InvalidDimensions {
            width: dst_width,
            height: dst_height,
        });
    }

    let src: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(src_width, src_height, depth[..expected].to_vec()).ok_or(
            FrameError::InvalidDimensions {
                width: src_width,
                height: src_height,
            },
        )?;

    let resized = if (src_width, src_height) == (dst_width, dst_height) {
        src
    } else {
        imageops::resize(&src, dst_width, dst_height, FilterType::Nearest)
    };

    Array2::from_shape_vec(
        (dst_height as usize, dst_width as usize),
        resized.into_raw(),
    )
    .map_err(|e| FrameError::Shape(e.to_string()))
}

/// Unproject a depth buffer into an N×3 point array (metres).
///
/// Samples every `stride`-th pixel in both directions and skips zero depth.
pub fn unproject_depth(
    depth: &[u16],
    width: u32,
    height: u32,
    intrinsics: &CameraIntrinsics,
    stride: usize,
) -> Result<Array2<f32>, FrameError> {
    let w = width as usize;
    let h = height as usize;
    if depth.len() < w * h {
        return Err(FrameError::InvalidLength {
            expected: w * h,
            actual: depth.len(),
        });
    }
    let stride = stride.max(1);

    let mut flat = Vec::with_capacity((w / stride + 1) * (h / stride + 1) * 3);
    for v in (0..h).step_by(stride) {
        for u in (0..w).step_by(stride) {
            let d = depth[v * w + u];
            if d == 0 {
                continue;
            }
            let z = d as f32 / 1000.0;
            flat.push((u as f32 - intrinsics.cx) * z / intrinsics.fx);
            flat.push((v as f32 - intrinsics.cy) * z / intrinsics.fy);
            flat.push(z);
        }
    }

    let rows = flat.len() / 3;
    Array2::from_shape_vec((rows, 3), flat).map_err(|e| FrameError::Shape(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("array shape error: {0}")]
    Shape(String),
}
