//! Latest-value frame store shared between the pipeline thread and readers.
//!
//! Each slot holds an `Arc` to an immutable frame. Writers build the new
//! frame first and then swap the pointer under a short write lock, so a
//! reader sees either the previous frame or the new one, never a mix.

use image::RgbImage;
use ndarray::Array2;
use oakd_hw::PointCloud;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Depth in millimetres, `height × width`.
pub type DepthMap = Array2<u16>;

struct Slot<T> {
    value: RwLock<Option<Arc<T>>>,
    published: AtomicU64,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            value: RwLock::new(None),
            published: AtomicU64::new(0),
        }
    }

    fn set(&self, value: T) {
        let value = Arc::new(value);
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> Option<Arc<T>> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Number of frames published into each slot since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounts {
    pub color: u64,
    pub depth: u64,
    pub point_cloud: u64,
}

/// All three slots read at once. The frames may come from different capture instants.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub color: Option<Arc<RgbImage>>,
    pub depth: Option<Arc<DepthMap>>,
    pub point_cloud: Option<Arc<PointCloud>>,
}

pub struct FrameStore {
    color: Slot<RgbImage>,
    depth: Slot<DepthMap>,
    point_cloud: Slot<PointCloud>,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            color: Slot::new(),
            depth: Slot::new(),
            point_cloud: Slot::new(),
        }
    }

    pub fn set_color(&self, image: RgbImage) {
        self.color.set(image);
    }

    pub fn set_depth(&self, map: DepthMap) {
        self.depth.set(map);
    }

    pub fn set_point_cloud(&self, cloud: PointCloud) {
        self.point_cloud.set(cloud);
    }

    /// Latest RGB image, or `None` if nothing was captured yet.
    pub fn get_color(&self) -> Option<Arc<RgbImage>> {
        self.color.get()
    }

    pub fn get_depth(&self) -> Option<Arc<DepthMap>> {
        self.depth.get()
    }

    pub fn get_point_cloud(&self) -> Option<Arc<PointCloud>> {
        self.point_cloud.get()
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            color: self.get_color(),
            depth: self.get_depth(),
            point_cloud: self.get_point_cloud(),
        }
    }

    /// Empty every slot. Publish counters are kept.
    pub fn clear(&self) {
        self.color.clear();
        self.depth.clear();
        self.point_cloud.clear();
    }

    pub fn counts(&self) -> FrameCounts {
        FrameCounts {
            color: self.color.published(),
            depth: self.depth.published(),
            point_cloud: self.point_cloud.published(),
        }
    }
}

/// Read-only, cloneable view of a worker's frame store.
#[derive(Clone)]
pub struct FrameReader {
    store: Arc<FrameStore>,
}

impl FrameReader {
    pub(crate) fn new(store: Arc<FrameStore>) -> Self {
        Self { store }
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

    pub fn snapshot(&self) -> FrameSnapshot {
        self.store.snapshot()
    }

    pub fn counts(&self) -> FrameCounts {
        self.store.counts()
    }
}
