//! Capture devices.
//!
//! A [`CameraBackend`] opens devices by index; the opened [`FrameSource`]
//! is wrapped in a [`Camera`] which releases it exactly once, on
//! [`Camera::close`] or on drop.

use camcal_core::GrayImage;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One captured 8-bit grayscale image.
pub type Frame = GrayImage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera {index} unavailable: {reason}")]
    DeviceUnavailable { index: usize, reason: String },
}

/// An open device yielding frames.
pub trait FrameSource: Send {
    /// Next frame; `None` on a transient failure or the end of the stream.
    fn read_frame(&mut self) -> Option<Frame>;

    /// Release the device. Called once.
    fn release(&mut self) {}
}

/// Something that can open capture devices by index.
pub trait CameraBackend: Send + Sync {
    fn open(&self, index: usize) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// An opened device with explicit open/closed state.
pub struct Camera {
    index: usize,
    source: Option<Box<dyn FrameSource>>,
}

impl Camera {
    pub fn open(backend: &dyn CameraBackend, index: usize) -> Result<Self, CameraError> {
        let source = backend.open(index)?;
        debug!("camera {index} opened");
        Ok(Self {
            index,
            source: Some(source),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// `None` once closed.
    pub fn read_frame(&mut self) -> Option<Frame> {
        self.source.as_mut()?.read_frame()
    }

    /// Release the device. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
            debug!("camera {} released", self.index);
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("index", &self.index)
            .field("open", &self.is_open())
            .finish()
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "pgm", "pnm", "tif", "tiff"];

/// Treats the `index`-th sub-directory (sorted by name) of `root` as a
/// device whose frames are the images inside it, in name order.
#[derive(Clone, Debug)]
pub struct ImageDirectoryBackend {
    root: PathBuf,
    looping: bool,
}

impl ImageDirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            looping: false,
        }
    }

    /// Restart from the first image instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dirs(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

impl CameraBackend for ImageDirectoryBackend {
    fn open(&self, index: usize) -> Result<Box<dyn FrameSource>, CameraError> {
        let unavailable = |reason: String| CameraError::DeviceUnavailable { index, reason };
        let dirs = self
            .device_dirs()
            .map_err(|e| unavailable(format!("{}: {e}", self.root.display())))?;
        let dir = dirs
            .get(index)
            .ok_or_else(|| unavailable(format!("{} devices under {}", dirs.len(), self.root.display())))?;

        let mut frames: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| unavailable(format!("{}: {e}", dir.display())))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        if frames.is_empty() {
            return Err(unavailable(format!("no images in {}", dir.display())));
        }
        frames.sort();
        debug!("camera {index}: {} frames in {}", frames.len(), dir.display());

        Ok(Box::new(ImageFileSource {
            frames,
            next: 0,
            looping: self.looping,
        }))
    }
}

struct ImageFileSource {
    frames: Vec<PathBuf>,
    next: usize,
    looping: bool,
}

impl FrameSource for ImageFileSource {
    fn read_frame(&mut self) -> Option<Frame> {
        if self.next >= self.frames.len() {
            if !self.looping {
                return None;
            }
            self.next = 0;
        }
        let path = &self.frames[self.next];
        self.next += 1;
        match load_gray(path) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("failed to read {}: {e}", path.display());
                None
            }
        }
    }
}

/// Decode any supported image file to grayscale.
pub fn load_gray(path: &Path) -> Result<Frame, image::ImageError> {
    let img = image::open(path)?.to_luma8();
    Ok(from_luma(img))
}

pub fn from_luma(img: image::GrayImage) -> Frame {
    let (width, height) = (img.width() as usize, img.height() as usize);
    GrayImage {
        width,
        height,
        data: img.into_raw(),
    }
}

/// Pre-recorded frames per device index.
///
/// Tracks how many sources are currently open so callers can check that
/// every opened device was released.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    devices: Vec<Option<MemoryDevice>>,
    open_sources: Arc<AtomicUsize>,
}

#[derive(Clone, Debug)]
struct MemoryDevice {
    frames: Arc<Vec<Frame>>,
    looping: bool,
    frame_interval: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the next device index, playing `frames` once.
    pub fn with_device(self, frames: Vec<Frame>) -> Self {
        self.push(MemoryDevice {
            frames: Arc::new(frames),
            looping: false,
            frame_interval: Duration::ZERO,
        })
    }

    /// Add the next device index, replaying `frames` forever with a pause
    /// of `frame_interval` before each read.
    pub fn with_looping_device(self, frames: Vec<Frame>, frame_interval: Duration) -> Self {
        self.push(MemoryDevice {
            frames: Arc::new(frames),
            looping: true,
            frame_interval,
        })
    }

    /// Add a device index that fails to open.
    pub fn with_missing_device(mut self) -> Self {
        self.devices.push(None);
        self
    }

    fn push(mut self, device: MemoryDevice) -> Self {
        self.devices.push(Some(device));
        self
    }

    /// Sources opened and not yet released.
    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }
}

impl CameraBackend for MemoryBackend {
    fn open(&self, index: usize) -> Result<Box<dyn FrameSource>, CameraError> {
        let device = self
            .devices
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| CameraError::DeviceUnavailable {
                index,
                reason: "no such device".to_string(),
            })?;
        self.open_sources.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySource {
            device: device.clone(),
            next: 0,
            open_sources: Arc::clone(&self.open_sources),
        }))
    }
}

struct MemorySource {
    device: MemoryDevice,
    next: usize,
    open_sources: Arc<AtomicUsize>,
}

impl FrameSource for MemorySource {
    fn read_frame(&mut self) -> Option<Frame> {
        if !self.device.frame_interval.is_zero() {
            std::thread::sleep(self.device.frame_interval);
        }
        let frames = &self.device.frames;
        if self.next >= frames.len() {
            if !self.device.looping || frames.is_empty() {
                return None;
            }
            self.next = 0;
        }
        self.next += 1;
        Some(frames[self.next - 1].clone())
    }

    fn release(&mut self) {
        self.open_sources.fetch_sub(1, Ordering::SeqCst);
    }
}
