//! Synthetic frames and targets shared by the integration tests.
#![allow(dead_code)]

use camcal::aruco::builtins;
use camcal::core::GrayImage;
use camcal::detect::{DetectError, TargetDetector};
use camcal::intrinsics::{grid_object_points, Distortion, Intrinsics, Observation, Pose};
use camcal::status::{RecordingSink, Reporter};
use camcal::worker::CancelToken;
use camcal::Frame;
use nalgebra::{Point2, Rotation3, Vector3};
use std::sync::Arc;

pub const WIDTH: usize = 640;
pub const HEIGHT: usize = 480;
/// Tag of frames in which [`SyntheticBoard`] finds nothing.
pub const MISS: u8 = 255;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn recorder() -> (Reporter, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (Reporter::new(sink.clone()), sink)
}

pub fn truth() -> Intrinsics {
    Intrinsics::new(
        800.0,
        790.0,
        321.0,
        238.0,
        Distortion {
            k1: -0.1,
            k2: 0.02,
            ..Distortion::default()
        },
    )
}

fn poses() -> Vec<Pose> {
    [
        ((0.35, 0.0, 0.0), (-0.10, -0.06, 0.50)),
        ((0.0, 0.35, 0.05), (-0.09, -0.07, 0.55)),
        ((-0.30, 0.20, 0.10), (-0.11, -0.05, 0.48)),
        ((0.25, -0.30, -0.08), (-0.08, -0.06, 0.52)),
        ((-0.20, -0.25, 0.15), (-0.10, -0.04, 0.58)),
    ]
    .into_iter()
    .map(|((rx, ry, rz), (tx, ty, tz))| {
        Pose::new(
            Rotation3::from_euler_angles(rx, ry, rz),
            Vector3::new(tx, ty, tz),
        )
    })
    .collect()
}

/// A 9×6 board seen through [`truth`] from five distinct poses.
pub fn board_views() -> Vec<Observation> {
    let k = truth();
    let object = grid_object_points(9, 6, 0.025);
    poses()
        .iter()
        .map(|pose| {
            let image: Vec<Point2<f64>> = object
                .iter()
                .map(|p| k.project(&pose.transform(p)).expect("in front"))
                .collect();
            Observation::new(object.clone(), image)
        })
        .collect()
}

/// Full-size frame carrying `tag` in its top-left pixel.
pub fn tagged(tag: u8) -> Frame {
    let mut f = GrayImage::filled(WIDTH, HEIGHT, 128);
    f.set(0, 0, tag);
    f
}

/// Frames for the given tags.
pub fn tagged_stream(tags: &[u8]) -> Vec<Frame> {
    tags.iter().map(|&t| tagged(t)).collect()
}

/// Finds board view `t` in a frame tagged `t`, nothing in other frames.
///
/// With `cancel_after = Some((k, token))` the token is cancelled as the
/// `k`-th view is handed out, or on the first frame when `k == 0`.
pub struct SyntheticBoard {
    views: Vec<Observation>,
    handed_out: usize,
    cancel_after: Option<(usize, CancelToken)>,
}

impl SyntheticBoard {
    pub fn new() -> Self {
        Self {
            views: board_views(),
            handed_out: 0,
            cancel_after: None,
        }
    }

    pub fn cancelling_after(k: usize, token: CancelToken) -> Self {
        Self {
            cancel_after: Some((k, token)),
            ..Self::new()
        }
    }
}

impl TargetDetector for SyntheticBoard {
    fn observe(&mut self, frame: &Frame) -> Result<Option<Observation>, DetectError> {
        frame.validate()?;
        if let Some((0, token)) = &self.cancel_after {
            token.cancel();
            return Ok(None);
        }
        let found = self.views.get(frame.get(0, 0) as usize).cloned();
        if found.is_some() {
            self.handed_out += 1;
            if let Some((k, token)) = &self.cancel_after {
                if self.handed_out >= *k {
                    token.cancel();
                }
            }
        }
        Ok(found)
    }
}

/// A 16h5 marker with a one-cell quiet zone; black border starts at
/// `cell_px`, so the marker outline spans `6 * cell_px`.
pub fn render_marker(id: usize, cell_px: usize) -> GrayImage {
    let code = builtins::DICT_APRILTAG_16h5.codes[id];
    let bits = 4;
    let cells = bits + 2;
    let side = (cells + 2) * cell_px;
    let mut img = GrayImage::filled(side, side, 255);
    for cy in 0..cells {
        for cx in 0..cells {
            let border = cx == 0 || cy == 0 || cx + 1 == cells || cy + 1 == cells;
            let black = border || (code >> ((cy - 1) * bits + (cx - 1))) & 1 == 1;
            if !black {
                continue;
            }
            for y in 0..cell_px {
                for x in 0..cell_px {
                    img.set((cx + 1) * cell_px + x, (cy + 1) * cell_px + y, 0);
                }
            }
        }
    }
    img
}

/// White `width × height` frame with marker `id` pasted at `(ox, oy)`.
/// Its top-left corner lands at `(ox + cell_px, oy + cell_px)`.
pub fn marker_frame(id: usize, width: usize, height: usize, ox: usize, oy: usize, cell_px: usize) -> Frame {
    let marker = render_marker(id, cell_px);
    let mut frame = GrayImage::filled(width, height, 255);
    for y in 0..marker.height {
        for x in 0..marker.width {
            frame.set(ox + x, oy + y, marker.get(x, y));
        }
    }
    frame
}
