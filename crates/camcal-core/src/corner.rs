use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// A saddle-point corner as reported by a ChESS-style detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Corner {
    /// Sub-pixel position in image coordinates (x right, y down).
    pub position: Point2<f32>,
    /// Direction of the bright diagonal, in radians, defined modulo π.
    pub orientation: f32,
    /// Detector response; larger is stronger.
    pub strength: f32,
}

impl Corner {
    pub fn new(x: f32, y: f32, orientation: f32, strength: f32) -> Self {
        Self {
            position: Point2::new(x, y),
            orientation,
            strength,
        }
    }
}
