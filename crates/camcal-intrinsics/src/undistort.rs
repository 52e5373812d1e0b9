//! Frame undistortion by inverse mapping.
//!
//! For each output pixel the ideal normalized coordinate is distorted with
//! the lens model and the source is sampled bilinearly there. Output and
//! source share the camera matrix.

use crate::model::Intrinsics;
use camcal_core::{sample_bilinear_u8, GrayImage, GrayImageView, ImageError};
use nalgebra::Point2;
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UndistortError {
    #[error("no calibration loaded")]
    NotCalibrated,
    #[error(transparent)]
    InvalidFrame(#[from] ImageError),
    #[error("map is {map_width}x{map_height} but frame is {width}x{height}")]
    SizeMismatch {
        map_width: usize,
        map_height: usize,
        width: usize,
        height: usize,
    },
}

/// Precomputed source coordinates for every output pixel.
#[derive(Clone, Debug)]
pub struct UndistortMap {
    width: usize,
    height: usize,
    coords: Vec<Point2<f32>>,
}

impl UndistortMap {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(intrinsics)))]
    pub fn new(intrinsics: &Intrinsics, width: usize, height: usize) -> Self {
        let mut coords = Vec::with_capacity(width * height);
        for v in 0..height {
            for u in 0..width {
                let (x, y) = intrinsics.pixel_to_normalized(Point2::new(u as f64, v as f64));
                let (xd, yd) = intrinsics.distortion.distort(x, y);
                let src = intrinsics.normalized_to_pixel(xd, yd);
                coords.push(Point2::new(src.x as f32, src.y as f32));
            }
        }
        Self {
            width,
            height,
            coords,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Source position sampled for output pixel `(u, v)`.
    pub fn source(&self, u: usize, v: usize) -> Point2<f32> {
        self.coords[v * self.width + u]
    }

    pub fn remap(&self, src: &GrayImageView<'_>) -> Result<GrayImage, UndistortError> {
        src.validate()?;
        if (src.width, src.height) != (self.width, self.height) {
            return Err(UndistortError::SizeMismatch {
                map_width: self.width,
                map_height: self.height,
                width: src.width,
                height: src.height,
            });
        }
        let data = self
            .coords
            .iter()
            .map(|p| sample_bilinear_u8(src, p.x, p.y))
            .collect();
        Ok(GrayImage {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// Undistort one frame. Fails with [`UndistortError::NotCalibrated`] before
/// touching any pixel when `intrinsics` is `None`.
pub fn undistort(
    frame: &GrayImage,
    intrinsics: Option<&Intrinsics>,
) -> Result<GrayImage, UndistortError> {
    let intrinsics = intrinsics.ok_or(UndistortError::NotCalibrated)?;
    frame.validate()?;
    UndistortMap::new(intrinsics, frame.width, frame.height).remap(&frame.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Distortion;

    fn gradient(w: usize, h: usize) -> GrayImage {
        let data = (0..h)
            .flat_map(|y| (0..w).map(move |x| ((x * 3 + y * 5) % 256) as u8))
            .collect();
        GrayImage::from_raw(w, h, data).expect("image")
    }

    #[test]
    fn absent_calibration_is_rejected() {
        let frame = gradient(8, 8);
        assert_eq!(undistort(&frame, None), Err(UndistortError::NotCalibrated));

        let broken = GrayImage {
            width: 4,
            height: 4,
            data: vec![0; 3],
        };
        assert_eq!(undistort(&broken, None), Err(UndistortError::NotCalibrated));
    }

    #[test]
    fn zero_distortion_is_identity() {
        let frame = gradient(32, 24);
        let k = Intrinsics::new(40.0, 40.0, 15.5, 11.5, Distortion::default());
        assert_eq!(undistort(&frame, Some(&k)).expect("undistort"), frame);
    }

    #[test]
    fn barrel_distortion_pulls_samples_outward() {
        let k = Intrinsics::new(
            100.0,
            100.0,
            50.0,
            40.0,
            Distortion {
                k1: 0.2,
                ..Distortion::default()
            },
        );
        let map = UndistortMap::new(&k, 101, 81);
        let center = map.source(50, 40);
        assert!((center.x - 50.0).abs() < 1e-4 && (center.y - 40.0).abs() < 1e-4);
        let corner = map.source(100, 80);
        assert!(corner.x > 100.0 && corner.y > 80.0);
    }

    #[test]
    fn map_rejects_other_sizes_and_bad_buffers() {
        let k = Intrinsics::new(10.0, 10.0, 4.0, 4.0, Distortion::default());
        let map = UndistortMap::new(&k, 8, 8);
        let other = gradient(9, 8);
        assert!(matches!(
            map.remap(&other.view()),
            Err(UndistortError::SizeMismatch { .. })
        ));
        let broken = GrayImage {
            width: 8,
            height: 8,
            data: vec![0; 10],
        };
        assert!(matches!(
            undistort(&broken, Some(&k)),
            Err(UndistortError::InvalidFrame(_))
        ));
    }
}
