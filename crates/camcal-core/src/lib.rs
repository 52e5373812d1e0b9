//! Core types shared by the camcal crates.
//!
//! This crate is small and detector-agnostic: an owned/borrowed grayscale
//! image pair, a ChESS-style corner record, planar homographies and the
//! process-wide logger setup. It does not depend on any concrete corner
//! detector or image codec.

mod corner;
mod homography;
mod image;
mod logger;

pub use corner::Corner;
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView, ImageError};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
