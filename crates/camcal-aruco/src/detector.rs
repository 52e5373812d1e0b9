//! Full-frame marker detection.

use crate::decode::{DecodeConfig, QuadDecoder};
use crate::quad::{dark_components, fit_quad, pixel_hull, QuadParams};
use crate::threshold::adaptive_dark_mask;
use crate::{Dictionary, DictionaryError, Matcher};
use camcal_core::{GrayImageView, ImageError};
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One decoded marker in image coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub id: u32,
    /// Marker corners ordered top-left, top-right, bottom-right, bottom-left
    /// in the marker's own frame.
    pub corners: [Point2<f32>; 4],
    pub hamming: u8,
    pub border_score: f32,
}

impl MarkerDetection {
    pub fn center(&self) -> Point2<f32> {
        let sum = self
            .corners
            .iter()
            .fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords);
        Point2::from(sum / 4.0)
    }

    /// Mean side length in pixels.
    pub fn side_px(&self) -> f32 {
        (0..4)
            .map(|i| (self.corners[(i + 1) % 4] - self.corners[i]).norm())
            .sum::<f32>()
            / 4.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerDetectorParams {
    /// Name of an embedded dictionary.
    pub dictionary: String,
    /// Half window of the local-mean threshold, in pixels.
    pub threshold_radius: usize,
    /// How much darker than the local mean a pixel must be.
    pub threshold_offset: u8,
    /// Components with fewer pixels are skipped.
    pub min_component_pixels: usize,
    pub quad: QuadParams,
    pub decode: DecodeConfig,
}

impl Default for MarkerDetectorParams {
    fn default() -> Self {
        Self {
            dictionary: "DICT_APRILTAG_16h5".to_string(),
            threshold_radius: 15,
            threshold_offset: 7,
            min_component_pixels: 32,
            quad: QuadParams::default(),
            decode: DecodeConfig::default(),
        }
    }
}

/// Threshold → components → quads → decode, over the whole frame.
pub struct MarkerDetector {
    params: MarkerDetectorParams,
    decoder: QuadDecoder,
}

impl MarkerDetector {
    /// Build a detector for the embedded dictionary named in `params`.
    pub fn new(params: MarkerDetectorParams) -> Result<Self, DictionaryError> {
        let dict = Dictionary::builtin(&params.dictionary)?;
        Ok(Self::with_dictionary(dict, params))
    }

    /// Build a detector for an explicit dictionary; `params.dictionary` is ignored.
    pub fn with_dictionary(dict: Dictionary, params: MarkerDetectorParams) -> Self {
        let matcher = Matcher::new(dict, params.decode.max_hamming);
        let decoder = QuadDecoder::new(matcher, params.decode.clone());
        Self { params, decoder }
    }

    pub fn params(&self) -> &MarkerDetectorParams {
        &self.params
    }

    pub fn dictionary(&self) -> &Dictionary {
        self.decoder.matcher().dictionary()
    }

    /// Every marker decoded in `img`, one entry per physical marker.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, img), fields(width = img.width, height = img.height))
    )]
    pub fn detect_all(&self, img: &GrayImageView<'_>) -> Result<Vec<MarkerDetection>, ImageError> {
        img.validate()?;
        let p = &self.params;
        let mask = adaptive_dark_mask(img, p.threshold_radius, p.threshold_offset);
        let components = dark_components(&mask, img.width, img.height, p.min_component_pixels);
        let frame_area = (img.width * img.height) as f64;

        let mut found: Vec<MarkerDetection> = Vec::new();
        for comp in &components {
            let hull = pixel_hull(&comp.boundary);
            let Some(quad) = fit_quad(&hull, frame_area, &p.quad) else {
                continue;
            };
            let Some((m, reading)) = self.decoder.decode(img, &quad) else {
                continue;
            };
            let r = m.rotation as usize;
            let det = MarkerDetection {
                id: m.id,
                corners: [0, 1, 2, 3].map(|k| quad[(k + r) % 4]),
                hamming: m.hamming,
                border_score: reading.border_score,
            };
            merge_duplicate(&mut found, det);
        }

        debug!(
            "{} components, {} markers ({})",
            components.len(),
            found.len(),
            self.dictionary().name
        );
        Ok(found)
    }

    /// The marker in `img` if exactly one is visible.
    ///
    /// Zero or several markers both yield `Ok(None)`.
    pub fn detect_single(
        &self,
        img: &GrayImageView<'_>,
    ) -> Result<Option<MarkerDetection>, ImageError> {
        let mut all = self.detect_all(img)?;
        if all.len() == 1 {
            Ok(all.pop())
        } else {
            Ok(None)
        }
    }
}

/// Keep one detection per physical marker: nested outlines of the same
/// marker land within half a side of each other.
fn merge_duplicate(found: &mut Vec<MarkerDetection>, det: MarkerDetection) {
    let c = det.center();
    let near = found.iter_mut().find(|f| {
        f.id == det.id && (f.center() - c).norm() < 0.5 * f.side_px().min(det.side_px())
    });
    match near {
        Some(prev) => {
            if (det.hamming, -det.border_score) < (prev.hamming, -prev.border_score) {
                *prev = det;
            }
        }
        None => found.push(det),
    }
}
