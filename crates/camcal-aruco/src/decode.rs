//! Bit sampling inside an image-space marker quad.

use crate::threshold::otsu_threshold;
use crate::{Match, Matcher};
use camcal_core::{homography_from_4pt, GrayImageView, Homography};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Sampling and acceptance settings for reading one marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Black border width in cells.
    pub border_bits: usize,
    /// Fraction of each cell ignored near its edges when sampling.
    pub inset_frac: f32,
    /// Minimal fraction of border cells that must read black.
    pub min_border_score: f32,
    /// Hamming tolerance; clamped to the dictionary's correction bits.
    pub max_hamming: u8,
    /// Try the inverted polarity as well (white-on-black markers).
    pub allow_inverted: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            border_bits: 1,
            inset_frac: 0.15,
            min_border_score: 0.85,
            max_hamming: 1,
            allow_inverted: false,
        }
    }
}

/// Raw reading of a quad before dictionary lookup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellReading {
    /// Inner bits, row-major, black = 1, in the quad's own frame.
    pub code: u64,
    pub border_score: f32,
    pub inverted: bool,
}

/// Sampling lattice in a canonical `cells × cells` square with unit cells.
struct SampleGrid {
    cells: usize,
    /// One point per cell, `idx = cy * cells + cx`; each cell holds a
    /// small sub-grid so the mean is robust to blur at cell edges.
    points: Vec<[Point2<f64>; 4]>,
}

impl SampleGrid {
    fn new(cells: usize, inset_frac: f32) -> Self {
        let inset = (inset_frac as f64).clamp(0.0, 0.45);
        let lo = inset + (0.5 - inset) * 0.5;
        let hi = 1.0 - lo;
        let mut points = Vec::with_capacity(cells * cells);
        for cy in 0..cells {
            for cx in 0..cells {
                let (x, y) = (cx as f64, cy as f64);
                points.push([
                    Point2::new(x + lo, y + lo),
                    Point2::new(x + hi, y + lo),
                    Point2::new(x + hi, y + hi),
                    Point2::new(x + lo, y + hi),
                ]);
            }
        }
        Self { cells, points }
    }
}

/// Reads markers of one dictionary from arbitrary image quads.
pub struct QuadDecoder {
    cfg: DecodeConfig,
    matcher: Matcher,
    grid: SampleGrid,
}

impl QuadDecoder {
    pub fn new(matcher: Matcher, cfg: DecodeConfig) -> Self {
        let cells = matcher.dictionary().marker_size + 2 * cfg.border_bits;
        let grid = SampleGrid::new(cells, cfg.inset_frac);
        Self { cfg, matcher, grid }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Homography from the canonical cell square to the image quad.
    ///
    /// `quad` is ordered clockwise in image coordinates starting at the
    /// corner that maps to the canonical top-left.
    fn cell_homography(&self, quad: &[Point2<f32>; 4]) -> Option<Homography> {
        let s = self.grid.cells as f64;
        let src = [
            Point2::new(0.0, 0.0),
            Point2::new(s, 0.0),
            Point2::new(s, s),
            Point2::new(0.0, s),
        ];
        let dst = quad.map(|p| Point2::new(p.x as f64, p.y as f64));
        homography_from_4pt(&src, &dst)
    }

    /// Sample the per-cell intensities of `quad`.
    pub fn sample(&self, img: &GrayImageView<'_>, quad: &[Point2<f32>; 4]) -> Option<Vec<u8>> {
        let h = self.cell_homography(quad)?;
        let mut out = Vec::with_capacity(self.grid.points.len());
        for sub in &self.grid.points {
            let mut sum = 0u32;
            for p in sub {
                let q = h.apply(*p);
                sum += pixel_in_bounds(img, q.x, q.y)? as u32;
            }
            out.push((sum / 4) as u8);
        }
        Some(out)
    }

    /// Sample and binarize `quad`, keeping the polarity with the best border.
    pub fn read(&self, img: &GrayImageView<'_>, quad: &[Point2<f32>; 4]) -> Option<CellReading> {
        let samples = self.sample(img, quad)?;
        read_bits(
            &samples,
            self.grid.cells,
            self.cfg.border_bits,
            self.cfg.min_border_score,
            self.cfg.allow_inverted,
        )
    }

    /// Read `quad` and look it up in the dictionary.
    pub fn decode(
        &self,
        img: &GrayImageView<'_>,
        quad: &[Point2<f32>; 4],
    ) -> Option<(Match, CellReading)> {
        let reading = self.read(img, quad)?;
        let m = self.matcher.match_code(reading.code)?;
        (m.hamming <= self.cfg.max_hamming).then_some((m, reading))
    }
}

fn read_bits(
    samples: &[u8],
    cells: usize,
    border: usize,
    min_border_score: f32,
    allow_inverted: bool,
) -> Option<CellReading> {
    if samples.len() != cells * cells || cells <= 2 * border {
        return None;
    }
    let bits = cells - 2 * border;
    let thr = otsu_threshold(samples);

    let polarities: &[bool] = if allow_inverted {
        &[false, true]
    } else {
        &[false]
    };

    let mut best: Option<CellReading> = None;
    for &inverted in polarities {
        let (mut border_black, mut border_total) = (0u32, 0u32);
        let mut code = 0u64;
        for cy in 0..cells {
            for cx in 0..cells {
                let black = (samples[cy * cells + cx] < thr) != inverted;
                let on_border = cx < border
                    || cy < border
                    || cx >= cells - border
                    || cy >= cells - border;
                if on_border {
                    border_total += 1;
                    border_black += black as u32;
                } else if black {
                    code |= 1 << ((cy - border) * bits + (cx - border));
                }
            }
        }
        let border_score = if border_total == 0 {
            1.0
        } else {
            border_black as f32 / border_total as f32
        };
        if border_score < min_border_score {
            continue;
        }
        if best.is_none_or(|b| border_score > b.border_score) {
            best = Some(CellReading {
                code,
                border_score,
                inverted,
            });
        }
    }
    best
}

fn pixel_in_bounds(img: &GrayImageView<'_>, x: f64, y: f64) -> Option<u8> {
    if !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    let (ix, iy) = (x.floor() as usize, y.floor() as usize);
    if ix >= img.width || iy >= img.height {
        return None;
    }
    Some(img.data[iy * img.width + ix])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{builtins, rotate_code};
    use camcal_core::GrayImage;

    /// Axis-aligned marker with a white quiet zone of one cell.
    pub(crate) fn render_marker(code: u64, bits: usize, cell_px: usize) -> GrayImage {
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

    fn quad(cell_px: usize, cells: usize) -> [Point2<f32>; 4] {
        let a = cell_px as f32;
        let b = (cell_px * (cells + 1)) as f32;
        [
            Point2::new(a, a),
            Point2::new(b, a),
            Point2::new(b, b),
            Point2::new(a, b),
        ]
    }

    #[test]
    fn decodes_marker_from_exact_quad() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let decoder = QuadDecoder::new(Matcher::new(dict.clone(), 2), DecodeConfig::default());
        let img = render_marker(dict.codes[3], 4, 12);

        let (m, reading) = decoder.decode(&img.view(), &quad(12, 6)).expect("decoded");
        assert_eq!((m.id, m.rotation, m.hamming), (3, 0, 0));
        assert!(reading.border_score > 0.99);
        assert!(!reading.inverted);
    }

    #[test]
    fn starting_corner_shifts_reported_rotation() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let decoder = QuadDecoder::new(Matcher::new(dict.clone(), 0), DecodeConfig::default());
        let img = render_marker(dict.codes[11], 4, 12);

        // Start the quad at the image bottom-left: the canonical frame is
        // the marker turned a quarter clockwise.
        let q = quad(12, 6);
        let shifted = [q[3], q[0], q[1], q[2]];
        let (m, reading) = decoder.decode(&img.view(), &shifted).expect("decoded");
        assert_eq!(m.id, 11);
        assert_eq!(m.rotation, 1);
        assert_eq!(reading.code, rotate_code(dict.codes[11], 4, 1));
    }

    #[test]
    fn quad_leaving_the_image_is_rejected() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let decoder = QuadDecoder::new(Matcher::new(dict.clone(), 0), DecodeConfig::default());
        let img = render_marker(dict.codes[0], 4, 8);
        let q = [
            Point2::new(-20.0, -20.0),
            Point2::new(40.0, -20.0),
            Point2::new(40.0, 40.0),
            Point2::new(-20.0, 40.0),
        ];
        assert!(decoder.read(&img.view(), &q).is_none());
    }

    #[test]
    fn blank_square_fails_border_check() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let decoder = QuadDecoder::new(Matcher::new(dict.clone(), 0), DecodeConfig::default());
        let mut img = GrayImage::filled(96, 96, 255);
        for y in 30..60 {
            for x in 30..60 {
                img.set(x, y, 0);
            }
        }
        assert!(decoder.decode(&img.view(), &quad(12, 6)).is_none());
    }
}
