//! Candidate marker quads from a binary dark mask.
//!
//! 1. Label 4-connected dark components, dropping the ones touching the
//!    frame border or with too few pixels.
//! 2. Take the convex hull of the boundary pixels' outer corners.
//! 3. Fit four corners to the hull and reject non-square-ish shapes.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadParams {
    /// Minimal side length of an accepted quad, in pixels.
    pub min_side_px: f32,
    /// Maximal quad area as a fraction of the frame area.
    pub max_area_frac: f32,
    /// Minimal ratio between quad area and hull area.
    pub min_fill_ratio: f32,
    /// Maximal ratio between the longest and shortest side.
    pub max_side_ratio: f32,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            min_side_px: 16.0,
            max_area_frac: 0.9,
            min_fill_ratio: 0.9,
            max_side_ratio: 4.0,
        }
    }
}

/// Boundary pixels of one dark component.
pub(crate) struct Component {
    pub boundary: Vec<(u32, u32)>,
}

/// Label 4-connected `true` regions of `mask`.
pub(crate) fn dark_components(
    mask: &[bool],
    width: usize,
    height: usize,
    min_pixels: usize,
) -> Vec<Component> {
    let mut label = vec![false; mask.len()];
    let mut out = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || label[start] {
            continue;
        }
        label[start] = true;
        stack.push(start);

        let mut pixels = 0usize;
        let mut touches_edge = false;
        let mut boundary = Vec::new();

        while let Some(idx) = stack.pop() {
            pixels += 1;
            let (x, y) = (idx % width, idx / width);
            if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
                touches_edge = true;
            }

            let mut on_boundary = false;
            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < width).then(|| idx + 1),
                (y > 0).then(|| idx - width),
                (y + 1 < height).then(|| idx + width),
            ];
            for n in neighbors {
                match n {
                    Some(n) if mask[n] => {
                        if !label[n] {
                            label[n] = true;
                            stack.push(n);
                        }
                    }
                    _ => on_boundary = true,
                }
            }
            if on_boundary {
                boundary.push((x as u32, y as u32));
            }
        }

        if !touches_edge && pixels >= min_pixels {
            out.push(Component { boundary });
        }
    }
    out
}

fn cross(o: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Convex hull (monotone chain) of the outer pixel corners of `pixels`.
pub(crate) fn pixel_hull(pixels: &[(u32, u32)]) -> Vec<Point2<f64>> {
    let mut pts: Vec<(u32, u32)> = pixels
        .iter()
        .flat_map(|&(x, y)| [(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)])
        .collect();
    pts.sort_unstable();
    pts.dedup();
    let pts: Vec<Point2<f64>> = pts
        .into_iter()
        .map(|(x, y)| Point2::new(x as f64, y as f64))
        .collect();
    if pts.len() < 3 {
        return pts;
    }

    let mut hull = half_hull(pts.iter());
    hull.extend(half_hull(pts.iter().rev()));
    hull
}

fn half_hull<'a>(pts: impl Iterator<Item = &'a Point2<f64>>) -> Vec<Point2<f64>> {
    let mut h: Vec<Point2<f64>> = Vec::new();
    for &p in pts {
        while h.len() >= 2 && cross(h[h.len() - 2], h[h.len() - 1], p) <= 0.0 {
            h.pop();
        }
        h.push(p);
    }
    h.pop();
    h
}

fn polygon_area(poly: &[Point2<f64>]) -> f64 {
    let n = poly.len();
    (0..n)
        .map(|i| {
            let (a, b) = (poly[i], poly[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
        .abs()
        * 0.5
}

fn line_distance(a: Point2<f64>, b: Point2<f64>, p: Point2<f64>) -> f64 {
    let len = (b - a).norm();
    if len < 1e-12 {
        return (p - a).norm();
    }
    cross(a, b, p) / len
}

/// Fit a quadrilateral to a convex hull.
///
/// Corners come back clockwise in image coordinates (y down), starting from
/// the one with the smallest polar angle around the centroid, which for an
/// upright square is its top-left.
pub(crate) fn fit_quad(
    hull: &[Point2<f64>],
    frame_area: f64,
    params: &QuadParams,
) -> Option<[Point2<f32>; 4]> {
    if hull.len() < 4 {
        return None;
    }
    let n = hull.len() as f64;
    let c = hull
        .iter()
        .fold(Point2::origin(), |acc: Point2<f64>, p| acc + p.coords / n);

    // Diagonal from the farthest pair, then the extreme point on each side.
    let a = *hull
        .iter()
        .max_by(|p, q| (*p - c).norm_squared().total_cmp(&(*q - c).norm_squared()))?;
    let b = *hull
        .iter()
        .max_by(|p, q| (*p - a).norm_squared().total_cmp(&(*q - a).norm_squared()))?;
    let by_line = |p: &&Point2<f64>, q: &&Point2<f64>| {
        line_distance(a, b, **p).total_cmp(&line_distance(a, b, **q))
    };
    let left = *hull.iter().max_by(by_line)?;
    let right = *hull.iter().min_by(by_line)?;
    if line_distance(a, b, left) <= 0.0 || line_distance(a, b, right) >= 0.0 {
        return None;
    }

    let mut corners = [a, left, b, right];
    let qc = corners
        .iter()
        .fold(Point2::origin(), |acc: Point2<f64>, p| acc + p.coords * 0.25);
    corners.sort_by(|p, q| {
        let ap = (p.y - qc.y).atan2(p.x - qc.x);
        let aq = (q.y - qc.y).atan2(q.x - qc.x);
        ap.total_cmp(&aq)
    });

    let sides: Vec<f64> = (0..4)
        .map(|i| (corners[(i + 1) % 4] - corners[i]).norm())
        .collect();
    let min_side = sides.iter().copied().fold(f64::INFINITY, f64::min);
    let max_side = sides.iter().copied().fold(0.0, f64::max);
    if min_side < params.min_side_px as f64
        || max_side > params.max_side_ratio as f64 * min_side
    {
        return None;
    }

    let quad_area = polygon_area(&corners);
    let hull_area = polygon_area(hull);
    if hull_area <= 0.0
        || quad_area / hull_area < params.min_fill_ratio as f64
        || quad_area > params.max_area_frac as f64 * frame_area
    {
        return None;
    }

    Some(corners.map(|p| Point2::new(p.x as f32, p.y as f32)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(w: usize, h: usize, x0: usize, y0: usize, side: usize) -> Vec<bool> {
        let mut m = vec![false; w * h];
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                m[y * w + x] = true;
            }
        }
        m
    }

    #[test]
    fn labels_components_and_drops_border_touching_ones() {
        let mut mask = square_mask(50, 50, 10, 10, 8);
        // A blob glued to the left frame edge.
        for y in 30..35 {
            for x in 0..4 {
                mask[y * 50 + x] = true;
            }
        }
        let comps = dark_components(&mask, 50, 50, 4);
        assert_eq!(comps.len(), 1);
        // Perimeter pixels of an 8x8 block.
        assert_eq!(comps[0].boundary.len(), 28);
    }

    #[test]
    fn hull_of_block_is_its_outline() {
        let pixels: Vec<(u32, u32)> = (0..3).flat_map(|y| (0..3).map(move |x| (x, y))).collect();
        let hull = pixel_hull(&pixels);
        assert_eq!(hull.len(), 4);
        assert!((polygon_area(&hull) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn fits_upright_square_with_top_left_first() {
        let mask = square_mask(100, 100, 20, 30, 40);
        let comps = dark_components(&mask, 100, 100, 16);
        let hull = pixel_hull(&comps[0].boundary);
        let q = fit_quad(&hull, 10_000.0, &QuadParams::default()).expect("quad");
        let expected = [(20.0, 30.0), (60.0, 30.0), (60.0, 70.0), (20.0, 70.0)];
        for (c, (x, y)) in q.iter().zip(expected) {
            assert!((c.x - x).abs() < 1e-4 && (c.y - y).abs() < 1e-4, "{c:?}");
        }
    }

    #[test]
    fn rejects_thin_strips_and_triangles() {
        let mut strip = vec![false; 100 * 100];
        for y in 10..14 {
            for x in 10..90 {
                strip[y * 100 + x] = true;
            }
        }
        let comps = dark_components(&strip, 100, 100, 4);
        let hull = pixel_hull(&comps[0].boundary);
        assert!(fit_quad(&hull, 10_000.0, &QuadParams::default()).is_none());

        let tri = vec![
            Point2::new(0.0, 0.0),
            Point2::new(60.0, 0.0),
            Point2::new(0.0, 60.0),
        ];
        assert!(fit_quad(&tri, 10_000.0, &QuadParams::default()).is_none());
    }
}
