//! Binarization helpers: Otsu over sample sets for bit decoding, and a
//! local-mean threshold over the full frame for quad finding.

use camcal_core::GrayImageView;

/// Otsu threshold of a set of intensities. Values `< t` are dark.
pub(crate) fn otsu_threshold(samples: &[u8]) -> u8 {
    let (Some(&min_v), Some(&max_v)) = (samples.iter().min(), samples.iter().max()) else {
        return 127;
    };
    if min_v == max_v {
        return min_v;
    }

    let mut hist = [0u32; 256];
    for &v in samples {
        hist[v as usize] += 1;
    }
    // Two-level input: split halfway so both levels land on their own side.
    if hist.iter().filter(|&&h| h > 0).count() <= 2 {
        return ((min_v as u16 + max_v as u16 + 1) / 2) as u8;
    }

    let total = samples.len() as f64;
    let sum_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &h)| i as f64 * h as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut w_b = 0.0;
    let mut best = (-1.0, 127u8);
    for (t, &h) in hist.iter().enumerate() {
        w_b += h as f64;
        if w_b < 1.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f < 1.0 {
            break;
        }
        sum_b += t as f64 * h as f64;
        let m_b = sum_b / w_b;
        let m_f = (sum_total - sum_b) / w_f;
        let between = w_b * w_f * (m_b - m_f).powi(2);
        if between > best.0 {
            // Pixels equal to `t` belong to the dark class.
            best = (between, (t + 1).min(255) as u8);
        }
    }
    best.1
}

/// Mark pixels darker than their local mean by more than `offset`.
///
/// The window is `(2 * radius + 1)²`, clipped at the image border. Sums come
/// from an integral image so the cost does not depend on the radius.
pub(crate) fn adaptive_dark_mask(img: &GrayImageView<'_>, radius: usize, offset: u8) -> Vec<bool> {
    let (w, h) = (img.width, img.height);
    let stride = w + 1;
    let mut integral = vec![0u64; stride * (h + 1)];
    for y in 0..h {
        let mut row = 0u64;
        for x in 0..w {
            row += img.data[y * w + x] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }

    let mut mask = vec![false; w * h];
    for y in 0..h {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius + 1).min(h);
        for x in 0..w {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(w);
            let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let area = ((y1 - y0) * (x1 - x0)) as u64;
            let v = img.data[y * w + x] as u64;
            // v < mean - offset  <=>  (v + offset) * area < sum
            mask[y * w + x] = (v + offset as u64) * area < sum;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use camcal_core::GrayImage;

    #[test]
    fn otsu_splits_bimodal_samples() {
        let mut samples = vec![20u8; 50];
        samples.extend(std::iter::repeat_n(30u8, 10));
        samples.extend(std::iter::repeat_n(220u8, 40));
        let t = otsu_threshold(&samples);
        assert!(t > 30 && t <= 220, "threshold {t}");
        assert_eq!(otsu_threshold(&[]), 127);
        assert_eq!(otsu_threshold(&[9, 9, 9]), 9);
    }

    #[test]
    fn adaptive_mask_marks_dark_square_edges() {
        let mut img = GrayImage::filled(40, 40, 230);
        for y in 10..30 {
            for x in 10..30 {
                img.set(x, y, 20);
            }
        }
        let mask = adaptive_dark_mask(&img.view(), 4, 10);
        assert!(mask[10 * 40 + 10]);
        assert!(mask[29 * 40 + 20]);
        assert!(!mask[5 * 40 + 5]);
        assert!(!mask[10 * 40 + 9]);
    }
}
