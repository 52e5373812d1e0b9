//! Dictionary lookup for observed codes, up to rotation.

use crate::Dictionary;

/// Best dictionary entry for an observed code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub id: u32,
    /// Quarter turns `0..=3` with `observed == rotate_code(dict_code, rotation)`.
    pub rotation: u8,
    pub hamming: u8,
}

/// Brute-force matcher over all ids and all four rotations.
#[derive(Clone, Debug)]
pub struct Matcher {
    dict: Dictionary,
    max_hamming: u8,
    rotated: Vec<[u64; 4]>,
}

impl Matcher {
    /// `max_hamming` is clamped to the dictionary's correction capability.
    pub fn new(dict: Dictionary, max_hamming: u8) -> Self {
        let n = dict.marker_size;
        let rotated = dict
            .codes
            .iter()
            .map(|&c| [0u8, 1, 2, 3].map(|r| rotate_code(c, n, r)))
            .collect();
        let max_hamming = max_hamming.min(dict.max_correction_bits);
        Self {
            dict,
            max_hamming,
            rotated,
        }
    }

    #[inline]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    #[inline]
    pub fn max_hamming(&self) -> u8 {
        self.max_hamming
    }

    /// Lowest-distance match within `max_hamming`, ties broken by lower id.
    pub fn match_code(&self, observed: u64) -> Option<Match> {
        let mut best: Option<Match> = None;
        for (id, rots) in self.rotated.iter().enumerate() {
            for (rotation, &cand) in rots.iter().enumerate() {
                let hamming = (observed ^ cand).count_ones() as u8;
                if hamming > self.max_hamming {
                    continue;
                }
                if best.is_none_or(|b| hamming < b.hamming) {
                    best = Some(Match {
                        id: id as u32,
                        rotation: rotation as u8,
                        hamming,
                    });
                    if hamming == 0 {
                        return best;
                    }
                }
            }
        }
        best
    }
}

/// Rotate an `n × n` row-major code (`idx = y * n + x`) clockwise by
/// `rot` quarter turns (image coordinates, y down).
pub fn rotate_code(code: u64, n: usize, rot: u8) -> u64 {
    let rot = rot & 3;
    if rot == 0 {
        return code;
    }
    let mut out = 0u64;
    for y in 0..n {
        for x in 0..n {
            let (sx, sy) = match rot {
                1 => (y, n - 1 - x),
                2 => (n - 1 - x, n - 1 - y),
                _ => (n - 1 - y, x),
            };
            out |= ((code >> (sy * n + sx)) & 1) << (y * n + x);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;

    #[test]
    fn four_quarter_turns_are_identity() {
        let code = 0x0123_4567_89ab_cdef_u64;
        let r = (0..4).fold(code, |c, _| rotate_code(c, 8, 1));
        assert_eq!(code, r);
    }

    #[test]
    fn quarter_turn_moves_top_left_to_top_right() {
        // Only the top-left bit of a 3x3 code is set.
        let rotated = rotate_code(1, 3, 1);
        assert_eq!(rotated, 1 << 2);
    }

    #[test]
    fn matcher_reports_rotation_and_corrects_bit_errors() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let matcher = Matcher::new(dict.clone(), 2);

        let observed = rotate_code(dict.codes[7], dict.marker_size, 3);
        let m = matcher.match_code(observed).expect("match");
        assert_eq!((m.id, m.rotation, m.hamming), (7, 3, 0));

        let noisy = observed ^ 0b1;
        let m = matcher.match_code(noisy).expect("corrected");
        assert_eq!((m.id, m.hamming), (7, 1));
    }

    #[test]
    fn distinct_codes_do_not_alias_under_rotation() {
        let dict = builtins::DICT_APRILTAG_16h5;
        let matcher = Matcher::new(dict.clone(), 0);
        for (id, &code) in dict.codes.iter().enumerate() {
            for rot in 0..4 {
                let m = matcher
                    .match_code(rotate_code(code, 4, rot))
                    .expect("exact match");
                assert_eq!(m.id as usize, id);
                assert_eq!(m.rotation, rot);
            }
        }
    }
}
