use serde::{Deserialize, Serialize};

/// Neighbor search settings for the corner grid graph.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GridGraphParams {
    pub min_spacing_pix: f32,
    pub max_spacing_pix: f32,
    pub k_neighbors: usize,
    pub orientation_tolerance_deg: f32,
}

impl Default for GridGraphParams {
    fn default() -> Self {
        Self {
            min_spacing_pix: 5.0,
            max_spacing_pix: 80.0,
            k_neighbors: 8,
            orientation_tolerance_deg: 22.5,
        }
    }
}

/// Pattern and filtering settings for the chessboard detector.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChessboardParams {
    /// Inner corners per row.
    pub cols: u32,
    /// Inner corners per column.
    pub rows: u32,
    /// Corners with a weaker response are dropped first.
    pub min_strength: f32,
    /// Derive the spacing window from the median nearest-neighbor distance
    /// instead of `graph.min_spacing_pix` / `graph.max_spacing_pix`.
    pub auto_spacing: bool,
    pub graph: GridGraphParams,
}

impl Default for ChessboardParams {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            min_strength: 0.0,
            auto_spacing: true,
            graph: GridGraphParams::default(),
        }
    }
}

impl ChessboardParams {
    pub fn with_pattern(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            ..Self::default()
        }
    }

    #[inline]
    pub fn corner_count(&self) -> usize {
        (self.cols * self.rows) as usize
    }
}
