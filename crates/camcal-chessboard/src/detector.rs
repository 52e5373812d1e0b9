use crate::gridgraph::{median_nearest_spacing, GridGraph};
use crate::params::{ChessboardParams, GridGraphParams};
use camcal_core::Corner;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One inner corner with its pattern coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridCorner {
    pub position: Point2<f32>,
    /// `[col, row]`, `col < cols`, `row < rows`.
    pub grid: [u32; 2],
}

/// A complete chessboard: every inner corner, row by row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChessboardDetection {
    pub cols: u32,
    pub rows: u32,
    pub corners: Vec<GridCorner>,
}

impl ChessboardDetection {
    pub fn points(&self) -> Vec<Point2<f32>> {
        self.corners.iter().map(|c| c.position).collect()
    }
}

/// Finds a fixed `cols × rows` inner-corner pattern in a ChESS corner cloud.
///
/// 1. Drop weak corners; estimate the spacing window.
/// 2. Link each corner to at most one neighbor per direction.
/// 3. Label each connected component on an integer grid.
/// 4. Accept the component whose labels fill exactly `cols × rows`, in either
///    orientation; a board seen sideways is relabeled by a quarter turn.
pub struct ChessboardDetector {
    pub params: ChessboardParams,
}

impl ChessboardDetector {
    pub fn new(params: ChessboardParams) -> Self {
        Self { params }
    }

    fn graph_params(&self, corners: &[Corner]) -> GridGraphParams {
        let mut graph = self.params.graph.clone();
        if self.params.auto_spacing {
            if let Some(s) = median_nearest_spacing(corners) {
                graph.min_spacing_pix = 0.5 * s;
                graph.max_spacing_pix = 2.0 * s;
            }
        }
        graph
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, corners), fields(num_corners = corners.len()))
    )]
    pub fn detect_from_corners(&self, corners: &[Corner]) -> Option<ChessboardDetection> {
        let (cols, rows) = (self.params.cols, self.params.rows);
        let needed = self.params.corner_count();
        let strong: Vec<Corner> = corners
            .iter()
            .copied()
            .filter(|c| c.strength >= self.params.min_strength)
            .collect();
        if needed == 0 || strong.len() < needed {
            debug!("{} corners, need {}", strong.len(), needed);
            return None;
        }

        let graph_params = self.graph_params(&strong);
        let graph = GridGraph::new(&strong, &graph_params);

        for component in graph.connected_components() {
            if component.len() != needed {
                continue;
            }
            let Some(coords) = graph.assign_grid_coordinates(&component) else {
                debug!("component of {} corners is not a grid", component.len());
                continue;
            };
            if let Some(det) = label_pattern(&strong, &coords, cols, rows) {
                return Some(det);
            }
        }
        debug!("no {}x{} component among {} corners", cols, rows, strong.len());
        None
    }
}

fn label_pattern(
    corners: &[Corner],
    coords: &[(usize, i32, i32)],
    cols: u32,
    rows: u32,
) -> Option<ChessboardDetection> {
    let min_i = coords.iter().map(|c| c.1).min()?;
    let min_j = coords.iter().map(|c| c.2).min()?;
    let width = (coords.iter().map(|c| c.1).max()? - min_i + 1) as u32;
    let height = (coords.iter().map(|c| c.2).max()? - min_j + 1) as u32;

    let relabel: fn(u32, u32, u32) -> (u32, u32) = if (width, height) == (cols, rows) {
        |i, j, _| (i, j)
    } else if (width, height) == (rows, cols) {
        // Quarter turn keeps handedness: (i, j) -> (j, rows - 1 - i).
        |i, j, rows| (j, rows - 1 - i)
    } else {
        return None;
    };

    let mut slots: Vec<Option<GridCorner>> = vec![None; (cols * rows) as usize];
    for &(node, i, j) in coords {
        let (col, row) = relabel((i - min_i) as u32, (j - min_j) as u32, rows);
        let slot = slots.get_mut((row * cols + col) as usize)?;
        if slot.is_some() {
            return None;
        }
        *slot = Some(GridCorner {
            position: corners[node].position,
            grid: [col, row],
        });
    }

    let corners = slots.into_iter().collect::<Option<Vec<_>>>()?;
    Some(ChessboardDetection {
        cols,
        rows,
        corners,
    })
}
