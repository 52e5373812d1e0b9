//! Fixed-size chessboard detection on top of `camcal-core` corners.
//!
//! The detector is graph based and perspective tolerant:
//! 1. filter ChESS corners by strength,
//! 2. link each corner to its right/left/up/down neighbor using spacing and
//!    the 45° relation between corner diagonals and grid edges,
//! 3. BFS each connected component onto integer grid coordinates,
//! 4. accept the component that is exactly the requested pattern.
//!
//! Output corners are ordered row by row, `cols` per row, as calibration
//! object points expect.

mod detector;
mod geom;
mod gridgraph;
mod params;

pub use detector::{ChessboardDetection, ChessboardDetector, GridCorner};
pub use gridgraph::{median_nearest_spacing, GridGraph, NeighborDirection, NodeNeighbor};
pub use params::{ChessboardParams, GridGraphParams};
