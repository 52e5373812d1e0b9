use crate::geom::{axis_diff_abs, is_orthogonal};
use crate::params::GridGraphParams;
use camcal_core::Corner;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector2;
use std::collections::{HashMap, VecDeque};
use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NeighborDirection {
    Right,
    Left,
    Up,
    Down,
}

impl NeighborDirection {
    /// Grid step `(di, dj)` with `i` along image x and `j` along image y.
    fn step(self) -> (i32, i32) {
        match self {
            Self::Right => (1, 0),
            Self::Left => (-1, 0),
            Self::Up => (0, -1),
            Self::Down => (0, 1),
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Right => 0,
            Self::Left => 1,
            Self::Up => 2,
            Self::Down => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeNeighbor {
    pub direction: NeighborDirection,
    pub index: usize,
    pub distance: f32,
    pub score: f32,
}

fn direction_quadrant(v: &Vector2<f32>) -> NeighborDirection {
    if v.x.abs() > v.y.abs() {
        if v.x >= 0.0 {
            NeighborDirection::Right
        } else {
            NeighborDirection::Left
        }
    } else if v.y >= 0.0 {
        NeighborDirection::Down
    } else {
        NeighborDirection::Up
    }
}

/// Score `neighbor` as a grid neighbor of `corner`; lower is better.
///
/// Adjacent chessboard corners have orthogonal bright diagonals, and the
/// edge between them runs at 45° to both.
fn neighbor_score(
    corner: &Corner,
    neighbor: &Corner,
    index: usize,
    params: &GridGraphParams,
) -> Option<NodeNeighbor> {
    let tol = params.orientation_tolerance_deg.to_radians();
    if !is_orthogonal(corner.orientation, neighbor.orientation, tol) {
        return None;
    }

    let v = neighbor.position - corner.position;
    let distance = v.norm();
    if distance < params.min_spacing_pix || distance > params.max_spacing_pix {
        return None;
    }

    let edge = v.y.atan2(v.x);
    let off_corner = (axis_diff_abs(corner.orientation, edge) - FRAC_PI_4).abs();
    let off_neighbor = (axis_diff_abs(neighbor.orientation, edge) - FRAC_PI_4).abs();
    if off_corner > tol || off_neighbor > tol {
        return None;
    }

    let off_orthogonal = (FRAC_PI_2 - axis_diff_abs(corner.orientation, neighbor.orientation)).abs();
    Some(NodeNeighbor {
        direction: direction_quadrant(&v),
        index,
        distance,
        score: off_corner + off_neighbor + off_orthogonal,
    })
}

/// Keep the best candidate per direction (lowest score, then shortest edge).
fn select_neighbors(candidates: Vec<NodeNeighbor>) -> Vec<NodeNeighbor> {
    let mut best: [Option<NodeNeighbor>; 4] = [None, None, None, None];
    for cand in candidates {
        let slot = &mut best[cand.direction.slot()];
        let better = slot.as_ref().is_none_or(|cur| {
            cand.score < cur.score || (cand.score == cur.score && cand.distance < cur.distance)
        });
        if better {
            *slot = Some(cand);
        }
    }
    best.into_iter().flatten().collect()
}

/// Median distance from each corner to its nearest other corner.
pub fn median_nearest_spacing(corners: &[Corner]) -> Option<f32> {
    if corners.len() < 2 {
        return None;
    }
    let coords: Vec<[f32; 2]> = corners
        .iter()
        .map(|c| [c.position.x, c.position.y])
        .collect();
    let tree: KdTree<f32, 2> = (&coords).into();
    let mut nearest: Vec<f32> = coords
        .iter()
        .enumerate()
        .filter_map(|(i, q)| {
            tree.nearest_n::<SquaredEuclidean>(q, 2)
                .into_iter()
                .find(|nn| nn.item as usize != i)
                .map(|nn| nn.distance.sqrt())
        })
        .collect();
    if nearest.is_empty() {
        return None;
    }
    nearest.sort_by(f32::total_cmp);
    Some(nearest[nearest.len() / 2])
}

/// 4-connected corner graph; each node keeps at most one neighbor per direction.
pub struct GridGraph {
    pub neighbors: Vec<Vec<NodeNeighbor>>,
}

impl GridGraph {
    pub fn new(corners: &[Corner], params: &GridGraphParams) -> Self {
        let coords: Vec<[f32; 2]> = corners
            .iter()
            .map(|c| [c.position.x, c.position.y])
            .collect();
        let tree: KdTree<f32, 2> = (&coords).into();

        let neighbors = corners
            .iter()
            .enumerate()
            .map(|(i, corner)| {
                let query = [corner.position.x, corner.position.y];
                let candidates = tree
                    .nearest_n::<SquaredEuclidean>(&query, params.k_neighbors)
                    .into_iter()
                    .map(|nn| nn.item as usize)
                    .filter(|&j| j != i)
                    .filter_map(|j| neighbor_score(corner, &corners[j], j, params))
                    .collect();
                select_neighbors(candidates)
            })
            .collect();

        Self { neighbors }
    }

    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut visited = vec![false; self.neighbors.len()];
        let mut components = Vec::new();
        for start in 0..self.neighbors.len() {
            if visited[start] {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(node) = stack.pop() {
                component.push(node);
                for n in &self.neighbors[node] {
                    if !visited[n.index] {
                        visited[n.index] = true;
                        stack.push(n.index);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// BFS integer coordinates `(node, i, j)` for one component.
    ///
    /// Returns `None` when two nodes claim the same cell or one node is
    /// reached at two different cells, which means the graph is not a grid.
    pub fn assign_grid_coordinates(&self, component: &[usize]) -> Option<Vec<(usize, i32, i32)>> {
        let start = *component.first()?;
        let mut at: HashMap<usize, (i32, i32)> = HashMap::with_capacity(component.len());
        let mut taken: HashMap<(i32, i32), usize> = HashMap::with_capacity(component.len());
        let mut queue = VecDeque::from([(start, 0, 0)]);
        at.insert(start, (0, 0));
        taken.insert((0, 0), start);

        while let Some((node, i, j)) = queue.pop_front() {
            for n in &self.neighbors[node] {
                let (di, dj) = n.direction.step();
                let cell = (i + di, j + dj);
                match at.get(&n.index) {
                    Some(&prev) if prev != cell => return None,
                    Some(_) => {}
                    None => {
                        if taken.insert(cell, n.index).is_some() {
                            return None;
                        }
                        at.insert(n.index, cell);
                        queue.push_back((n.index, cell.0, cell.1));
                    }
                }
            }
        }

        let mut coords: Vec<(usize, i32, i32)> =
            at.into_iter().map(|(node, (i, j))| (node, i, j)).collect();
        coords.sort_unstable_by_key(|&(_, i, j)| (j, i));
        Some(coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_4;

    fn grid(cols: usize, rows: usize, spacing: f32) -> Vec<Corner> {
        let mut corners = Vec::new();
        for j in 0..rows {
            for i in 0..cols {
                let orientation = if (i + j) % 2 == 0 {
                    FRAC_PI_4
                } else {
                    3.0 * FRAC_PI_4
                };
                corners.push(Corner::new(
                    i as f32 * spacing,
                    j as f32 * spacing,
                    orientation,
                    1.0,
                ));
            }
        }
        corners
    }

    fn params() -> GridGraphParams {
        GridGraphParams {
            min_spacing_pix: 5.0,
            max_spacing_pix: 15.0,
            ..Default::default()
        }
    }

    fn directions(ns: &[NodeNeighbor]) -> HashMap<NeighborDirection, usize> {
        ns.iter().map(|n| (n.direction, n.index)).collect()
    }

    #[test]
    fn finds_axis_neighbors_in_regular_grid() {
        let corners = grid(3, 3, 10.0);
        let graph = GridGraph::new(&corners, &params());

        let center = directions(&graph.neighbors[4]);
        assert_eq!(center.len(), 4);
        assert_eq!(center[&NeighborDirection::Left], 3);
        assert_eq!(center[&NeighborDirection::Right], 5);
        assert_eq!(center[&NeighborDirection::Up], 1);
        assert_eq!(center[&NeighborDirection::Down], 7);

        let corner = directions(&graph.neighbors[0]);
        assert_eq!(corner.len(), 2);
        assert!(corner.contains_key(&NeighborDirection::Right));
        assert!(corner.contains_key(&NeighborDirection::Down));
    }

    #[test]
    fn rejects_parallel_orientations_and_far_corners() {
        let same = vec![
            Corner::new(0.0, 0.0, FRAC_PI_4, 1.0),
            Corner::new(10.0, 0.0, FRAC_PI_4, 1.0),
        ];
        let graph = GridGraph::new(&same, &params());
        assert!(graph.neighbors.iter().all(|n| n.is_empty()));

        let far = vec![
            Corner::new(0.0, 0.0, FRAC_PI_4, 1.0),
            Corner::new(30.0, 0.0, 3.0 * FRAC_PI_4, 1.0),
        ];
        let graph = GridGraph::new(&far, &params());
        assert!(graph.neighbors.iter().all(|n| n.is_empty()));
    }

    #[test]
    fn labels_full_component_row_major() {
        let corners = grid(4, 3, 10.0);
        let graph = GridGraph::new(&corners, &params());
        let comps = graph.connected_components();
        assert_eq!(comps.len(), 1);

        let coords = graph.assign_grid_coordinates(&comps[0]).expect("consistent");
        assert_eq!(coords.len(), 12);
        let (i0, j0) = (coords[0].1, coords[0].2);
        for (k, &(node, i, j)) in coords.iter().enumerate() {
            assert_eq!(node, k);
            assert_eq!(((i - i0) as usize, (j - j0) as usize), (k % 4, k / 4));
        }
    }

    #[test]
    fn median_spacing_of_regular_grid() {
        let corners = grid(5, 4, 12.0);
        let s = median_nearest_spacing(&corners).expect("spacing");
        assert!((s - 12.0).abs() < 1e-4);
        assert!(median_nearest_spacing(&corners[..1]).is_none());
    }
}
