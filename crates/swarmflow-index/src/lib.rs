//! Spatial indexing abstractions for agent neighborhood and beacon queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors emitted by point queries over candidate sets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The candidate set was empty; callers must guard or supply a sentinel.
    #[error("candidate set is empty")]
    EmptyCandidateSet,
}

/// Squared planar distance between two points.
#[inline]
#[must_use]
pub fn distance_sq(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}

/// Index of the candidate nearest to `origin` by planar Euclidean distance.
///
/// Ties resolve toward the lowest candidate index. Candidates coincident
/// with `origin` are legal (distance zero wins).
pub fn nearest_candidate(origin: (f32, f32), candidates: &[(f32, f32)]) -> Result<usize, QueryError> {
    let mut best: Option<(OrderedFloat<f32>, usize)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let d_sq = OrderedFloat(distance_sq(origin, *candidate));
        match best {
            Some((best_sq, _)) if d_sq >= best_sq => {}
            _ => best = Some((d_sq, idx)),
        }
    }
    best.map(|(_, idx)| idx).ok_or(QueryError::EmptyCandidateSet)
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit neighbors of `agent_idx` strictly within the provided squared radius.
    ///
    /// The agent itself is excluded by index, never by position, so two
    /// coincident agents still see each other. An empty visitation is a
    /// valid outcome, not an error.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Reference implementation scanning every candidate pair.
///
/// Used as the oracle in tests and for small populations where bucketing
/// overhead is not worth paying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearScanIndex {
    positions: Vec<(f32, f32)>,
}

impl LinearScanIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NeighborhoodIndex for LinearScanIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(origin) = self.positions.get(agent_idx).copied() else {
            return;
        };
        for (idx, position) in self.positions.iter().enumerate() {
            if idx == agent_idx {
                continue;
            }
            let d_sq = distance_sq(origin, *position);
            if d_sq < radius_sq {
                visitor(idx, OrderedFloat(d_sq));
            }
        }
    }
}

/// Uniform grid bucketing positions over a centered rectangular room.
///
/// The room spans `[-half_width, half_width] x [-half_depth, half_depth]`;
/// positions outside the room are clamped into the border cells so boundary
/// jitter never drops an agent from the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    cell_size: f32,
    half_width: f32,
    half_depth: f32,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a grid covering a centered room with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32, half_width: f32, half_depth: f32) -> Self {
        let cols = Self::axis_cells(half_width, cell_size);
        let rows = Self::axis_cells(half_depth, cell_size);
        Self {
            cell_size,
            half_width,
            half_depth,
            cols,
            rows,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    fn axis_cells(half_extent: f32, cell_size: f32) -> usize {
        if cell_size <= 0.0 || half_extent <= 0.0 {
            return 1;
        }
        ((half_extent * 2.0 / cell_size).ceil() as usize).max(1)
    }

    fn cell_of(&self, position: (f32, f32)) -> (usize, usize) {
        let col = ((position.0 + self.half_width) / self.cell_size).floor() as isize;
        let row = ((position.1 + self.half_depth) / self.cell_size).floor() as isize;
        (
            col.clamp(0, self.cols as isize - 1) as usize,
            row.clamp(0, self.rows as isize - 1) as usize,
        )
    }

    #[inline]
    fn bucket_index(&self, col: usize, row: usize) -> usize {
        row * self.cols + col
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.half_width <= 0.0 || self.half_depth <= 0.0 {
            return Err(IndexError::InvalidConfig("room half extents must be positive"));
        }
        let wanted = self.cols * self.rows;
        if self.buckets.len() != wanted {
            self.buckets = vec![Vec::new(); wanted];
        } else {
            for bucket in &mut self.buckets {
                bucket.clear();
            }
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, position) in positions.iter().enumerate() {
            let (col, row) = self.cell_of(*position);
            let bucket = self.bucket_index(col, row);
            self.buckets[bucket].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(origin) = self.positions.get(agent_idx).copied() else {
            return;
        };
        if radius_sq <= 0.0 || self.buckets.is_empty() {
            return;
        }
        let radius = radius_sq.sqrt();
        let reach = (radius / self.cell_size).ceil() as isize;
        let (col, row) = self.cell_of(origin);
        let col_lo = (col as isize - reach).max(0) as usize;
        let col_hi = (col as isize + reach).min(self.cols as isize - 1) as usize;
        let row_lo = (row as isize - reach).max(0) as usize;
        let row_hi = (row as isize + reach).min(self.rows as isize - 1) as usize;

        for r in row_lo..=row_hi {
            for c in col_lo..=col_hi {
                for &idx in &self.buckets[self.bucket_index(c, r)] {
                    if idx == agent_idx {
                        continue;
                    }
                    let d_sq = distance_sq(origin, self.positions[idx]);
                    if d_sq < radius_sq {
                        visitor(idx, OrderedFloat(d_sq));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<I: NeighborhoodIndex>(index: &I, agent_idx: usize, radius_sq: f32) -> Vec<usize> {
        let mut hits = Vec::new();
        index.neighbors_within(agent_idx, radius_sq, &mut |idx, _| hits.push(idx));
        hits.sort_unstable();
        hits
    }

    #[test]
    fn nearest_picks_minimum_distance() {
        let candidates = vec![(5.0, 5.0), (1.0, 0.0), (3.0, 4.0)];
        assert_eq!(nearest_candidate((0.0, 0.0), &candidates), Ok(1));
    }

    #[test]
    fn nearest_tie_breaks_to_lowest_index() {
        let candidates = vec![(2.0, 0.0), (-2.0, 0.0), (0.0, 2.0)];
        assert_eq!(nearest_candidate((0.0, 0.0), &candidates), Ok(0));
    }

    #[test]
    fn nearest_rejects_empty_candidates() {
        assert_eq!(
            nearest_candidate((0.0, 0.0), &[]),
            Err(QueryError::EmptyCandidateSet)
        );
    }

    #[test]
    fn grid_rebuild_rejects_bad_cell_size() {
        let mut index = UniformGridIndex::new(0.0, 4.0, 5.0);
        assert!(matches!(
            index.rebuild(&[(0.0, 0.0)]),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn grid_finds_neighbors_within_radius() {
        let mut index = UniformGridIndex::new(1.0, 4.0, 5.0);
        let positions = vec![(0.0, 0.0), (0.5, 0.0), (3.0, 3.0)];
        index.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&index, 0, 1.0), vec![1]);
    }

    #[test]
    fn grid_excludes_self_by_index() {
        let mut index = UniformGridIndex::new(1.0, 4.0, 5.0);
        // Two coincident agents must still see each other.
        let positions = vec![(1.0, 1.0), (1.0, 1.0)];
        index.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&index, 0, 0.25), vec![1]);
        assert_eq!(collect(&index, 1, 0.25), vec![0]);
    }

    #[test]
    fn radius_is_strict() {
        let mut index = UniformGridIndex::new(1.0, 4.0, 5.0);
        let positions = vec![(0.0, 0.0), (1.0, 0.0)];
        index.rebuild(&positions).expect("rebuild");
        assert!(collect(&index, 0, 1.0).is_empty());
        assert_eq!(collect(&index, 0, 1.0 + 1e-3), vec![1]);
    }

    #[test]
    fn positions_outside_room_clamp_into_border_cells() {
        let mut index = UniformGridIndex::new(1.0, 4.0, 5.0);
        let positions = vec![(4.2, 0.0), (3.9, 0.0)];
        index.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&index, 1, 1.0), vec![0]);
    }

    #[test]
    fn grid_agrees_with_linear_scan() {
        let positions: Vec<(f32, f32)> = (0..40)
            .map(|i| {
                let t = i as f32 * 0.7;
                ((t.sin() * 3.8), (t.cos() * 4.7))
            })
            .collect();
        let mut grid = UniformGridIndex::new(1.5, 4.0, 5.0);
        let mut scan = LinearScanIndex::new();
        grid.rebuild(&positions).expect("grid rebuild");
        scan.rebuild(&positions).expect("scan rebuild");
        for agent_idx in 0..positions.len() {
            for radius_sq in [0.25, 1.0, 4.0, 25.0] {
                assert_eq!(
                    collect(&grid, agent_idx, radius_sq),
                    collect(&scan, agent_idx, radius_sq),
                    "agent {agent_idx} radius_sq {radius_sq}"
                );
            }
        }
    }

    #[test]
    fn empty_visitation_is_not_an_error() {
        let mut index = UniformGridIndex::new(1.0, 4.0, 5.0);
        index.rebuild(&[(0.0, 0.0)]).expect("rebuild");
        assert!(collect(&index, 0, 100.0).is_empty());
    }
}
