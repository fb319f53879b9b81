//! Spatial indexing abstractions for firefly neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on grid cells along a single axis.
const MAX_CELLS_PER_AXIS: usize = 256;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex: Send + Sync {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError>;

    /// Visit neighbors of `agent_idx` whose squared distance is at most `radius_sq`.
    ///
    /// The agent itself is never visited. Visit order is unspecified.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Which index implementation a swarm should use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Pairwise scan over every agent.
    BruteForce,
    /// Uniform 3D bucket grid.
    #[default]
    UniformGrid,
}

#[inline]
fn distance_sq(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

/// Pairwise index; every query scans all positions.
#[derive(Debug, Clone, Default)]
pub struct BruteForceIndex {
    positions: Vec<[f32; 3]>,
}

impl BruteForceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NeighborhoodIndex for BruteForceIndex {
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError> {
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
        let Some(origin) = self.positions.get(agent_idx) else {
            return;
        };
        for (idx, other) in self.positions.iter().enumerate() {
            if idx == agent_idx {
                continue;
            }
            let dist_sq = distance_sq(origin, other);
            if dist_sq <= radius_sq {
                visitor(idx, OrderedFloat(dist_sq));
            }
        }
    }
}

/// Uniform grid index bucketing agents into axis-aligned cells.
///
/// Positions outside the indexed volume are bucketed into the nearest boundary
/// cell, so queries stay exact for agents that a single reflection left
/// slightly out of range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Requested edge length of each grid cell.
    pub cell_size: f32,
    origin: [f32; 3],
    extent: [f32; 3],
    #[serde(skip)]
    dims: [usize; 3],
    #[serde(skip)]
    cell_len: [f32; 3],
    #[serde(skip)]
    cell_starts: Vec<usize>,
    #[serde(skip)]
    entries: Vec<usize>,
    #[serde(skip)]
    positions: Vec<[f32; 3]>,
}

impl UniformGridIndex {
    /// Create a new grid covering `origin .. origin + extent` with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32, origin: [f32; 3], extent: [f32; 3]) -> Self {
        Self {
            cell_size,
            origin,
            extent,
            dims: [1; 3],
            cell_len: extent,
            cell_starts: Vec::new(),
            entries: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Number of cells along each axis after the last rebuild.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn validate(&self) -> Result<(), IndexError> {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self
            .extent
            .iter()
            .any(|extent| !extent.is_finite() || *extent <= 0.0)
        {
            return Err(IndexError::InvalidConfig("grid extent must be positive"));
        }
        Ok(())
    }

    fn axis_cell(&self, axis: usize, value: f32) -> usize {
        let offset = (value - self.origin[axis]) / self.cell_len[axis];
        if offset.is_nan() || offset <= 0.0 {
            return 0;
        }
        (offset.floor() as usize).min(self.dims[axis] - 1)
    }

    fn cell_of(&self, position: &[f32; 3]) -> usize {
        let cx = self.axis_cell(0, position[0]);
        let cy = self.axis_cell(1, position[1]);
        let cz = self.axis_cell(2, position[2]);
        self.flatten(cx, cy, cz)
    }

    #[inline]
    fn flatten(&self, cx: usize, cy: usize, cz: usize) -> usize {
        (cz * self.dims[1] + cy) * self.dims[0] + cx
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(0.4, [0.0; 3], [1.0; 3])
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError> {
        self.validate()?;
        for axis in 0..3 {
            let cells = (self.extent[axis] / self.cell_size).ceil() as usize;
            self.dims[axis] = cells.clamp(1, MAX_CELLS_PER_AXIS);
            self.cell_len[axis] = self.extent[axis] / self.dims[axis] as f32;
        }

        let cell_count = self.dims.iter().product::<usize>();
        let cells: Vec<usize> = positions.iter().map(|p| self.cell_of(p)).collect();

        // Counting sort into a CSR layout: entries[cell_starts[c]..cell_starts[c + 1]].
        self.cell_starts.clear();
        self.cell_starts.resize(cell_count + 1, 0);
        for &cell in &cells {
            self.cell_starts[cell + 1] += 1;
        }
        for cell in 0..cell_count {
            self.cell_starts[cell + 1] += self.cell_starts[cell];
        }
        let mut cursor = self.cell_starts.clone();
        self.entries.clear();
        self.entries.resize(positions.len(), 0);
        for (idx, &cell) in cells.iter().enumerate() {
            self.entries[cursor[cell]] = idx;
            cursor[cell] += 1;
        }

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
        let Some(origin) = self.positions.get(agent_idx) else {
            return;
        };
        if radius_sq.is_nan() || radius_sq < 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();

        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            lo[axis] = self.axis_cell(axis, origin[axis] - radius);
            hi[axis] = self.axis_cell(axis, origin[axis] + radius);
        }

        for cz in lo[2]..=hi[2] {
            for cy in lo[1]..=hi[1] {
                for cx in lo[0]..=hi[0] {
                    let cell = self.flatten(cx, cy, cz);
                    let bucket = &self.entries[self.cell_starts[cell]..self.cell_starts[cell + 1]];
                    for &idx in bucket {
                        if idx == agent_idx {
                            continue;
                        }
                        let dist_sq = distance_sq(origin, &self.positions[idx]);
                        if dist_sq <= radius_sq {
                            visitor(idx, OrderedFloat(dist_sq));
                        }
                    }
                }
            }
        }
    }
}

/// Construct a boxed index of the requested kind.
#[must_use]
pub fn build_index(
    kind: IndexKind,
    cell_size: f32,
    origin: [f32; 3],
    extent: [f32; 3],
) -> Box<dyn NeighborhoodIndex> {
    match kind {
        IndexKind::BruteForce => Box::new(BruteForceIndex::new()),
        IndexKind::UniformGrid => Box::new(UniformGridIndex::new(cell_size, origin, extent)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scatter(count: usize) -> Vec<[f32; 3]> {
        // Deterministic low-discrepancy scatter, with a few points pushed out of range.
        (0..count)
            .map(|i| {
                let t = i as f32;
                let mut p = [
                    (t * 0.618_034).fract(),
                    (t * 0.414_213_6).fract(),
                    (t * 0.732_050_8).fract(),
                ];
                if i % 17 == 0 {
                    p[0] = -0.02;
                }
                if i % 23 == 0 {
                    p[2] = 1.03;
                }
                p
            })
            .collect()
    }

    fn collect(index: &dyn NeighborhoodIndex, agent: usize, radius: f32) -> Vec<usize> {
        let mut found = Vec::new();
        index.neighbors_within(agent, radius * radius, &mut |idx, _| found.push(idx));
        found.sort_unstable();
        found
    }

    #[test]
    fn grid_matches_brute_force() {
        let positions = scatter(200);
        let mut brute = BruteForceIndex::new();
        brute.rebuild(&positions).expect("brute rebuild");
        let mut grid = UniformGridIndex::new(0.15, [0.0; 3], [1.0; 3]);
        grid.rebuild(&positions).expect("grid rebuild");
        assert_eq!(grid.dims(), [7, 7, 7]);

        for radius in [0.05_f32, 0.15, 0.4] {
            for agent in 0..positions.len() {
                assert_eq!(
                    collect(&grid, agent, radius),
                    collect(&brute, agent, radius),
                    "agent {agent} radius {radius}"
                );
            }
        }
    }

    #[test]
    fn self_is_never_visited() {
        let positions = vec![[0.5, 0.5, 0.5], [0.5, 0.5, 0.5]];
        let mut grid = UniformGridIndex::default();
        grid.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&grid, 0, 0.1), vec![1]);
        assert_eq!(collect(&grid, 1, 0.1), vec![0]);
    }

    #[test]
    fn reports_squared_distance() {
        let positions = vec![[0.0, 0.0, 0.0], [0.3, 0.4, 0.0]];
        let mut brute = BruteForceIndex::new();
        brute.rebuild(&positions).expect("rebuild");
        let mut seen = None;
        brute.neighbors_within(0, 1.0, &mut |idx, dist_sq| seen = Some((idx, dist_sq)));
        let (idx, dist_sq) = seen.expect("neighbor visited");
        assert_eq!(idx, 1);
        assert!((dist_sq.into_inner() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let mut grid = UniformGridIndex::new(0.0, [0.0; 3], [1.0; 3]);
        assert!(matches!(
            grid.rebuild(&[[0.5; 3]]),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tiny_cells_are_capped() {
        let mut grid = UniformGridIndex::new(1e-6, [0.0; 3], [1.0; 3]);
        grid.rebuild(&[[0.1; 3], [0.1, 0.1, 0.1000001]])
            .expect("rebuild");
        assert_eq!(grid.dims(), [MAX_CELLS_PER_AXIS; 3]);
        assert_eq!(collect(&grid, 0, 0.01), vec![1]);
    }

    #[test]
    fn unknown_agent_visits_nothing() {
        let mut grid = UniformGridIndex::default();
        grid.rebuild(&[[0.5; 3]]).expect("rebuild");
        assert!(collect(&grid, 7, 1.0).is_empty());
    }
}
