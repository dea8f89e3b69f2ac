//! Read-only terrain oracle.
//!
//! The world is a latitude/longitude grid of tiles. Each tile is either open
//! or blocked and may belong to a territory region. Both queries are O(1)
//! lookups into precomputed tables, so the motion solver can probe the
//! footprint of every tank every tick.

use crate::sphere::{SpherePoint, POLE_EPSILON};
use crate::RegionId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};

pub const GRID_LON_CELLS: usize = 120;
pub const GRID_LAT_CELLS: usize = 60;
/// Regions are square blocks of this many tiles per side.
pub const REGION_SPAN: usize = 5;
/// Rows this close to a pole carry no region.
pub const POLAR_ROWS: usize = 5;

/// Questions the simulation asks about the static world.
pub trait TerrainOracle {
    fn is_blocked(&self, theta: f64, phi: f64) -> bool;
    fn region_at(&self, theta: f64, phi: f64) -> Option<RegionId>;

    fn is_point_blocked(&self, point: &SpherePoint) -> bool {
        self.is_blocked(point.theta, point.phi)
    }
}

/// Precomputed lookup grid.
#[derive(Debug, Clone)]
pub struct GridTerrain {
    lon_cells: usize,
    lat_cells: usize,
    blocked: Vec<bool>,
    regions: Vec<Option<RegionId>>,
}

impl GridTerrain {
    /// A grid with no obstacles and the standard region layout.
    pub fn open(lon_cells: usize, lat_cells: usize) -> Self {
        let lon_cells = lon_cells.max(1);
        let lat_cells = lat_cells.max(1);
        let mut regions = vec![None; lon_cells * lat_cells];
        let region_cols = lon_cells.div_ceil(REGION_SPAN);

        for row in 0..lat_cells {
            if row < POLAR_ROWS || row + POLAR_ROWS >= lat_cells {
                continue;
            }
            let band = (row - POLAR_ROWS) / REGION_SPAN;
            for col in 0..lon_cells {
                let id = band * region_cols + col / REGION_SPAN;
                regions[row * lon_cells + col] = Some(RegionId(id as u16));
            }
        }

        Self {
            lon_cells,
            lat_cells,
            blocked: vec![false; lon_cells * lat_cells],
            regions,
        }
    }

    /// Deterministically scatters wall segments over an open grid.
    ///
    /// Client and server call this with the same seed and get the same world.
    pub fn generate(seed: u64) -> Self {
        let mut terrain = Self::open(GRID_LON_CELLS, GRID_LAT_CELLS);
        let mut rng = StdRng::seed_from_u64(seed);
        let wall_count = (GRID_LON_CELLS * GRID_LAT_CELLS) / 60;

        for _ in 0..wall_count {
            let mut col = rng.gen_range(0..terrain.lon_cells);
            // keep the polar caps clear so spawning there never deadlocks
            let mut row = rng.gen_range(POLAR_ROWS..terrain.lat_cells - POLAR_ROWS);
            let length = rng.gen_range(2..7);
            let along_latitude = rng.gen_bool(0.5);

            for _ in 0..length {
                terrain.set_blocked(col, row, true);
                if along_latitude {
                    col = (col + 1) % terrain.lon_cells;
                } else if row + 1 < terrain.lat_cells - POLAR_ROWS {
                    row += 1;
                }
            }
        }

        terrain
    }

    pub fn lon_cells(&self) -> usize {
        self.lon_cells
    }

    pub fn lat_cells(&self) -> usize {
        self.lat_cells
    }

    pub fn set_blocked(&mut self, col: usize, row: usize, blocked: bool) {
        if col < self.lon_cells && row < self.lat_cells {
            self.blocked[row * self.lon_cells + col] = blocked;
        }
    }

    pub fn cell_blocked(&self, col: usize, row: usize) -> bool {
        self.blocked[row * self.lon_cells + col]
    }

    pub fn cell_region(&self, col: usize, row: usize) -> Option<RegionId> {
        self.regions[row * self.lon_cells + col]
    }

    /// Grid cell containing `(theta, phi)`.
    pub fn cell_at(&self, theta: f64, phi: f64) -> (usize, usize) {
        let col = ((theta.rem_euclid(TAU) / TAU) * self.lon_cells as f64) as usize;
        let row = ((phi / PI) * self.lat_cells as f64) as usize;
        (col.min(self.lon_cells - 1), row.min(self.lat_cells - 1))
    }

    /// Center of a grid cell.
    pub fn cell_center(&self, col: usize, row: usize) -> SpherePoint {
        let theta = (col as f64 + 0.5) / self.lon_cells as f64 * TAU;
        let phi = (row as f64 + 0.5) / self.lat_cells as f64 * PI;
        SpherePoint::new(theta, phi)
    }

    /// Number of tiles owned by each region.
    pub fn region_tile_counts(&self) -> BTreeMap<RegionId, u32> {
        let mut counts = BTreeMap::new();
        for region in self.regions.iter().flatten() {
            *counts.entry(*region).or_insert(0) += 1;
        }
        counts
    }

    /// Open cell nearest to `point`, searched in growing square rings.
    pub fn nearest_open(&self, point: &SpherePoint) -> Option<SpherePoint> {
        self.nearest_where(point, |_| true)
    }

    /// Nearest point that is on open ground and passes `accept`.
    ///
    /// `point` itself is returned when it qualifies, otherwise the closest
    /// qualifying cell center by ring distance.
    pub fn nearest_where<F>(&self, point: &SpherePoint, mut accept: F) -> Option<SpherePoint>
    where
        F: FnMut(&SpherePoint) -> bool,
    {
        let (col, row) = self.cell_at(point.theta, point.phi);
        if !self.cell_blocked(col, row) && accept(point) {
            return Some(*point);
        }

        let max_ring = self.lon_cells.max(self.lat_cells) as i64;
        for ring in 0..=max_ring {
            for d_row in -ring..=ring {
                for d_col in -ring..=ring {
                    if d_row.abs() != ring && d_col.abs() != ring {
                        continue;
                    }
                    let r = row as i64 + d_row;
                    if r < 0 || r >= self.lat_cells as i64 {
                        continue;
                    }
                    let c = (col as i64 + d_col).rem_euclid(self.lon_cells as i64) as usize;
                    let r = r as usize;
                    let center = self.cell_center(c, r);
                    if self.cell_blocked(c, r) || !clear_of_poles(&center) {
                        continue;
                    }
                    if accept(&center) {
                        return Some(center);
                    }
                }
            }
        }
        None
    }

    /// Uniformly chosen open cell center outside the polar caps.
    pub fn random_open_point<R: Rng>(&self, rng: &mut R) -> Option<SpherePoint> {
        self.random_where(rng, |_| true)
    }

    /// Random open cell center outside the polar caps that passes `accept`.
    ///
    /// Falls back to a ring search from the equator when random draws keep
    /// missing.
    pub fn random_where<R, F>(&self, rng: &mut R, mut accept: F) -> Option<SpherePoint>
    where
        R: Rng,
        F: FnMut(&SpherePoint) -> bool,
    {
        let low = POLAR_ROWS.min(self.lat_cells - 1);
        let high = self.lat_cells.saturating_sub(POLAR_ROWS).max(low + 1);
        for _ in 0..256 {
            let col = rng.gen_range(0..self.lon_cells);
            let row = rng.gen_range(low..high);
            if self.cell_blocked(col, row) {
                continue;
            }
            let center = self.cell_center(col, row);
            if accept(&center) {
                return Some(center);
            }
        }
        self.nearest_where(&SpherePoint::new(0.0, PI / 2.0), accept)
    }
}

fn clear_of_poles(point: &SpherePoint) -> bool {
    point.phi > POLE_EPSILON * 2.0 && point.phi < PI - POLE_EPSILON * 2.0
}

impl TerrainOracle for GridTerrain {
    fn is_blocked(&self, theta: f64, phi: f64) -> bool {
        let (col, row) = self.cell_at(theta, phi);
        self.cell_blocked(col, row)
    }

    fn region_at(&self, theta: f64, phi: f64) -> Option<RegionId> {
        let (col, row) = self.cell_at(theta, phi);
        self.cell_region(col, row)
    }
}
