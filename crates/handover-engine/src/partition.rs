//! Geographic partitioner
//!
//! Splits the globe into latitude/longitude blocks and records, for every
//! block, which satellites' footprints reach it. A point lookup returns the
//! satellites of its own block plus the 8 surrounding blocks, wrapping in
//! longitude and folding across the poles.
//!
//! The index is rebuilt from a [`ConstellationSnapshot`] every cycle and is
//! immutable afterwards, so worker threads read it without locking.

use crate::config::EngineConfig;
use crate::snapshot::ConstellationSnapshot;
use orbital_mechanics::transforms::{
    footprint_radius_km, haversine_km, normalize_longitude, EARTH_RADIUS_KM,
};
use orbital_mechanics::GeodeticPosition;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Surface kilometres per degree of latitude
pub const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub row: u32,
    pub col: u32,
}

/// One cell of the grid and the satellites (snapshot indices) covering it
#[derive(Debug, Clone, Default)]
pub struct GeographicBlock {
    pub satellites: Vec<usize>,
}

/// Lat/lon grid geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockGrid {
    rows: u32,
    cols: u32,
    lat_step: f64,
    lon_step: f64,
}

impl BlockGrid {
    /// Grid whose cells are roughly `block_size_km` on a side at the equator.
    /// Rows and columns are rounded so the cells tile the sphere exactly.
    pub fn new(block_size_km: f64) -> Self {
        let block_deg = (block_size_km / KM_PER_DEGREE).clamp(0.01, 180.0);
        let rows = (180.0 / block_deg).round().max(1.0) as u32;
        let cols = (360.0 / block_deg).round().max(2.0) as u32;
        Self {
            rows,
            cols,
            lat_step: 180.0 / rows as f64,
            lon_step: 360.0 / cols as f64,
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn block_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn key_for(&self, latitude: f64, longitude: f64) -> BlockKey {
        let row = ((latitude.clamp(-90.0, 90.0) + 90.0) / self.lat_step).floor() as i64;
        let col = ((normalize_longitude(longitude) + 180.0) / self.lon_step).floor() as i64;
        BlockKey {
            row: row.clamp(0, self.rows as i64 - 1) as u32,
            col: col.rem_euclid(self.cols as i64) as u32,
        }
    }

    /// (lat_min, lat_max, lon_min, lon_max) in degrees
    pub fn bounds(&self, key: BlockKey) -> (f64, f64, f64, f64) {
        let lat_min = -90.0 + key.row as f64 * self.lat_step;
        let lon_min = -180.0 + key.col as f64 * self.lon_step;
        (lat_min, lat_min + self.lat_step, lon_min, lon_min + self.lon_step)
    }

    pub fn center(&self, key: BlockKey) -> (f64, f64) {
        let (lat_min, lat_max, lon_min, lon_max) = self.bounds(key);
        ((lat_min + lat_max) / 2.0, (lon_min + lon_max) / 2.0)
    }

    /// Largest surface distance from the centre of a block in `row` to its corners
    fn half_diagonal_km(&self, row: u32) -> f64 {
        let key = BlockKey { row, col: 0 };
        let (lat_min, lat_max, lon_min, lon_max) = self.bounds(key);
        let (clat, clon) = self.center(key);
        [
            (lat_min, lon_min),
            (lat_min, lon_max),
            (lat_max, lon_min),
            (lat_max, lon_max),
        ]
        .iter()
        .map(|&(lat, lon)| haversine_km(clat, clon, lat, lon))
        .fold(0.0, f64::max)
    }

    /// The 8 surrounding blocks. Longitude wraps; stepping past a pole lands
    /// on the same polar row half way round the globe.
    pub fn neighbors(&self, key: BlockKey) -> Vec<BlockKey> {
        let rows = self.rows as i64;
        let cols = self.cols as i64;
        let mut out = Vec::with_capacity(8);

        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let mut row = key.row as i64 + dr;
                let mut col = key.col as i64 + dc;
                if row < 0 || row >= rows {
                    row = row.clamp(0, rows - 1);
                    col += cols / 2;
                }
                let neighbor = BlockKey {
                    row: row as u32,
                    col: col.rem_euclid(cols) as u32,
                };
                if neighbor != key && !out.contains(&neighbor) {
                    out.push(neighbor);
                }
            }
        }
        out
    }
}

struct ConstellationGrid {
    grid: BlockGrid,
    blocks: HashMap<BlockKey, GeographicBlock>,
}

/// Per-cycle spatial index over a constellation snapshot
pub struct GeoIndex {
    grids: BTreeMap<String, ConstellationGrid>,
}

impl GeoIndex {
    pub fn build(snapshot: &ConstellationSnapshot, config: &EngineConfig) -> Self {
        let mut grids: BTreeMap<String, ConstellationGrid> = BTreeMap::new();

        for (index, sat) in snapshot.satellites().iter().enumerate() {
            let cgrid = grids
                .entry(sat.constellation.clone())
                .or_insert_with(|| ConstellationGrid {
                    grid: BlockGrid::new(config.block_size_for(&sat.constellation)),
                    blocks: HashMap::new(),
                });

            let radius_km = footprint_radius_km(sat.position.altitude_km, config.min_elevation_deg);
            for key in footprint_blocks(&cgrid.grid, &sat.position, radius_km) {
                cgrid.blocks.entry(key).or_default().satellites.push(index);
            }
        }

        for (tag, cgrid) in &grids {
            debug!(
                "Partitioned {}: {} of {} blocks occupied",
                tag,
                cgrid.blocks.len(),
                cgrid.grid.block_count()
            );
        }

        Self { grids }
    }

    /// Snapshot indices of satellites whose footprints reach the point's block
    /// or any neighboring block, sorted and de-duplicated.
    pub fn candidates(&self, point: &GeodeticPosition) -> Vec<usize> {
        let mut out = Vec::new();
        for cgrid in self.grids.values() {
            let key = cgrid.grid.key_for(point.latitude, point.longitude);
            for k in std::iter::once(key).chain(cgrid.grid.neighbors(key)) {
                if let Some(block) = cgrid.blocks.get(&k) {
                    out.extend_from_slice(&block.satellites);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn block(&self, constellation: &str, key: BlockKey) -> Option<&GeographicBlock> {
        self.grids.get(constellation)?.blocks.get(&key)
    }

    pub fn grid(&self, constellation: &str) -> Option<&BlockGrid> {
        self.grids.get(constellation).map(|g| &g.grid)
    }

    pub fn occupied_blocks(&self) -> usize {
        self.grids.values().map(|g| g.blocks.len()).sum()
    }
}

/// Blocks that a circular footprint of `radius_km` around the sub-satellite
/// point can reach. A block is included when its centre lies within the
/// footprint radius plus the block's half diagonal, so any covered point's
/// own block is always included.
fn footprint_blocks(grid: &BlockGrid, sub: &GeodeticPosition, radius_km: f64) -> Vec<BlockKey> {
    let ang_deg = (radius_km / EARTH_RADIUS_KM).to_degrees();
    let lat_lo = (sub.latitude - ang_deg - grid.lat_step).max(-90.0);
    let lat_hi = (sub.latitude + ang_deg + grid.lat_step).min(90.0);
    let row_lo = grid.key_for(lat_lo, 0.0).row;
    let row_hi = grid.key_for(lat_hi, 0.0).row;

    // Longitude half-width of a spherical cap; the whole ring once it reaches a pole
    let cos_lat = sub.latitude.to_radians().cos();
    let sin_ang = ang_deg.to_radians().sin();
    let all_cols = sub.latitude.abs() + ang_deg >= 90.0 || sin_ang >= cos_lat;
    let half_cols = if all_cols {
        grid.cols as i64
    } else {
        let dlon = (sin_ang / cos_lat).asin().to_degrees() + grid.lon_step;
        (dlon / grid.lon_step).ceil() as i64
    };

    let center = grid.key_for(sub.latitude, sub.longitude);
    let col_span: Vec<u32> = if 2 * half_cols + 1 >= grid.cols as i64 {
        (0..grid.cols).collect()
    } else {
        (-half_cols..=half_cols)
            .map(|dc| (center.col as i64 + dc).rem_euclid(grid.cols as i64) as u32)
            .collect()
    };

    let mut keys = Vec::new();
    for row in row_lo..=row_hi {
        let reach = radius_km + grid.half_diagonal_km(row) + 1e-6;
        for &col in &col_span {
            let key = BlockKey { row, col };
            let (clat, clon) = grid.center(key);
            if haversine_km(sub.latitude, sub.longitude, clat, clon) <= reach {
                keys.push(key);
            }
        }
    }
    keys
}
