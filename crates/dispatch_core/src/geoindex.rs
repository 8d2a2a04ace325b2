//! Driver lookup: availability-filtered nearest-driver queries over an H3
//! cell grid.
//!
//! [`DriverIndex`] is the gateway to whatever holds live driver positions;
//! [`GridDriverIndex`] is the supplied in-memory implementation, bucketing
//! drivers by H3 cell (resolution 9, ~240 m cells) with a grid-disk
//! prefilter and an exact haversine cut. It doubles as the best-effort
//! [`DriverRegistry`] the scheduler pings on assignment.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use h3o::{CellIndex, Resolution};

use crate::error::{EngineError, EngineResult};
use crate::model::{Availability, DriverId, DriverSnapshot, VehicleType};
use crate::spatial::{haversine_m, GeoPoint};

pub const MIN_RADIUS_M: f64 = 1.0;
pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const MAX_LIMIT: usize = 50;

/// Query surface over live driver positions.
///
/// Implementations return only `availability = active` drivers, ordered by
/// ascending great-circle distance from the origin, capped at `limit`.
/// Vehicle aliases ("moto") are normalized before this layer. Transient
/// index outages surface as `Unavailable` and are retried by the caller
/// with the shared backoff policy.
#[async_trait]
pub trait DriverIndex: Send + Sync {
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_m: f64,
        vehicle: Option<VehicleType>,
        limit: usize,
    ) -> EngineResult<Vec<DriverSnapshot>>;
}

/// Best-effort availability updates toward the driver service. Idempotent;
/// never required for correctness of a dispatch outcome.
#[async_trait]
pub trait DriverRegistry: Send + Sync {
    async fn set_availability(&self, driver: &DriverId, availability: Availability)
        -> EngineResult<()>;
}

fn validate_query(radius_m: f64, limit: usize) -> EngineResult<()> {
    if !radius_m.is_finite() || !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&radius_m) {
        return Err(EngineError::bad_input(format!(
            "radius must be {MIN_RADIUS_M}..={MAX_RADIUS_M} m, got {radius_m}"
        )));
    }
    if limit == 0 || limit > MAX_LIMIT {
        return Err(EngineError::bad_input(format!(
            "limit must be 1..={MAX_LIMIT}, got {limit}"
        )));
    }
    Ok(())
}

struct IndexedDriver {
    snapshot: DriverSnapshot,
    cell: CellIndex,
}

/// In-memory H3-bucketed driver index.
pub struct GridDriverIndex {
    resolution: Resolution,
    /// Conservative center-to-center spacing used to size the grid disk.
    /// Overshooting only widens the prefilter; the haversine cut enforces
    /// the exact radius.
    cell_spacing_km: f64,
    drivers: DashMap<DriverId, IndexedDriver>,
    cells: DashMap<CellIndex, HashSet<DriverId>>,
}

impl GridDriverIndex {
    pub fn new(resolution: Resolution, cell_spacing_km: f64) -> Self {
        Self {
            resolution,
            cell_spacing_km,
            drivers: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    /// Insert or move a driver. Positions come from the location pipeline;
    /// the dispatch engine itself never writes them.
    pub fn upsert(&self, snapshot: DriverSnapshot) -> EngineResult<()> {
        let cell = snapshot.position.to_cell(self.resolution)?;
        let id = snapshot.id.clone();
        if let Some(previous) = self.drivers.insert(
            id.clone(),
            IndexedDriver {
                snapshot,
                cell,
            },
        ) {
            if previous.cell != cell {
                if let Some(mut bucket) = self.cells.get_mut(&previous.cell) {
                    bucket.remove(&id);
                }
            }
        }
        self.cells.entry(cell).or_default().insert(id);
        Ok(())
    }

    pub fn remove(&self, driver: &DriverId) {
        if let Some((_, indexed)) = self.drivers.remove(driver) {
            if let Some(mut bucket) = self.cells.get_mut(&indexed.cell) {
                bucket.remove(driver);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    fn disk_k(&self, radius_m: f64) -> u32 {
        let radius_km = radius_m / 1000.0;
        (radius_km / self.cell_spacing_km).ceil() as u32 + 1
    }
}

impl Default for GridDriverIndex {
    fn default() -> Self {
        Self::new(Resolution::Nine, 0.35)
    }
}

#[async_trait]
impl DriverIndex for GridDriverIndex {
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_m: f64,
        vehicle: Option<VehicleType>,
        limit: usize,
    ) -> EngineResult<Vec<DriverSnapshot>> {
        validate_query(radius_m, limit)?;
        let origin_cell = origin.to_cell(self.resolution)?;
        let k = self.disk_k(radius_m);

        let mut matches: Vec<(f64, DriverSnapshot)> = Vec::new();
        for cell in origin_cell.grid_disk::<Vec<_>>(k) {
            let Some(bucket) = self.cells.get(&cell) else {
                continue;
            };
            for id in bucket.iter() {
                let Some(indexed) = self.drivers.get(id) else {
                    continue;
                };
                let snapshot = &indexed.snapshot;
                if snapshot.availability != Availability::Active {
                    continue;
                }
                if let Some(wanted) = vehicle {
                    if snapshot.vehicle != wanted {
                        continue;
                    }
                }
                let distance = haversine_m(origin, snapshot.position);
                if distance <= radius_m {
                    matches.push((distance, snapshot.clone()));
                }
            }
        }

        matches.sort_by(|a, b| a.0.total_cmp(&b.0));
        matches.truncate(limit);
        Ok(matches.into_iter().map(|(_, snapshot)| snapshot).collect())
    }
}

#[async_trait]
impl DriverRegistry for GridDriverIndex {
    async fn set_availability(
        &self,
        driver: &DriverId,
        availability: Availability,
    ) -> EngineResult<()> {
        match self.drivers.get_mut(driver) {
            Some(mut indexed) => {
                indexed.snapshot.availability = availability;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("driver {driver} not indexed"))),
        }
    }
}
