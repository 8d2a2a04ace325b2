//! Travel-time estimation: batch ETAs from many origins to one destination.
//!
//! This module provides:
//!
//! - **EtaMatrix**: per-origin durations with bound blanking and argmin
//! - **EtaOracle**: the provider seam (OSRM table endpoint or the local
//!   speed model)
//! - **EtaCalibrator**: optional per-duration correction with time-of-day
//!   context; calibration failures retain the raw value
//!
//! Provider faults surface as `Unavailable`; the call site retries them
//! with the shared backoff policy.

#[cfg(feature = "osrm")]
pub mod osrm;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Timelike, Utc};

use crate::clock::SharedClock;
use crate::error::EngineResult;
use crate::spatial::{haversine_km, GeoPoint};

/// Batch ETA result. `durations[i]` is the travel time in whole seconds
/// from origin `i`, or `None` when unreachable or over the bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtaMatrix {
    pub durations: Vec<Option<u32>>,
    /// Argmin over defined entries, ties broken by lowest index. `None`
    /// when every entry is blank.
    pub best_index: Option<usize>,
}

impl EtaMatrix {
    /// Apply the bound (entries above it are blanked in the returned array)
    /// and compute the argmin.
    pub fn from_durations(mut durations: Vec<Option<u32>>, bound_secs: Option<u32>) -> Self {
        if let Some(bound) = bound_secs {
            for slot in &mut durations {
                if matches!(slot, Some(d) if *d > bound) {
                    *slot = None;
                }
            }
        }

        let mut best_index = None;
        let mut best_duration = u32::MAX;
        for (i, slot) in durations.iter().enumerate() {
            if let Some(d) = slot {
                if *d < best_duration {
                    best_duration = *d;
                    best_index = Some(i);
                }
            }
        }

        Self {
            durations,
            best_index,
        }
    }
}

/// Time-of-day context handed to the calibrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationContext {
    /// 0..=23, UTC.
    pub hour_of_day: u32,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u32,
}

impl CalibrationContext {
    pub fn from_unix_ms(ms: i64) -> Self {
        match Utc.timestamp_millis_opt(ms).single() {
            Some(at) => Self {
                hour_of_day: at.hour(),
                day_of_week: at.weekday().num_days_from_monday(),
            },
            None => Self {
                hour_of_day: 0,
                day_of_week: 0,
            },
        }
    }
}

/// Optional correction layer over raw provider durations (e.g. a learned
/// congestion model). Must never turn a defined duration into undefined;
/// the helper below guarantees that by retaining the raw value on failure.
#[async_trait]
pub trait EtaCalibrator: Send + Sync {
    async fn calibrate(&self, raw_secs: u32, ctx: &CalibrationContext) -> EngineResult<u32>;
}

/// Run every defined duration through the calibrator. Failures keep the raw
/// value.
pub async fn calibrate_all(
    raw: Vec<Option<u32>>,
    calibrator: Option<&dyn EtaCalibrator>,
    ctx: &CalibrationContext,
) -> Vec<Option<u32>> {
    let Some(calibrator) = calibrator else {
        return raw;
    };
    let mut out = Vec::with_capacity(raw.len());
    for slot in raw {
        match slot {
            Some(secs) => match calibrator.calibrate(secs, ctx).await {
                Ok(adjusted) => out.push(Some(adjusted)),
                Err(err) => {
                    tracing::debug!(raw_secs = secs, error = %err, "calibration failed, keeping raw value");
                    out.push(Some(secs));
                }
            },
            None => out.push(None),
        }
    }
    out
}

/// Batch travel-time provider.
#[async_trait]
pub trait EtaOracle: Send + Sync {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
        bound_secs: Option<u32>,
    ) -> EngineResult<EtaMatrix>;
}

/// Straight-line estimate over a constant road speed. The local fallback
/// when no routing provider is configured, and the workhorse for tests.
pub struct SpeedModelEta {
    speed_kmh: f64,
    calibrator: Option<Arc<dyn EtaCalibrator>>,
    clock: SharedClock,
}

impl SpeedModelEta {
    pub fn new(speed_kmh: f64, clock: SharedClock) -> Self {
        Self {
            speed_kmh: speed_kmh.max(1.0),
            calibrator: None,
            clock,
        }
    }

    pub fn with_calibrator(mut self, calibrator: Arc<dyn EtaCalibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }
}

#[async_trait]
impl EtaOracle for SpeedModelEta {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
        bound_secs: Option<u32>,
    ) -> EngineResult<EtaMatrix> {
        let raw: Vec<Option<u32>> = origins
            .iter()
            .map(|origin| {
                let hours = haversine_km(*origin, destination) / self.speed_kmh;
                Some((hours * 3600.0).round() as u32)
            })
            .collect();

        let ctx = CalibrationContext::from_unix_ms(self.clock.now_ms());
        let calibrated = calibrate_all(raw, self.calibrator.as_deref(), &ctx).await;
        Ok(EtaMatrix::from_durations(calibrated, bound_secs))
    }
}
