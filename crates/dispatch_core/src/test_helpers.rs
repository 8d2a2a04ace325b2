//! Test helpers for common fixtures and stub collaborators.
//!
//! This module provides shared test utilities to reduce duplication across
//! test files: a manual clock, a recording event sink, canned ETA oracles,
//! and sample records.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::events::{Address, EventSink, OutboundEvent, RideEvent};
use crate::geoindex::DriverRegistry;
use crate::model::{
    Availability, Candidate, CandidateStatus, CorrelationId, Dispatch, DispatchId, DispatchOutcome,
    DriverId, Place, PushAddress, Ride, RideId, RideStatus, RiderId, VehicleType,
};
use crate::routing::{EtaMatrix, EtaOracle};
use crate::spatial::GeoPoint;

/// Clock pinned to a settable instant.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Sink that records every emission for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.name).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, address: Address, event: &RideEvent, correlation: &CorrelationId) {
        self.events.lock().expect("sink lock").push(OutboundEvent {
            address,
            name: event.name(),
            payload: event.payload(),
            correlation: correlation.clone(),
        });
    }
}

/// Registry stub that accepts every availability update.
#[derive(Default)]
pub struct NullRegistry;

#[async_trait]
impl DriverRegistry for NullRegistry {
    async fn set_availability(
        &self,
        _driver: &DriverId,
        _availability: Availability,
    ) -> EngineResult<()> {
        Ok(())
    }
}

/// Oracle returning the configured durations regardless of origins. The
/// bound is still applied, so bounded-then-unbounded flows behave as in
/// production.
pub struct FixedEta {
    pub durations: Vec<Option<u32>>,
}

#[async_trait]
impl EtaOracle for FixedEta {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        _destination: GeoPoint,
        bound_secs: Option<u32>,
    ) -> EngineResult<EtaMatrix> {
        debug_assert_eq!(origins.len(), self.durations.len(), "fixture shape mismatch");
        Ok(EtaMatrix::from_durations(self.durations.clone(), bound_secs))
    }
}

/// Oracle that fails a set number of times before serving durations; for
/// exercising the retry policy.
pub struct FlakyEta {
    pub remaining_failures: AtomicU32,
    pub durations: Vec<Option<u32>>,
}

impl FlakyEta {
    pub fn failing(times: u32, durations: Vec<Option<u32>>) -> Self {
        Self {
            remaining_failures: AtomicU32::new(times),
            durations,
        }
    }
}

#[async_trait]
impl EtaOracle for FlakyEta {
    async fn multi_eta(
        &self,
        _origins: &[GeoPoint],
        _destination: GeoPoint,
        bound_secs: Option<u32>,
    ) -> EngineResult<EtaMatrix> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Unavailable("eta oracle flapping".into()));
        }
        Ok(EtaMatrix::from_durations(self.durations.clone(), bound_secs))
    }
}

/// A pickup point used across tests (central Berlin).
pub fn test_pickup() -> GeoPoint {
    GeoPoint::new(52.5200, 13.4050).expect("valid pickup")
}

pub fn test_destination() -> GeoPoint {
    GeoPoint::new(52.4900, 13.4250).expect("valid destination")
}

fn place(point: GeoPoint) -> Place {
    Place {
        raw: format!("{},{}", point.lat, point.lon),
        point,
    }
}

/// Dispatch with `count` pending candidates (`d-0`, `d-1`, ...), cursor 0,
/// 30 s ack window.
pub fn sample_dispatch(count: usize) -> Dispatch {
    sample_dispatch_with(count, 30)
}

pub fn sample_dispatch_with(count: usize, ack_seconds: u64) -> Dispatch {
    let candidates = (0..count)
        .map(|i| Candidate {
            driver: DriverId(format!("d-{i}")),
            push_address: Some(PushAddress(format!("push-{i}"))),
            eta_seconds: Some(240 + 60 * i as u32),
            status: CandidateStatus::Pending,
        })
        .collect();
    Dispatch {
        id: DispatchId::new(),
        rider: RiderId("r-1".into()),
        pickup: place(test_pickup()),
        destination: place(test_destination()),
        vehicle: VehicleType::Car,
        candidates,
        cursor: 0,
        outcome: DispatchOutcome::Pending,
        ride_id: None,
        fare_minor: 1250,
        ack_seconds,
        correlation: CorrelationId::generate(),
        created_at_ms: 0,
    }
}

pub fn sample_ride() -> Ride {
    Ride {
        id: RideId::new(),
        rider: RiderId("r-1".into()),
        driver: DriverId("d-0".into()),
        pickup: "52.52,13.405".into(),
        destination: "52.49,13.425".into(),
        fare_minor: 1250,
        status: RideStatus::Accepted,
        otp: "042117".into(),
        created_at_ms: 0,
    }
}
