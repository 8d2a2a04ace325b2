//! Engine: the dispatch API surface and its collaborator wiring.
//!
//! All collaborators arrive through [`EngineConfig`]; there is no global
//! state and the offer worker pool has an explicit start/stop lifecycle.
//! `start_dispatch` builds the candidate list (driver index + ETA oracle),
//! persists the record, and enqueues exactly one offer task; `ack_offer`
//! and `cancel_dispatch` only ever write through the store's conditional
//! transitions and then ring the dispatch's wakeup signal.

use std::sync::Arc;

use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::events::{Address, EventSink, RideEvent};
use crate::geoindex::{DriverIndex, DriverRegistry, MAX_LIMIT};
use crate::idempotency::{IdempotencyCache, RequestKey};
use crate::model::{
    Candidate, CandidateStatus, CorrelationId, Dispatch, DispatchId, DispatchOutcome, DriverId,
    Place, Ride, RideId, RideStatus, RiderId, VehicleType,
};
use crate::pricing::{quote_fare_minor, PricingConfig, SurgeSource};
use crate::queue::OfferQueue;
use crate::retry::{with_backoff, RetryPolicy};
use crate::routing::EtaOracle;
use crate::scheduler::{DispatchSignals, OfferScheduler, SchedulerConfig, SchedulerDeps};
use crate::spatial::Geocoder;
use crate::store::{DispatchStore, RideStore, StoreError};

pub const MAX_RADIUS_KM: f64 = 50.0;
pub const DEFAULT_RADIUS_KM: f64 = 5.0;
pub const DEFAULT_LIMIT: usize = 10;
pub const MIN_ACK_SECONDS: u64 = 5;
pub const MAX_ACK_SECONDS: u64 = 120;

/// Everything the engine talks to. No hidden globals; tests swap any seam.
pub struct EngineConfig {
    pub dispatches: Arc<dyn DispatchStore>,
    pub rides: Arc<dyn RideStore>,
    pub queue: Arc<OfferQueue>,
    pub sink: Arc<dyn EventSink>,
    pub driver_index: Arc<dyn DriverIndex>,
    pub registry: Arc<dyn DriverRegistry>,
    pub eta_oracle: Arc<dyn EtaOracle>,
    pub geocoder: Arc<dyn Geocoder>,
    pub surge: Arc<dyn SurgeSource>,
    pub clock: SharedClock,
    pub retry: RetryPolicy,
    pub pricing: PricingConfig,
    pub ack_seconds_default: u64,
}

/// An open-ride request as it arrives at the API boundary.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub rider: RiderId,
    pub pickup: String,
    pub destination: String,
    pub vehicle: Option<String>,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
    pub bound_secs: Option<u32>,
    pub ack_seconds: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// What the rider gets back while the offer round runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub dispatch_id: DispatchId,
    pub candidate_count: usize,
    pub cursor: usize,
    pub ack_seconds: u64,
    pub fare_minor: u64,
}

struct EngineInner {
    dispatches: Arc<dyn DispatchStore>,
    rides: Arc<dyn RideStore>,
    queue: Arc<OfferQueue>,
    sink: Arc<dyn EventSink>,
    driver_index: Arc<dyn DriverIndex>,
    registry: Arc<dyn DriverRegistry>,
    eta_oracle: Arc<dyn EtaOracle>,
    geocoder: Arc<dyn Geocoder>,
    surge: Arc<dyn SurgeSource>,
    clock: SharedClock,
    retry: RetryPolicy,
    pricing: PricingConfig,
    ack_seconds_default: u64,
    signals: Arc<DispatchSignals>,
    idempotency: IdempotencyCache<DispatchReceipt>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let idempotency = IdempotencyCache::hourly(config.clock.clone());
        Self {
            inner: Arc::new(EngineInner {
                dispatches: config.dispatches,
                rides: config.rides,
                queue: config.queue,
                sink: config.sink,
                driver_index: config.driver_index,
                registry: config.registry,
                eta_oracle: config.eta_oracle,
                geocoder: config.geocoder,
                surge: config.surge,
                clock: config.clock,
                retry: config.retry,
                pricing: config.pricing,
                ack_seconds_default: config.ack_seconds_default,
                signals: Arc::new(DispatchSignals::default()),
                idempotency,
            }),
        }
    }

    /// Worker pool bound to this engine's stores, queue, and signals.
    pub fn offer_scheduler(&self, config: SchedulerConfig) -> OfferScheduler {
        let inner = &self.inner;
        OfferScheduler::new(
            SchedulerDeps {
                dispatches: inner.dispatches.clone(),
                rides: inner.rides.clone(),
                queue: inner.queue.clone(),
                sink: inner.sink.clone(),
                registry: inner.registry.clone(),
                signals: inner.signals.clone(),
                clock: inner.clock.clone(),
            },
            config,
        )
    }

    /// Open a dispatch: select candidates, price the trip, persist, enqueue
    /// one offer task. Idempotent under a client key or the request
    /// fingerprint for one hour.
    pub async fn start_dispatch(
        &self,
        request: DispatchRequest,
        correlation: CorrelationId,
    ) -> EngineResult<DispatchReceipt> {
        let inner = &self.inner;
        let vehicle = match &request.vehicle {
            Some(raw) => VehicleType::normalize(raw)
                .ok_or_else(|| EngineError::bad_input(format!("unknown vehicle type {raw:?}")))?,
            None => VehicleType::Car,
        };
        let radius_km = request.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
        if !radius_km.is_finite() || radius_km <= 0.0 || radius_km > MAX_RADIUS_KM {
            return Err(EngineError::bad_input(format!(
                "radius must be 0..={MAX_RADIUS_KM} km, got {radius_km}"
            )));
        }
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(EngineError::bad_input(format!(
                "limit must be 1..={MAX_LIMIT}, got {limit}"
            )));
        }
        let ack_seconds = request.ack_seconds.unwrap_or(inner.ack_seconds_default);
        if !(MIN_ACK_SECONDS..=MAX_ACK_SECONDS).contains(&ack_seconds) {
            return Err(EngineError::bad_input(format!(
                "ackSeconds must be {MIN_ACK_SECONDS}..={MAX_ACK_SECONDS}, got {ack_seconds}"
            )));
        }

        let key = match &request.idempotency_key {
            Some(client_key) => RequestKey::client(&request.rider, client_key),
            None => RequestKey::fingerprint(
                &request.rider,
                &request.pickup,
                &request.destination,
                vehicle,
            ),
        };
        if let Some(prior) = inner.idempotency.lookup(&key) {
            return Ok(prior);
        }

        let pickup = inner.geocoder.resolve(&request.pickup).await?;
        let destination = inner.geocoder.resolve(&request.destination).await?;

        let drivers = with_backoff(inner.retry, || {
            inner
                .driver_index
                .nearby(pickup, radius_km * 1000.0, Some(vehicle), limit)
        })
        .await?;

        if drivers.is_empty() {
            // The record is still created, immediately exhausted, so the
            // attempt is auditable.
            let dispatch = Dispatch {
                id: DispatchId::new(),
                rider: request.rider.clone(),
                pickup: Place {
                    raw: request.pickup.clone(),
                    point: pickup,
                },
                destination: Place {
                    raw: request.destination.clone(),
                    point: destination,
                },
                vehicle,
                candidates: Vec::new(),
                cursor: 0,
                outcome: DispatchOutcome::Exhausted,
                ride_id: None,
                fare_minor: quote_fare_minor(pickup, destination, 1.0, &inner.pricing),
                ack_seconds,
                correlation,
                created_at_ms: inner.clock.now_ms(),
            };
            inner.dispatches.create(&dispatch)?;
            return Err(EngineError::NotFound("no drivers nearby".into()));
        }

        let origins: Vec<_> = drivers.iter().map(|d| d.position).collect();
        let mut matrix = with_backoff(inner.retry, || {
            inner.eta_oracle.multi_eta(&origins, pickup, request.bound_secs)
        })
        .await?;
        // A bound that filters out every candidate falls back to the
        // unbounded ordering.
        if matrix.best_index.is_none() && request.bound_secs.is_some() {
            matrix = with_backoff(inner.retry, || {
                inner.eta_oracle.multi_eta(&origins, pickup, None)
            })
            .await?;
        }
        if matrix.durations.len() != drivers.len() {
            return Err(EngineError::Internal(format!(
                "eta oracle returned {} durations for {} origins",
                matrix.durations.len(),
                drivers.len()
            )));
        }

        let cursor = matrix.best_index.unwrap_or(0);
        let surge = inner.surge.multiplier(pickup).await;
        let fare_minor = quote_fare_minor(pickup, destination, surge, &inner.pricing);

        let candidates: Vec<Candidate> = drivers
            .into_iter()
            .zip(matrix.durations.iter().copied())
            .enumerate()
            .map(|(i, (driver, eta_seconds))| Candidate {
                driver: driver.id,
                push_address: driver.push_address,
                eta_seconds,
                status: if i < cursor {
                    CandidateStatus::Skipped
                } else {
                    CandidateStatus::Pending
                },
            })
            .collect();

        let dispatch = Dispatch {
            id: DispatchId::new(),
            rider: request.rider.clone(),
            pickup: Place {
                raw: request.pickup.clone(),
                point: pickup,
            },
            destination: Place {
                raw: request.destination.clone(),
                point: destination,
            },
            vehicle,
            candidates,
            cursor,
            outcome: DispatchOutcome::Pending,
            ride_id: None,
            fare_minor,
            ack_seconds,
            correlation,
            created_at_ms: inner.clock.now_ms(),
        };
        inner.dispatches.create(&dispatch)?;
        inner.queue.enqueue(&dispatch.id)?;

        let receipt = DispatchReceipt {
            dispatch_id: dispatch.id,
            candidate_count: dispatch.candidates.len(),
            cursor,
            ack_seconds,
            fare_minor,
        };
        let winner = inner.idempotency.store(key, receipt.clone());
        if winner.dispatch_id != receipt.dispatch_id {
            // A concurrent identical request won the slot; withdraw this
            // record and hand back the winner's receipt. The queued task
            // observes the cancelled outcome and no-ops.
            let _ = inner.dispatches.cancel(&dispatch.id);
            return Ok(winner);
        }
        Ok(receipt)
    }

    /// A driver's answer to an offer. Never blocks: one conditional write,
    /// one wakeup.
    pub async fn ack_offer(
        &self,
        id: &DispatchId,
        driver: &DriverId,
        accepted: bool,
    ) -> EngineResult<()> {
        let inner = &self.inner;
        let dispatch = match inner.dispatches.read(id) {
            Ok(dispatch) => dispatch,
            Err(StoreError::NotFound) => {
                return Err(EngineError::NotFound(format!("dispatch {id} not found")))
            }
            Err(err) => return Err(err.into()),
        };
        if dispatch.outcome.is_terminal() {
            return Err(EngineError::Gone("dispatch is closed".into()));
        }
        let index = dispatch
            .candidate_index_of(driver)
            .ok_or_else(|| EngineError::NotFound(format!("driver {driver} is not a candidate")))?;

        let target = if accepted {
            CandidateStatus::Acked
        } else {
            CandidateStatus::Rejected
        };
        if dispatch.candidates[index].status == target {
            // Duplicate answer; same successful result.
            return Ok(());
        }

        match inner
            .dispatches
            .set_candidate_status(id, index, CandidateStatus::Offered, target)
        {
            Ok(()) => {
                inner.signals.notify(id);
                Ok(())
            }
            Err(StoreError::Conflict) | Err(StoreError::AlreadyTerminal) => {
                let current = inner.dispatches.read(id)?;
                let status = current.candidates[index].status;
                if status == target
                    || (accepted && status == CandidateStatus::Assigned)
                {
                    // Raced against an identical answer or the commit of
                    // this very acceptance.
                    return Ok(());
                }
                if current.outcome.is_terminal() {
                    return Err(EngineError::Gone("dispatch is closed".into()));
                }
                match status {
                    CandidateStatus::TimedOut | CandidateStatus::Skipped => {
                        Err(EngineError::Gone("offer window closed".into()))
                    }
                    _ => Err(EngineError::Conflict(
                        "offer cannot be answered in its current state".into(),
                    )),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rider-side cancellation of the whole dispatch.
    pub async fn cancel_dispatch(&self, id: &DispatchId) -> EngineResult<()> {
        match self.inner.dispatches.cancel(id) {
            Ok(()) => {
                self.inner.signals.notify(id);
                Ok(())
            }
            Err(StoreError::AlreadyTerminal) => {
                Err(EngineError::Conflict("dispatch already terminal".into()))
            }
            Err(StoreError::NotFound) => {
                Err(EngineError::NotFound(format!("dispatch {id} not found")))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn dispatch_status(&self, id: &DispatchId) -> EngineResult<Dispatch> {
        Ok(self.inner.dispatches.read(id)?)
    }

    pub fn ride_status(&self, id: &RideId) -> EngineResult<Ride> {
        Ok(self.inner.rides.read(id)?)
    }

    /// OTP witness: the driver relays the rider's code to start the trip.
    pub async fn start_ride(
        &self,
        id: &RideId,
        otp: &str,
        correlation: &CorrelationId,
    ) -> EngineResult<Ride> {
        let inner = &self.inner;
        let ride = inner.rides.read_with_otp(id)?;
        if ride.otp != otp {
            return Err(EngineError::Conflict("otp mismatch".into()));
        }
        match inner
            .rides
            .transition(id, RideStatus::Accepted, RideStatus::Ongoing)
        {
            Ok(()) => {
                inner
                    .sink
                    .emit(
                        Address::Rider(ride.rider.clone()),
                        &RideEvent::Started { ride_id: *id },
                        correlation,
                    )
                    .await;
                Ok(inner.rides.read(id)?)
            }
            Err(StoreError::Conflict) => {
                Err(EngineError::Conflict("ride is not awaiting pickup".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn end_ride(&self, id: &RideId, correlation: &CorrelationId) -> EngineResult<Ride> {
        let inner = &self.inner;
        let ride = inner.rides.read(id)?;
        match inner
            .rides
            .transition(id, RideStatus::Ongoing, RideStatus::Completed)
        {
            Ok(()) => {
                inner
                    .sink
                    .emit(
                        Address::Rider(ride.rider.clone()),
                        &RideEvent::Ended { ride_id: *id },
                        correlation,
                    )
                    .await;
                Ok(inner.rides.read(id)?)
            }
            Err(StoreError::Conflict) => Err(EngineError::Conflict("ride is not ongoing".into())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn cancel_ride(&self, id: &RideId) -> EngineResult<Ride> {
        let inner = &self.inner;
        let ride = inner.rides.read(id)?;
        let result = match ride.status {
            RideStatus::Accepted => {
                inner
                    .rides
                    .transition(id, RideStatus::Accepted, RideStatus::Cancelled)
            }
            RideStatus::Ongoing => {
                inner
                    .rides
                    .transition(id, RideStatus::Ongoing, RideStatus::Cancelled)
            }
            _ => Err(StoreError::Conflict),
        };
        match result {
            Ok(()) => Ok(inner.rides.read(id)?),
            Err(StoreError::Conflict) => {
                Err(EngineError::Conflict("ride already terminal".into()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::geoindex::GridDriverIndex;
    use crate::model::{Availability, DriverSnapshot, PushAddress};
    use crate::pricing::FixedSurge;
    use crate::spatial::{GeoPoint, LatLonParser};
    use crate::store::durable::{SledDispatchStore, SledRideStore, Storage};
    use crate::test_helpers::{sample_ride, FixedEta, FlakyEta, RecordingSink};

    struct TestBed {
        engine: Engine,
        dispatches: Arc<SledDispatchStore>,
        rides: Arc<SledRideStore>,
        queue: Arc<OfferQueue>,
        sink: Arc<RecordingSink>,
    }

    /// Engine over temporary stores, `driver_count` car drivers seeded at
    /// increasing distance from the test pickup, and the given ETA oracle.
    fn bed(eta_oracle: Arc<dyn EtaOracle>, driver_count: usize) -> TestBed {
        let storage = Storage::temporary().expect("temporary sled");
        let dispatches = Arc::new(storage.dispatches().expect("dispatch tree"));
        let rides = Arc::new(storage.rides().expect("ride tree"));
        let queue = Arc::new(OfferQueue::open(storage.db()).expect("queue"));
        let sink = Arc::new(RecordingSink::default());

        let index = Arc::new(GridDriverIndex::default());
        for i in 0..driver_count {
            index
                .upsert(DriverSnapshot {
                    id: DriverId(format!("d-{i}")),
                    position: GeoPoint::new(52.5200 + 0.003 * (i as f64 + 1.0), 13.4050)
                        .expect("valid position"),
                    vehicle: VehicleType::Car,
                    availability: Availability::Active,
                    push_address: Some(PushAddress(format!("push-{i}"))),
                })
                .expect("seed driver");
        }

        let engine = Engine::new(EngineConfig {
            dispatches: dispatches.clone(),
            rides: rides.clone(),
            queue: queue.clone(),
            sink: sink.clone(),
            driver_index: index.clone(),
            registry: index,
            eta_oracle,
            geocoder: Arc::new(LatLonParser),
            surge: Arc::new(FixedSurge(1.0)),
            clock: system_clock(),
            retry: RetryPolicy::default(),
            pricing: PricingConfig::default(),
            ack_seconds_default: 30,
        });

        TestBed {
            engine,
            dispatches,
            rides,
            queue,
            sink,
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            rider: RiderId("r-1".into()),
            pickup: "52.5200,13.4050".into(),
            destination: "52.4900,13.4250".into(),
            vehicle: None,
            radius_km: None,
            limit: None,
            bound_secs: None,
            ack_seconds: None,
            idempotency_key: None,
        }
    }

    fn correlation() -> CorrelationId {
        CorrelationId::generate()
    }

    #[tokio::test]
    async fn start_dispatch_builds_candidates_and_enqueues_one_task() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(300), Some(240), Some(360)] }), 3);
        let receipt = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect("dispatch opens");

        assert_eq!(receipt.candidate_count, 3);
        assert_eq!(receipt.cursor, 1, "cursor seeds at the eta argmin");
        assert_eq!(receipt.ack_seconds, 30);
        assert!(receipt.fare_minor > 0);
        assert_eq!(bed.queue.depth(), 1);

        let record = bed.dispatches.read(&receipt.dispatch_id).expect("persisted");
        assert_eq!(record.outcome, DispatchOutcome::Pending);
        assert_eq!(record.fare_minor, receipt.fare_minor);
        // Distance order from the index, with the pre-cursor entry skipped.
        assert_eq!(record.candidates[0].driver.0, "d-0");
        assert_eq!(record.candidates[0].status, CandidateStatus::Skipped);
        assert_eq!(record.candidates[1].status, CandidateStatus::Pending);
        assert_eq!(record.candidates[1].eta_seconds, Some(240));
        assert_eq!(record.candidates[2].status, CandidateStatus::Pending);
    }

    #[tokio::test]
    async fn bounded_selection_falls_back_to_unbounded_ordering() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(300), Some(240), Some(360)] }), 3);
        let mut req = request();
        req.bound_secs = Some(60);

        let receipt = bed
            .engine
            .start_dispatch(req, correlation())
            .await
            .expect("falls back unbounded");
        assert_eq!(receipt.cursor, 1, "unbounded argmin seeds the cursor");

        let record = bed.dispatches.read(&receipt.dispatch_id).expect("persisted");
        let etas: Vec<_> = record.candidates.iter().map(|c| c.eta_seconds).collect();
        assert_eq!(etas, vec![Some(300), Some(240), Some(360)]);
    }

    #[tokio::test]
    async fn validation_failures_are_bad_input() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240)] }), 1);
        let cases: Vec<Box<dyn Fn(&mut DispatchRequest)>> = vec![
            Box::new(|r| r.vehicle = Some("rickshaw".into())),
            Box::new(|r| r.radius_km = Some(51.0)),
            Box::new(|r| r.radius_km = Some(0.0)),
            Box::new(|r| r.limit = Some(0)),
            Box::new(|r| r.limit = Some(51)),
            Box::new(|r| r.ack_seconds = Some(4)),
            Box::new(|r| r.ack_seconds = Some(121)),
        ];
        for mutate in cases {
            let mut req = request();
            mutate(&mut req);
            let err = bed
                .engine
                .start_dispatch(req, correlation())
                .await
                .expect_err("invalid request");
            assert!(matches!(err, EngineError::BadInput(_)));
        }
    }

    #[tokio::test]
    async fn moto_alias_normalizes_before_filtering() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240)] }), 1);
        let mut req = request();
        req.vehicle = Some("moto".into());
        // Seeded drivers are cars; a motorcycle request finds nobody.
        let err = bed
            .engine
            .start_dispatch(req, correlation())
            .await
            .expect_err("no motorcycles");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn unresolvable_pickup_is_not_found() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240)] }), 1);
        let mut req = request();
        req.pickup = "Main Street 7".into();
        let err = bed
            .engine
            .start_dispatch(req, correlation())
            .await
            .expect_err("geocode miss");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_candidate_set_reports_no_drivers() {
        let bed = bed(Arc::new(FixedEta { durations: vec![] }), 0);
        let err = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect_err("nobody nearby");
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(bed.queue.depth(), 0, "no offer task for an empty round");
    }

    #[tokio::test]
    async fn identical_requests_within_ttl_share_one_dispatch() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let first = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect("first");
        let second = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect("second");
        assert_eq!(first.dispatch_id, second.dispatch_id);
        assert_eq!(bed.queue.depth(), 1, "only one offer task enqueued");

        let mut keyed = request();
        keyed.idempotency_key = Some("retry-77".into());
        let third = bed
            .engine
            .start_dispatch(keyed.clone(), correlation())
            .await
            .expect("keyed");
        assert_ne!(third.dispatch_id, first.dispatch_id);
        let fourth = bed
            .engine
            .start_dispatch(keyed, correlation())
            .await
            .expect("keyed repeat");
        assert_eq!(third.dispatch_id, fourth.dispatch_id);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_oracle_faults_are_retried_with_backoff() {
        let bed = bed(
            Arc::new(FlakyEta::failing(2, vec![Some(240), Some(300)])),
            2,
        );
        let receipt = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect("third attempt succeeds");
        assert_eq!(receipt.candidate_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_unavailable() {
        let bed = bed(
            Arc::new(FlakyEta::failing(10, vec![Some(240), Some(300)])),
            2,
        );
        let err = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect_err("retries exhausted");
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    /// Open a dispatch and flip the cursor candidate to `offered`, as the
    /// scheduler would right before the wait.
    async fn offered_dispatch(bed: &TestBed) -> (DispatchId, DriverId, usize) {
        let receipt = bed
            .engine
            .start_dispatch(request(), correlation())
            .await
            .expect("dispatch opens");
        let record = bed.dispatches.read(&receipt.dispatch_id).expect("read");
        let index = record.cursor;
        let driver = record.candidates[index].driver.clone();
        bed.dispatches
            .set_candidate_status(&receipt.dispatch_id, index, CandidateStatus::Pending, CandidateStatus::Offered)
            .expect("offer");
        (receipt.dispatch_id, driver, index)
    }

    #[tokio::test]
    async fn ack_accepts_and_duplicates_are_idempotent() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let (id, driver, index) = offered_dispatch(&bed).await;

        bed.engine.ack_offer(&id, &driver, true).await.expect("first ack");
        bed.engine.ack_offer(&id, &driver, true).await.expect("duplicate ack");

        let record = bed.dispatches.read(&id).expect("read");
        assert_eq!(record.candidates[index].status, CandidateStatus::Acked);

        // A rejection after the acceptance is a real conflict.
        let err = bed
            .engine
            .ack_offer(&id, &driver, false)
            .await
            .expect_err("reject after ack");
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn ack_after_timeout_is_gone() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let (id, driver, index) = offered_dispatch(&bed).await;
        bed.dispatches
            .set_candidate_status(&id, index, CandidateStatus::Offered, CandidateStatus::TimedOut)
            .expect("window elapsed");

        let err = bed
            .engine
            .ack_offer(&id, &driver, true)
            .await
            .expect_err("late ack");
        assert!(matches!(err, EngineError::Gone(_)));
        // The late answer mutated nothing.
        let record = bed.dispatches.read(&id).expect("read");
        assert_eq!(record.candidates[index].status, CandidateStatus::TimedOut);
    }

    #[tokio::test]
    async fn ack_after_cancel_is_gone() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let (id, driver, _) = offered_dispatch(&bed).await;
        bed.engine.cancel_dispatch(&id).await.expect("cancel");

        let err = bed
            .engine
            .ack_offer(&id, &driver, true)
            .await
            .expect_err("ack on a closed dispatch");
        assert!(matches!(err, EngineError::Gone(_)));
    }

    #[tokio::test]
    async fn ack_unknown_dispatch_or_driver_is_not_found() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let (id, _, _) = offered_dispatch(&bed).await;

        let err = bed
            .engine
            .ack_offer(&DispatchId::new(), &DriverId("d-0".into()), true)
            .await
            .expect_err("unknown dispatch");
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = bed
            .engine
            .ack_offer(&id, &DriverId("ghost".into()), true)
            .await
            .expect_err("unknown driver");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_is_single_shot() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240), Some(300)] }), 2);
        let (id, _, _) = offered_dispatch(&bed).await;

        bed.engine.cancel_dispatch(&id).await.expect("cancel");
        let record = bed.engine.dispatch_status(&id).expect("read");
        assert_eq!(record.outcome, DispatchOutcome::Cancelled);

        let err = bed
            .engine
            .cancel_dispatch(&id)
            .await
            .expect_err("already terminal");
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn ride_lifecycle_witnesses_otp_and_emits_events() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240)] }), 1);
        let ride = sample_ride();
        bed.rides.create(&ride).expect("create ride");

        let err = bed
            .engine
            .start_ride(&ride.id, "000000", &correlation())
            .await
            .expect_err("wrong otp");
        assert!(matches!(err, EngineError::Conflict(_)));

        let started = bed
            .engine
            .start_ride(&ride.id, &ride.otp, &correlation())
            .await
            .expect("otp witnessed");
        assert_eq!(started.status, RideStatus::Ongoing);
        assert!(started.otp.is_empty(), "reads stay redacted");

        let ended = bed
            .engine
            .end_ride(&ride.id, &correlation())
            .await
            .expect("trip completes");
        assert_eq!(ended.status, RideStatus::Completed);

        let err = bed
            .engine
            .cancel_ride(&ride.id)
            .await
            .expect_err("completed ride cannot cancel");
        assert!(matches!(err, EngineError::Conflict(_)));

        assert_eq!(bed.sink.names(), vec!["ride-started", "ride-ended"]);
    }

    #[tokio::test]
    async fn ride_status_redacts_otp() {
        let bed = bed(Arc::new(FixedEta { durations: vec![Some(240)] }), 1);
        let ride = sample_ride();
        bed.rides.create(&ride).expect("create ride");

        let public = bed.engine.ride_status(&ride.id).expect("read");
        assert!(public.otp.is_empty());
        assert_eq!(public.fare_minor, ride.fare_minor);
    }
}
