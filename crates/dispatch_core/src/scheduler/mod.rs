//! Offer scheduler: the per-dispatch state machine and its worker pool.
//!
//! Workers take offer tasks from the durable queue (one dispatch per task,
//! single writer) and walk the candidate list: emit the offer, flip the
//! candidate to `offered`, wait out the ack window, then branch on what the
//! record says. The wait is a single primitive over a per-dispatch wakeup
//! signal and a deadline, with a fixed-interval re-read fallback that keeps
//! external cancellation observable within one poll period.
//!
//! Everything the scheduler writes goes through the store's conditional
//! operations; a conflict means some other actor moved the record first and
//! is handled by re-reading, never by failing the task.


use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::SharedClock;
use crate::error::EngineResult;
use crate::events::{Address, EventSink, RideEvent};
use crate::geoindex::DriverRegistry;
use crate::model::{
    Availability, CandidateStatus, Dispatch, DispatchId, Ride, RideId, RideStatus,
    mint_otp,
};
use crate::queue::OfferQueue;
use crate::store::{DispatchStore, RideStore, StoreError};

/// Per-dispatch wakeup registry. The ack and cancel paths ring the bell;
/// the waiting worker re-reads. A missed ring is covered by the poll
/// fallback, so correctness never depends on the signal.
#[derive(Default)]
pub struct DispatchSignals {
    waiters: DashMap<DispatchId, Arc<Notify>>,
}

impl DispatchSignals {
    pub fn subscribe(&self, id: &DispatchId) -> Arc<Notify> {
        self.waiters.entry(*id).or_default().clone()
    }

    pub fn notify(&self, id: &DispatchId) {
        if let Some(notify) = self.waiters.get(id) {
            notify.notify_one();
        }
    }

    pub fn forget(&self, id: &DispatchId) {
        self.waiters.remove(id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Parallel workers; each owns at most one dispatch at a time.
    pub workers: usize,
    /// Re-read interval while waiting for an acknowledgement. Bounds how
    /// long an external cancel can go unobserved.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Collaborators the scheduler drives. Assembled by the engine so both
/// share the same stores and signal registry.
pub struct SchedulerDeps {
    pub dispatches: Arc<dyn DispatchStore>,
    pub rides: Arc<dyn RideStore>,
    pub queue: Arc<OfferQueue>,
    pub sink: Arc<dyn EventSink>,
    pub registry: Arc<dyn DriverRegistry>,
    pub signals: Arc<DispatchSignals>,
    pub clock: SharedClock,
}

/// The state-machine half, shared by every worker.
pub struct SchedulerCore {
    dispatches: Arc<dyn DispatchStore>,
    rides: Arc<dyn RideStore>,
    queue: Arc<OfferQueue>,
    sink: Arc<dyn EventSink>,
    registry: Arc<dyn DriverRegistry>,
    signals: Arc<DispatchSignals>,
    clock: SharedClock,
    poll_interval: Duration,
}

impl SchedulerCore {
    /// Drive one dispatch to its next resting point: assignment, a terminal
    /// outcome, or candidate exhaustion. Idempotent on replay; a dispatch
    /// whose outcome is already terminal is a no-op.
    pub async fn run_dispatch(&self, id: &DispatchId) -> EngineResult<()> {
        let mut dispatch = match self.dispatches.read(id) {
            Ok(dispatch) => dispatch,
            Err(StoreError::NotFound) => {
                tracing::warn!(dispatch = %id, "offer task references a missing record");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let correlation = dispatch.correlation.clone();
        let ack_window = Duration::from_secs(dispatch.ack_seconds);
        let notify = self.signals.subscribe(id);

        while !dispatch.outcome.is_terminal() {
            let index = dispatch.cursor;
            let Some(candidate) = dispatch.candidates.get(index).cloned() else {
                // Walked off the end without an acceptance.
                match self.dispatches.mark_exhausted(id) {
                    Ok(()) => {
                        self.sink
                            .emit(
                                Address::Rider(dispatch.rider.clone()),
                                &RideEvent::DispatchFailed { dispatch_id: *id },
                                &correlation,
                            )
                            .await;
                    }
                    Err(StoreError::AlreadyTerminal) => {}
                    Err(err) => return Err(err.into()),
                }
                break;
            };

            match candidate.status {
                CandidateStatus::Pending => {
                    self.present_offer(&dispatch, index).await;
                    match self.dispatches.set_candidate_status(
                        id,
                        index,
                        CandidateStatus::Pending,
                        CandidateStatus::Offered,
                    ) {
                        // A conflict here means a late ack or a cancel got
                        // in first; the re-read below observes it.
                        Ok(()) | Err(StoreError::Conflict) | Err(StoreError::AlreadyTerminal) => {}
                        Err(err) => return Err(err.into()),
                    }
                    dispatch = self.dispatches.read(id)?;
                }
                CandidateStatus::Offered => {
                    let deadline = Instant::now() + ack_window;
                    dispatch = self.await_decision(id, index, deadline, &notify).await?;
                }
                CandidateStatus::Acked => {
                    self.commit(&dispatch, index).await?;
                    break;
                }
                CandidateStatus::Rejected | CandidateStatus::TimedOut | CandidateStatus::Skipped => {
                    match self.dispatches.advance_cursor(id, index, index + 1) {
                        Ok(()) | Err(StoreError::Conflict) | Err(StoreError::AlreadyTerminal) => {}
                        Err(err) => return Err(err.into()),
                    }
                    dispatch = self.dispatches.read(id)?;
                }
                // Unreachable under the single-writer lease; a record that
                // already carries an assignment is simply left alone.
                CandidateStatus::Assigned => break,
            }
        }

        self.signals.forget(id);
        Ok(())
    }

    /// Best-effort offer emission. A missing push address is a silent drop;
    /// the at-least-once contract allows it and the ack window still runs.
    async fn present_offer(&self, dispatch: &Dispatch, index: usize) {
        let candidate = &dispatch.candidates[index];
        let Some(address) = candidate.push_address.clone() else {
            tracing::debug!(
                dispatch = %dispatch.id,
                driver = %candidate.driver,
                "candidate has no push address, offer not emitted"
            );
            return;
        };
        self.sink
            .emit(
                Address::Driver(address),
                &RideEvent::Offer {
                    dispatch_id: dispatch.id,
                    driver_id: candidate.driver.clone(),
                    pickup: dispatch.pickup.raw.clone(),
                    destination: dispatch.destination.raw.clone(),
                    eta_seconds: candidate.eta_seconds,
                },
                &dispatch.correlation,
            )
            .await;
    }

    /// Wait until the offered candidate leaves `offered`, the outcome turns
    /// terminal, or the ack window elapses (in which case the timeout is
    /// written under the usual conditional rules). Returns the freshest
    /// record.
    async fn await_decision(
        &self,
        id: &DispatchId,
        index: usize,
        deadline: Instant,
        notify: &Notify,
    ) -> EngineResult<Dispatch> {
        loop {
            let dispatch = self.dispatches.read(id)?;
            if dispatch.outcome.is_terminal() {
                return Ok(dispatch);
            }
            if dispatch.candidates[index].status != CandidateStatus::Offered {
                return Ok(dispatch);
            }

            let now = Instant::now();
            if now >= deadline {
                match self.dispatches.set_candidate_status(
                    id,
                    index,
                    CandidateStatus::Offered,
                    CandidateStatus::TimedOut,
                ) {
                    Ok(()) => {}
                    // An ack or a cancel landed between the deadline check
                    // and the write; the re-read reports the winner.
                    Err(StoreError::Conflict) | Err(StoreError::AlreadyTerminal) => {}
                    Err(err) => return Err(err.into()),
                }
                return Ok(self.dispatches.read(id)?);
            }

            let wait = cmp::min(self.poll_interval, deadline - now);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Materialize the ride and commit the assignment. A commit conflict
    /// means the outcome raced to cancelled; the freshly created ride is
    /// compensated and the round ends without an assignment.
    async fn commit(&self, dispatch: &Dispatch, index: usize) -> EngineResult<()> {
        let candidate = &dispatch.candidates[index];
        let otp = mint_otp(&mut rand::thread_rng());
        let ride = Ride {
            id: RideId::new(),
            rider: dispatch.rider.clone(),
            driver: candidate.driver.clone(),
            pickup: dispatch.pickup.raw.clone(),
            destination: dispatch.destination.raw.clone(),
            fare_minor: dispatch.fare_minor,
            status: RideStatus::Accepted,
            otp,
            created_at_ms: self.clock.now_ms(),
        };
        self.rides.create(&ride)?;

        match self.dispatches.commit_assignment(&dispatch.id, index, &ride.id) {
            Ok(()) => {
                if let Some(address) = candidate.push_address.clone() {
                    self.sink
                        .emit(
                            Address::Driver(address),
                            &RideEvent::OfferAccepted {
                                dispatch_id: dispatch.id,
                                ride_id: ride.id,
                            },
                            &dispatch.correlation,
                        )
                        .await;
                }
                self.sink
                    .emit(
                        Address::Rider(dispatch.rider.clone()),
                        &RideEvent::Assigned { ride_id: ride.id },
                        &dispatch.correlation,
                    )
                    .await;
                self.sink
                    .emit(
                        Address::Rider(dispatch.rider.clone()),
                        &RideEvent::Confirmed { ride_id: ride.id },
                        &dispatch.correlation,
                    )
                    .await;

                // Availability is advisory; the committed outcome is the
                // ground truth even if this update is lost.
                if let Err(err) = self
                    .registry
                    .set_availability(&candidate.driver, Availability::Assigned)
                    .await
                {
                    tracing::debug!(
                        driver = %candidate.driver,
                        error = %err,
                        "best-effort availability update failed"
                    );
                }
                Ok(())
            }
            Err(StoreError::Conflict) | Err(StoreError::AlreadyTerminal) => {
                tracing::info!(
                    dispatch = %dispatch.id,
                    ride = %ride.id,
                    "assignment lost to cancellation, compensating ride"
                );
                if let Err(err) =
                    self.rides
                        .transition(&ride.id, RideStatus::Accepted, RideStatus::Cancelled)
                {
                    tracing::warn!(ride = %ride.id, error = %err, "ride compensation failed");
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// The worker pool. Explicit lifecycle: construct, `start`, `shutdown`.
pub struct OfferScheduler {
    core: Arc<SchedulerCore>,
    workers: usize,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl OfferScheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(SchedulerCore {
                dispatches: deps.dispatches,
                rides: deps.rides,
                queue: deps.queue,
                sink: deps.sink,
                registry: deps.registry,
                signals: deps.signals,
                clock: deps.clock,
                poll_interval: config.poll_interval,
            }),
            workers: config.workers.max(1),
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Direct handle on the state machine; scenario tests drive it without
    /// the pool.
    pub fn core(&self) -> Arc<SchedulerCore> {
        Arc::clone(&self.core)
    }

    pub fn start(&mut self) {
        for worker_id in 0..self.workers {
            let core = Arc::clone(&self.core);
            let shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(worker_loop(core, shutdown, worker_id)));
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(core: Arc<SchedulerCore>, mut shutdown: watch::Receiver<bool>, worker_id: usize) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            leased = core.queue.next() => {
                let Some(id) = leased else { break };
                tracing::debug!(worker = worker_id, dispatch = %id, "offer task leased");
                match core.run_dispatch(&id).await {
                    Ok(()) => {
                        if let Err(err) = core.queue.complete(&id) {
                            tracing::warn!(dispatch = %id, error = %err, "failed to complete offer task");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(dispatch = %id, error = %err, "offer task failed, redelivering");
                        core.queue.redeliver(&id);
                        // Keep a wedged task from spinning the worker.
                        tokio::time::sleep(core.poll_interval).await;
                    }
                }
            }
        }
    }
}
