//! Durable record stores for dispatches and rides.
//!
//! Every mutation is a conditional write: the caller names the state it
//! expects and receives `Conflict` when the record moved underneath it.
//! That is the sole mechanism for status transitions, which makes the
//! record safe even against a buggy double-lease on the offer queue.
//!
//! The mutation rules themselves live here as plain record functions; the
//! sled-backed implementation in [`durable`] applies them under
//! compare-and-swap, which gives per-record linearizability.

pub mod durable;

use thiserror::Error;

use crate::error::EngineError;
use crate::model::{CandidateStatus, Dispatch, DispatchId, DispatchOutcome, Ride, RideId, RideStatus};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record did not match the caller's expected state.
    #[error("conditional write missed")]
    Conflict,

    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    AlreadyExists,

    /// The record reached a terminal outcome; no further writes land.
    #[error("record already terminal")]
    AlreadyTerminal,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage failure: {0}")]
    Io(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => EngineError::Conflict("conditional write missed".into()),
            StoreError::NotFound => EngineError::NotFound("record not found".into()),
            StoreError::AlreadyExists => EngineError::Conflict("record already exists".into()),
            StoreError::AlreadyTerminal => EngineError::Conflict("record already terminal".into()),
            StoreError::Corrupt(msg) => EngineError::Internal(msg),
            StoreError::Io(msg) => EngineError::Internal(msg),
        }
    }
}

/// Durable dispatch records; all operations linearizable per dispatch id.
pub trait DispatchStore: Send + Sync {
    fn create(&self, dispatch: &Dispatch) -> StoreResult<()>;
    fn read(&self, id: &DispatchId) -> StoreResult<Dispatch>;

    /// Conditional candidate transition; `Conflict` when the current status
    /// differs from `expected` or the transition is not forward-only.
    fn set_candidate_status(
        &self,
        id: &DispatchId,
        index: usize,
        expected: CandidateStatus,
        next: CandidateStatus,
    ) -> StoreResult<()>;

    fn advance_cursor(&self, id: &DispatchId, from: usize, to: usize) -> StoreResult<()>;

    /// Atomic assignment commit: requires `candidates[index]` acked, cursor
    /// at `index`, and a pending outcome.
    fn commit_assignment(&self, id: &DispatchId, index: usize, ride: &RideId) -> StoreResult<()>;

    fn cancel(&self, id: &DispatchId) -> StoreResult<()>;

    /// Pending → exhausted, written by the scheduler when the candidate
    /// list runs out.
    fn mark_exhausted(&self, id: &DispatchId) -> StoreResult<()>;
}

/// Durable ride records.
pub trait RideStore: Send + Sync {
    fn create(&self, ride: &Ride) -> StoreResult<()>;

    /// Read with the OTP blanked; the default on every read path.
    fn read(&self, id: &RideId) -> StoreResult<Ride>;

    /// Explicit-include read used by the OTP witness check.
    fn read_with_otp(&self, id: &RideId) -> StoreResult<Ride>;

    fn transition(&self, id: &RideId, from: RideStatus, to: RideStatus) -> StoreResult<()>;
}

// ── Record mutation rules ──────────────────────────────────────────
//
// Shared by any store implementation; each takes the record by &mut and
// returns Conflict/AlreadyTerminal without touching it on a miss.

pub(crate) fn apply_candidate_status(
    dispatch: &mut Dispatch,
    index: usize,
    expected: CandidateStatus,
    next: CandidateStatus,
) -> StoreResult<()> {
    if dispatch.outcome.is_terminal() {
        return Err(StoreError::AlreadyTerminal);
    }
    let candidate = dispatch.candidates.get_mut(index).ok_or(StoreError::NotFound)?;
    if candidate.status != expected {
        return Err(StoreError::Conflict);
    }
    if !expected.can_become(next) {
        return Err(StoreError::Conflict);
    }
    candidate.status = next;
    Ok(())
}

pub(crate) fn apply_cursor_advance(
    dispatch: &mut Dispatch,
    from: usize,
    to: usize,
) -> StoreResult<()> {
    if dispatch.outcome.is_terminal() {
        return Err(StoreError::AlreadyTerminal);
    }
    if dispatch.cursor != from || to < from || to > dispatch.candidates.len() {
        return Err(StoreError::Conflict);
    }
    dispatch.cursor = to;
    Ok(())
}

pub(crate) fn apply_assignment(
    dispatch: &mut Dispatch,
    index: usize,
    ride: &RideId,
) -> StoreResult<()> {
    if dispatch.outcome != DispatchOutcome::Pending {
        return Err(StoreError::AlreadyTerminal);
    }
    if dispatch.cursor != index {
        return Err(StoreError::Conflict);
    }
    let candidate = dispatch.candidates.get_mut(index).ok_or(StoreError::NotFound)?;
    if candidate.status != CandidateStatus::Acked {
        return Err(StoreError::Conflict);
    }
    candidate.status = CandidateStatus::Assigned;
    dispatch.outcome = DispatchOutcome::Assigned;
    dispatch.ride_id = Some(*ride);
    Ok(())
}

pub(crate) fn apply_outcome(dispatch: &mut Dispatch, outcome: DispatchOutcome) -> StoreResult<()> {
    debug_assert!(outcome.is_terminal(), "only terminal outcomes are written directly");
    if dispatch.outcome.is_terminal() {
        return Err(StoreError::AlreadyTerminal);
    }
    dispatch.outcome = outcome;
    Ok(())
}

pub(crate) fn apply_ride_transition(
    ride: &mut Ride,
    from: RideStatus,
    to: RideStatus,
) -> StoreResult<()> {
    if ride.status != from {
        return Err(StoreError::Conflict);
    }
    if !from.can_become(to) {
        return Err(StoreError::Conflict);
    }
    ride.status = to;
    Ok(())
}
