//! Sled-backed stores: one tree per entity family, conditional writes via
//! compare-and-swap over the serialized record.
//!
//! The CAS loop re-reads and re-applies the mutation when another writer
//! interleaves, so each operation is linearizable per record key. A
//! precondition miss (wrong expected status, terminal outcome) propagates
//! immediately without retrying.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    apply_assignment, apply_candidate_status, apply_cursor_advance, apply_outcome,
    apply_ride_transition, DispatchStore, RideStore, StoreError, StoreResult,
};
use crate::model::{CandidateStatus, Dispatch, DispatchId, DispatchOutcome, Ride, RideId, RideStatus};

const DISPATCH_TREE: &str = "dispatch";
const RIDE_TREE: &str = "ride";

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

fn corrupt(err: serde_json::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

/// The document store behind the engine: owns the sled database and hands
/// out per-family stores. The offer queue shares the same database.
#[derive(Debug, Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// In-memory database for tests; dropped with the process.
    pub fn temporary() -> StoreResult<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    pub fn dispatches(&self) -> StoreResult<SledDispatchStore> {
        Ok(SledDispatchStore {
            tree: self.db.open_tree(DISPATCH_TREE)?,
        })
    }

    pub fn rides(&self) -> StoreResult<SledRideStore> {
        Ok(SledRideStore {
            tree: self.db.open_tree(RIDE_TREE)?,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }
}

fn insert_new<T: Serialize>(tree: &sled::Tree, key: &[u8], record: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec(record).map_err(corrupt)?;
    tree.compare_and_swap(key, None::<&[u8]>, Some(bytes))?
        .map_err(|_| StoreError::AlreadyExists)
}

fn read_record<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> StoreResult<T> {
    let bytes = tree.get(key)?.ok_or(StoreError::NotFound)?;
    serde_json::from_slice(&bytes).map_err(corrupt)
}

/// Read-modify-CAS loop. `mutate` sees the freshest record each round;
/// its precondition errors propagate, CAS interference retries.
fn update_record<T, F>(tree: &sled::Tree, key: &[u8], mut mutate: F) -> StoreResult<()>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> StoreResult<()>,
{
    loop {
        let current = tree.get(key)?.ok_or(StoreError::NotFound)?;
        let mut record: T = serde_json::from_slice(&current).map_err(corrupt)?;
        mutate(&mut record)?;
        let next = serde_json::to_vec(&record).map_err(corrupt)?;
        match tree.compare_and_swap(key, Some(&current), Some(next))? {
            Ok(()) => return Ok(()),
            Err(_) => continue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SledDispatchStore {
    tree: sled::Tree,
}

impl DispatchStore for SledDispatchStore {
    fn create(&self, dispatch: &Dispatch) -> StoreResult<()> {
        insert_new(&self.tree, dispatch.id.to_string().as_bytes(), dispatch)?;
        self.tree.flush()?;
        Ok(())
    }

    fn read(&self, id: &DispatchId) -> StoreResult<Dispatch> {
        read_record(&self.tree, id.to_string().as_bytes())
    }

    fn set_candidate_status(
        &self,
        id: &DispatchId,
        index: usize,
        expected: CandidateStatus,
        next: CandidateStatus,
    ) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |dispatch: &mut Dispatch| {
            apply_candidate_status(dispatch, index, expected, next)
        })
    }

    fn advance_cursor(&self, id: &DispatchId, from: usize, to: usize) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |dispatch: &mut Dispatch| {
            apply_cursor_advance(dispatch, from, to)
        })
    }

    fn commit_assignment(&self, id: &DispatchId, index: usize, ride: &RideId) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |dispatch: &mut Dispatch| {
            apply_assignment(dispatch, index, ride)
        })?;
        // An assignment must survive a crash before any event goes out.
        self.tree.flush()?;
        Ok(())
    }

    fn cancel(&self, id: &DispatchId) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |dispatch: &mut Dispatch| {
            apply_outcome(dispatch, DispatchOutcome::Cancelled)
        })
    }

    fn mark_exhausted(&self, id: &DispatchId) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |dispatch: &mut Dispatch| {
            apply_outcome(dispatch, DispatchOutcome::Exhausted)
        })
    }
}

#[derive(Debug, Clone)]
pub struct SledRideStore {
    tree: sled::Tree,
}

impl RideStore for SledRideStore {
    fn create(&self, ride: &Ride) -> StoreResult<()> {
        insert_new(&self.tree, ride.id.to_string().as_bytes(), ride)?;
        self.tree.flush()?;
        Ok(())
    }

    fn read(&self, id: &RideId) -> StoreResult<Ride> {
        let ride: Ride = read_record(&self.tree, id.to_string().as_bytes())?;
        Ok(ride.redacted())
    }

    fn read_with_otp(&self, id: &RideId) -> StoreResult<Ride> {
        read_record(&self.tree, id.to_string().as_bytes())
    }

    fn transition(&self, id: &RideId, from: RideStatus, to: RideStatus) -> StoreResult<()> {
        update_record(&self.tree, id.to_string().as_bytes(), |ride: &mut Ride| {
            apply_ride_transition(ride, from, to)
        })
    }
}
