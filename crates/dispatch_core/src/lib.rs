//! # Ride-Dispatch Engine Core
//!
//! The subsystem that takes an open ride request, selects candidate drivers,
//! sequentially offers the ride to them with bounded response windows, and
//! durably commits the first acceptance to an assigned ride.
//!
//! ## Overview
//!
//! - **Driver index**: availability-filtered nearest-driver queries over an
//!   H3 cell grid
//! - **ETA oracle**: batch travel-time from many origins to one destination,
//!   with optional calibration and a time bound
//! - **Durable stores**: dispatch and ride records with per-record
//!   conditional writes
//! - **Offer scheduler**: worker pool walking each candidate list, waiting
//!   for acknowledgements, committing the first acceptance
//! - **Event fan-out**: typed at-least-once events to drivers and riders
//!
//! ## Key Concepts
//!
//! - **Single writer per dispatch**: the offer queue hands each task to one
//!   worker; every store mutation is a conditional write, so even a buggy
//!   double-lease cannot corrupt a record
//! - **Conflicts are control flow**: optimistic-concurrency misses are
//!   values the callers branch on, never panics
//! - **Deterministic tests**: all waits go through `tokio::time`, so the
//!   end-to-end scenarios run under a paused clock

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod geoindex;
pub mod idempotency;
pub mod model;
pub mod pricing;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod spatial;
pub mod store;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
