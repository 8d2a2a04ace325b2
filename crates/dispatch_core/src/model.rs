//! Core entities and state enums for dispatches, candidates, and rides.
//!
//! - **Ids**: `DispatchId`, `RideId` (minted here), `DriverId`, `RiderId`
//!   (owned by external account services, opaque strings)
//! - **Dispatch**: one open attempt to assign a ride, with its ordered
//!   candidate list, cursor, and terminal outcome
//! - **Ride**: the durable ride entity created at assignment, with OTP
//! - **Transition tables**: candidate and ride statuses are forward-only;
//!   the legality check lives next to the enums and the store enforces it
//!   under conditional writes

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spatial::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchId(Uuid);

impl DispatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(Uuid);

impl RideId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for RideId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RideId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Driver identifier minted by the external driver registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Rider identifier minted by the external account service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiderId(pub String);

impl std::fmt::Display for RiderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport handle for pushing events to a driver's device. Valid at read
/// time, may go stale; consumers tolerate unknown addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PushAddress(pub String);

/// Correlation id attached to every downstream call and emitted event.
/// Opaque: inbound requests may carry their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Auto,
}

impl VehicleType {
    /// Normalize the wire spelling. `"moto"` is an accepted alias for
    /// motorcycle; everything else must match a canonical name.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "car" => Some(VehicleType::Car),
            "motorcycle" | "moto" => Some(VehicleType::Motorcycle),
            "auto" => Some(VehicleType::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Active,
    Inactive,
    Assigned,
}

/// Read-only view of a driver as served by the driver index. The engine
/// never mutates positions; it only transitions availability on assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSnapshot {
    pub id: DriverId,
    pub position: GeoPoint,
    pub vehicle: VehicleType,
    pub availability: Availability,
    pub push_address: Option<PushAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateStatus {
    Pending,
    Offered,
    Acked,
    Rejected,
    TimedOut,
    Skipped,
    Assigned,
}

impl CandidateStatus {
    /// Whether no further transition can leave this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CandidateStatus::Rejected
                | CandidateStatus::TimedOut
                | CandidateStatus::Skipped
                | CandidateStatus::Assigned
        )
    }

    /// Forward-only transition table. `pending → offered → one terminal
    /// label`; only an acked candidate may become assigned. Pending
    /// candidates ahead of a seeded cursor are skipped directly.
    pub fn can_become(self, next: CandidateStatus) -> bool {
        use CandidateStatus::*;
        matches!(
            (self, next),
            (Pending, Offered)
                | (Pending, Skipped)
                | (Offered, Acked)
                | (Offered, Rejected)
                | (Offered, TimedOut)
                | (Offered, Skipped)
                | (Acked, Assigned)
        )
    }
}

/// One driver under consideration in a dispatch. Order is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub driver: DriverId,
    pub push_address: Option<PushAddress>,
    /// Estimated seconds from the driver to the pickup; `None` when the ETA
    /// oracle reported the origin unreachable or over the bound.
    pub eta_seconds: Option<u32>,
    pub status: CandidateStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Pending,
    Assigned,
    Cancelled,
    Exhausted,
}

impl DispatchOutcome {
    pub fn is_terminal(self) -> bool {
        self != DispatchOutcome::Pending
    }
}

/// A location as requested plus its resolved coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    /// The text the rider supplied (address or `"lat,lon"`).
    pub raw: String,
    pub point: GeoPoint,
}

/// One open attempt to assign a ride: the durable record the scheduler
/// drives. The candidate list is never reordered after creation; the cursor
/// only moves forward; a terminal outcome freezes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub id: DispatchId,
    pub rider: RiderId,
    pub pickup: Place,
    pub destination: Place,
    pub vehicle: VehicleType,
    pub candidates: Vec<Candidate>,
    /// Index of the candidate currently being offered.
    pub cursor: usize,
    pub outcome: DispatchOutcome,
    /// Set iff `outcome == Assigned`.
    pub ride_id: Option<RideId>,
    /// Fare quoted to the rider, in minor currency units. Priced once at
    /// creation and copied verbatim to the Ride at assignment.
    pub fare_minor: u64,
    /// Per-offer acknowledgement window in seconds.
    pub ack_seconds: u64,
    pub correlation: CorrelationId,
    pub created_at_ms: i64,
}

impl Dispatch {
    /// Position of a driver in the candidate list, if present.
    pub fn candidate_index_of(&self, driver: &DriverId) -> Option<usize> {
        self.candidates.iter().position(|c| &c.driver == driver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Accepted,
    Ongoing,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Allowed lifecycle edges: accepted → ongoing → completed, with
    /// cancellation possible until completion.
    pub fn can_become(self, next: RideStatus) -> bool {
        use RideStatus::*;
        matches!(
            (self, next),
            (Accepted, Ongoing) | (Accepted, Cancelled) | (Ongoing, Completed) | (Ongoing, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }
}

/// Number of digits in a ride OTP.
const OTP_DIGITS: u32 = 6;

/// Durable ride entity, created when a dispatch commits its assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    pub id: RideId,
    pub rider: RiderId,
    pub driver: DriverId,
    pub pickup: String,
    pub destination: String,
    /// Integer minor currency units; strictly positive.
    pub fare_minor: u64,
    pub status: RideStatus,
    /// Six-digit secret minted at creation, used to witness rider presence.
    /// Empty on redacted reads.
    pub otp: String,
    pub created_at_ms: i64,
}

impl Ride {
    /// Copy with the OTP blanked; the default shape on every read path.
    pub fn redacted(&self) -> Ride {
        Ride {
            otp: String::new(),
            ..self.clone()
        }
    }
}

/// Mint a ride OTP: six numeric digits, leading zeros kept.
pub fn mint_otp<R: Rng>(rng: &mut R) -> String {
    format!("{:06}", rng.gen_range(0..10u64.pow(OTP_DIGITS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn vehicle_normalization_maps_moto() {
        assert_eq!(VehicleType::normalize("moto"), Some(VehicleType::Motorcycle));
        assert_eq!(VehicleType::normalize("Motorcycle"), Some(VehicleType::Motorcycle));
        assert_eq!(VehicleType::normalize(" car "), Some(VehicleType::Car));
        assert_eq!(VehicleType::normalize("auto"), Some(VehicleType::Auto));
        assert_eq!(VehicleType::normalize("rickshaw"), None);
    }

    #[test]
    fn candidate_transitions_are_forward_only() {
        use CandidateStatus::*;
        assert!(Pending.can_become(Offered));
        assert!(Pending.can_become(Skipped));
        assert!(Offered.can_become(Acked));
        assert!(Offered.can_become(Rejected));
        assert!(Offered.can_become(TimedOut));
        assert!(Acked.can_become(Assigned));

        assert!(!Offered.can_become(Pending));
        assert!(!TimedOut.can_become(Acked));
        assert!(!Rejected.can_become(Offered));
        assert!(!Assigned.can_become(Acked));
        assert!(!Pending.can_become(Acked));
    }

    #[test]
    fn terminal_candidate_statuses() {
        use CandidateStatus::*;
        for status in [Rejected, TimedOut, Skipped, Assigned] {
            assert!(status.is_terminal());
        }
        for status in [Pending, Offered, Acked] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn ride_lifecycle_edges() {
        use RideStatus::*;
        assert!(Accepted.can_become(Ongoing));
        assert!(Accepted.can_become(Cancelled));
        assert!(Ongoing.can_become(Completed));
        assert!(Ongoing.can_become(Cancelled));

        assert!(!Completed.can_become(Cancelled));
        assert!(!Cancelled.can_become(Ongoing));
        assert!(!Accepted.can_become(Completed));
    }

    #[test]
    fn otp_is_six_digits_with_leading_zeros() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let otp = mint_otp(&mut rng);
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn redacted_ride_hides_otp() {
        let mut rng = StdRng::seed_from_u64(1);
        let ride = Ride {
            id: RideId::new(),
            rider: RiderId("r-1".into()),
            driver: DriverId("d-1".into()),
            pickup: "52.5,13.4".into(),
            destination: "52.6,13.5".into(),
            fare_minor: 1250,
            status: RideStatus::Accepted,
            otp: mint_otp(&mut rng),
            created_at_ms: 0,
        };
        let public = ride.redacted();
        assert!(public.otp.is_empty());
        assert_eq!(public.id, ride.id);
        assert_eq!(public.fare_minor, ride.fare_minor);
    }

    #[test]
    fn status_serde_uses_camel_case_labels() {
        let json = serde_json::to_string(&CandidateStatus::TimedOut).expect("serialize");
        assert_eq!(json, "\"timedOut\"");
        let back: CandidateStatus = serde_json::from_str("\"timedOut\"").expect("deserialize");
        assert_eq!(back, CandidateStatus::TimedOut);
    }
}
