//! Outbound event protocol: typed catalogue and the at-least-once sink.
//!
//! The engine never talks to sockets directly; it hands [`OutboundEvent`]s
//! to an [`EventSink`] that fronts the push transport. Delivery is
//! at-least-once and consumers de-duplicate by `dispatchId`. The sink is
//! allowed to drop events for unknown addresses; emission failures are
//! logged and never propagate into dispatch control flow.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::model::{CorrelationId, DispatchId, DriverId, PushAddress, RideId, RiderId};

/// Where an event is headed. Driver devices are addressed by their push
/// handle; rider sessions are resolved by the transport from the rider id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Driver(PushAddress),
    Rider(RiderId),
}

/// Event catalogue. Names and payload shapes are stable wire contracts.
#[derive(Debug, Clone, PartialEq)]
pub enum RideEvent {
    /// Offer presented to a candidate driver.
    Offer {
        dispatch_id: DispatchId,
        driver_id: DriverId,
        pickup: String,
        destination: String,
        eta_seconds: Option<u32>,
    },
    /// The winning driver's acceptance was committed.
    OfferAccepted {
        dispatch_id: DispatchId,
        ride_id: RideId,
    },
    /// A ride was assigned to the rider's open request.
    Assigned { ride_id: RideId },
    /// The candidate list was exhausted without an acceptance.
    DispatchFailed { dispatch_id: DispatchId },
    /// Booking confirmed: the ride record exists.
    Confirmed { ride_id: RideId },
    /// The driver verified the rider's OTP; the trip is underway.
    Started { ride_id: RideId },
    /// The trip completed.
    Ended { ride_id: RideId },
}

impl RideEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RideEvent::Offer { .. } => "ride-offer",
            RideEvent::OfferAccepted { .. } => "ride-offer-accepted",
            RideEvent::Assigned { .. } => "ride-assigned",
            RideEvent::DispatchFailed { .. } => "dispatch-failed",
            RideEvent::Confirmed { .. } => "ride-confirmed",
            RideEvent::Started { .. } => "ride-started",
            RideEvent::Ended { .. } => "ride-ended",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            RideEvent::Offer {
                dispatch_id,
                driver_id,
                pickup,
                destination,
                eta_seconds,
            } => json!({
                "dispatchId": dispatch_id,
                "driverId": driver_id,
                "pickup": pickup,
                "destination": destination,
                "etaSeconds": eta_seconds,
            }),
            RideEvent::OfferAccepted {
                dispatch_id,
                ride_id,
            } => json!({ "dispatchId": dispatch_id, "rideId": ride_id }),
            RideEvent::Assigned { ride_id } => json!({ "rideId": ride_id }),
            RideEvent::DispatchFailed { dispatch_id } => json!({ "dispatchId": dispatch_id }),
            RideEvent::Confirmed { ride_id }
            | RideEvent::Started { ride_id }
            | RideEvent::Ended { ride_id } => json!({ "rideId": ride_id }),
        }
    }
}

/// A fully addressed event ready for the push transport.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub address: Address,
    pub name: &'static str,
    pub payload: Value,
    pub correlation: CorrelationId,
}

/// Outbound emission seam. At-least-once; implementations log failures and
/// swallow them.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, address: Address, event: &RideEvent, correlation: &CorrelationId);
}

/// Sink that forwards events to the push-transport bridge over an unbounded
/// channel. If the bridge is gone the event is dropped with a warning; the
/// at-least-once contract permits this for unknown destinations.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, address: Address, event: &RideEvent, correlation: &CorrelationId) {
        let outbound = OutboundEvent {
            address,
            name: event.name(),
            payload: event.payload(),
            correlation: correlation.clone(),
        };
        if self.tx.send(outbound).is_err() {
            tracing::warn!(event = event.name(), %correlation, "push bridge closed, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_stable() {
        let ride = RideId::new();
        let dispatch = DispatchId::new();
        assert_eq!(
            RideEvent::OfferAccepted {
                dispatch_id: dispatch,
                ride_id: ride
            }
            .name(),
            "ride-offer-accepted"
        );
        assert_eq!(RideEvent::Assigned { ride_id: ride }.name(), "ride-assigned");
        assert_eq!(
            RideEvent::DispatchFailed {
                dispatch_id: dispatch
            }
            .name(),
            "dispatch-failed"
        );
    }

    #[test]
    fn offer_payload_carries_dispatch_and_eta() {
        let dispatch_id = DispatchId::new();
        let event = RideEvent::Offer {
            dispatch_id,
            driver_id: DriverId("d-9".into()),
            pickup: "52.5,13.4".into(),
            destination: "52.6,13.5".into(),
            eta_seconds: Some(240),
        };
        let payload = event.payload();
        assert_eq!(payload["driverId"], "d-9");
        assert_eq!(payload["etaSeconds"], 240);
        assert_eq!(payload["dispatchId"], json!(dispatch_id));
    }

    #[test]
    fn unreachable_eta_serializes_as_null() {
        let event = RideEvent::Offer {
            dispatch_id: DispatchId::new(),
            driver_id: DriverId("d-1".into()),
            pickup: "a".into(),
            destination: "b".into(),
            eta_seconds: None,
        };
        assert!(event.payload()["etaSeconds"].is_null());
    }

    #[tokio::test]
    async fn channel_sink_forwards_addressed_events() {
        let (sink, mut rx) = ChannelSink::new();
        let correlation = CorrelationId::generate();
        sink.emit(
            Address::Rider(RiderId("r-1".into())),
            &RideEvent::Assigned { ride_id: RideId::new() },
            &correlation,
        )
        .await;
        let outbound = rx.recv().await.expect("event forwarded");
        assert_eq!(outbound.name, "ride-assigned");
        assert_eq!(outbound.correlation, correlation);
        assert!(matches!(outbound.address, Address::Rider(_)));
    }

    #[tokio::test]
    async fn closed_bridge_drops_without_error() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic or propagate.
        sink.emit(
            Address::Driver(PushAddress("push-1".into())),
            &RideEvent::Ended { ride_id: RideId::new() },
            &CorrelationId::generate(),
        )
        .await;
    }
}
