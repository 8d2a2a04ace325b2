//! Fare quoting: distance-based pricing in integer minor units with a
//! consumed surge factor.
//!
//! Pricing policy stays deliberately small: base plus per-km rate, scaled by
//! whatever surge multiplier the mapping provider reports, floored at a
//! minimum fare. The quote is computed once at dispatch creation and copied
//! to the Ride at assignment.

use async_trait::async_trait;

use crate::spatial::{haversine_km, GeoPoint};

/// Base fare in minor currency units (e.g. cents).
pub const BASE_FARE_MINOR: u64 = 250;

/// Per-kilometer rate in minor currency units.
pub const PER_KM_RATE_MINOR: u64 = 150;

/// Pricing configuration for the marketplace.
#[derive(Debug, Clone, Copy)]
pub struct PricingConfig {
    /// Base fare in minor currency units.
    pub base_fare_minor: u64,
    /// Per-kilometer rate in minor currency units.
    pub per_km_rate_minor: u64,
    /// Fares never quote below this floor.
    pub minimum_fare_minor: u64,
    /// Maximum surge multiplier cap (e.g. 2.0 = 2x).
    pub surge_max_multiplier: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_fare_minor: BASE_FARE_MINOR,
            per_km_rate_minor: PER_KM_RATE_MINOR,
            minimum_fare_minor: BASE_FARE_MINOR,
            surge_max_multiplier: 2.0,
        }
    }
}

/// Source of the surge factor around a pickup point. Owned by the mapping
/// provider; the engine only consumes the multiplier.
#[async_trait]
pub trait SurgeSource: Send + Sync {
    /// Current surge multiplier at the pickup; 1.0 means no surge.
    async fn multiplier(&self, pickup: GeoPoint) -> f64;
}

/// Constant surge factor; the default when no provider is wired in.
#[derive(Debug, Clone, Copy)]
pub struct FixedSurge(pub f64);

impl Default for FixedSurge {
    fn default() -> Self {
        Self(1.0)
    }
}

#[async_trait]
impl SurgeSource for FixedSurge {
    async fn multiplier(&self, _pickup: GeoPoint) -> f64 {
        self.0
    }
}

/// Quote a trip fare in minor units.
///
/// Formula: `(base + distance_km * per_km_rate) * clamp(surge, 1.0..=cap)`,
/// floored at the minimum fare. Always strictly positive for a config with
/// a positive base.
pub fn quote_fare_minor(
    pickup: GeoPoint,
    destination: GeoPoint,
    surge: f64,
    config: &PricingConfig,
) -> u64 {
    let distance_km = haversine_km(pickup, destination);
    let metered = config.base_fare_minor as f64 + distance_km * config.per_km_rate_minor as f64;
    let surge = surge.clamp(1.0, config.surge_max_multiplier.max(1.0));
    let quoted = (metered * surge).round() as u64;
    quoted.max(config.minimum_fare_minor).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn berlin() -> GeoPoint {
        GeoPoint::new(52.5200, 13.4050).expect("valid")
    }

    fn berlin_west() -> GeoPoint {
        GeoPoint::new(52.5070, 13.2846).expect("valid")
    }

    #[test]
    fn fare_includes_base_and_distance() {
        let config = PricingConfig::default();
        let fare = quote_fare_minor(berlin(), berlin_west(), 1.0, &config);
        let distance = haversine_km(berlin(), berlin_west());
        let expected =
            (config.base_fare_minor as f64 + distance * config.per_km_rate_minor as f64).round() as u64;
        assert_eq!(fare, expected);
        assert!(fare > config.base_fare_minor);
    }

    #[test]
    fn surge_is_clamped_to_cap() {
        let config = PricingConfig::default();
        let capped = quote_fare_minor(berlin(), berlin_west(), 10.0, &config);
        let at_cap = quote_fare_minor(berlin(), berlin_west(), config.surge_max_multiplier, &config);
        assert_eq!(capped, at_cap);
    }

    #[test]
    fn surge_below_one_does_not_discount() {
        let config = PricingConfig::default();
        let base = quote_fare_minor(berlin(), berlin_west(), 1.0, &config);
        let under = quote_fare_minor(berlin(), berlin_west(), 0.5, &config);
        assert_eq!(base, under);
    }

    #[test]
    fn zero_distance_quotes_minimum() {
        let config = PricingConfig::default();
        let fare = quote_fare_minor(berlin(), berlin(), 1.0, &config);
        assert_eq!(fare, config.minimum_fare_minor.max(config.base_fare_minor));
    }

    #[tokio::test]
    async fn fixed_surge_reports_constant() {
        assert_eq!(FixedSurge::default().multiplier(berlin()).await, 1.0);
        assert_eq!(FixedSurge(1.7).multiplier(berlin()).await, 1.7);
    }
}
