//! Spatial operations: coordinates, H3 cells, and great-circle distances.
//!
//! This module provides:
//!
//! - **GeoPoint**: validated (lat, lon) pair, parseable from `"lat,lon"`
//! - **Haversine distance**: with an LRU cache for repeated pairs
//! - **H3 conversion**: points to cells at the index resolution
//! - **Geocoder**: the seam to the external mapping provider
//!
//! Default H3 resolution is 9 (~240 m cell size), suitable for city-scale
//! driver lookups.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> EngineResult<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(EngineError::bad_input(format!("latitude out of range: {lat}")));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(EngineError::bad_input(format!("longitude out of range: {lon}")));
        }
        Ok(Self { lat, lon })
    }

    /// Parse a `"lat,lon"` pair. Returns `None` for anything else, so the
    /// caller can fall back to geocoding the text as an address.
    pub fn parse(raw: &str) -> Option<Self> {
        let (lat, lon) = raw.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lon: f64 = lon.trim().parse().ok()?;
        Self::new(lat, lon).ok()
    }

    /// H3 cell containing this point at the given resolution.
    pub fn to_cell(self, resolution: Resolution) -> EngineResult<CellIndex> {
        let latlng = LatLng::new(self.lat, self.lon)
            .map_err(|e| EngineError::bad_input(format!("invalid coordinate: {e}")))?;
        Ok(latlng.to_cell(resolution))
    }
}

fn haversine_km_uncached(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Cache key: micro-degree quantization makes the coordinates hashable
/// without measurable loss (1e-6 deg ~ 0.1 m).
type PairKey = (i64, i64, i64, i64);

fn quantize(p: GeoPoint) -> (i64, i64) {
    ((p.lat * 1e6).round() as i64, (p.lon * 1e6).round() as i64)
}

/// Global distance cache (10,000 entries).
fn distance_cache() -> &'static Mutex<LruCache<PairKey, f64>> {
    static CACHE: OnceLock<Mutex<LruCache<PairKey, f64>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(10_000).expect("cache size must be non-zero"),
        ))
    })
}

/// Great-circle distance in km with LRU caching.
///
/// Uses a symmetric key (smaller endpoint first) to maximize cache hits for
/// repeated driver/pickup pairs within one dispatch round.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (qa, qb) = (quantize(a), quantize(b));
    let key = if qa <= qb {
        (qa.0, qa.1, qb.0, qb.1)
    } else {
        (qb.0, qb.1, qa.0, qa.1)
    };

    let mut cache = match distance_cache().lock() {
        Ok(cache) => cache,
        // A poisoned cache only loses memoization, not correctness.
        Err(poisoned) => poisoned.into_inner(),
    };
    *cache.get_or_insert(key, || haversine_km_uncached(a, b))
}

pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Resolution of free-text pickup/destination into coordinates.
///
/// The real geocoder lives in the external mapping provider; the engine only
/// needs "text in, point out". A miss is `NotFound` (the rider typo'd an
/// address), a provider outage is `Unavailable`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, raw: &str) -> EngineResult<GeoPoint>;
}

/// Default resolver: accepts `"lat,lon"` literals only and reports anything
/// else as a miss. Deployments with a mapping provider plug their own
/// implementation into the engine config.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatLonParser;

#[async_trait]
impl Geocoder for LatLonParser {
    async fn resolve(&self, raw: &str) -> EngineResult<GeoPoint> {
        GeoPoint::parse(raw)
            .ok_or_else(|| EngineError::NotFound(format!("could not resolve location {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_latlon_pair() {
        let p = GeoPoint::parse("52.52, 13.40").expect("valid pair");
        assert!((p.lat - 52.52).abs() < 1e-9);
        assert!((p.lon - 13.40).abs() < 1e-9);
    }

    #[test]
    fn parse_rejects_addresses_and_junk() {
        assert!(GeoPoint::parse("Alexanderplatz 1, Berlin").is_none());
        assert!(GeoPoint::parse("52.52").is_none());
        assert!(GeoPoint::parse("91.0,13.4").is_none());
        assert!(GeoPoint::parse("52.5,181.0").is_none());
    }

    #[test]
    fn new_rejects_out_of_range() {
        assert!(GeoPoint::new(90.1, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -180.1).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Berlin Alexanderplatz to Brandenburg Gate is roughly 2.1 km.
        let alex = GeoPoint::new(52.5219, 13.4132).expect("valid");
        let gate = GeoPoint::new(52.5163, 13.3777).expect("valid");
        let d = haversine_km(alex, gate);
        assert!((1.9..2.8).contains(&d), "unexpected distance {d}");
    }

    #[test]
    fn haversine_is_symmetric_and_zero_on_self() {
        let a = GeoPoint::new(52.5, 13.4).expect("valid");
        let b = GeoPoint::new(52.6, 13.5).expect("valid");
        assert_eq!(haversine_km(a, b), haversine_km(b, a));
        assert!(haversine_km(a, a) < 1e-9);
    }

    #[tokio::test]
    async fn latlon_parser_resolves_or_misses() {
        let geocoder = LatLonParser;
        let p = geocoder.resolve("52.5,13.4").await.expect("pair resolves");
        assert!((p.lat - 52.5).abs() < 1e-9);
        let err = geocoder.resolve("Main St 7").await.expect_err("miss");
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
