//! Thin HTTP client for the OSRM `/table` service.
//!
//! One request per dispatch: all candidate origins against the single
//! pickup destination. Every transport or provider fault maps to
//! `Unavailable` so the call site's backoff policy can retry it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::routing::{calibrate_all, CalibrationContext, EtaCalibrator, EtaMatrix, EtaOracle};
use crate::spatial::GeoPoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(serde::Deserialize)]
struct OsrmTableResponse {
    code: String,
    durations: Option<Vec<Vec<Option<f64>>>>,
}

/// `lon,lat;lon,lat;...` with the destination appended last, the OSRM
/// coordinate convention.
fn encode_coordinates(origins: &[GeoPoint], destination: GeoPoint) -> String {
    origins
        .iter()
        .chain(std::iter::once(&destination))
        .map(|p| format!("{:.6},{:.6}", p.lon, p.lat))
        .collect::<Vec<_>>()
        .join(";")
}

/// Join `0;1;...;n-1` for the sources query parameter.
fn encode_indices(count: usize) -> String {
    (0..count)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

/// Pull the per-origin durations (each row is one source, single
/// destination column) and round to whole seconds.
fn parse_durations(response: OsrmTableResponse, origins: usize) -> EngineResult<Vec<Option<u32>>> {
    if response.code != "Ok" {
        return Err(EngineError::Unavailable(format!(
            "osrm table returned code {}",
            response.code
        )));
    }
    let rows = response
        .durations
        .ok_or_else(|| EngineError::Unavailable("osrm table response missing durations".into()))?;
    if rows.len() != origins {
        return Err(EngineError::Unavailable(format!(
            "osrm table returned {} rows for {} origins",
            rows.len(),
            origins
        )));
    }
    Ok(rows
        .into_iter()
        .map(|row| match row.first().copied().flatten() {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Some(secs.round() as u32),
            _ => None,
        })
        .collect())
}

/// Batch ETA oracle backed by an OSRM `table` endpoint
/// (e.g. `http://localhost:5000`).
pub struct OsrmTableClient {
    client: Client,
    endpoint: String,
    profile: String,
    calibrator: Option<Arc<dyn EtaCalibrator>>,
    clock: SharedClock,
}

impl OsrmTableClient {
    pub fn new(endpoint: &str, clock: SharedClock) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build OSRM client");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            profile: "driving".to_string(),
            calibrator: None,
            clock,
        }
    }

    pub fn with_profile(mut self, profile: &str) -> Self {
        self.profile = profile.to_string();
        self
    }

    pub fn with_calibrator(mut self, calibrator: Arc<dyn EtaCalibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }
}

#[async_trait]
impl EtaOracle for OsrmTableClient {
    async fn multi_eta(
        &self,
        origins: &[GeoPoint],
        destination: GeoPoint,
        bound_secs: Option<u32>,
    ) -> EngineResult<EtaMatrix> {
        if origins.is_empty() {
            return Ok(EtaMatrix::from_durations(Vec::new(), bound_secs));
        }

        let coords = encode_coordinates(origins, destination);
        let base = format!("{}/table/v1/{}/{}", self.endpoint, self.profile, coords);
        let mut url = Url::parse(&base)
            .map_err(|err| EngineError::Unavailable(format!("failed to build OSRM URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("sources", &encode_indices(origins.len()))
            .append_pair("destinations", &origins.len().to_string())
            .append_pair("annotations", "duration");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| EngineError::Unavailable(format!("osrm table request failed: {err}")))?;
        let parsed: OsrmTableResponse = response
            .json()
            .await
            .map_err(|err| EngineError::Unavailable(format!("osrm table response invalid: {err}")))?;

        let raw = parse_durations(parsed, origins.len())?;
        let ctx = CalibrationContext::from_unix_ms(self.clock.now_ms());
        let calibrated = calibrate_all(raw, self.calibrator.as_deref(), &ctx).await;
        Ok(EtaMatrix::from_durations(calibrated, bound_secs))
    }
}
