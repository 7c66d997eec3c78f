//! Thin `reqwest` wrapper for the remaining external interfaces in §6: tour metadata, recorded
//! playback, health, and ask cancellation. Styled after `IndexTtsAPI`/`AllTalkApi`
//! (`st_system/src/tts_backends/{indextts,alltalk}/api.rs`): a small struct holding a
//! `reqwest::Client` + base `Url`, with a `url(path)` helper and typed request/response structs.

use serde::{Deserialize, Serialize};

use crate::data::TourPlan;
use crate::error::{AskError, TourError};

#[derive(Clone)]
pub struct TourApiClient {
    http: reqwest::Client,
    base_url: url::Url,
}

#[derive(Debug, Serialize)]
struct CancelBody<'a> {
    request_id: &'a str,
    client_id: &'a str,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct TourPlanBody<'a> {
    zone: &'a str,
    profile: Option<&'a str>,
    duration_s: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct HealthStatus {
    pub ragflow_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct RecordedStop {
    pub answer_text: String,
    pub tail: String,
    pub segments: Vec<RecordedSegment>,
}

#[derive(Debug, Deserialize)]
pub struct RecordedSegment {
    pub audio_url: String,
    pub text: Option<String>,
}

impl TourApiClient {
    pub fn new(http: reqwest::Client, base_url: url::Url) -> Self {
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("static path should always join")
    }

    pub async fn cancel(&self, request_id: &str, client_id: &str, reason: &str) -> Result<(), AskError> {
        self.http
            .post(self.url("/api/cancel"))
            .json(&CancelBody { request_id, client_id, reason })
            .send()
            .await
            .map_err(|source| AskError::Network { source })?;
        Ok(())
    }

    pub async fn tour_meta(&self) -> Result<serde_json::Value, TourError> {
        let response = self
            .http
            .get(self.url("/api/tour/meta"))
            .send()
            .await
            .map_err(|source| TourError::PrefetchFailed { source })?;
        response.json().await.map_err(|source| TourError::PrefetchFailed { source })
    }

    pub async fn tour_stops(&self) -> Result<Vec<crate::data::TourStop>, TourError> {
        let response = self
            .http
            .get(self.url("/api/tour/stops"))
            .send()
            .await
            .map_err(|source| TourError::PrefetchFailed { source })?;
        response.json().await.map_err(|source| TourError::PrefetchFailed { source })
    }

    pub async fn tour_plan(&self, zone: &str, profile: Option<&str>, duration_s: Option<u32>) -> Result<TourPlan, TourError> {
        let response = self
            .http
            .post(self.url("/api/tour/plan"))
            .json(&TourPlanBody { zone, profile, duration_s })
            .send()
            .await
            .map_err(|source| TourError::PrefetchFailed { source })?;
        response.json().await.map_err(|source| TourError::PrefetchFailed { source })
    }

    pub async fn recorded_stop(&self, recording_id: &str, stop_index: i64) -> Result<RecordedStop, TourError> {
        let path = format!("/api/recordings/{recording_id}/stop/{stop_index}");
        let response = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .map_err(|source| TourError::PrefetchFailed { source })?;
        response.json().await.map_err(|source| TourError::PrefetchFailed { source })
    }

    pub async fn health(&self) -> Result<HealthStatus, TourError> {
        let response = self
            .http
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|source| TourError::PrefetchFailed { source })?;
        response.json().await.map_err(|source| TourError::PrefetchFailed { source })
    }
}
