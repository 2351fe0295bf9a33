//! HTTP client for the node API, used by the CLI.

use crate::api::{SubmitRequest, SubmitResponse};
use crate::job::{Job, JobDeal, JobEvent, JobLocalEvent, JobSpec, JobState};
use crate::types::{FlotillaError, FlotillaResult};

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn submit(
        &self,
        spec: JobSpec,
        deal: JobDeal,
        client_id: impl Into<String>,
    ) -> FlotillaResult<Job> {
        let response = self
            .client
            .post(format!("{}/api/v0/submit", self.base_url))
            .json(&SubmitRequest {
                spec,
                deal,
                client_id: client_id.into(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let body: SubmitResponse = response.json().await.map_err(transport_error)?;
        Ok(body.job)
    }

    pub async fn get(&self, id: &str) -> FlotillaResult<Job> {
        self.get_json(&format!("/api/v0/jobs/{}", id)).await
    }

    pub async fn get_job_state(&self, id: &str) -> FlotillaResult<JobState> {
        self.get_json(&format!("/api/v0/jobs/{}/state", id)).await
    }

    pub async fn get_events(&self, id: &str) -> FlotillaResult<Vec<JobEvent>> {
        self.get_json(&format!("/api/v0/jobs/{}/events", id)).await
    }

    pub async fn get_local_events(&self, id: &str) -> FlotillaResult<Vec<JobLocalEvent>> {
        self.get_json(&format!("/api/v0/jobs/{}/local_events", id))
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> FlotillaResult<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> FlotillaError {
    FlotillaError::Transient(format!("api request failed: {}", e))
}

async fn check_status(response: reqwest::Response) -> FlotillaResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    match status {
        reqwest::StatusCode::NOT_FOUND => Err(FlotillaError::NotFound(detail)),
        reqwest::StatusCode::BAD_REQUEST => Err(FlotillaError::BadSpec(detail)),
        _ => Err(FlotillaError::Transient(format!(
            "api returned {}: {}",
            status, detail
        ))),
    }
}
