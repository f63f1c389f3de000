//! HTTP client for the evaluation records backend.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    ApiConfig, ApiError, ApprovalEvent, EvaluationRecord, RecordPatch, RecordStats, SearchParams,
    SignaturePayload,
};

/// Client for the evaluation records REST API.
///
/// Every request carries a connect and overall timeout; a timed-out request
/// surfaces as an `ApiError::Http` and is treated like any other transport
/// failure by callers.
pub struct RecordApi {
    http: Client,
    base_url: String,
}

impl RecordApi {
    /// Create a new client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a client from configuration.
    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.base_url.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check the status and decode the body, mapping non-2xx to a typed error.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Fetch the full record collection (server-defined order).
    pub async fn fetch_all_records(&self) -> Result<Vec<EvaluationRecord>, ApiError> {
        let response = self.http.get(self.url("/evaluations")).send().await?;
        let records: Vec<EvaluationRecord> = Self::decode(response).await?;
        debug!(count = records.len(), "fetched record collection");
        Ok(records)
    }

    /// Fetch a single record by id.
    pub async fn fetch_record(&self, id: i64) -> Result<EvaluationRecord, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/evaluations/{}", id)))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Search records with the given parameters.
    pub async fn search_records(
        &self,
        params: &SearchParams,
    ) -> Result<Vec<EvaluationRecord>, ApiError> {
        let mut request = self.http.get(self.url("/evaluations/search"));
        if let Some(status) = &params.status {
            request = request.query(&[("status", status.as_str())]);
        }
        if let Some(evaluator) = &params.evaluator {
            request = request.query(&[("evaluator", evaluator)]);
        }
        if let Some(text) = &params.text {
            request = request.query(&[("text", text)]);
        }
        Self::decode(request.send().await?).await
    }

    /// Fetch aggregate stats over the collection.
    pub async fn fetch_stats(&self) -> Result<RecordStats, ApiError> {
        let response = self.http.get(self.url("/evaluations/stats")).send().await?;
        Self::decode(response).await
    }

    /// Fetch the approval history for a record.
    pub async fn fetch_approval_history(&self, id: i64) -> Result<Vec<ApprovalEvent>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/evaluations/{}/history", id)))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Apply a partial update to a record; returns the updated record.
    pub async fn mutate_record(
        &self,
        id: i64,
        patch: &RecordPatch,
    ) -> Result<EvaluationRecord, ApiError> {
        let response = self
            .http
            .patch(self.url(&format!("/evaluations/{}", id)))
            .json(patch)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Record the employee's approval and signature.
    pub async fn apply_employee_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, ApiError> {
        let response = self
            .http
            .post(self.url(&format!("/evaluations/{}/employee-approval", id)))
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Record the evaluator's approval and signature.
    pub async fn apply_evaluator_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, ApiError> {
        let response = self
            .http
            .post(self.url(&format!("/evaluations/{}/evaluator-approval", id)))
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }
}
