//! Client for the web application's backlog of user-submitted requests.
//!
//! The backlog is the upstream source of work: users file feature requests
//! and bug reports, the triage stage approves or rejects them, and approved
//! requests are promoted into queued tracker issues.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::config::BacklogConfig;
use crate::error::{PipelineError, Result};
use crate::generator::TriageVerdict;

const API_KEY_HEADER: &str = "x-api-key";

// ---------------------------------------------------------------------------
// FeatureRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Feature,
    Bug,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Feature => "feature",
            RequestKind::Bug => "bug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: RequestKind,
    #[serde(default)]
    pub votes: u32,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_note: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerdictPatch<'a> {
    status: RequestStatus,
    triage_note: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackedPatch {
    issue_number: u64,
}

// ---------------------------------------------------------------------------
// Backlog
// ---------------------------------------------------------------------------

pub trait Backlog {
    fn list_pending(&self) -> Result<Vec<FeatureRequest>>;
    fn list_approved_untracked(&self) -> Result<Vec<FeatureRequest>>;
    fn record_verdict(&self, id: &str, verdict: &TriageVerdict) -> Result<()>;
    fn mark_tracked(&self, id: &str, issue_number: u64) -> Result<()>;
}

/// REST client authenticated with an API key header.
pub struct HttpBacklog {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBacklog {
    /// Build a client, reading the API key from the environment variable
    /// named in `config.api_key_env`.
    pub fn from_config(config: &BacklogConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(&config.base_url, api_key, Duration::from_secs(config.timeout_seconds))
    }

    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn requests_url(&self) -> String {
        format!("{}/api/pipeline/requests", self.base_url)
    }

    fn list(&self, query: &[(&str, &str)]) -> Result<Vec<FeatureRequest>> {
        let resp = self
            .client
            .get(self.requests_url())
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .send()?;
        let resp = check_status(resp)?;
        Ok(resp.json()?)
    }

    fn patch<T: Serialize>(&self, id: &str, body: &T) -> Result<()> {
        let resp = self
            .client
            .patch(format!("{}/{}", self.requests_url(), id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()?;
        check_status(resp)?;
        Ok(())
    }
}

fn check_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().unwrap_or_default();
    Err(PipelineError::Backlog(format!(
        "{url} returned {status}: {}",
        body.trim()
    )))
}

impl Backlog for HttpBacklog {
    fn list_pending(&self) -> Result<Vec<FeatureRequest>> {
        self.list(&[("status", "pending")])
    }

    fn list_approved_untracked(&self) -> Result<Vec<FeatureRequest>> {
        self.list(&[("status", "approved"), ("tracked", "false")])
    }

    fn record_verdict(&self, id: &str, verdict: &TriageVerdict) -> Result<()> {
        let status = if verdict.approved {
            RequestStatus::Approved
        } else {
            RequestStatus::Rejected
        };
        self.patch(
            id,
            &VerdictPatch {
                status,
                triage_note: &verdict.reason,
            },
        )
    }

    fn mark_tracked(&self, id: &str, issue_number: u64) -> Result<()> {
        self.patch(id, &TrackedPatch { issue_number })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
