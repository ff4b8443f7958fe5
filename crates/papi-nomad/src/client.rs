//! HTTP client for the scheduler API
//!
//! One client instance is shared by all request handlers (connection
//! pooling). Errors map into the PAPI taxonomy here: timeouts become
//! `Timeout`, everything else becomes `Backend` carrying the scheduler's
//! message verbatim.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use papi_common::config::EnvConfig;
use papi_common::{Error, Result};

use crate::types::{Allocation, Evaluation, Job, JobStub, Node};

/// Default deadline for scheduler calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for job submissions (the scheduler evaluates placements inline)
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Typed client for the scheduler HTTP API
#[derive(Debug, Clone)]
pub struct NomadClient {
    http: reqwest::Client,
    base: String,
}

impl NomadClient {
    /// Build a client from the `NOMAD_*` environment configuration,
    /// including mutual TLS when certificates are configured
    pub fn from_env(env: &EnvConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .connect_timeout(Duration::from_secs(5));

        if let Some(cacert) = &env.nomad_cacert {
            let pem = std::fs::read(cacert)
                .map_err(|e| Error::internal("nomad-client", format!("read CA cert: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::internal("nomad-client", format!("parse CA cert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&env.nomad_client_cert, &env.nomad_client_key)
        {
            let mut pem = std::fs::read(cert_path)
                .map_err(|e| Error::internal("nomad-client", format!("read client cert: {e}")))?;
            let key = std::fs::read(key_path)
                .map_err(|e| Error::internal("nomad-client", format!("read client key: {e}")))?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::internal("nomad-client", format!("parse identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| Error::internal("nomad-client", format!("build client: {e}")))?;

        Ok(Self {
            http,
            base: env.nomad_addr.trim_end_matches('/').to_string(),
        })
    }

    /// Build a plain client for a known address (tests, local dev)
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .query(query)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| wire_error(e, path))?;
        decode(response, path).await
    }

    /// List jobs in a namespace, optionally with a server-side filter
    /// expression
    pub async fn list_jobs(&self, namespace: &str, filter: &str) -> Result<Vec<JobStub>> {
        let mut query = vec![("namespace", namespace)];
        if !filter.is_empty() {
            query.push(("filter", filter));
        }
        self.get_json("/jobs", &query).await
    }

    /// Fetch one job; `None` when the scheduler does not know the id
    pub async fn get_job(&self, id: &str, namespace: &str) -> Result<Option<Job>> {
        let path = format!("/job/{id}");
        let response = self
            .http
            .get(self.url(&path))
            .query(&[("namespace", namespace)])
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| wire_error(e, &path))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response, &path).await.map(Some)
    }

    /// Parse a rendered job specification into a job document
    pub async fn parse_job(&self, hcl: &str) -> Result<Job> {
        let response = self
            .http
            .post(self.url("/jobs/parse"))
            .json(&json!({"JobHCL": hcl, "Canonicalize": true}))
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| wire_error(e, "/jobs/parse"))?;
        decode(response, "/jobs/parse").await
    }

    /// Register (submit) a job. Never retried: the caller re-submits.
    pub async fn register_job(&self, job: &Job) -> Result<()> {
        let response = self
            .http
            .post(self.url("/jobs"))
            .query(&[("namespace", job.namespace.as_str())])
            .json(&json!({ "Job": job }))
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| wire_error(e, "/jobs"))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("nomad", message));
        }
        debug!(job = %job.id, "job registered");
        Ok(())
    }

    /// Stop a job; with `purge` the job is removed immediately instead of
    /// being left for garbage collection
    pub async fn deregister_job(&self, id: &str, namespace: &str, purge: bool) -> Result<()> {
        let path = format!("/job/{id}");
        let purge_str = if purge { "true" } else { "false" };
        let response = self
            .http
            .delete(self.url(&path))
            .query(&[("namespace", namespace), ("purge", purge_str)])
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| wire_error(e, &path))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("nomad", message));
        }
        Ok(())
    }

    /// Allocations of a job, all generations
    pub async fn job_allocations(&self, id: &str, namespace: &str) -> Result<Vec<Allocation>> {
        self.get_json(&format!("/job/{id}/allocations"), &[("namespace", namespace)])
            .await
    }

    /// Evaluations of a job
    pub async fn job_evaluations(&self, id: &str, namespace: &str) -> Result<Vec<Evaluation>> {
        self.get_json(&format!("/job/{id}/evaluations"), &[("namespace", namespace)])
            .await
    }

    /// One allocation with its allocated resources
    pub async fn get_allocation(&self, id: &str) -> Result<Allocation> {
        self.get_json(&format!("/allocation/{id}"), &[]).await
    }

    /// All cluster nodes with their device inventories
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get_json("/nodes", &[("resources", "true")]).await
    }

    /// One node with full attributes and metadata
    pub async fn get_node(&self, id: &str) -> Result<Node> {
        self.get_json(&format!("/node/{id}"), &[]).await
    }
}

fn wire_error(err: reqwest::Error, path: &str) -> Error {
    if err.is_timeout() {
        Error::timeout(format!("nomad {path}"))
    } else {
        Error::backend("nomad", err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::backend("nomad", message));
    }
    response
        .json()
        .await
        .map_err(|e| Error::backend("nomad", format!("invalid response from {path}: {e}")))
}
