//! Function platform client
//!
//! One cluster per VO; calls are authenticated with the caller's own
//! bearer token so the platform applies its own per-user permissions.

use std::time::Duration;

use serde_json::Value;

use papi_common::config::OscarCluster;
use papi_common::{Error, Result};

/// Client for one function-platform cluster, bound to a caller token
pub struct OscarClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl OscarClient {
    /// Build a client for a VO's cluster using the caller's token
    pub fn new(cluster: &OscarCluster, token: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            endpoint: cluster.endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout("oscar")
                } else {
                    Error::backend("oscar", e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("oscar", message));
        }
        Ok(response)
    }

    /// Cluster information document
    pub async fn cluster_info(&self) -> Result<Value> {
        let response = self.send(self.http.get(self.url("/system/info"))).await?;
        response
            .json()
            .await
            .map_err(|e| Error::backend("oscar", e.to_string()))
    }

    /// All services deployed on the cluster
    pub async fn list_services(&self) -> Result<Value> {
        let response = self
            .send(self.http.get(self.url("/system/services")))
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::backend("oscar", e.to_string()))
    }

    /// One service
    pub async fn get_service(&self, name: &str) -> Result<Value> {
        let response = self
            .send(self.http.get(self.url(&format!("/system/services/{name}"))))
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::backend("oscar", e.to_string()))
    }

    /// Create a service from its definition. Never retried.
    pub async fn create_service(&self, definition: &Value) -> Result<()> {
        self.send(self.http.post(self.url("/system/services")).json(definition))
            .await?;
        Ok(())
    }

    /// Update a service; the platform needs the full definition
    pub async fn update_service(&self, definition: &Value) -> Result<()> {
        self.send(self.http.put(self.url("/system/services")).json(definition))
            .await?;
        Ok(())
    }

    /// Delete a service
    pub async fn delete_service(&self, name: &str) -> Result<()> {
        self.send(
            self.http
                .delete(self.url(&format!("/system/services/{name}"))),
        )
        .await?;
        Ok(())
    }

    /// Execution logs of a service
    pub async fn service_logs(&self, name: &str) -> Result<Value> {
        let response = self
            .send(self.http.get(self.url(&format!("/system/logs/{name}"))))
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::backend("oscar", e.to_string()))
    }
}
