//! Secret store client (KV v1 over HTTPS)
//!
//! The server-side token can read and write under the whole mount; the
//! per-user prefix is enforced here, before any path reaches the store.
//! Users never specify absolute paths: every effective path is
//! `/<secret-root>/<vo>/users/<subject>/<user-path>`, derived server-side.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use papi_common::{Error, Result};

/// Client for the key/value secret store
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    mount: String,
    token: Option<String>,
}

impl VaultClient {
    /// Build a client for one store; without a token every call degrades
    /// to a backend error (dev mode)
    pub fn new(addr: String, mount: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            addr: addr.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token,
        }
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::backend("vault", "secret store token is not configured"))
    }

    /// Normalize a user path and derive the effective store path.
    ///
    /// Rejects traversal outside the user subtree.
    pub fn scoped_path(&self, vo: &str, subject: &str, user_path: &str) -> Result<String> {
        let trimmed = user_path.trim_matches('/');
        if trimmed.split('/').any(|seg| seg == "..") {
            return Err(Error::forbidden("secret paths cannot traverse upwards"));
        }
        let mut path = format!("{}/{vo}/users/{subject}", self.mount);
        if !trimmed.is_empty() {
            path.push('/');
            path.push_str(trimmed);
        }
        Ok(path)
    }

    fn url(&self, store_path: &str) -> String {
        format!("{}/v1/{store_path}", self.addr)
    }

    async fn list_keys(&self, store_path: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.url(store_path))
            .query(&[("list", "true")])
            .header("X-Vault-Token", self.token()?)
            .send()
            .await
            .map_err(|e| wire_error(e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // No secrets under this path
            return Ok(Vec::new());
        }
        let body: Value = decode(response).await?;
        Ok(body["data"]["keys"]
            .as_array()
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read(&self, store_path: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(store_path))
            .header("X-Vault-Token", self.token()?)
            .send()
            .await
            .map_err(wire_error)?;
        let body: Value = decode(response).await?;
        Ok(body["data"].clone())
    }

    /// All secrets under the user subtree (optionally narrowed to a
    /// subpath), keyed by path relative to the subtree
    pub async fn list_secrets(
        &self,
        vo: &str,
        subject: &str,
        subpath: &str,
    ) -> Result<BTreeMap<String, Value>> {
        let user_root = self.scoped_path(vo, subject, "")?;
        let start = self.scoped_path(vo, subject, subpath)?;

        // Walk the tree: keys ending in '/' are folders
        let mut pending = vec![format!("{start}/")];
        let mut leaves = Vec::new();
        while let Some(folder) = pending.pop() {
            for key in self.list_keys(folder.trim_end_matches('/')).await? {
                let child = format!("{folder}{key}");
                if key.ends_with('/') {
                    pending.push(child);
                } else {
                    leaves.push(child);
                }
            }
        }

        let mut out = BTreeMap::new();
        for leaf in leaves {
            let value = self.read(&leaf).await?;
            let relative = leaf
                .strip_prefix(&user_root)
                .unwrap_or(&leaf)
                .to_string();
            out.insert(relative, value);
        }
        Ok(out)
    }

    /// One secret, or None when the path holds nothing
    pub async fn get_secret(&self, vo: &str, subject: &str, path: &str) -> Result<Option<Value>> {
        let store_path = self.scoped_path(vo, subject, path)?;
        let response = self
            .http
            .get(self.url(&store_path))
            .header("X-Vault-Token", self.token()?)
            .send()
            .await
            .map_err(wire_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = decode(response).await?;
        Ok(Some(body["data"].clone()))
    }

    /// Create or update a secret. Never retried.
    pub async fn put_secret(
        &self,
        vo: &str,
        subject: &str,
        path: &str,
        data: &Value,
    ) -> Result<()> {
        let store_path = self.scoped_path(vo, subject, path)?;
        let response = self
            .http
            .post(self.url(&store_path))
            .header("X-Vault-Token", self.token()?)
            .json(data)
            .send()
            .await
            .map_err(wire_error)?;
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("vault", message));
        }
        debug!(vo = vo, path = path, "secret written");
        Ok(())
    }

    /// Delete a secret
    pub async fn delete_secret(&self, vo: &str, subject: &str, path: &str) -> Result<()> {
        let store_path = self.scoped_path(vo, subject, path)?;
        let response = self
            .http
            .delete(self.url(&store_path))
            .header("X-Vault-Token", self.token()?)
            .send()
            .await
            .map_err(wire_error)?;
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("vault", message));
        }
        Ok(())
    }
}

fn wire_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout("vault")
    } else {
        Error::backend("vault", err.to_string())
    }
}

async fn decode(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::backend("vault", message));
    }
    response
        .json()
        .await
        .map_err(|e| Error::backend("vault", e.to_string()))
}
