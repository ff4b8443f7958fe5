//! Image registry client (snapshot storage)
//!
//! Snapshots follow the scheme: one user = one repository under the
//! snapshot project, one snapshot = one tagged artifact in it, with the
//! provenance (owner, title, VO, date) stored as image labels.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use papi_common::{Error, Result};

/// Client for the registry API
#[derive(Debug, Clone)]
pub struct HarborClient {
    http: reqwest::Client,
    addr: String,
    project: String,
    user: String,
    password: Option<String>,
}

/// One artifact (snapshot) in the registry
#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    /// Artifact size in bytes
    #[serde(default)]
    pub size: u64,
    /// Tags on the artifact (the snapshot id is the first tag)
    #[serde(default)]
    pub tags: Option<Vec<ArtifactTag>>,
    /// Extra attributes carrying the image config
    #[serde(default)]
    pub extra_attrs: ExtraAttrs,
}

/// Tag of an artifact
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactTag {
    /// Tag name
    pub name: String,
}

/// Extra attributes of an artifact
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraAttrs {
    /// Image config section
    #[serde(default)]
    pub config: ArtifactConfig,
}

/// Image config of an artifact
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactConfig {
    /// Image labels (snapshot provenance)
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

impl Artifact {
    /// The snapshot id (first tag)
    pub fn snapshot_id(&self) -> Option<&str> {
        self.tags
            .as_ref()?
            .first()
            .map(|tag| tag.name.as_str())
    }

    /// A provenance label
    pub fn label(&self, key: &str) -> &str {
        self.extra_attrs
            .config
            .labels
            .get(key)
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
}

impl HarborClient {
    /// Build a client; without a password every call degrades to a backend
    /// error (dev mode)
    pub fn new(addr: String, project: String, user: String, password: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            addr: addr.trim_end_matches('/').to_string(),
            project,
            user,
            password,
        }
    }

    /// Registry repositories are per user, with `@` escaped
    pub fn repository_for(owner: &str) -> String {
        owner.replace('@', "_at_")
    }

    /// Image reference users pull snapshots from
    pub fn image_for(&self, owner: &str) -> String {
        let host = self
            .addr
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!("{host}/{}/{}", self.project, Self::repository_for(owner))
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::backend("harbor", "registry robot password is not configured"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}/api/v2.0{path}", self.addr))
            .basic_auth(&self.user, Some(self.password()?))
            .query(&[("page_size", "100")])
            .send()
            .await
            .map_err(wire_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("harbor", message));
        }
        response
            .json()
            .await
            .map_err(|e| Error::backend("harbor", e.to_string()))
    }

    /// Whether a user already has a snapshot repository
    pub async fn user_has_repository(&self, owner: &str) -> Result<bool> {
        let repos: Vec<Repository> = self
            .get_json(&format!("/projects/{}/repositories", self.project))
            .await?;
        let wanted = Self::repository_for(owner);
        Ok(repos
            .iter()
            .filter_map(|r| r.name.split('/').nth(1))
            .any(|name| name == wanted))
    }

    /// All snapshot artifacts of a user
    pub async fn list_artifacts(&self, owner: &str) -> Result<Vec<Artifact>> {
        if !self.user_has_repository(owner).await? {
            return Ok(Vec::new());
        }
        let repository = Self::repository_for(owner);
        self.get_json(&format!(
            "/projects/{}/repositories/{}/artifacts",
            self.project,
            urlencode(&repository)
        ))
        .await
    }

    /// Delete one snapshot artifact by tag
    pub async fn delete_artifact(&self, owner: &str, reference: &str) -> Result<()> {
        let repository = Self::repository_for(owner);
        let response = self
            .http
            .delete(format!(
                "{}/api/v2.0/projects/{}/repositories/{}/artifacts/{}",
                self.addr,
                self.project,
                urlencode(&repository),
                reference
            ))
            .basic_auth(&self.user, Some(self.password()?))
            .send()
            .await
            .map_err(wire_error)?;
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::backend("harbor", message));
        }
        Ok(())
    }
}

/// Percent-encode a repository name for use as one path segment
fn urlencode(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn wire_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout("harbor")
    } else {
        Error::backend("harbor", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_owner_escaping() {
        assert_eq!(HarborClient::repository_for("alice@x.org"), "alice_at_x.org");
        assert_eq!(HarborClient::repository_for("bob"), "bob");
    }

    #[test]
    fn test_image_reference() {
        let client = HarborClient::new(
            "https://registry.example.org".to_string(),
            "user-snapshots".to_string(),
            "robot".to_string(),
            Some("pw".to_string()),
        );
        assert_eq!(
            client.image_for("alice@x"),
            "registry.example.org/user-snapshots/alice_at_x"
        );
    }

    #[test]
    fn test_artifact_labels_and_id() {
        let artifact: Artifact = serde_json::from_value(json!({
            "size": 4200000000u64,
            "tags": [{"name": "aaaa-bbbb_1700000000"}],
            "extra_attrs": {
                "config": {
                    "Labels": {
                        "VO": "vo.a",
                        "TITLE": "t1",
                        "DATE": "2023-11-14 22:13:20"
                    }
                }
            }
        }))
        .unwrap();
        assert_eq!(artifact.snapshot_id(), Some("aaaa-bbbb_1700000000"));
        assert_eq!(artifact.label("VO"), "vo.a");
        assert_eq!(artifact.label("MISSING"), "");
    }

    #[test]
    fn test_artifact_without_tags() {
        let artifact: Artifact = serde_json::from_value(json!({"size": 1})).unwrap();
        assert_eq!(artifact.snapshot_id(), None);
    }

    #[test]
    fn test_urlencode_repository() {
        assert_eq!(urlencode("alice_at_x.org"), "alice_at_x.org");
        assert_eq!(urlencode("weird/name"), "weird%2Fname");
    }
}
