//! Authentication for the private methods of the API
//!
//! Bearer tokens are validated against the configured OIDC issuers: the
//! issuer is read from the token, its JWKS document is fetched (and cached
//! with periodic refresh), the signature and expiry are checked, and the
//! claims are distilled into an [`AuthInfo`]. Access levels come from the
//! entitlement roles, formatted `<access-level>:<project>`
//! (e.g. `platform-access:vo.ai4eosc.eu`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use papi_common::config::MainConfig;
use papi_common::{Error, Result};

/// Access level required to use the platform
pub const PLATFORM_ACCESS: &str = "platform-access";

/// Validated identity of a caller
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// Subject (user id)
    pub subject: String,
    /// URL of the token issuer
    pub issuer: String,
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
    /// access level -> projects that granted it
    pub groups: HashMap<String, Vec<String>>,
}

impl AuthInfo {
    /// VOs the user can use at the platform access level
    pub fn vos(&self) -> &[String] {
        self.groups
            .get(PLATFORM_ACCESS)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check the user belongs to the requested VO and the VO is allow-listed
    pub fn check_vo(&self, vo: &str, config: &MainConfig) -> Result<()> {
        if !config.knows_vo(vo) {
            return Err(Error::not_member(format!(
                "the Virtual Organization {vo} is not served by this installation"
            )));
        }
        if !self.vos().iter().any(|v| v == vo) {
            return Err(Error::not_member(format!(
                "the requested Virtual Organization ({vo}) does not match any of your \
                 available VOs: {:?}",
                self.vos()
            )));
        }
        Ok(())
    }

    /// Check membership of an access-level group (e.g. the LLM demo group)
    pub fn check_group(&self, access_level: &str) -> Result<()> {
        if !self.groups.contains_key(access_level) {
            return Err(Error::not_member(format!(
                "your user does not have the required access level: {access_level}"
            )));
        }
        Ok(())
    }

    /// Resolve the VOs a listing call should cover: the requested subset or
    /// all of the user's VOs, always intersected with the allow-list
    pub fn resolve_vos(&self, requested: Option<&[String]>, config: &MainConfig) -> Result<Vec<String>> {
        let candidates: Vec<String> = match requested {
            Some(vos) if !vos.is_empty() => vos.to_vec(),
            _ => self.vos().to_vec(),
        };
        let resolved: Vec<String> = candidates
            .into_iter()
            .filter(|vo| config.knows_vo(vo) && self.vos().iter().any(|v| v == vo))
            .collect();
        if resolved.is_empty() {
            return Err(Error::not_member(format!(
                "the provided Virtual Organizations do not match any of your available \
                 VOs: {:?}",
                self.vos()
            )));
        }
        Ok(resolved)
    }

    /// Check the caller may use admin routes (catalog refresh)
    pub fn check_admin(&self, config: &MainConfig) -> Result<()> {
        if !config.auth.admins.iter().any(|s| s == &self.subject) {
            return Err(Error::forbidden("this route is restricted to administrators"));
        }
        Ok(())
    }
}

/// JWT claims PAPI cares about
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    iss: Option<String>,
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    aud: Audience,
    #[serde(default)]
    realm_access: RealmAccess,
    #[serde(default)]
    eduperson_entitlement: Vec<String>,
}

/// Audience claim: single string or array
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum Audience {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn contains(&self, wanted: &str) -> bool {
        match self {
            Audience::None => false,
            Audience::Single(s) => s == wanted,
            Audience::Multiple(v) => v.iter().any(|s| s == wanted),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// JWKS cache entry for one issuer
struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    last_refresh: Instant,
}

/// OIDC discovery document
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK key
#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Multi-issuer OIDC token validator
pub struct OidcValidator {
    issuers: Vec<String>,
    jwks: RwLock<HashMap<String, JwksCache>>,
    http: reqwest::Client,
    refresh_interval: Duration,
}

impl OidcValidator {
    /// Build a validator for the configured trusted issuers
    pub fn new(issuers: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            issuers,
            jwks: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            refresh_interval: Duration::from_secs(3600),
        })
    }

    /// Validate a bearer token and distill its claims
    pub async fn validate(&self, token: &str) -> Result<AuthInfo> {
        let issuer = unverified_issuer(token)?;
        if !self.issuers.iter().any(|i| i.trim_end_matches('/') == issuer.trim_end_matches('/')) {
            return Err(Error::auth(format!("token issuer {issuer} is not trusted")));
        }

        let header = decode_header(token).map_err(|e| Error::auth(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::auth("token header carries no key id"))?;

        let key = self.decoding_key(&issuer, &kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&issuer]);
        // Audience is checked manually below (the secret store needs the
        // "account" audience, not the API itself)
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| Error::auth(e.to_string()))?;
        build_auth_info(data.claims)
    }

    async fn decoding_key(&self, issuer: &str, kid: &str) -> Result<DecodingKey> {
        {
            let cache = self.jwks.read().await;
            if let Some(entry) = cache.get(issuer) {
                if entry.last_refresh.elapsed() < self.refresh_interval {
                    if let Some(key) = entry.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Stale cache or unknown kid (key rotation): refresh
        let keys = self.fetch_jwks(issuer).await?;
        let mut cache = self.jwks.write().await;
        let entry = cache.entry(issuer.to_string()).or_insert(JwksCache {
            keys: HashMap::new(),
            last_refresh: Instant::now(),
        });
        entry.keys = keys;
        entry.last_refresh = Instant::now();
        entry
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| Error::auth(format!("token signed with unknown key {kid}")))
    }

    async fn fetch_jwks(&self, issuer: &str) -> Result<HashMap<String, DecodingKey>> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: OidcDiscovery = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| Error::auth(format!("OIDC discovery failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::auth(format!("invalid OIDC discovery document: {e}")))?;

        let jwks: JwksDocument = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::auth(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::auth(format!("invalid JWKS document: {e}")))?;

        let mut keys = HashMap::new();
        for key in jwks.keys {
            let Some(kid) = key.kid.clone() else {
                continue;
            };
            match decoding_key_of(&key) {
                Some(decoded) => {
                    keys.insert(kid, decoded);
                }
                None => warn!(kid = %kid, kty = %key.kty, "skipping unsupported JWKS key"),
            }
        }
        debug!(issuer = %issuer, keys = keys.len(), "refreshed JWKS");
        Ok(keys)
    }
}

fn decoding_key_of(key: &JwkKey) -> Option<DecodingKey> {
    match key.kty.as_str() {
        "RSA" => {
            let n = key.n.as_deref()?;
            let e = key.e.as_deref()?;
            DecodingKey::from_rsa_components(n, e).ok()
        }
        "EC" => {
            let x = key.x.as_deref()?;
            let y = key.y.as_deref()?;
            let _crv = key.crv.as_deref()?;
            DecodingKey::from_ec_components(x, y).ok()
        }
        _ => None,
    }
}

/// Read the issuer from an unverified token (the signature is checked
/// afterwards against that issuer's keys)
fn unverified_issuer(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::auth("malformed token"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::auth("malformed token payload"))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| Error::auth("malformed token payload"))?;
    value
        .get("iss")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::auth("token carries no issuer"))
}

/// Distill validated claims into the identity the controllers consume
fn build_auth_info(claims: Claims) -> Result<AuthInfo> {
    let mut roles = claims.realm_access.roles;
    roles.extend(claims.eduperson_entitlement);

    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for role in roles {
        let mut parts = role.splitn(2, ':');
        let access = parts.next().unwrap_or_default().to_string();
        let project = parts.next();
        let entry = groups.entry(access).or_default();
        if let Some(project) = project {
            entry.push(project.to_string());
        }
    }

    let required = [
        ("sub", &claims.sub),
        ("iss", &claims.iss),
        ("name", &claims.name),
        ("email", &claims.email),
    ];
    for (name, value) in required {
        if value.as_deref().unwrap_or("").is_empty() {
            return Err(Error::auth(format!("your token should have scopes for {name}")));
        }
    }

    // The secret store logs in with the same token and needs this audience
    if !claims.aud.contains("account") {
        return Err(Error::auth("your token should have 'account' in audiences"));
    }

    Ok(AuthInfo {
        subject: claims.sub.unwrap_or_default(),
        issuer: claims.iss.unwrap_or_default(),
        name: claims.name.unwrap_or_default(),
        email: claims.email.unwrap_or_default(),
        groups,
    })
}

/// Pull the bearer token out of the request headers
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::auth("missing Authorization header"))?
        .to_str()
        .map_err(|_| Error::auth("malformed Authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| Error::auth("Authorization header is not a bearer token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: serde_json::Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    fn full_claims() -> serde_json::Value {
        json!({
            "sub": "alice@x",
            "iss": "https://aai.example.org/auth/realms/egi",
            "name": "Alice Example",
            "email": "alice@example.org",
            "aud": ["account", "papi"],
            "realm_access": {
                "roles": [
                    "platform-access:vo.a",
                    "platform-access:vo.b",
                    "demo",
                    "offline_access"
                ]
            }
        })
    }

    fn config() -> MainConfig {
        serde_yaml::from_str(
            r#"
self: {domain: api.example.org}
auth:
  OP: [https://aai.example.org/auth/realms/egi]
  VO: [vo.a, vo.b]
  admins: [root@x]
nomad: {namespaces: {vo.a: ai4eosc, vo.b: imagine}}
lb: {domain: {vo.a: a.deploy.example, vo.b: b.deploy.example}}
catalog:
  modules_index: https://example.org/MODULES.yml
  allowed_registries: [allowed/]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_entitlements_become_grouped_vos() {
        let info = build_auth_info(claims(full_claims())).unwrap();
        assert_eq!(info.subject, "alice@x");
        assert_eq!(info.vos(), ["vo.a", "vo.b"]);
        // Roles without a project grant the level but no VO
        assert!(info.groups.contains_key("demo"));
        assert!(info.groups["demo"].is_empty());
    }

    #[test]
    fn test_missing_required_claim_rejected() {
        let mut value = full_claims();
        value.as_object_mut().unwrap().remove("email");
        let err = build_auth_info(claims(value)).unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_missing_account_audience_rejected() {
        let mut value = full_claims();
        value["aud"] = json!(["papi"]);
        let err = build_auth_info(claims(value)).unwrap_err();
        assert!(err.to_string().contains("account"));
    }

    #[test]
    fn test_single_string_audience() {
        let mut value = full_claims();
        value["aud"] = json!("account");
        assert!(build_auth_info(claims(value)).is_ok());
    }

    #[test]
    fn test_check_vo_membership() {
        let info = build_auth_info(claims(full_claims())).unwrap();
        let config = config();
        assert!(info.check_vo("vo.a", &config).is_ok());
        // Allow-listed VO the user does not belong to
        let mut limited = info.clone();
        limited.groups.get_mut(PLATFORM_ACCESS).unwrap().retain(|v| v == "vo.a");
        assert!(limited.check_vo("vo.b", &config).is_err());
        // VO outside the installation's allow-list
        assert!(info.check_vo("vo.evil", &config).is_err());
    }

    #[test]
    fn test_resolve_vos_defaults_to_all_user_vos() {
        let info = build_auth_info(claims(full_claims())).unwrap();
        let config = config();
        assert_eq!(info.resolve_vos(None, &config).unwrap(), ["vo.a", "vo.b"]);
        let subset = vec!["vo.b".to_string()];
        assert_eq!(info.resolve_vos(Some(&subset), &config).unwrap(), ["vo.b"]);
        let bogus = vec!["vo.evil".to_string()];
        assert!(info.resolve_vos(Some(&bogus), &config).is_err());
    }

    #[test]
    fn test_admin_check() {
        let mut info = build_auth_info(claims(full_claims())).unwrap();
        let config = config();
        assert!(info.check_admin(&config).is_err());
        info.subject = "root@x".to_string();
        assert!(info.check_admin(&config).is_ok());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");

        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_unverified_issuer_peek() {
        let payload = URL_SAFE_NO_PAD.encode(
            json!({"iss": "https://aai.example.org/auth/realms/egi"}).to_string(),
        );
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        assert_eq!(
            unverified_issuer(&token).unwrap(),
            "https://aai.example.org/auth/realms/egi"
        );
        assert!(unverified_issuer("garbage").is_err());
    }

    #[tokio::test]
    async fn test_untrusted_issuer_rejected() {
        let validator = OidcValidator::new(vec![
            "https://aai.example.org/auth/realms/egi".to_string()
        ]);
        let payload = URL_SAFE_NO_PAD.encode(json!({"iss": "https://evil.example"}).to_string());
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        let err = validator.validate(&token).await.unwrap_err();
        assert!(err.to_string().contains("not trusted"));
    }
}
