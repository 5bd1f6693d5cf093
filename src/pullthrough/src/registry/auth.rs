use crate::config::{DEFAULT_TOKEN_EXPIRY_SECS, TOKEN_EXPIRY_SAFETY_MARGIN_SECS};
use crate::config::RegistryCredential;
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

fn unquote(value: &str) -> String {
    value
        .trim()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(value.trim())
        .to_string()
}

impl Challenge {
    /// Example: `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        // Quoted values may contain commas (`pull,push`)
        let mut rest = params;
        while !rest.is_empty() {
            let (key, after_eq) = match rest.split_once('=') {
                Some(kv) => kv,
                None => break,
            };
            let key = key.trim().trim_start_matches(',').trim();
            let (value, next) = if let Some(quoted) = after_eq.strip_prefix('"') {
                match quoted.find('"') {
                    Some(end) => (&quoted[..end], &quoted[end + 1..]),
                    None => (quoted, ""),
                }
            } else {
                match after_eq.find(',') {
                    Some(end) => (&after_eq[..end], &after_eq[end..]),
                    None => (after_eq, ""),
                }
            };
            match key {
                "realm" => realm = Some(unquote(value)),
                "service" => service = Some(unquote(value)),
                "scope" => scope = Some(unquote(value)),
                _ => {}
            }
            rest = next.trim_start_matches(',').trim_start();
        }

        realm.map(|realm| Challenge::Bearer {
            realm,
            service,
            scope,
        })
    }

    /// Token endpoint URL; scope falls back to pull access on `repository`
    pub fn token_url(&self, repository: &str) -> Option<String> {
        let Challenge::Bearer {
            realm,
            service,
            scope,
        } = self
        else {
            return None;
        };
        let scope = scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", repository));
        let mut url = realm.clone();
        url.push(if realm.contains('?') { '&' } else { '?' });
        if let Some(service) = service {
            url.push_str(&format!("service={}&", service));
        }
        url.push_str(&format!("scope={}", scope));
        Some(url)
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer tokens keyed by token URL
#[derive(Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.tokens.read().await.get(key).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    pub async fn insert(&self, key: String, token: String, expires_in_seconds: Option<u64>) {
        let expires_in = expires_in_seconds.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS));
        let mut tokens = self.tokens.write().await;
        tokens.insert(key, CachedToken { token, expires_at });
        tokens.retain(|_, cached| cached.expires_at > Instant::now());
    }

    /// Resolve a bearer token for `challenge`, from cache or from the realm
    pub async fn fetch(
        &self,
        client: &Client,
        challenge: &Challenge,
        repository: &str,
        credential: Option<&RegistryCredential>,
    ) -> Option<String> {
        let token_url = challenge.token_url(repository)?;
        if let Some(token) = self.get(&token_url).await {
            tracing::debug!(token_url = %token_url, "Using cached registry token");
            return Some(token);
        }

        let mut req = client.get(&token_url);
        if let Some(cred) = credential {
            req = req.basic_auth(&cred.username, Some(&cred.password));
        }
        let resp = match req.send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::warn!(token_url = %token_url, status = %resp.status(), "Token endpoint refused request");
                return None;
            }
            Err(e) => {
                tracing::warn!(token_url = %token_url, error = %e, "Failed to fetch registry token");
                return None;
            }
        };
        let json: serde_json::Value = resp.json().await.ok()?;
        // Docker Hub answers with `token`, some registries only with `access_token`
        let token = json
            .get("token")
            .and_then(|t| t.as_str())
            .or_else(|| json.get("access_token").and_then(|t| t.as_str()))?
            .to_string();
        let expires_in = json.get("expires_in").and_then(|v| v.as_u64());
        self.insert(token_url, token.clone(), expires_in).await;
        Some(token)
    }
}
