//! Bearer-token authentication.
//!
//! Tokens are opaque to this service: the identity provider's userinfo
//! endpoint turns them into a stable user identifier (`sub`). Verified
//! tokens are cached in-process for a short TTL so a polling client does
//! not hammer the provider. `AUTH_STATIC_TOKENS` offers a development
//! verifier when no provider is configured.

use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ApiError;

const CACHE_TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
struct CachedIdentity {
    user_id: String,
    verified_at: DateTime<Utc>,
}

impl CachedIdentity {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.verified_at + Duration::minutes(CACHE_TTL_MINUTES)
    }
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
}

pub struct Authenticator {
    http: reqwest::Client,
    userinfo_url: Option<String>,
    static_tokens: HashMap<String, String>,
    cache: RwLock<HashMap<String, CachedIdentity>>,
}

impl Authenticator {
    pub fn new(userinfo_url: Option<String>, static_tokens: HashMap<String, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            userinfo_url,
            static_tokens,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Authenticate a request; returns the stable user identifier.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        let token = bearer_token(headers).ok_or(ApiError::Auth)?;
        self.verify(token).await
    }

    pub async fn verify(&self, token: &str) -> Result<String, ApiError> {
        if let Some(user_id) = self.static_tokens.get(token) {
            return Ok(user_id.clone());
        }

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(token) {
                if entry.is_fresh() {
                    return Ok(entry.user_id.clone());
                }
            }
        }

        let Some(url) = &self.userinfo_url else {
            return Err(ApiError::Auth);
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|_| ApiError::Auth)?;
        if !response.status().is_success() {
            return Err(ApiError::Auth);
        }
        let info: UserInfo = response.json().await.map_err(|_| ApiError::Auth)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(
                token.to_string(),
                CachedIdentity {
                    user_id: info.sub.clone(),
                    verified_at: Utc::now(),
                },
            );
        }

        debug!(user = %info.sub, "bearer token verified");
        Ok(info.sub)
    }

    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired identity cache entries");
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn static_token_resolves() {
        let mut tokens = HashMap::new();
        tokens.insert("tok-a".to_string(), "alice".to_string());
        let auth = Authenticator::new(None, tokens);

        let user = auth
            .authenticate(&headers_with("Bearer tok-a"))
            .await
            .unwrap();
        assert_eq!(user, "alice");
    }

    #[tokio::test]
    async fn missing_header_rejected() {
        let auth = Authenticator::new(None, HashMap::new());
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(ApiError::Auth)
        ));
    }

    #[tokio::test]
    async fn non_bearer_scheme_rejected() {
        let auth = Authenticator::new(None, HashMap::new());
        assert!(matches!(
            auth.authenticate(&headers_with("Basic dXNlcjpwdw==")).await,
            Err(ApiError::Auth)
        ));
    }

    #[tokio::test]
    async fn unknown_token_without_provider_rejected() {
        let auth = Authenticator::new(None, HashMap::new());
        assert!(matches!(
            auth.authenticate(&headers_with("Bearer whoever")).await,
            Err(ApiError::Auth)
        ));
    }
}
