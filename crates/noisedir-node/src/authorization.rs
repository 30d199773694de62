//! Authorization gateway: gates API requests behind an external accounting
//! service when `REQUIRE_AUTHORIZATION` is set, caching positive outcomes
//! for 60 seconds keyed by the exact header value.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("accounting service rejected the request")]
    Rejected,
    #[error("accounting service unreachable: {0}")]
    Unreachable(String),
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        403
    }
}

#[derive(Debug, Serialize)]
struct AccountingRequest<'a> {
    auth: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccountingResponse {
    active: bool,
    #[allow(dead_code)]
    user_id: Option<serde_json::Value>,
}

/// Wraps the outbound call to `{ACCOUNTING_URL}/api/v0/internal/user/` with
/// a short-lived positive-result cache backed by `reqwest`.
pub struct AuthorizationGateway {
    client: reqwest::Client,
    accounting_url: String,
    apisecret: String,
    cache: DashMap<String, Instant>,
}

impl AuthorizationGateway {
    pub fn new(accounting_url: String, apisecret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            accounting_url,
            apisecret,
            cache: DashMap::new(),
        }
    }

    /// Authorizes the exact `Authorization` header value, caching a
    /// positive result for 60 seconds so repeated requests from the same
    /// caller don't round-trip to the accounting service every time.
    pub async fn authorize(&self, header_value: &str) -> Result<(), AuthError> {
        if header_value.is_empty() {
            return Err(AuthError::MissingHeader);
        }

        if let Some(cached_at) = self.cache.get(header_value) {
            if cached_at.elapsed() < CACHE_TTL {
                return Ok(());
            }
        }
        self.cache.remove(header_value);

        let url = format!("{}/api/v0/internal/user/", self.accounting_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("APISECRET", &self.apisecret)
            .json(&AccountingRequest { auth: header_value })
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected);
        }

        let body: AccountingResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !body.active {
            return Err(AuthError::Rejected);
        }

        self.cache.insert(header_value.to_string(), Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_header_is_rejected_without_network_call() {
        let gateway = AuthorizationGateway::new("http://localhost:1".to_string(), "secret".to_string());
        let result = gateway.authorize("").await;
        assert!(matches!(result, Err(AuthError::MissingHeader)));
    }

    #[tokio::test]
    async fn positive_result_is_cached() {
        // Without a live accounting server we can only exercise the cache
        // hit path directly; insert a fake positive entry and confirm it
        // short-circuits the network call.
        let gateway = AuthorizationGateway::new("http://localhost:1".to_string(), "secret".to_string());
        gateway.cache.insert("token-abc".to_string(), Instant::now());
        gateway.authorize("token-abc").await.unwrap();
    }
}
