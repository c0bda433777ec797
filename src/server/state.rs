//! Shared server state and client authentication
//!
//! One `AppState` threads every collaborator through the handlers; nothing
//! in the request path reaches for globals.

use crate::config::Config;
use crate::history::{HistoryQuery, HistoryStore};
use crate::router::ModelRouter;
use crate::server::error::ProxyError;
use crate::transform::TransformerRegistry;
use crate::upstream::UpstreamClient;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub router: Arc<ModelRouter>,
    pub transformers: Arc<TransformerRegistry>,
    pub upstream: Arc<UpstreamClient>,
    pub history: HistoryStore,
    pub query: Arc<HistoryQuery>,
}

/// Extract the client token from `x-api-key` or `Authorization: Bearer`
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(String::from)
        })
}

/// Validate the shared secret. With no secret configured, any token (or
/// none) is accepted.
pub fn validate_client(headers: &HeaderMap, config: &Config) -> Result<(), ProxyError> {
    let Some(expected) = &config.api_key else {
        return Ok(());
    };
    match client_token(headers) {
        Some(token) if token == *expected => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

/// Hash prefix of the client token, for log correlation.
/// The raw token never reaches the logs.
pub fn client_hash(headers: &HeaderMap) -> Option<String> {
    client_token(headers).map(|token| {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")[..16].to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn config_with_key(key: Option<&str>) -> Config {
        Config {
            api_key: key.map(String::from),
            ..Config::default()
        }
    }

    #[test]
    fn test_no_configured_secret_accepts_anything() {
        let config = config_with_key(None);
        assert!(validate_client(&headers(&[]), &config).is_ok());
        assert!(validate_client(&headers(&[("x-api-key", "whatever")]), &config).is_ok());
    }

    #[test]
    fn test_x_api_key_match() {
        let config = config_with_key(Some("sk-secret"));
        assert!(validate_client(&headers(&[("x-api-key", "sk-secret")]), &config).is_ok());
        assert!(validate_client(&headers(&[("x-api-key", "wrong")]), &config).is_err());
        assert!(validate_client(&headers(&[]), &config).is_err());
    }

    #[test]
    fn test_bearer_token_match() {
        let config = config_with_key(Some("sk-secret"));
        assert!(
            validate_client(&headers(&[("authorization", "Bearer sk-secret")]), &config).is_ok()
        );
        assert!(
            validate_client(&headers(&[("authorization", "Basic sk-secret")]), &config).is_err()
        );
    }

    #[test]
    fn test_client_hash_is_not_the_token() {
        let hash = client_hash(&headers(&[("x-api-key", "sk-secret")])).unwrap();
        assert_eq!(hash.len(), 16);
        assert!(!hash.contains("sk-secret"));
    }
}
