//! Proxy error taxonomy and response handling
//!
//! Every failure maps to an HTTP status plus a Claude-shaped error body
//! `{"type": "error", "error": {"type": ..., "message": ...}}` so clients
//! see the same envelope the native API produces.

use crate::router::RouterError;
use crate::upstream::UpstreamError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug)]
pub enum ProxyError {
    /// Schema violation, missing max_tokens, unknown tool
    InvalidRequest(String),
    /// Bad shared secret
    Unauthorized,
    /// Selection references a non-listed provider/model
    UnknownModel(String),
    /// No provider advertises the tier
    NoProvider(String),
    UpstreamTimeout,
    UpstreamTransport(String),
    UpstreamProtocol(String),
    /// Provider rejected our credentials; masked so the client can't probe
    UpstreamAuth,
    UpstreamRateLimited { retry_after: Option<u64> },
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::UnknownModel(_) | ProxyError::NoProvider(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamTransport(_)
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamAuth => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Claude error-body `error.type`
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::Unauthorized => "authentication_error",
            ProxyError::UnknownModel(_) | ProxyError::NoProvider(_) => "not_found_error",
            ProxyError::UpstreamRateLimited { .. } => "rate_limit_error",
            ProxyError::UpstreamTimeout
            | ProxyError::UpstreamTransport(_)
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamAuth => "api_error",
            ProxyError::Internal(_) => "api_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProxyError::InvalidRequest(msg) => msg.clone(),
            ProxyError::Unauthorized => "invalid client API key".to_string(),
            ProxyError::UnknownModel(sel) => format!("unknown provider/model: {sel}"),
            ProxyError::NoProvider(tier) => {
                format!("no provider advertises a {tier} model")
            }
            ProxyError::UpstreamTimeout => "upstream request timed out".to_string(),
            ProxyError::UpstreamTransport(msg) => format!("upstream transport error: {msg}"),
            ProxyError::UpstreamProtocol(msg) => format!("upstream protocol error: {msg}"),
            ProxyError::UpstreamAuth => "upstream provider rejected the request".to_string(),
            ProxyError::UpstreamRateLimited { .. } => "upstream rate limited".to_string(),
            ProxyError::Internal(msg) => format!("internal error: {msg}"),
        }
    }

    pub fn from_router(e: RouterError) -> Self {
        match e {
            RouterError::UnknownModel(sel) => ProxyError::UnknownModel(sel),
            RouterError::NoProviders(tier) => ProxyError::NoProvider(tier.as_str().to_string()),
        }
    }

    pub fn from_upstream(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Timeout => ProxyError::UpstreamTimeout,
            UpstreamError::Transport(msg) => ProxyError::UpstreamTransport(msg),
            UpstreamError::Protocol(msg) => ProxyError::UpstreamProtocol(msg),
            UpstreamError::Auth => ProxyError::UpstreamAuth,
            UpstreamError::RateLimited { retry_after } => {
                ProxyError::UpstreamRateLimited { retry_after }
            }
            UpstreamError::Status { status, body } => {
                ProxyError::UpstreamTransport(format!("status {status}: {body}"))
            }
        }
    }

    /// The JSON error body
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.message(),
            }
        })
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Proxy error: {} - {}", status, self.message());
        } else {
            tracing::debug!("Client error: {} - {}", status, self.message());
        }

        let mut response = (status, Json(self.body())).into_response();
        if let ProxyError::UpstreamRateLimited {
            retry_after: Some(secs),
        } = &self
        {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::UnknownModel("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ProxyError::UpstreamAuth.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::UpstreamRateLimited { retry_after: None }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = ProxyError::Unauthorized.body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
        assert!(body["error"]["message"].is_string());
    }

    #[test]
    fn test_upstream_auth_is_masked() {
        let message = ProxyError::UpstreamAuth.message();
        assert!(!message.contains("401"));
        assert!(!message.contains("key"));
    }

    #[test]
    fn test_router_error_conversion() {
        let e = ProxyError::from_router(RouterError::UnknownModel("X:y".into()));
        assert!(matches!(e, ProxyError::UnknownModel(_)));
    }
}
