use axum::http::StatusCode;

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid request format: {0}")]
    InvalidRequest(String),

    #[error("tool call arguments are not a JSON object: {0}")]
    InvalidArguments(String),

    #[error("tool schema violation: {0}")]
    SchemaViolation(String),

    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("all endpoints in pool exhausted")]
    PoolExhausted,

    #[error("tool call correction failed: {0}")]
    CorrectionFailed(String),

    #[error("upstream stream contained no chunks")]
    EmptyStream,

    #[error("invalid override pattern: {0}")]
    InvalidPattern(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ProxyError {
    /// HTTP status this error surfaces as when it reaches the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PoolExhausted => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_is_400() {
        let err = ProxyError::InvalidRequest("bad json".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("Invalid request format"));
    }

    #[test]
    fn test_pool_exhausted_is_502() {
        assert_eq!(ProxyError::PoolExhausted.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let err = ProxyError::UpstreamStatus {
            status: 404,
            body: "not found".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
