use http::StatusCode;
use thiserror::Error;

/// Core error type for bubblecast.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A required credential is not configured. Checked before any connection is opened.
    #[error("{what} is not configured")]
    Unavailable { what: String },

    /// Rejected by our own token bucket, never reaches an upstream.
    #[error("Rate limit exceeded")]
    Throttled { identity: String },

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("upstream {provider} idle for {secs}s")]
    IdleTimeout { provider: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// HTTP status surfaced to the browser for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Throttled { .. } | Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::ProviderError { code, .. } => code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::IdleTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Io(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let unavailable = RelayError::Unavailable {
            what: "ANTHROPIC_API_KEY".into(),
        };
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.to_string(), "ANTHROPIC_API_KEY is not configured");

        let throttled = RelayError::Throttled {
            identity: "1.2.3.4".into(),
        };
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(throttled.to_string(), "Rate limit exceeded");

        let upstream = RelayError::ProviderError {
            provider: "anthropic".into(),
            code: "401".into(),
            message: "bad key".into(),
        };
        assert_eq!(upstream.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn success_code_in_provider_error_maps_to_bad_gateway() {
        // a 200 with an undecodable body is still an upstream failure
        let err = RelayError::ProviderError {
            provider: "http".into(),
            code: "200".into(),
            message: "json decode error".into(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
