use serde::Deserialize;

/// Why a fetch or mutation failed.
///
/// Failures are stored in the cache entry, never thrown across the cache
/// boundary, so the type is `Clone` and compares by value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("unauthorized: {message}")]
    Auth { message: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        FetchError::Network { message: message.into() }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        FetchError::Server { status, message: message.into() }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        FetchError::Decode { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        FetchError::Auth { message: message.into() }
    }

    /// Stable code for programmatic handling and log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            FetchError::Network { .. } => "NETWORK_ERROR",
            FetchError::Server { .. } => "SERVER_ERROR",
            FetchError::Decode { .. } => "DECODE_ERROR",
            FetchError::Auth { .. } => "AUTH_ERROR",
        }
    }

    /// The bare message, as shown next to stale data in the UI.
    pub fn message(&self) -> &str {
        match self {
            FetchError::Network { message }
            | FetchError::Server { message, .. }
            | FetchError::Decode { message }
            | FetchError::Auth { message } => message,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Server { status, .. } => crate::retry::is_retryable_http_error(*status),
            FetchError::Decode { .. } | FetchError::Auth { .. } => false,
        }
    }

    /// Build the error for a non-success HTTP response.
    ///
    /// The backend reports failures as `{"detail": "..."}`; anything else
    /// falls back to the status reason.
    pub fn from_response(status: u16, reason: &str, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorPayload {
            detail: Option<serde_json::Value>,
        }

        let detail = serde_json::from_str::<ErrorPayload>(body)
            .ok()
            .and_then(|p| p.detail)
            .map(|d| match d {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .filter(|d| !d.is_empty());
        let message = detail.unwrap_or_else(|| {
            if reason.is_empty() {
                "request failed".to_string()
            } else {
                reason.to_string()
            }
        });

        if status == 401 {
            FetchError::auth(message)
        } else {
            FetchError::server(status, message)
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::decode(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_response(status.as_u16(), status.canonical_reason().unwrap_or(""), "")
        } else {
            FetchError::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_field_becomes_message() {
        let err = FetchError::from_response(422, "Unprocessable Entity", r#"{"detail":"bad prompt"}"#);
        assert_eq!(err, FetchError::server(422, "bad prompt"));
        assert_eq!(err.message(), "bad prompt");
    }

    #[test]
    fn test_missing_detail_falls_back_to_reason() {
        let err = FetchError::from_response(500, "Internal Server Error", "<html>oops</html>");
        assert_eq!(err, FetchError::server(500, "Internal Server Error"));

        let err = FetchError::from_response(502, "", "");
        assert_eq!(err.message(), "request failed");
    }

    #[test]
    fn test_structured_detail_is_stringified() {
        let err = FetchError::from_response(422, "x", r#"{"detail":[{"loc":["body"]}]}"#);
        assert!(err.message().contains("loc"));
    }

    #[test]
    fn test_unauthorized_is_auth_error() {
        let err = FetchError::from_response(401, "Unauthorized", r#"{"detail":"token expired"}"#);
        assert!(err.is_auth());
        assert_eq!(err.error_code(), "AUTH_ERROR");
        assert_eq!(err.to_string(), "unauthorized: token expired");
    }

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::network("reset").is_retryable());
        assert!(FetchError::server(503, "down").is_retryable());
        assert!(FetchError::server(429, "slow down").is_retryable());
        assert!(!FetchError::server(404, "missing").is_retryable());
        assert!(!FetchError::decode("eof").is_retryable());
        assert!(!FetchError::auth("expired").is_retryable());
    }
}
