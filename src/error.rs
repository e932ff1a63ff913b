//! Caller-visible errors and the JSON envelope they are rendered as

use hyper::StatusCode;
use serde::Serialize;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used for streaming bodies in both directions
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Everything the proxy can answer with instead of an upstream response
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or wrong bearer credential
    #[error("Unauthorized")]
    Unauthorized,

    /// Declared request body above the configured ceiling
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// Upstream unreachable, reset, or silent past the timeout
    #[error("Error connecting to Ollama server: {0}")]
    Connection(String),
}

impl ProxyError {
    /// Build a connection error from a transport error, keeping its source chain.
    ///
    /// Client errors tend to say only "error sending request"; the root cause
    /// (refused, reset, dns) lives further down the chain.
    pub fn connection(err: &(dyn StdError + 'static)) -> Self {
        let mut text = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !text.contains(&cause_text) {
                text.push_str(": ");
                text.push_str(&cause_text);
            }
            source = cause.source();
        }
        ProxyError::Connection(text)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Connection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (kind, code) = match self {
            ProxyError::Unauthorized => ("invalid_request_error", Some("invalid_api_key")),
            ProxyError::PayloadTooLarge { .. } => {
                ("invalid_request_error", Some("request_too_large"))
            }
            ProxyError::Connection(_) => ("server_error", None),
        };

        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                kind,
                code,
            },
        }
    }
}

/// `{"error": {"message", "type", "code"?}}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt;

    #[derive(Debug)]
    struct Layer(&'static str, Option<Box<Layer>>);

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Layer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.1.as_deref().map(|l| l as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn test_unauthorized_envelope() {
        let value = serde_json::to_value(ProxyError::Unauthorized.envelope()).unwrap();
        assert_eq!(
            value,
            json!({
                "error": {
                    "message": "Unauthorized",
                    "type": "invalid_request_error",
                    "code": "invalid_api_key"
                }
            })
        );
        assert_eq!(ProxyError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_connection_envelope_has_no_code() {
        let err = ProxyError::Connection("connect ECONNREFUSED".to_string());
        let value = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(
            value,
            json!({
                "error": {
                    "message": "Error connecting to Ollama server: connect ECONNREFUSED",
                    "type": "server_error"
                }
            })
        );
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_payload_too_large_envelope() {
        let err = ProxyError::PayloadTooLarge { limit: 10 };
        let value = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(value["error"]["message"], "Request body exceeds 10 bytes");
        assert_eq!(value["error"]["code"], "request_too_large");
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_connection_keeps_source_chain() {
        let err = Layer(
            "error sending request",
            Some(Box::new(Layer(
                "tcp connect error",
                Some(Box::new(Layer("Connection refused (os error 111)", None))),
            ))),
        );

        match ProxyError::connection(&err) {
            ProxyError::Connection(text) => assert_eq!(
                text,
                "error sending request: tcp connect error: Connection refused (os error 111)"
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_connection_skips_repeated_causes() {
        let err = Layer(
            "client error (Connect): refused",
            Some(Box::new(Layer("refused", None))),
        );

        match ProxyError::connection(&err) {
            ProxyError::Connection(text) => assert_eq!(text, "client error (Connect): refused"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
