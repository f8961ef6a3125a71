use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Rejected request; the operation had no side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable store failure. Never retried by the broker core.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Consumer {consumer_id} error: {reason}")]
    Consumer { consumer_id: String, reason: String },
}

impl BrokerError {
    pub fn consumer(consumer_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Consumer {
            consumer_id: consumer_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            BrokerError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            BrokerError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            BrokerError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            BrokerError::Store(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Message store temporarily unavailable".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_ERROR", client_msg, log_msg)
            }
            BrokerError::Consumer { .. } => {
                let msg = self.to_string();
                (StatusCode::INTERNAL_SERVER_ERROR, "CONSUMER_ERROR", msg.clone(), msg)
            }
        };

        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_bad_request() {
        let response = BrokerError::Validation("queue busy".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: BrokerError = StoreError::Unavailable("disk".to_string()).into();
        assert!(err.to_string().contains("disk"));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_consumer_error_display() {
        let err = BrokerError::consumer("c-1", "channel closed");
        assert_eq!(err.to_string(), "Consumer c-1 error: channel closed");
    }
}
