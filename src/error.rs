/*
 * Diarization Server - Rust Edition
 * Copyright (c) 2024 Diarization Server Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy for the whole service.
///
/// Display strings are the user-visible messages; handlers only add an HTTP
/// status around them. Internal cause chains never reach clients except as
/// free-form text inside these messages.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job queue is full, try again later")]
    QueueFull,

    #[error("request cancelled by client")]
    Cancelled,

    #[error("processing timed out")]
    Timeout,

    #[error("task expired while waiting in queue")]
    Expired,

    #[error("AudioDecodeFailure: {0}")]
    AudioDecodeFailure(String),

    #[error("EmptyAudio: decoded waveform contains no samples")]
    EmptyAudio,

    #[error("ModelLoadFailure: {0}")]
    ModelLoadFailure(String),

    #[error("InferenceFailure: {0}")]
    InferenceFailure(String),

    #[error("SeparationFailure: {0}")]
    SeparationFailure(String),

    #[error("a separation job is already in progress, try again later")]
    Busy,

    #[error("{0}")]
    InputValidation(String),

    #[error("request body exceeds the upload limit of {0} bytes")]
    PayloadTooLarge(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Short machine-readable kind, used by scheduler lifecycle events.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::QueueFull => "queue_full",
            ServiceError::Cancelled => "cancelled",
            ServiceError::Timeout => "timeout",
            ServiceError::Expired => "expired",
            ServiceError::AudioDecodeFailure(_) => "audio_decode",
            ServiceError::EmptyAudio => "empty_audio",
            ServiceError::ModelLoadFailure(_) => "model_load",
            ServiceError::InferenceFailure(_) => "inference",
            ServiceError::SeparationFailure(_) => "separation",
            ServiceError::Busy => "busy",
            ServiceError::InputValidation(_) => "validation",
            ServiceError::PayloadTooLarge(_) => "payload_too_large",
            ServiceError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::QueueFull | ServiceError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Cancelled => client_closed_request(),
            ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::InputValidation(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Non-standard "client closed request" status reported when the client
/// aborts mid-flight.
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.kind() == "cancelled" {
            // A cancelled request must not carry a partial body.
            return status.into_response();
        }
        tracing::debug!("request failed ({}): {}", self.kind(), self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServiceError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ServiceError::Busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ServiceError::Cancelled.status().as_u16(), 499);
        assert_eq!(ServiceError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ServiceError::InputValidation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::PayloadTooLarge(1).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServiceError::AudioDecodeFailure("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn decode_failure_message_names_the_kind() {
        let err = ServiceError::AudioDecodeFailure("ffmpeg exited with 1".into());
        assert!(err.to_string().contains("AudioDecodeFailure"));
    }
}
