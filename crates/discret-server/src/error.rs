use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use discret_core::monitor::MonitorError;
use discret_core::notify::NotifyError;
use discret_core::verify::VerifyError;
use discret_shared::error::{CryptoError, GeoError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation id, inserted by the meta middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Success envelope: `{success, data, meta}`.
pub fn ok<T: Serialize>(request_id: &RequestId, data: T) -> Response {
    let body = json!({
        "success": true,
        "data": data,
        "meta": Meta {
            request_id: request_id.0.clone(),
            timestamp: Utc::now(),
        },
    });
    let mut response = (StatusCode::OK, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn photo_too_large() -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "PHOTO_TOO_LARGE",
            message: "photo exceeds the 5 MiB cap".into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "RATE_LIMITED",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
        }
    }

    pub fn invalid_encryption_format() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INVALID_ENCRYPTION_FORMAT",
            message: "ciphertext does not match the expected wire form".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = RequestId::fresh();

        // Production masks internal details; the request id still correlates.
        let message = if self.status.is_server_error() {
            error!(code = self.code, request_id = %request_id.0, message = %self.message, "request failed");
            if std::env::var("RUST_ENV").as_deref() == Ok("production") {
                "internal error".to_string()
            } else {
                self.message
            }
        } else {
            self.message
        };

        let body = json!({
            "success": false,
            "error": { "code": self.code, "message": message },
            "meta": Meta {
                request_id: request_id.0.clone(),
                timestamp: Utc::now(),
            },
        });

        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id.0) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

impl From<GeoError> for ApiError {
    fn from(e: GeoError) -> Self {
        ApiError::validation(e.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidFormat => ApiError::invalid_encryption_format(),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<VerifyError> for ApiError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::NotFound(_) => ApiError::not_found(e.to_string()),
            VerifyError::PhotoTooLarge => ApiError::photo_too_large(),
            VerifyError::Crypto(inner) => inner.into(),
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        ApiError::not_found(e.to_string())
    }
}

impl From<NotifyError> for ApiError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::NotFound(_) => ApiError::not_found(e.to_string()),
            NotifyError::RateLimited { .. } => ApiError::rate_limited(e.to_string()),
            NotifyError::ChannelNotAllowed(_) | NotifyError::QuietHours => {
                ApiError::validation(e.to_string())
            }
            NotifyError::Crypto(inner) => inner.into(),
        }
    }
}

impl From<discret_core::emergency::EmergencyError> for ApiError {
    fn from(e: discret_core::emergency::EmergencyError) -> Self {
        ApiError::not_found(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_mapping() {
        let err: ApiError = VerifyError::PhotoTooLarge.into();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code, "PHOTO_TOO_LARGE");

        let err: ApiError = CryptoError::InvalidFormat.into();
        assert_eq!(err.code, "INVALID_ENCRYPTION_FORMAT");

        let err: ApiError = MonitorError::NotFound(Uuid::new_v4()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
