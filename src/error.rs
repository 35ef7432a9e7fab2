use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::ledger::LedgerError;
use crate::responses::RequestMeta;

pub const E_BAD_INPUT: &str = "BAD_INPUT";
pub const E_BAD_FILTER: &str = "BAD_FILTER";
pub const E_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_INVALID_STATE: &str = "INVALID_STATE";
pub const E_DUPLICATE: &str = "DUPLICATE";
pub const E_STALE_WRITE: &str = "STALE_WRITE";
pub const E_MALFORMED_DATA: &str = "MALFORMED_DATA";
pub const E_PERSISTENCE_FAILURE: &str = "PERSISTENCE_FAILURE";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Unavailable(String),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Maps a ledger failure to its HTTP error and code.
pub fn ledger_error(e: LedgerError, meta: RequestMeta) -> ApiErrorWithMeta {
    let message = e.to_string();
    let (error, code) = match e {
        LedgerError::RequestNotFound(_) | LedgerError::UserNotFound(_) => {
            (ApiError::NotFound(message), E_NOT_FOUND)
        }
        LedgerError::InvalidState { .. } => (ApiError::Conflict(message), E_INVALID_STATE),
        LedgerError::Duplicate(_) => (ApiError::Conflict(message), E_DUPLICATE),
        LedgerError::Conflict(_) => (ApiError::Conflict(message), E_STALE_WRITE),
        LedgerError::InvalidInput(_) => (ApiError::BadRequest(message), E_BAD_INPUT),
        LedgerError::MalformedData { .. } => {
            error!("stored ledger data is malformed: {message}");
            (ApiError::Unprocessable(message), E_MALFORMED_DATA)
        }
        LedgerError::PersistenceFailure(_) => {
            warn!("persistence failure: {message}");
            (
                ApiError::Unavailable("ledger storage unavailable, try again".into()),
                E_PERSISTENCE_FAILURE,
            )
        }
    };
    error.with_meta(meta).with_code(code)
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
