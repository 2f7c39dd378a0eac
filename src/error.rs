use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::affiliates::AffiliateError;
use crate::ledger::LedgerError;
use crate::payouts::PayoutError;
use crate::reconcile::ReconcileError;
use crate::responses::RequestMeta;

pub const E_SIGNATURE_INVALID: &str = "SIGNATURE_INVALID";
pub const E_PAYLOAD_INVALID: &str = "PAYLOAD_INVALID";
pub const E_PROCESSING_FAILURE: &str = "PROCESSING_FAILURE";
pub const E_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const E_NOT_ADMIN: &str = "NOT_ADMIN";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const E_MISSING_DESTINATION: &str = "MISSING_DESTINATION";
pub const E_PROCESSOR_FAILURE: &str = "PROCESSOR_FAILURE";
pub const E_PARTIAL_WRITE: &str = "PARTIAL_WRITE";
pub const E_SUBMISSION_UNKNOWN: &str = "SUBMISSION_UNKNOWN";
pub const E_DB_FAILURE: &str = "DB_FAILURE";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    /// An upstream service failed; the caller may retry.
    BadGateway(String),
    Internal(anyhow::Error),
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

    pub fn status(&self) -> StatusCode {
        match &self.error {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match self.error {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unprocessable(msg)
            | ApiError::BadGateway(msg) => msg,
            ApiError::Internal(e) => {
                error!(request_id = %self.meta.request_id, "internal error: {:?}", e);
                "internal server error".to_string()
            }
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

/// Maps a ledger failure to its HTTP shape.
pub fn ledger_error(e: LedgerError, meta: RequestMeta) -> ApiErrorWithMeta {
    match e {
        LedgerError::NotFound { .. } => ApiError::NotFound(e.to_string())
            .with_meta(meta)
            .with_code(E_NOT_FOUND),
        LedgerError::Conflict(_) | LedgerError::DuplicateOrder(_) | LedgerError::PayoutInFlight(_) => {
            ApiError::Conflict(e.to_string())
                .with_meta(meta)
                .with_code(E_CONFLICT)
        }
        LedgerError::Corrupt(_) | LedgerError::Database(_) => ApiError::Internal(e.into())
            .with_meta(meta)
            .with_code(E_DB_FAILURE),
    }
}

pub fn affiliate_error(e: AffiliateError, meta: RequestMeta) -> ApiErrorWithMeta {
    match e {
        AffiliateError::AlreadyApplied(_) => ApiError::Conflict(e.to_string())
            .with_meta(meta)
            .with_code(E_CONFLICT),
        AffiliateError::InvalidInput(_) => ApiError::BadRequest(e.to_string())
            .with_meta(meta)
            .with_code(E_PAYLOAD_INVALID),
        AffiliateError::InvalidTransition { .. } => ApiError::Conflict(e.to_string())
            .with_meta(meta)
            .with_code(E_INVALID_TRANSITION),
        AffiliateError::Ledger(e) => ledger_error(e, meta),
    }
}

pub fn payout_error(e: PayoutError, meta: RequestMeta) -> ApiErrorWithMeta {
    match e {
        PayoutError::MissingDestination(_) => ApiError::Unprocessable(e.to_string())
            .with_meta(meta)
            .with_code(E_MISSING_DESTINATION),
        PayoutError::Processor(_) => ApiError::BadGateway(e.to_string())
            .with_meta(meta)
            .with_code(E_PROCESSOR_FAILURE),
        PayoutError::OutcomeUnknown { .. } => ApiError::BadGateway(e.to_string())
            .with_meta(meta)
            .with_code(E_SUBMISSION_UNKNOWN),
        PayoutError::PartialWrite { .. } => ApiError::Internal(e.into())
            .with_meta(meta)
            .with_code(E_PARTIAL_WRITE),
        PayoutError::Ledger(e) => ledger_error(e, meta),
    }
}

pub fn reconcile_error(e: ReconcileError, meta: RequestMeta) -> ApiErrorWithMeta {
    match e {
        ReconcileError::InvalidOverride(_) => ApiError::BadRequest(e.to_string())
            .with_meta(meta)
            .with_code(E_INVALID_TRANSITION),
        ReconcileError::Processor(_) => ApiError::BadGateway(e.to_string())
            .with_meta(meta)
            .with_code(E_PROCESSOR_FAILURE),
        ReconcileError::Ledger(e) => ledger_error(e, meta),
    }
}
