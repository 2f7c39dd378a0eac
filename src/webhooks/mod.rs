//! Inbound webhook endpoints.
//!
//! Every handler verifies the signature over the raw body before parsing it.
//! Status codes follow the sources' retry behavior: 401 for a bad signature,
//! 400 for a body that will never parse, 2xx for anything handled (including
//! duplicates), and 500 only when a redelivery could succeed.

pub mod disbursement;
pub mod storefront;
pub mod subscription;

use std::fmt::Display;

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::warn;

use crate::diagnostics::DiagnosticSink;
use crate::error::{ApiError, ApiErrorWithMeta, E_PAYLOAD_INVALID, E_PROCESSING_FAILURE, E_SIGNATURE_INVALID};
use crate::responses::RequestMeta;
use crate::signature::WebhookVerifier;
use crate::types::{Severity, SystemError};

/// Verifies and parses one delivery.
pub(crate) async fn accept<T: DeserializeOwned>(
    verifier: &WebhookVerifier,
    diagnostics: &DiagnosticSink,
    source: &'static str,
    headers: &HeaderMap,
    body: &[u8],
    meta: &RequestMeta,
) -> Result<T, ApiErrorWithMeta> {
    let signature = headers
        .get(verifier.header())
        .and_then(|v| v.to_str().ok());
    if let Err(e) = verifier.verify(body, signature) {
        warn!(source, request_id = %meta.request_id, error = %e, "webhook signature rejected");
        return Err(ApiError::Unauthorized(e.to_string())
            .with_meta(meta.clone())
            .with_code(E_SIGNATURE_INVALID));
    }

    match serde_json::from_slice(body) {
        Ok(payload) => Ok(payload),
        Err(e) => {
            warn!(source, request_id = %meta.request_id, error = %e, "webhook payload rejected");
            diagnostics
                .record(
                    SystemError::new(Severity::Error, "payload_invalid", source, "webhook payload did not parse")
                        .with_context(json!({
                            "request_id": meta.request_id,
                            "error": e.to_string(),
                            "bytes": body.len(),
                        })),
                )
                .await;
            Err(ApiError::BadRequest(format!("invalid payload: {e}"))
                .with_meta(meta.clone())
                .with_code(E_PAYLOAD_INVALID))
        }
    }
}

/// A payload that parsed but is missing something required.
pub(crate) async fn invalid_event(
    diagnostics: &DiagnosticSink,
    source: &'static str,
    meta: &RequestMeta,
    reason: impl Display,
) -> ApiErrorWithMeta {
    let reason = reason.to_string();
    diagnostics
        .record(
            SystemError::new(Severity::Error, "payload_invalid", source, reason.clone())
                .with_context(json!({ "request_id": meta.request_id })),
        )
        .await;
    ApiError::BadRequest(reason)
        .with_meta(meta.clone())
        .with_code(E_PAYLOAD_INVALID)
}

/// A failure while acting on a valid event. Answered with 500 so the source
/// redelivers.
pub(crate) async fn processing_failure(
    diagnostics: &DiagnosticSink,
    source: &'static str,
    meta: &RequestMeta,
    error: impl Display,
    context: serde_json::Value,
) -> ApiErrorWithMeta {
    let message = error.to_string();
    diagnostics
        .record(
            SystemError::new(Severity::Error, "processing_failure", source, message.clone()).with_context(json!({
                "request_id": meta.request_id,
                "event": context,
            })),
        )
        .await;
    ApiError::Internal(anyhow::anyhow!(message))
        .with_meta(meta.clone())
        .with_code(E_PROCESSING_FAILURE)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Str(String),
}

impl IdRepr {
    fn into_string(self) -> String {
        match self {
            IdRepr::Int(n) => n.to_string(),
            IdRepr::Str(s) => s,
        }
    }
}

/// External ids arrive as JSON numbers from some sources and strings from others.
pub(crate) fn flexible_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    IdRepr::deserialize(d).map(IdRepr::into_string)
}

pub(crate) fn flexible_id_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(d)?
        .map(IdRepr::into_string)
        .filter(|s| !s.trim().is_empty()))
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscountCodeRef {
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
        #[serde(default, deserialize_with = "flexible_id_opt")]
        other: Option<String>,
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let p: Probe = serde_json::from_str(r#"{"id": 820982911946154508, "other": "abc"}"#).unwrap();
        assert_eq!(p.id, "820982911946154508");
        assert_eq!(p.other.as_deref(), Some("abc"));

        let p: Probe = serde_json::from_str(r#"{"id": "gid-1", "other": null}"#).unwrap();
        assert_eq!(p.id, "gid-1");
        assert_eq!(p.other, None);

        let p: Probe = serde_json::from_str(r#"{"id": 7}"#).unwrap();
        assert_eq!(p.other, None);
    }
}
