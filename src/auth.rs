//! Caller identity. Authentication happens at the identity gateway in front
//! of the service, which forwards the verified subject and email as headers.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use tracing::warn;

use crate::api::AppState;
use crate::error::{ApiError, ApiErrorWithMeta, E_NOT_ADMIN, E_UNAUTHENTICATED};
use crate::responses::RequestMeta;

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const EMAIL_HEADER: &str = "x-auth-email";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Allowlist of subjects permitted on admin routes.
#[derive(Debug, Clone, Default)]
pub struct AdminAuthorizer {
    subjects: Arc<HashSet<String>>,
}

impl AdminAuthorizer {
    pub fn new(subjects: impl IntoIterator<Item = String>) -> Self {
        Self {
            subjects: Arc::new(subjects.into_iter().collect()),
        }
    }

    /// Parses the comma-separated `admin_ids` setting.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }

    pub fn is_admin(&self, subject: &str) -> bool {
        self.subjects.contains(subject)
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn meta(parts: &Parts) -> RequestMeta {
    parts.extensions.get::<RequestMeta>().cloned().unwrap_or_default()
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(subject) = header(&parts.headers, SUBJECT_HEADER) else {
            return Err(ApiError::Unauthorized("missing caller identity".into())
                .with_meta(meta(parts))
                .with_code(E_UNAUTHENTICATED));
        };
        Ok(Identity {
            subject,
            email: header(&parts.headers, EMAIL_HEADER),
        })
    }
}

/// An authenticated caller on the admin allowlist.
#[derive(Debug, Clone)]
pub struct Admin(pub Identity);

impl FromRequestParts<AppState> for Admin {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_request_parts(parts, state).await?;
        if !state.admins.is_admin(&identity.subject) {
            warn!(subject = %identity.subject, path = %parts.uri.path(), "admin route denied");
            return Err(ApiError::Forbidden("admin access required".into())
                .with_meta(meta(parts))
                .with_code(E_NOT_ADMIN));
        }
        Ok(Admin(identity))
    }
}

/// First hop of `X-Forwarded-For`, the address the gateway saw.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    header(headers, FORWARDED_FOR_HEADER).and_then(|v| {
        v.split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn allowlist_parses_csv() {
        let admins = AdminAuthorizer::from_csv(" auth0|alice, ,auth0|bob ");
        assert!(admins.is_admin("auth0|alice"));
        assert!(admins.is_admin("auth0|bob"));
        assert!(!admins.is_admin("auth0|mallory"));
        assert!(AdminAuthorizer::from_csv("").is_empty());
    }

    #[test]
    fn client_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
