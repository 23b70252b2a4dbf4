//! Caller identity extraction.
//!
//! Authentication lives outside this service. A fronting proxy verifies
//! credentials and forwards an opaque identity in `x-actor-id` plus a
//! role in `x-actor-role`; this extractor only reads those headers.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ChronicleError;
use crate::query::{Caller, CallerRole};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Extracted caller identity for handlers.
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = ChronicleError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ChronicleError::unauthorized(format!("missing {} header", ACTOR_ID_HEADER))
            })?;

        let role = match parts
            .headers
            .get(ACTOR_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        {
            Some("elevated") => CallerRole::Elevated,
            _ => CallerRole::Standard,
        };

        Ok(Self(Caller {
            id: id.to_string(),
            role,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<CallerIdentity, ChronicleError> {
        let (mut parts, _) = request.into_parts();
        CallerIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_identity_and_role() {
        let request = Request::builder()
            .header(ACTOR_ID_HEADER, "alice")
            .header(ACTOR_ROLE_HEADER, "elevated")
            .body(())
            .unwrap();
        let CallerIdentity(caller) = extract(request).await.unwrap();
        assert_eq!(caller.id, "alice");
        assert!(caller.is_elevated());
    }

    #[tokio::test]
    async fn test_unknown_role_defaults_to_standard() {
        let request = Request::builder()
            .header(ACTOR_ID_HEADER, "bob")
            .header(ACTOR_ROLE_HEADER, "superuser")
            .body(())
            .unwrap();
        let CallerIdentity(caller) = extract(request).await.unwrap();
        assert!(!caller.is_elevated());
    }

    #[tokio::test]
    async fn test_missing_identity_rejected() {
        let request = Request::builder().body(()).unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }
}
