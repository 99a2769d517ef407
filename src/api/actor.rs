//! Acting identity for write requests.

use axum::{extract::FromRequestParts, http::request::Parts, http::StatusCode};

/// Header carrying the id of the actor performing a request.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// The actor named by the `X-Actor-Id` header. Rejects with 400 when the
/// header is missing, empty or not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorId(pub String);

impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    format!("Missing {} header", ACTOR_HEADER),
                )
            })?;

        Ok(Self(actor.to_string()))
    }
}
