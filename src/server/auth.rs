//! Bearer token authentication
//!
//! Both APIs share one scheme: `Authorization: Bearer <token>`. A missing
//! or malformed header and a wrong token all answer 401 `{error}`.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Expected token, shared by every request
#[derive(Clone)]
pub struct BearerToken(Arc<str>);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        // Length leaks, content does not
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

const MISSING_HEADER: &str = "Unauthorized: missing or invalid Authorization header";

/// Middleware for `middleware::from_fn_with_state`
pub async fn require_bearer(
    State(token): State<BearerToken>,
    request: Request,
    next: Next,
) -> Response {
    let verdict = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
    {
        None | Some("") => Err(MISSING_HEADER),
        Some(presented) if token.matches(presented) => Ok(()),
        Some(_) => Err("Unauthorized: invalid token"),
    };

    match verdict {
        Ok(()) => next.run(request).await,
        Err(message) => {
            debug!(path = %request.uri().path(), reason = message, "rejected unauthenticated request");
            unauthorized(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_match_requires_exact_bytes() {
        let token = BearerToken::new("s3cret");

        assert!(token.matches("s3cret"));
        assert!(!token.matches("s3cre"));
        assert!(!token.matches("s3creT"));
        assert!(!token.matches(""));
    }
}
