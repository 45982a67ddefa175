use crate::error::AppError;
use crate::state::AppState;
use axum::extract::Request;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::IntoResponse;
use std::sync::Arc;
use subtle::ConstantTimeEq;

fn header_api_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn header_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn tokens_match(got: &str, expected: &str) -> bool {
    let got = got.as_bytes();
    let expected = expected.as_bytes();
    if got.len() != expected.len() {
        // Same amount of work on a length mismatch.
        let _ = expected.ct_eq(expected);
        return false;
    }
    got.ct_eq(expected).into()
}

pub async fn require_api_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let headers = req.headers();
    let got = header_api_token(headers).or_else(|| header_bearer_token(headers));
    match got {
        Some(t) if tokens_match(t, &state.api_token) => next.run(req).await,
        _ => AppError::Forbidden("api token required".into()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_either_header() {
        let mut h = HeaderMap::new();
        h.insert("x-api-token", HeaderValue::from_static(" abc "));
        assert_eq!(header_api_token(&h), Some("abc"));
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(header_bearer_token(&h), Some("xyz"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(header_bearer_token(&h), None);
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("0123456789abcdef", "0123456789abcdef"));
        assert!(!tokens_match("0123456789abcdeF", "0123456789abcdef"));
        assert!(!tokens_match("short", "0123456789abcdef"));
        assert!(!tokens_match("", "0123456789abcdef"));
        assert!(!tokens_match("0123456789abcdef0", "0123456789abcdef"));
    }
}
