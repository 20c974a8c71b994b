//! Bearer-auth middleware (§4.10/§4.7). The token comparison is
//! constant-time so response latency can't leak how many leading bytes of a
//! guessed token matched.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use super::GatewayState;

pub async fn auth_middleware(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if tokens_match(token, &state.config.access_token) => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Same constant-time comparison the `Authorization` header middleware uses,
/// exposed for routes (like the terminal proxy) that authenticate over a
/// query parameter instead of a header because their client is a bare
/// WebSocket that can't set one.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    // Compare full byte slices so mismatched lengths don't early-exit in a
    // way that might be observable through timing.
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Pulls `X-SESSION-ID` off a request. The façade never infers session
/// identity from anything else (§4.7).
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-SESSION-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length() {
        assert!(!tokens_match("short", "a-much-longer-token"));
    }

    #[test]
    fn accepts_exact_match() {
        assert!(tokens_match("secret-token", "secret-token"));
    }
}
