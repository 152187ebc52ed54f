//! Client and admin authentication gates.
//!
//! Every non-public request must present `Authorization: Bearer <token>`, where
//! `<token>` matches either the admin token or any credential currently in the pool.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::Error;
use crate::AppState;

const SESSION_COOKIE_NAME: &str = "keywarden_admin_session";

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers().get(AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn session_cookie(req: &Request) -> Option<String> {
    let cookie_header = req.headers().get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE_NAME).then(|| value.to_string())
    })
}

/// Accepts the admin token or any credential currently present in the pool.
pub async fn client_auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, Error> {
    let token = bearer_token(&req).ok_or(Error::Unauthenticated)?;

    if token == state.config.admin_session_token {
        return Ok(next.run(req).await);
    }
    if state.pool.has_credential(token) {
        return Ok(next.run(req).await);
    }
    Err(Error::Forbidden)
}

/// Accepts the static admin bearer token or a valid admin session cookie.
pub async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, Error> {
    if let Some(token) = bearer_token(&req) {
        if token == state.config.admin_session_token {
            return Ok(next.run(req).await);
        }
    }
    if let Some(cookie) = session_cookie(&req) {
        if state.sessions.is_valid(&cookie) {
            return Ok(next.run(req).await);
        }
    }
    Err(Error::Unauthenticated)
}
