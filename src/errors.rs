//! Error types and HTTP response conversion.
//!
//! Every failure path in the gateway becomes one of these variants; no panic or bare
//! `anyhow::Error` is allowed to cross a handler boundary (see §7 of the design).

use crate::db::errors::DbError;
use axum::{
    http::{header::RETRY_AFTER, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// No `Authorization` header, or a malformed one.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Bearer token present but it doesn't match the admin token or any pool credential.
    #[error("Invalid credentials")]
    Forbidden,

    /// Client path/method isn't part of the recognized surface.
    #[error("Not found")]
    NotFound,

    /// Malformed admin request (bad JSON body, unknown key id, ...).
    #[error("{message}")]
    BadRequest { message: String },

    /// Every key in the pool was unavailable for this request.
    #[error("all keys unavailable")]
    AllKeysUnavailable { tried: Vec<String> },

    /// Database operation failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Upstream transport failure after exhausting retries, or any other unexpected error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::AllKeysUnavailable { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Database(DbError::NotFound) => StatusCode::NOT_FOUND,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(_) | Error::Other(_) => {
                tracing::error!("internal error: {:#}", self);
            }
            Error::Unauthenticated | Error::Forbidden => {
                tracing::debug!("auth error: {}", self);
            }
            Error::AllKeysUnavailable { tried } => {
                tracing::warn!("no key available, tried {} keys", tried.len());
            }
            Error::NotFound | Error::BadRequest { .. } => {
                tracing::debug!("client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::AllKeysUnavailable { tried } => (
                status,
                [(RETRY_AFTER, "5")],
                Json(json!({ "error": "all keys unavailable", "tried": tried })),
            )
                .into_response(),
            _ => (status, Json(json!({ "error": self.to_string() }))).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
