//! Retry Controller — top-level request handler: acquires keys from the Pool, invokes
//! the Forwarder, loops on transient failure until the pool is exhausted.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};

use crate::errors::{Error, Result};
use crate::forward::{Classification, DispatchOutcome, Forwarder};
use crate::pool::KeyPool;
use crate::rewrite::{self, MappedPath};

pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Handles one inbound proxy request end to end.
pub async fn handle_proxy_request(pool: &Arc<KeyPool>, forwarder: &Forwarder, req: ProxyRequest) -> Result<Response> {
    let mapped = rewrite::map_path(&req.path);

    match mapped {
        MappedPath::Unrecognized => Err(Error::NotFound),
        MappedPath::Models => handle_models(pool, forwarder, &req).await,
        MappedPath::Execution { upstream_tail } => handle_execution(pool, forwarder, &req, &upstream_tail).await,
    }
}

async fn handle_models(pool: &Arc<KeyPool>, forwarder: &Forwarder, req: &ProxyRequest) -> Result<Response> {
    if req.method != Method::GET {
        // Non-GET on the models path: select one available key uniformly at random
        // (fallback: earliest `banned_until`) and forward it with the egress proxy
        // disabled, per the model-listing execution branch.
        let key = pool
            .random_or_earliest_banned()
            .ok_or_else(|| Error::AllKeysUnavailable { tried: Vec::new() })?;

        let outcome = forwarder
            .dispatch(&key.key, "models", &req.headers, req.body.clone(), req.query.as_deref(), false)
            .await;

        return match outcome {
            DispatchOutcome::Responded { response, classification } => {
                match classification {
                    Classification::Success => pool.record_success(&key),
                    Classification::Failure => pool.record_failure(&key),
                }
                Ok(response)
            }
            DispatchOutcome::TransportError(err) => {
                tracing::warn!(key_preview = %key.key_preview(), error = %err, "transport error dispatching model-listing execution");
                pool.record_failure(&key);
                Err(Error::AllKeysUnavailable { tried: vec![key.key_preview()] })
            }
        };
    }
    // Model-listing purity: GET never acquires a key and never contacts upstream.
    Ok(forwarder.synthetic_model_list())
}

/// Iterates at most `N = pool.len()` acquisitions. Returns the forwarded response on the
/// first successful dispatch (success *or* upstream-classified HTTP failure — retry only
/// happens on transport-level errors). If the loop exits without a response, replies 429.
async fn handle_execution(pool: &Arc<KeyPool>, forwarder: &Forwarder, req: &ProxyRequest, upstream_tail: &str) -> Result<Response> {
    let attempts = pool.len().max(1);
    let mut tried = Vec::new();

    for _ in 0..attempts {
        let Some(key) = pool.next_available() else { break };
        tried.push(key.key_preview());

        let outcome = forwarder
            .dispatch(&key.key, upstream_tail, &req.headers, req.body.clone(), req.query.as_deref(), true)
            .await;

        match outcome {
            DispatchOutcome::Responded { response, classification } => {
                match classification {
                    Classification::Success => pool.record_success(&key),
                    Classification::Failure => pool.record_failure(&key),
                }
                return Ok(response);
            }
            DispatchOutcome::TransportError(err) => {
                tracing::warn!(key_preview = %key.key_preview(), error = %err, "transport error dispatching to upstream, retrying");
                pool.record_failure(&key);
                continue;
            }
        }
    }

    Err(Error::AllKeysUnavailable { tried })
}

/// axum handler entry point, wired in `lib.rs`'s router.
pub async fn proxy_handler(State(state): State<crate::AppState>, method: Method, uri: axum::http::Uri, headers: HeaderMap, body: Bytes) -> Response {
    let req = ProxyRequest {
        method,
        path: uri.path().trim_start_matches('/').to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    match handle_proxy_request(&state.pool, &state.forwarder, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
