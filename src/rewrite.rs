//! Request Rewriter — path remap, header sanitization, body transform.

use axum::http::{HeaderMap, HeaderName};
use serde_json::{json, Value};
use std::collections::HashMap;

const STRIPPED_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];
const THINKING_BUDGET: u64 = 32_768;

/// Where a client path maps to, or that it doesn't map anywhere recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedPath {
    /// `GET`/`POST` `v1/models` or `models` — the synthetic model list.
    Models,
    /// Everything else under the proxy surface, with the upstream tail path attached.
    Execution { upstream_tail: String },
    /// Not part of the recognized surface; must 404 before any pool interaction.
    Unrecognized,
}

/// Strip a leading `v1/` segment and classify the remaining path.
pub fn map_path(client_path: &str) -> MappedPath {
    let trimmed = client_path.trim_start_matches('/');
    let rest = trimmed.strip_prefix("v1/").unwrap_or(trimmed);

    if rest == "models" || rest.starts_with("models/") {
        return MappedPath::Models;
    }
    if rest == "chat/completions" {
        return MappedPath::Execution {
            upstream_tail: rest.to_string(),
        };
    }
    MappedPath::Unrecognized
}

pub fn upstream_url(base: &str, tail: &str) -> String {
    let base = base.trim_end_matches('/');
    format!("{base}/openai/{tail}")
}

/// Forward every client header except the hop-by-hop/identity ones; the caller sets
/// `Authorization` and a default `Content-Type` separately.
pub fn sanitize_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client_headers.iter() {
        if name == axum::http::header::AUTHORIZATION {
            continue;
        }
        if STRIPPED_HEADERS.iter().any(|h| name.as_str().eq_ignore_ascii_case(h)) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn authorization_header_name() -> HeaderName {
    axum::http::header::AUTHORIZATION
}

/// Rewrites a JSON request body: maps the public model alias to the canonical upstream
/// model name, and optionally injects the thinking-chain parameter. Any other body shape
/// (including non-JSON or an absent `model` field) passes through unchanged.
pub fn rewrite_body(body: &[u8], model_aliases: &HashMap<String, String>, inject_thinking: bool) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };

    if let Some(obj) = value.as_object_mut() {
        if let Some(Value::String(model)) = obj.get("model").cloned() {
            if let Some(canonical) = model_aliases.get(&model) {
                obj.insert("model".to_string(), Value::String(canonical.clone()));
            }
        }

        if inject_thinking && !has_thinking_config(obj) {
            inject_thinking_config(obj);
        }
    }

    serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec())
}

fn has_thinking_config(obj: &serde_json::Map<String, Value>) -> bool {
    obj.get("extra_body")
        .and_then(|v| v.get("google"))
        .and_then(|v| v.get("thinking_config"))
        .is_some()
}

fn inject_thinking_config(obj: &mut serde_json::Map<String, Value>) {
    let extra_body = obj.entry("extra_body").or_insert_with(|| json!({}));
    if !extra_body.is_object() {
        *extra_body = json!({});
    }
    let extra_body = extra_body.as_object_mut().expect("just ensured object");

    let google = extra_body.entry("google").or_insert_with(|| json!({}));
    if !google.is_object() {
        *google = json!({});
    }
    let google = google.as_object_mut().expect("just ensured object");

    google.insert(
        "thinking_config".to_string(),
        json!({ "thinking_budget": THINKING_BUDGET, "include_thoughts": true }),
    );
}

/// True iff the query string asks for `stream=true` or the JSON body has top-level
/// `stream: true`.
pub fn is_streaming_request(query: Option<&str>, body: &[u8]) -> bool {
    if let Some(query) = query {
        if query.split('&').any(|pair| pair == "stream=true") {
            return true;
        }
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if value.get("stream").and_then(Value::as_bool) == Some(true) {
            return true;
        }
    }
    false
}
