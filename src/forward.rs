//! Forwarder — executes one attempted dispatch against an acquired key: buffered or
//! streaming; classifies the response into success/failure/terminal.
//!
//! The Forwarder never touches `KeyPool` or `KeyState` mutation directly — it hands the
//! classification back to the Retry Controller, which owns the pool and is the single
//! place that calls `record_success`/`record_failure`.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;

use crate::egress::EgressSelector;
use crate::rewrite;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// HTTP status codes on a dispatch response that mark the key failed.
const FAILURE_STATUS_CODES: &[u16] = &[429, 403, 500, 502, 503];
/// Subset of failure codes that, while routed through a non-default egress session,
/// additionally mark that session bad.
const EGRESS_BAD_STATUS_CODES: &[u16] = &[407, 502, 503];

pub struct Forwarder {
    client: reqwest::Client,
    upstream_base_url: String,
    model_aliases: HashMap<String, String>,
    thinking_chain_enabled: bool,
    egress: EgressSelector,
}

/// Whether the key that made this attempt should be marked healthy or quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure,
}

/// What happened when the Forwarder tried to reach upstream.
pub enum DispatchOutcome {
    /// Upstream was reached (any status code); `response` is ready to return to the
    /// client as-is.
    Responded { response: Response, classification: Classification },
    /// Transport-level failure (connection error, timeout) — no response from upstream
    /// at all. The caller marks the key failed and tries the next one.
    TransportError(String),
}

impl Forwarder {
    pub fn new(upstream_base_url: String, model_aliases: HashMap<String, String>, thinking_chain_enabled: bool, egress: EgressSelector) -> Self {
        let client = reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build().expect("reqwest client builds");
        Self {
            client,
            upstream_base_url,
            model_aliases,
            thinking_chain_enabled,
            egress,
        }
    }

    /// Synthetic one-entry model list, advertising the gateway's public alias. Never
    /// touches upstream or the pool.
    pub fn synthetic_model_list(&self) -> Response {
        let public_alias = self.model_aliases.keys().next().cloned().unwrap_or_default();
        let body = json!({
            "object": "list",
            "data": [{
                "id": public_alias,
                "object": "model",
                "owned_by": "keywarden",
            }]
        });
        axum::response::Json(body).into_response()
    }

    /// Dispatches one attempt against the credential `api_key`. `upstream_tail` is the
    /// already-mapped path (e.g. `chat/completions`); `use_egress` is false for
    /// model-listing execution.
    pub async fn dispatch(&self, api_key: &str, upstream_tail: &str, client_headers: &HeaderMap, body: Bytes, query: Option<&str>, use_egress: bool) -> DispatchOutcome {
        let url = rewrite::upstream_url(&self.upstream_base_url, upstream_tail);
        let streaming = rewrite::is_streaming_request(query, &body);
        let rewritten_body = rewrite::rewrite_body(&body, &self.model_aliases, self.thinking_chain_enabled);

        let mut headers = rewrite::sanitize_headers(client_headers);
        headers.insert(
            rewrite::authorization_header_name(),
            format!("Bearer {api_key}").parse().expect("bearer header value is valid ascii"),
        );
        if !headers.contains_key(axum::http::header::CONTENT_TYPE) {
            headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        }

        // The egress session token rotates per call, so a fresh client carrying that
        // proxy is built per dispatch when egress is in play; otherwise the shared,
        // connection-pooled client is reused.
        let egress_client = if use_egress {
            self.egress.select().and_then(|proxy_url| match reqwest::Proxy::all(proxy_url.as_str()) {
                Ok(proxy) => reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).proxy(proxy).build().ok(),
                Err(err) => {
                    tracing::warn!(error = %err, "invalid egress proxy url, using direct connection");
                    None
                }
            })
        } else {
            None
        };
        let client = egress_client.as_ref().unwrap_or(&self.client);
        let sent = client.post(&url).headers(headers).body(rewritten_body).send().await;

        match sent {
            Ok(resp) if streaming => self.handle_streaming(resp, use_egress).await,
            Ok(resp) => self.handle_buffered(resp, use_egress).await,
            Err(err) => DispatchOutcome::TransportError(err.to_string()),
        }
    }

    async fn handle_buffered(&self, resp: reqwest::Response, use_egress: bool) -> DispatchOutcome {
        let status = resp.status();
        let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).cloned();
        let classification = self.classify(status.as_u16(), use_egress);

        let body = resp.bytes().await.unwrap_or_default();
        let mut builder = Response::builder().status(status);
        if let Some(ct) = content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
        }
        let response = builder.body(Body::from(body)).expect("valid response builder state");
        DispatchOutcome::Responded { response, classification }
    }

    async fn handle_streaming(&self, resp: reqwest::Response, use_egress: bool) -> DispatchOutcome {
        let status = resp.status();

        if status.as_u16() >= 400 {
            let classification = self.classify(status.as_u16(), use_egress);
            let body = read_bounded(resp).await;
            let response = Response::builder()
                .status(status)
                .body(Body::from(body))
                .expect("valid response builder state");
            return DispatchOutcome::Responded { response, classification };
        }

        // Success/failure classification is irreversible once the status line is
        // consumed: a mid-stream disconnect does not re-mark failure.
        let classification = self.classify(status.as_u16(), use_egress);

        let stream = resp.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        let response = Response::builder()
            .status(status)
            .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(stream))
            .expect("valid response builder state");
        DispatchOutcome::Responded { response, classification }
    }

    fn classify(&self, status: u16, use_egress: bool) -> Classification {
        if use_egress && self.egress.is_configured() && EGRESS_BAD_STATUS_CODES.contains(&status) {
            self.egress.mark_session_bad();
        }
        if FAILURE_STATUS_CODES.contains(&status) {
            Classification::Failure
        } else {
            Classification::Success
        }
    }
}

async fn read_bounded(resp: reqwest::Response) -> Bytes {
    let mut collected = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                let remaining = MAX_ERROR_BODY_BYTES.saturating_sub(collected.len());
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(bytes.len());
                collected.extend_from_slice(&bytes[..take]);
                if take < bytes.len() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    Bytes::from(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("salesmanchatbot-pro".to_string(), "gemini-2.5-flash".to_string());
        m
    }

    #[test]
    fn synthetic_model_list_advertises_public_alias() {
        let forwarder = Forwarder::new("https://upstream.example/v1beta".to_string(), aliases(), true, EgressSelector::new(None));
        let response = forwarder.synthetic_model_list();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn classify_marks_known_failure_codes() {
        let forwarder = Forwarder::new("https://upstream.example/v1beta".to_string(), aliases(), true, EgressSelector::new(None));
        assert_eq!(forwarder.classify(429, false), Classification::Failure);
        assert_eq!(forwarder.classify(503, false), Classification::Failure);
        assert_eq!(forwarder.classify(200, false), Classification::Success);
        assert_eq!(forwarder.classify(400, false), Classification::Success);
    }

    #[test]
    fn egress_bad_status_is_evaluated_independently_of_key_failure_classification() {
        let base = url::Url::parse("http://baseuser:pw@proxy.example.com:8080").unwrap();
        let forwarder = Forwarder::new("https://upstream.example/v1beta".to_string(), aliases(), true, EgressSelector::new(Some(base)));
        // 407 is egress-bad but not a key-failure code: the key is still marked healthy.
        assert_eq!(forwarder.classify(407, true), Classification::Success);
        // 502/503 are both egress-bad and key-failure codes.
        assert_eq!(forwarder.classify(502, true), Classification::Failure);
    }
}
