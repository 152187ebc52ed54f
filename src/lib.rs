//! keywarden — an OpenAI-compatible HTTP gateway fronting Google Gemini's "OpenAI
//! compatibility" surface with a rotating, rate-limited pool of provider API keys.
//!
//! Request flow: `client -> Retry Controller -> (acquire) Key Pool -> Request Rewriter
//! -> Forwarder -> (via) Egress Proxy Selector -> upstream`; the response flows back
//! through the Forwarder, which updates the Key State and, on success, triggers Usage
//! Sync.

pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod egress;
pub mod errors;
pub mod forward;
pub mod pool;
pub mod retry;
pub mod rewrite;
pub mod telemetry;
pub mod types;

use std::future::Future;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bon::Builder;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use auth::session::SessionStore;
use config::Config;
use db::Store;
use egress::EgressSelector;
use forward::Forwarder;
use pool::key_state::KeyState;
use pool::KeyPool;

pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub pool: Arc<KeyPool>,
    pub forwarder: Arc<Forwarder>,
    pub sessions: Arc<SessionStore>,
}

pub struct Application {
    router: Router,
    listener: tokio::net::TcpListener,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool_opts = PgPoolOptions::new().max_connections(10);
        let db_pool: PgPool = pool_opts.connect(&config.database_url).await?;
        migrator().run(&db_pool).await?;

        let store = Store::new(db_pool);

        let existing_limits = store.load_global_limits().await?;
        let limits = existing_limits.unwrap_or(config.limits);
        if existing_limits.is_none() {
            store.save_global_limits(limits).await?;
        }

        let records = store.load_active_keys().await?;
        let now = chrono::Utc::now();
        let keys: Vec<Arc<KeyState>> = records.iter().map(|r| Arc::new(KeyState::from_record(r, now))).collect();
        tracing::info!(count = keys.len(), "loaded active keys into pool");

        let key_pool = KeyPool::new(keys, limits, store.clone());

        let egress_url = config.egress_proxy_url.as_deref().map(url::Url::parse).transpose()?;
        let egress = EgressSelector::new(egress_url);
        let forwarder = Arc::new(Forwarder::new(config.upstream_base_url.clone(), config.model_aliases.clone(), config.thinking_chain_enabled, egress));

        let state = AppState::builder()
            .config(config.clone())
            .store(store)
            .pool(key_pool)
            .forwarder(forwarder)
            .sessions(Arc::new(SessionStore::new()))
            .build();

        let router = build_router(state);

        let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;

        Ok(Self { router, listener })
    }

    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "listening");
        axum::serve(self.listener, self.router).with_graceful_shutdown(shutdown).await?;
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/status", get(admin::status))
        .route("/reload-keys", post(admin::reload))
        .route("/admin/keys", get(admin::list_keys).post(admin::add_key).put(admin::update_key))
        .route("/admin/keys/{id}", axum::routing::delete(admin::delete_key))
        .route("/admin/keys/{id}/reveal", get(admin::reveal_key))
        .route("/admin/config", get(admin::get_config).post(admin::update_config))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::middleware::admin_auth));

    let proxy_routes = Router::new()
        .route("/v1/models", any(retry::proxy_handler))
        .route("/models", any(retry::proxy_handler))
        .route("/v1/chat/completions", any(retry::proxy_handler))
        .route("/chat/completions", any(retry::proxy_handler))
        .route("/{*path}", any(retry::proxy_handler))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::middleware::client_auth));

    Router::new()
        .route("/", get(root_redirect))
        .route("/health", get(health))
        .route("/admin/login", post(admin::login))
        .route("/admin/logout", get(admin::logout))
        .merge(admin_routes)
        .merge(proxy_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn root_redirect() -> Response {
    (axum::http::StatusCode::FOUND, [(axum::http::header::LOCATION, "/admin/login")]).into_response()
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "provider": state.config.provider,
        "version": env!("CARGO_PKG_VERSION"),
        "region": state.config.region,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GlobalLimits, KeyRecord};
    use axum_test::TestServer;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fake_store() -> Store {
        Store::new(PgPoolOptions::new().connect_lazy("postgres://localhost/keywarden_test").unwrap())
    }

    fn key_record(seed: u8, credential: &str) -> KeyRecord {
        KeyRecord {
            id: Uuid::from_bytes([seed; 16]),
            provider: "google-gemini".into(),
            model: "gemini-2.5-flash".into(),
            api: credential.to_string(),
            status: "active".into(),
            usage_today: 0,
            last_used_at: None,
        }
    }

    async fn test_server(upstream_base_url: String, credential: &str) -> TestServer {
        let now = chrono::Utc::now();
        let keys = vec![Arc::new(KeyState::from_record(&key_record(1, credential), now))];
        let pool = KeyPool::new(keys, GlobalLimits::default(), fake_store());
        let forwarder = Arc::new(Forwarder::new(upstream_base_url, Config::default().model_aliases, true, EgressSelector::new(None)));

        let state = AppState::builder()
            .config(Config::default())
            .store(fake_store())
            .pool(pool)
            .forwarder(forwarder)
            .sessions(Arc::new(SessionStore::new()))
            .build();

        TestServer::new(build_router(state)).expect("test server builds")
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected() {
        let server = test_server("http://unused.invalid".to_string(), "sk-test-1").await;
        let response = server.post("/v1/chat/completions").json(&serde_json::json!({"model": "x"})).await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn happy_path_post_rewrites_and_forwards() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "choices": [],
            })))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri(), "sk-test-1").await;
        let response = server
            .post("/v1/chat/completions")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer sk-test-1")
            .json(&serde_json::json!({"model": "salesmanchatbot-pro", "messages": []}))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["id"], "chatcmpl-1");
    }

    #[tokio::test]
    async fn streaming_request_passes_through_event_stream() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"choices\":[]}\n\n", "text/event-stream")
                    .append_header("content-type", "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri(), "sk-test-1").await;
        let response = server
            .post("/v1/chat/completions")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer sk-test-1")
            .json(&serde_json::json!({"model": "salesmanchatbot-pro", "stream": true}))
            .await;

        response.assert_status_ok();
        assert!(response.text().contains("choices"));
    }

    #[tokio::test]
    async fn exhausted_pool_returns_429_with_retry_after() {
        let now = chrono::Utc::now();
        let keys = vec![Arc::new(KeyState::from_record(&key_record(1, "sk-test-1"), now))];
        let pool = KeyPool::new(keys, GlobalLimits { rpm: 0, rph: 0, rpd: 0 }, fake_store());
        let forwarder = Arc::new(Forwarder::new("http://unused.invalid".to_string(), Config::default().model_aliases, true, EgressSelector::new(None)));
        let state = AppState::builder()
            .config(Config::default())
            .store(fake_store())
            .pool(pool)
            .forwarder(forwarder)
            .sessions(Arc::new(SessionStore::new()))
            .build();
        let server = TestServer::new(build_router(state)).expect("test server builds");

        let response = server
            .post("/v1/chat/completions")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer sk-test-1")
            .json(&serde_json::json!({"model": "salesmanchatbot-pro"}))
            .await;

        response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
        let retry_after = response.headers().get(axum::http::header::RETRY_AFTER).expect("retry-after header present");
        assert_eq!(retry_after, "5");
    }

    #[tokio::test]
    async fn health_endpoint_reports_provider() {
        let server = test_server("http://unused.invalid".to_string(), "sk-test-1").await;
        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["provider"], "google-gemini");
    }

    #[tokio::test]
    async fn get_models_never_touches_upstream() {
        // No mock is mounted at all; if the gateway contacted upstream this would panic.
        let mock_server = MockServer::start().await;
        let server = test_server(mock_server.uri(), "sk-test-1").await;

        let response = server.get("/v1/models").add_header(axum::http::header::AUTHORIZATION, "Bearer sk-test-1").await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["object"], "list");
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_get_models_forwards_to_upstream_with_egress_disabled() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"object": "list", "data": []})))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri(), "sk-test-1").await;
        let response = server
            .post("/v1/models")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer sk-test-1")
            .json(&serde_json::json!({}))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["object"], "list");
    }
}
