//! Admin Surface — key CRUD, global-limit configuration read/write, pool reload, pool
//! status snapshot. Every handler here sits behind `auth::middleware::admin_auth`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Redirect, Response};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::{GlobalLimits, KeyUpdate, NewKeyRecord};
use crate::errors::{Error, Result};
use crate::pool::key_state::KeyState;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Result<Response> {
    if req.email != state.config.admin_email {
        return Err(Error::Forbidden);
    }
    let ok = crate::auth::password::verify_password(&req.password, &state.config.admin_password_hash)?;
    if !ok {
        return Err(Error::Forbidden);
    }
    let token = state.sessions.create();
    let cookie = format!("keywarden_admin_session={token}; HttpOnly; Path=/; SameSite=Strict");
    Ok((axum::http::StatusCode::OK, [(axum::http::header::SET_COOKIE, cookie)], Json(json!({ "status": "ok" }))).into_response())
}

pub async fn logout(State(state): State<AppState>, req: axum::extract::Request) -> Result<Response> {
    if let Some(cookie_header) = req.headers().get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookie_header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "keywarden_admin_session" {
                    state.sessions.remove(value);
                }
            }
        }
    }
    Ok(Redirect::to("/admin/login").into_response())
}

/// `GET /status` — the Key Pool status snapshot.
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "keys": state.pool.status() }))
}

/// `POST /reload-keys` — re-executes the pool load protocol and replaces the pool.
pub async fn reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let records = state.store.load_active_keys().await?;
    let now = chrono::Utc::now();
    let keys: Vec<Arc<KeyState>> = records.iter().map(|r| Arc::new(KeyState::from_record(r, now))).collect();
    let count = keys.len();
    state.pool.reload(keys);
    Ok(Json(json!({ "status": "reloaded", "keys": count })))
}

/// `GET /admin/keys` — all persisted records matching the Gemini provider filter.
pub async fn list_keys(State(state): State<AppState>) -> Result<Json<Vec<crate::db::models::KeyRecord>>> {
    let mut records = state.store.list_keys().await?;
    for record in &mut records {
        record.api = crate::types::abbrev_key(&record.api);
    }
    Ok(Json(records))
}

/// `GET /admin/keys/{id}/reveal` — the full credential for one record.
pub async fn reveal_key(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<crate::db::models::KeyRecord>> {
    let record = state.store.reveal_key(id).await?;
    Ok(Json(record))
}

/// `POST /admin/keys` — insert `{api, provider, model, status, usage_today=0}`.
pub async fn add_key(State(state): State<AppState>, Json(new_key): Json<NewKeyRecord>) -> Result<Json<crate::db::models::KeyRecord>> {
    let record = state.store.insert_key(new_key).await?;
    Ok(Json(record))
}

/// `DELETE /admin/keys/{id}` — remove a record by id.
pub async fn delete_key(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>> {
    state.store.delete_key(id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

/// `PUT /admin/keys` — mutate status/model/provider fields of a record by credential.
pub async fn update_key(State(state): State<AppState>, Json(update): Json<KeyUpdate>) -> Result<Json<crate::db::models::KeyRecord>> {
    let record = state
        .store
        .update_key_by_credential(&update.api, update.status.as_deref(), update.model.as_deref(), update.provider.as_deref())
        .await?;
    Ok(Json(record))
}

/// `GET /admin/config` — the persisted global `{rpm, rph, rpd}` record.
pub async fn get_config(State(state): State<AppState>) -> Json<GlobalLimits> {
    Json(state.pool.limits())
}

/// `POST /admin/config` — overwrite the persisted global record and the in-memory pool.
pub async fn update_config(State(state): State<AppState>, Json(limits): Json<GlobalLimits>) -> Result<Json<GlobalLimits>> {
    state.store.save_global_limits(limits).await?;
    state.pool.set_limits(limits);
    Ok(Json(limits))
}
