//! Datastore Gateway — read-through for initial key load and global limits,
//! write-through for usage counters and admin mutations.
//!
//! Two tables back the gateway: `api_list` (Persisted Key Record) and
//! `gateway_config` (Global Configuration, single `gemini_limits` row).

pub mod errors;
pub mod models;

use errors::Result;
use models::{GlobalLimits, KeyRecord, NewKeyRecord};
use sqlx::PgPool;

const GEMINI_PROVIDER_FILTER: &str = "%gemini%";
const LIMITS_CONFIG_KEY: &str = "gemini_limits";

/// Thin wrapper around the connection pool. Kept as its own type (rather than a bare
/// `PgPool`) so call sites read `store.load_active_keys()` instead of hand-rolled SQL,
/// matching the repository style the rest of the stack uses.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load every record whose provider matches the Gemini family and whose status is
    /// "active" — the only records the Key Pool admits.
    pub async fn load_active_keys(&self) -> Result<Vec<KeyRecord>> {
        let rows = sqlx::query_as!(
            KeyRecord,
            r#"
            SELECT id, provider, model, api, status, usage_today, last_used_at
            FROM api_list
            WHERE provider ILIKE $1 AND status = 'active'
            ORDER BY id
            "#,
            GEMINI_PROVIDER_FILTER,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        let rows = sqlx::query_as!(
            KeyRecord,
            r#"
            SELECT id, provider, model, api, status, usage_today, last_used_at
            FROM api_list
            WHERE provider ILIKE $1
            ORDER BY id
            "#,
            GEMINI_PROVIDER_FILTER,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn reveal_key(&self, id: uuid::Uuid) -> Result<KeyRecord> {
        let row = sqlx::query_as!(
            KeyRecord,
            r#"
            SELECT id, provider, model, api, status, usage_today, last_used_at
            FROM api_list
            WHERE id = $1
            "#,
            id,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(errors::DbError::NotFound)?;
        Ok(row)
    }

    pub async fn insert_key(&self, new_key: NewKeyRecord) -> Result<KeyRecord> {
        let row = sqlx::query_as!(
            KeyRecord,
            r#"
            INSERT INTO api_list (id, provider, model, api, status, usage_today)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 0)
            RETURNING id, provider, model, api, status, usage_today, last_used_at
            "#,
            new_key.provider,
            new_key.model,
            new_key.api,
            new_key.status,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_key(&self, id: uuid::Uuid) -> Result<()> {
        let result = sqlx::query!("DELETE FROM api_list WHERE id = $1", id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(errors::DbError::NotFound);
        }
        Ok(())
    }

    /// Mutate status/model/provider fields of a record, addressed by credential string
    /// (the admin surface's `update key` operation keys off the credential, not the id).
    pub async fn update_key_by_credential(&self, api: &str, status: Option<&str>, model: Option<&str>, provider: Option<&str>) -> Result<KeyRecord> {
        let row = sqlx::query_as!(
            KeyRecord,
            r#"
            UPDATE api_list
            SET status = COALESCE($2, status),
                model = COALESCE($3, model),
                provider = COALESCE($4, provider)
            WHERE api = $1
            RETURNING id, provider, model, api, status, usage_today, last_used_at
            "#,
            api,
            status,
            model,
            provider,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(errors::DbError::NotFound)?;
        Ok(row)
    }

    /// Usage Sync write-back: set `usage_today` and `last_used_at` keyed by credential.
    pub async fn record_usage(&self, api: &str, day_count: i64, last_used_at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        sqlx::query!(
            "UPDATE api_list SET usage_today = $2, last_used_at = $3 WHERE api = $1",
            api,
            day_count,
            last_used_at,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_global_limits(&self) -> Result<Option<GlobalLimits>> {
        let row = sqlx::query!("SELECT value FROM gateway_config WHERE key = $1", LIMITS_CONFIG_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let limits: GlobalLimits = serde_json::from_value(row.value).map_err(|e| errors::DbError::Other(e.into()))?;
                Ok(Some(limits))
            }
            None => Ok(None),
        }
    }

    pub async fn save_global_limits(&self, limits: GlobalLimits) -> Result<()> {
        let value = serde_json::to_value(limits).map_err(|e| errors::DbError::Other(e.into()))?;
        sqlx::query!(
            r#"
            INSERT INTO gateway_config (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
            LIMITS_CONFIG_KEY,
            value,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_config_key_matches_schema() {
        assert_eq!(LIMITS_CONFIG_KEY, "gemini_limits");
    }
}
