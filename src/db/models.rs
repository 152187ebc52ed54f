//! Row structures matching the two tables the gateway owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted Key Record — the external representation of a provisioned credential.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub api: String,
    pub status: String,
    pub usage_today: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Request body for the admin surface's `add key` operation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewKeyRecord {
    pub provider: String,
    pub model: String,
    pub api: String,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "active".to_string()
}

/// Request body for the admin surface's `update key` operation.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeyUpdate {
    pub api: String,
    pub status: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

/// Global Configuration — the three numeric rate limits, persisted as a single row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub rpm: u32,
    pub rph: u32,
    pub rpd: u32,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self { rpm: 60, rph: 1_000, rpd: 10_000 }
    }
}
