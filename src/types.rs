//! Shared identifier and small value types used across the gateway.

use uuid::Uuid;

/// Identifier of a persisted credential record.
pub type KeyId = Uuid;

/// Abbreviate a credential to its first 8 characters for logs and admin responses —
/// the full credential is never logged or returned except through `reveal key`.
pub fn abbrev_key(key: &str) -> String {
    key.chars().take(8).collect()
}
