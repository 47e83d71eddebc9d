use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Core Application Schemas (Mapped to Database) ---

/// User
///
/// The caller's canonical identity record from the `users` table, as relevant
/// to this core: `is_admin` gates admin-only modules and admin-only mutations,
/// `is_active` lets an account be switched off without deleting its grants.
/// Authentication itself happens upstream; this record is what the auth
/// extractor resolves.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// RBAC gate for admin-only modules and admin-only mutations.
    pub is_admin: bool,
    pub is_active: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

/// Module
///
/// A row of the system module registry (`modules` table): a named,
/// independently toggle-able application feature. `name` is a unique slug and
/// immutable after creation; everything else is admin-mutable.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Module {
    pub id: i64,
    /// Unique slug, e.g. "boats", "trips". Immutable after creation.
    pub name: String,
    /// Human-facing title, e.g. "Fleet Management".
    pub display_name: String,
    pub description: Option<String>,
    /// Icon class/name for the frontend navigation.
    pub icon: Option<String>,
    /// Global kill switch. An inactive module is invisible to everyone,
    /// grants included.
    pub is_active: bool,
    /// Restricts visibility to admin users even when granted.
    pub requires_admin: bool,
    /// Navigation display order, ascending. Ties break by id (creation order).
    pub sort_order: i32,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// Permission
///
/// One user's grant to one module (`permissions` table). The storage layer
/// enforces uniqueness on `(user_id, module_id)`; a duplicate grant is a
/// conflict, never an upsert. `is_enabled` is the user-level switch,
/// independent of the module's global `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Permission {
    pub id: i64,
    pub user_id: Uuid,
    pub module_id: i64,
    pub is_enabled: bool,
    #[ts(type = "string")]
    pub granted_at: DateTime<Utc>,
    /// The admin who granted access, or None for bootstrap/migration grants.
    pub granted_by: Option<Uuid>,
}

/// Preference
///
/// Raw per-user key/value row (`preferences` table). The value is stored as an
/// opaque serialized blob; decode with [`Preference::decoded_value`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct Preference {
    pub id: i64,
    pub user_id: Uuid,
    pub preference_key: String,
    pub preference_value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    /// Decodes the stored blob back to its original structured shape when it
    /// parses as JSON, otherwise returns the raw string verbatim. An unset
    /// value decodes to `null`.
    pub fn decoded_value(&self) -> Value {
        match &self.preference_value {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
            None => Value::Null,
        }
    }

    /// Encodes a value for storage: plain strings are stored verbatim so that
    /// `"dark"` round-trips as `"dark"`, structured values are serialized.
    pub fn encode_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// --- Joined / Computed Read Models (Output) ---

/// PermissionView
///
/// A permission row joined at read time with its module's current metadata.
/// The module fields are *not* snapshotted at grant time: renaming a module
/// is immediately reflected in the audit listing.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct PermissionView {
    pub id: i64,
    pub user_id: Uuid,
    pub module_id: i64,
    pub module_name: String,
    pub module_display_name: String,
    pub is_enabled: bool,
    #[ts(type = "string")]
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<Uuid>,
}

/// AvailableModule
///
/// A module the caller can actually use (all four conjuncts of the visibility
/// rule hold), paired with the caller's own enabled flag.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct AvailableModule {
    #[serde(flatten)]
    pub module: Module,
    /// The caller's per-user switch for this module.
    pub is_enabled: bool,
}

/// ModuleAccessStatus
///
/// Admin audit view: every registry module annotated with one target user's
/// grant state, regardless of whether the module is currently usable.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct ModuleAccessStatus {
    #[serde(flatten)]
    pub module: Module,
    pub has_permission: bool,
    pub is_enabled: bool,
    #[ts(type = "string | null")]
    pub granted_at: Option<DateTime<Utc>>,
}

// --- Request Payloads (Input Schemas) ---

/// CreateModuleRequest
///
/// Input payload for registering a new module (POST /admin/modules).
/// `name` and `display_name` are required and must be non-empty; the rest
/// default to an active, non-admin module sorted first.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateModuleRequest {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub requires_admin: bool,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_true() -> bool {
    true
}

impl Default for CreateModuleRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            description: None,
            icon: None,
            is_active: true,
            requires_admin: false,
            sort_order: 0,
        }
    }
}

/// UpdateModuleRequest
///
/// Partial update payload for PUT /admin/modules/{id}. Only the whitelisted
/// fields below are mutable; `name` is deliberately absent. `Option<T>`
/// fields are left untouched when omitted from the JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateModuleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_admin: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

/// SetEnabledRequest
///
/// Input payload for PUT /me/modules/{id}/enabled.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

/// SetPreferencesRequest
///
/// Input payload for PUT /me/preferences: a map of keys to arbitrary JSON
/// values, upserted per key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct SetPreferencesRequest {
    pub preferences: std::collections::HashMap<String, Value>,
}

/// SetPreferencesResponse
///
/// Echoes back the keys that were written.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct SetPreferencesResponse {
    pub updated: Vec<String>,
}

/// PreferenceValueResponse
///
/// Output wrapper for a single decoded preference (GET /me/preferences/{key}).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct PreferenceValueResponse {
    pub key: String,
    pub value: Value,
}
