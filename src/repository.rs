use crate::error::{ApiError, ApiResult};
use crate::models::{
    CreateModuleRequest, Module, Permission, PermissionView, Preference, UpdateModuleRequest, User,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Repository Trait
///
/// The abstract persistence contract for the module registry, permission
/// store, and preference store. Handlers program against this trait, so the
/// concrete backend (Postgres in production, in-memory for tests and local
/// experimentation) is interchangeable.
///
/// Consistency contract: uniqueness on `modules.name`,
/// `(user_id, module_id)`, and `(user_id, preference_key)` is enforced here,
/// at the storage layer — the loser of a racing duplicate insert receives
/// `Conflict`, never a silent duplicate row. Protected-module policy lives
/// above this trait (see `policy`); the store only knows about rows.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Module Registry ---

    /// Lists registry modules sorted by `sort_order` ascending, ties broken
    /// by id (creation order). `active_only` filters out globally disabled
    /// modules.
    async fn list_modules(&self, active_only: bool) -> ApiResult<Vec<Module>>;
    async fn get_module(&self, id: i64) -> ApiResult<Module>;
    async fn get_module_by_name(&self, name: &str) -> ApiResult<Option<Module>>;
    /// Inserts a new module. `Conflict` if the name is already registered.
    async fn create_module(&self, req: CreateModuleRequest) -> ApiResult<Module>;
    /// Applies the whitelisted partial update. `name` is immutable by design
    /// and not part of the update payload.
    async fn update_module(&self, id: i64, req: UpdateModuleRequest) -> ApiResult<Module>;
    /// Removes the module and cascades deletion of every permission
    /// referencing it. Protection of `dashboard`/`admin` is checked by the
    /// caller before this is reached.
    async fn delete_module(&self, id: i64) -> ApiResult<()>;

    // --- Users ---

    async fn get_user(&self, id: Uuid) -> ApiResult<Option<User>>;
    /// Creates an identity record. Used by bootstrap and test seeding; the
    /// login/registration flow lives outside this core.
    async fn create_user(&self, user: User) -> ApiResult<User>;

    // --- Permission Store ---

    /// Creates an enabled grant. `Conflict` if a grant for the pair already
    /// exists (no implicit re-enable), `NotFound` if the user or module does
    /// not exist.
    async fn grant_permission(
        &self,
        user_id: Uuid,
        module_id: i64,
        granted_by: Option<Uuid>,
    ) -> ApiResult<Permission>;
    /// Deletes the grant row. `NotFound` if no grant exists for the pair.
    async fn revoke_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<()>;
    async fn get_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<Option<Permission>>;
    /// Sets the enabled flag on an existing grant. `NotFound` if no grant
    /// exists — the caller distinguishes this from a disabled grant.
    async fn set_permission_enabled(
        &self,
        user_id: Uuid,
        module_id: i64,
        enabled: bool,
    ) -> ApiResult<Permission>;
    /// All grants for a user, each joined with its module's *current*
    /// metadata at read time (not snapshotted at grant time).
    async fn list_permissions_for_user(&self, user_id: Uuid) -> ApiResult<Vec<PermissionView>>;
    /// All grants referencing a module. Explicit query instead of an
    /// ORM-style backref on the module entity.
    async fn list_permissions_for_module(&self, module_id: i64) -> ApiResult<Vec<Permission>>;

    // --- Preference Store ---

    async fn get_preference(&self, user_id: Uuid, key: &str) -> ApiResult<Option<Preference>>;
    /// Upserts each entry by key (update if present, insert otherwise) and
    /// returns the keys written.
    async fn upsert_preferences(
        &self,
        user_id: Uuid,
        entries: &HashMap<String, Value>,
    ) -> ApiResult<Vec<String>>;
    async fn list_preferences(&self, user_id: Uuid) -> ApiResult<Vec<Preference>>;
}

/// The concrete type used to share the persistence layer across the app state.
pub type RepositoryState = Arc<dyn Repository>;

// --- Postgres Implementation ---

/// PostgresRepository
///
/// Production backend. Relies on the database's unique indexes
/// (`modules.name`, `permissions (user_id, module_id)`,
/// `preferences (user_id, preference_key)`) to serialize racing writers:
/// unique violations surface as `Conflict`, foreign-key violations on grant
/// as `NotFound`.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MODULE_COLUMNS: &str = "id, name, display_name, description, icon, is_active, \
                              requires_admin, sort_order, created_at, updated_at";
const PERMISSION_COLUMNS: &str = "id, user_id, module_id, is_enabled, granted_at, granted_by";

#[async_trait]
impl Repository for PostgresRepository {
    async fn list_modules(&self, active_only: bool) -> ApiResult<Vec<Module>> {
        let sql = if active_only {
            format!(
                "SELECT {MODULE_COLUMNS} FROM modules WHERE is_active = true \
                 ORDER BY sort_order ASC, id ASC"
            )
        } else {
            format!("SELECT {MODULE_COLUMNS} FROM modules ORDER BY sort_order ASC, id ASC")
        };
        let modules = sqlx::query_as::<_, Module>(&sql).fetch_all(&self.pool).await?;
        Ok(modules)
    }

    async fn get_module(&self, id: i64) -> ApiResult<Module> {
        let sql = format!("SELECT {MODULE_COLUMNS} FROM modules WHERE id = $1");
        sqlx::query_as::<_, Module>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApiError::NotFound("module"))
    }

    async fn get_module_by_name(&self, name: &str) -> ApiResult<Option<Module>> {
        let sql = format!("SELECT {MODULE_COLUMNS} FROM modules WHERE name = $1");
        let module = sqlx::query_as::<_, Module>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(module)
    }

    async fn create_module(&self, req: CreateModuleRequest) -> ApiResult<Module> {
        let sql = format!(
            "INSERT INTO modules \
             (name, display_name, description, icon, is_active, requires_admin, sort_order, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW()) \
             RETURNING {MODULE_COLUMNS}"
        );
        let module = sqlx::query_as::<_, Module>(&sql)
            .bind(&req.name)
            .bind(&req.display_name)
            .bind(&req.description)
            .bind(&req.icon)
            .bind(req.is_active)
            .bind(req.requires_admin)
            .bind(req.sort_order)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ApiError::Conflict(format!("module '{}' already exists", req.name))
                }
                _ => ApiError::from(e),
            })?;
        Ok(module)
    }

    async fn update_module(&self, id: i64, req: UpdateModuleRequest) -> ApiResult<Module> {
        // COALESCE keeps the current value for any field omitted from the
        // payload. The mutable whitelist is exactly this column list; `name`
        // is immutable.
        let sql = format!(
            "UPDATE modules \
             SET display_name  = COALESCE($2, display_name), \
                 description   = COALESCE($3, description), \
                 icon          = COALESCE($4, icon), \
                 is_active     = COALESCE($5, is_active), \
                 requires_admin = COALESCE($6, requires_admin), \
                 sort_order    = COALESCE($7, sort_order), \
                 updated_at    = NOW() \
             WHERE id = $1 \
             RETURNING {MODULE_COLUMNS}"
        );
        sqlx::query_as::<_, Module>(&sql)
            .bind(id)
            .bind(&req.display_name)
            .bind(&req.description)
            .bind(&req.icon)
            .bind(req.is_active)
            .bind(req.requires_admin)
            .bind(req.sort_order)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApiError::NotFound("module"))
    }

    async fn delete_module(&self, id: i64) -> ApiResult<()> {
        // Cascade is explicit and transactional: the grant rows and the
        // module row disappear together or not at all.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM permissions WHERE module_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM modules WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("module"));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> ApiResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, is_admin, is_active, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_user(&self, user: User) -> ApiResult<User> {
        let created = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, username, email, is_admin, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             RETURNING id, username, email, is_admin, is_active, created_at",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.is_admin)
        .bind(user.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Conflict("user already exists".to_string())
            }
            _ => ApiError::from(e),
        })?;
        Ok(created)
    }

    async fn grant_permission(
        &self,
        user_id: Uuid,
        module_id: i64,
        granted_by: Option<Uuid>,
    ) -> ApiResult<Permission> {
        let sql = format!(
            "INSERT INTO permissions (user_id, module_id, is_enabled, granted_at, granted_by) \
             VALUES ($1, $2, true, NOW(), $3) \
             RETURNING {PERMISSION_COLUMNS}"
        );
        let permission = sqlx::query_as::<_, Permission>(&sql)
            .bind(user_id)
            .bind(module_id)
            .bind(granted_by)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ApiError::Conflict("permission already granted".to_string())
                }
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    ApiError::NotFound("user or module")
                }
                _ => ApiError::from(e),
            })?;
        Ok(permission)
    }

    async fn revoke_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM permissions WHERE user_id = $1 AND module_id = $2")
            .bind(user_id)
            .bind(module_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("permission"));
        }
        Ok(())
    }

    async fn get_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<Option<Permission>> {
        let sql =
            format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE user_id = $1 AND module_id = $2");
        let permission = sqlx::query_as::<_, Permission>(&sql)
            .bind(user_id)
            .bind(module_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(permission)
    }

    async fn set_permission_enabled(
        &self,
        user_id: Uuid,
        module_id: i64,
        enabled: bool,
    ) -> ApiResult<Permission> {
        let sql = format!(
            "UPDATE permissions SET is_enabled = $3 \
             WHERE user_id = $1 AND module_id = $2 \
             RETURNING {PERMISSION_COLUMNS}"
        );
        sqlx::query_as::<_, Permission>(&sql)
            .bind(user_id)
            .bind(module_id)
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApiError::NotFound("permission"))
    }

    async fn list_permissions_for_user(&self, user_id: Uuid) -> ApiResult<Vec<PermissionView>> {
        // The module columns are read live, so a renamed module shows its
        // current display name in the audit view.
        let views = sqlx::query_as::<_, PermissionView>(
            "SELECT p.id, p.user_id, p.module_id, \
                    m.name AS module_name, m.display_name AS module_display_name, \
                    p.is_enabled, p.granted_at, p.granted_by \
             FROM permissions p \
             JOIN modules m ON p.module_id = m.id \
             WHERE p.user_id = $1 \
             ORDER BY m.sort_order ASC, m.id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(views)
    }

    async fn list_permissions_for_module(&self, module_id: i64) -> ApiResult<Vec<Permission>> {
        let sql = format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE module_id = $1 ORDER BY granted_at ASC"
        );
        let permissions = sqlx::query_as::<_, Permission>(&sql)
            .bind(module_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(permissions)
    }

    async fn get_preference(&self, user_id: Uuid, key: &str) -> ApiResult<Option<Preference>> {
        let preference = sqlx::query_as::<_, Preference>(
            "SELECT id, user_id, preference_key, preference_value, created_at, updated_at \
             FROM preferences WHERE user_id = $1 AND preference_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(preference)
    }

    async fn upsert_preferences(
        &self,
        user_id: Uuid,
        entries: &HashMap<String, Value>,
    ) -> ApiResult<Vec<String>> {
        let mut written = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let stored = Preference::encode_value(value);
            sqlx::query(
                "INSERT INTO preferences (user_id, preference_key, preference_value, created_at, updated_at) \
                 VALUES ($1, $2, $3, NOW(), NOW()) \
                 ON CONFLICT (user_id, preference_key) \
                 DO UPDATE SET preference_value = EXCLUDED.preference_value, updated_at = NOW()",
            )
            .bind(user_id)
            .bind(key)
            .bind(&stored)
            .execute(&self.pool)
            .await?;
            written.push(key.clone());
        }
        Ok(written)
    }

    async fn list_preferences(&self, user_id: Uuid) -> ApiResult<Vec<Preference>> {
        let preferences = sqlx::query_as::<_, Preference>(
            "SELECT id, user_id, preference_key, preference_value, created_at, updated_at \
             FROM preferences WHERE user_id = $1 ORDER BY preference_key ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(preferences)
    }
}

// --- In-Memory Implementation ---

/// MemoryRepository
///
/// In-process backend implementing the same contract, used by the test suite
/// and available for dependency-free local runs. The single mutex stands in
/// for the database's serialization of racing writers: duplicate inserts
/// observe the existing row and fail with `Conflict`, exactly like the unique
/// index in Postgres.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<Uuid, User>,
    modules: Vec<Module>,
    permissions: Vec<Permission>,
    preferences: Vec<Preference>,
    next_module_id: i64,
    next_permission_id: i64,
    next_preference_id: i64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Lock poisoning only happens if a holder panicked; propagating the
        // inner state is still sound for tests.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_modules(&self, active_only: bool) -> ApiResult<Vec<Module>> {
        let inner = self.lock();
        let mut modules: Vec<Module> = inner
            .modules
            .iter()
            .filter(|m| !active_only || m.is_active)
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
        Ok(modules)
    }

    async fn get_module(&self, id: i64) -> ApiResult<Module> {
        let inner = self.lock();
        inner
            .modules
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(ApiError::NotFound("module"))
    }

    async fn get_module_by_name(&self, name: &str) -> ApiResult<Option<Module>> {
        let inner = self.lock();
        Ok(inner.modules.iter().find(|m| m.name == name).cloned())
    }

    async fn create_module(&self, req: CreateModuleRequest) -> ApiResult<Module> {
        let mut inner = self.lock();
        if inner.modules.iter().any(|m| m.name == req.name) {
            return Err(ApiError::Conflict(format!(
                "module '{}' already exists",
                req.name
            )));
        }
        inner.next_module_id += 1;
        let now = Utc::now();
        let module = Module {
            id: inner.next_module_id,
            name: req.name,
            display_name: req.display_name,
            description: req.description,
            icon: req.icon,
            is_active: req.is_active,
            requires_admin: req.requires_admin,
            sort_order: req.sort_order,
            created_at: now,
            updated_at: now,
        };
        inner.modules.push(module.clone());
        Ok(module)
    }

    async fn update_module(&self, id: i64, req: UpdateModuleRequest) -> ApiResult<Module> {
        let mut inner = self.lock();
        let module = inner
            .modules
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ApiError::NotFound("module"))?;
        if let Some(display_name) = req.display_name {
            module.display_name = display_name;
        }
        if let Some(description) = req.description {
            module.description = Some(description);
        }
        if let Some(icon) = req.icon {
            module.icon = Some(icon);
        }
        if let Some(is_active) = req.is_active {
            module.is_active = is_active;
        }
        if let Some(requires_admin) = req.requires_admin {
            module.requires_admin = requires_admin;
        }
        if let Some(sort_order) = req.sort_order {
            module.sort_order = sort_order;
        }
        module.updated_at = Utc::now();
        Ok(module.clone())
    }

    async fn delete_module(&self, id: i64) -> ApiResult<()> {
        let mut inner = self.lock();
        let before = inner.modules.len();
        inner.modules.retain(|m| m.id != id);
        if inner.modules.len() == before {
            return Err(ApiError::NotFound("module"));
        }
        // Cascade: drop every grant referencing the module.
        inner.permissions.retain(|p| p.module_id != id);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> ApiResult<Option<User>> {
        let inner = self.lock();
        Ok(inner.users.get(&id).cloned())
    }

    async fn create_user(&self, user: User) -> ApiResult<User> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.id) {
            return Err(ApiError::Conflict("user already exists".to_string()));
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn grant_permission(
        &self,
        user_id: Uuid,
        module_id: i64,
        granted_by: Option<Uuid>,
    ) -> ApiResult<Permission> {
        let mut inner = self.lock();
        if !inner.users.contains_key(&user_id) {
            return Err(ApiError::NotFound("user"));
        }
        if !inner.modules.iter().any(|m| m.id == module_id) {
            return Err(ApiError::NotFound("module"));
        }
        if inner
            .permissions
            .iter()
            .any(|p| p.user_id == user_id && p.module_id == module_id)
        {
            return Err(ApiError::Conflict("permission already granted".to_string()));
        }
        inner.next_permission_id += 1;
        let permission = Permission {
            id: inner.next_permission_id,
            user_id,
            module_id,
            is_enabled: true,
            granted_at: Utc::now(),
            granted_by,
        };
        inner.permissions.push(permission.clone());
        Ok(permission)
    }

    async fn revoke_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<()> {
        let mut inner = self.lock();
        let before = inner.permissions.len();
        inner
            .permissions
            .retain(|p| !(p.user_id == user_id && p.module_id == module_id));
        if inner.permissions.len() == before {
            return Err(ApiError::NotFound("permission"));
        }
        Ok(())
    }

    async fn get_permission(&self, user_id: Uuid, module_id: i64) -> ApiResult<Option<Permission>> {
        let inner = self.lock();
        Ok(inner
            .permissions
            .iter()
            .find(|p| p.user_id == user_id && p.module_id == module_id)
            .cloned())
    }

    async fn set_permission_enabled(
        &self,
        user_id: Uuid,
        module_id: i64,
        enabled: bool,
    ) -> ApiResult<Permission> {
        let mut inner = self.lock();
        let permission = inner
            .permissions
            .iter_mut()
            .find(|p| p.user_id == user_id && p.module_id == module_id)
            .ok_or(ApiError::NotFound("permission"))?;
        permission.is_enabled = enabled;
        Ok(permission.clone())
    }

    async fn list_permissions_for_user(&self, user_id: Uuid) -> ApiResult<Vec<PermissionView>> {
        let inner = self.lock();
        let mut joined: Vec<(i32, i64, PermissionView)> = inner
            .permissions
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| {
                // Join with the module's current metadata at read time.
                inner.modules.iter().find(|m| m.id == p.module_id).map(|m| {
                    (
                        m.sort_order,
                        m.id,
                        PermissionView {
                            id: p.id,
                            user_id: p.user_id,
                            module_id: p.module_id,
                            module_name: m.name.clone(),
                            module_display_name: m.display_name.clone(),
                            is_enabled: p.is_enabled,
                            granted_at: p.granted_at,
                            granted_by: p.granted_by,
                        },
                    )
                })
            })
            .collect();
        joined.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(joined.into_iter().map(|(_, _, v)| v).collect())
    }

    async fn list_permissions_for_module(&self, module_id: i64) -> ApiResult<Vec<Permission>> {
        let inner = self.lock();
        let mut permissions: Vec<Permission> = inner
            .permissions
            .iter()
            .filter(|p| p.module_id == module_id)
            .cloned()
            .collect();
        permissions.sort_by_key(|p| p.granted_at);
        Ok(permissions)
    }

    async fn get_preference(&self, user_id: Uuid, key: &str) -> ApiResult<Option<Preference>> {
        let inner = self.lock();
        Ok(inner
            .preferences
            .iter()
            .find(|p| p.user_id == user_id && p.preference_key == key)
            .cloned())
    }

    async fn upsert_preferences(
        &self,
        user_id: Uuid,
        entries: &HashMap<String, Value>,
    ) -> ApiResult<Vec<String>> {
        let mut inner = self.lock();
        let mut written = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let stored = Preference::encode_value(value);
            let now = Utc::now();
            let existing = inner
                .preferences
                .iter()
                .position(|p| p.user_id == user_id && p.preference_key == *key);
            match existing {
                Some(i) => {
                    let preference = &mut inner.preferences[i];
                    preference.preference_value = Some(stored);
                    preference.updated_at = now;
                }
                None => {
                    inner.next_preference_id += 1;
                    let id = inner.next_preference_id;
                    inner.preferences.push(Preference {
                        id,
                        user_id,
                        preference_key: key.clone(),
                        preference_value: Some(stored),
                        created_at: now,
                        updated_at: now,
                    });
                }
            }
            written.push(key.clone());
        }
        Ok(written)
    }

    async fn list_preferences(&self, user_id: Uuid) -> ApiResult<Vec<Preference>> {
        let inner = self.lock();
        let mut preferences: Vec<Preference> = inner
            .preferences
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        preferences.sort_by(|a, b| a.preference_key.cmp(&b.preference_key));
        Ok(preferences)
    }
}
