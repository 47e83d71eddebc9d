use crate::{
    AppState,
    auth::AuthUser,
    error::{ApiError, ApiResult},
    models::{
        AvailableModule, CreateModuleRequest, Module, ModuleAccessStatus, Permission,
        PermissionView, PreferenceValueResponse, SetEnabledRequest, SetPreferencesRequest,
        SetPreferencesResponse, UpdateModuleRequest,
    },
    policy,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// --- Filter Structs ---

/// ModuleFilter
///
/// Query parameters for the admin module listing (GET /admin/modules).
#[derive(Deserialize, utoipa::IntoParams)]
pub struct ModuleFilter {
    /// When true, only modules whose global kill switch is on are returned.
    pub active_only: Option<bool>,
}

// --- Self-Service Handlers (/me) ---

/// get_my_modules
///
/// [Authenticated Route] Lists the modules the caller can actually use: an
/// enabled grant exists, the module is globally active, and admin-only
/// modules are filtered out for non-admin callers. Evaluated fresh on every
/// request — nothing here is cached, so an admin flipping a module's active
/// flag is visible immediately.
#[utoipa::path(
    get,
    path = "/me/modules",
    responses((status = 200, description = "Usable modules", body = [AvailableModule]))
)]
pub async fn get_my_modules(
    AuthUser { id, is_admin }: AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<AvailableModule>>> {
    let modules = state.repo.list_modules(false).await?;

    let mut available = Vec::new();
    for module in modules {
        let permission = state.repo.get_permission(id, module.id).await?;
        if policy::usable(is_admin, &module, permission.as_ref()) {
            // usable() only holds when a permission row exists.
            let is_enabled = permission.map(|p| p.is_enabled).unwrap_or(false);
            available.push(AvailableModule { module, is_enabled });
        }
    }
    Ok(Json(available))
}

/// toggle_module
///
/// [Authenticated Route] Flips the caller's enabled flag for a granted
/// module. A missing grant is a 403, not a silent row creation: absence of a
/// grant is distinct from a disabled grant, and only `grant` creates rows.
/// The `dashboard` module is pinned and can never be toggled.
#[utoipa::path(
    post,
    path = "/me/modules/{module_id}/toggle",
    params(("module_id" = i64, Path, description = "Module ID")),
    responses(
        (status = 200, description = "Toggled", body = Permission),
        (status = 403, description = "No grant, or module is pinned"),
        (status = 404, description = "Module not found")
    )
)]
pub async fn toggle_module(
    AuthUser { id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(module_id): Path<i64>,
) -> ApiResult<Json<Permission>> {
    let module = state.repo.get_module(module_id).await?;
    if policy::is_pinned(&module.name) {
        return Err(ApiError::Forbidden(format!(
            "module '{}' cannot be toggled",
            module.name
        )));
    }

    let permission = state
        .repo
        .get_permission(id, module_id)
        .await?
        .ok_or_else(|| ApiError::Forbidden("no permission for this module".to_string()))?;

    let updated = state
        .repo
        .set_permission_enabled(id, module_id, !permission.is_enabled)
        .await?;
    Ok(Json(updated))
}

/// set_module_enabled
///
/// [Authenticated Route] Explicitly sets the caller's enabled flag. Same
/// rules as toggle, except pinning only blocks *disabling*: re-asserting
/// `enabled=true` on `dashboard` is harmless and allowed.
#[utoipa::path(
    put,
    path = "/me/modules/{module_id}/enabled",
    params(("module_id" = i64, Path, description = "Module ID")),
    request_body = SetEnabledRequest,
    responses(
        (status = 200, description = "Updated", body = Permission),
        (status = 403, description = "No grant, or disabling a pinned module"),
        (status = 404, description = "Module not found")
    )
)]
pub async fn set_module_enabled(
    AuthUser { id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(module_id): Path<i64>,
    Json(payload): Json<SetEnabledRequest>,
) -> ApiResult<Json<Permission>> {
    let module = state.repo.get_module(module_id).await?;
    if !payload.enabled && policy::is_pinned(&module.name) {
        return Err(ApiError::Forbidden(format!(
            "module '{}' cannot be disabled",
            module.name
        )));
    }

    if state.repo.get_permission(id, module_id).await?.is_none() {
        return Err(ApiError::Forbidden(
            "no permission for this module".to_string(),
        ));
    }

    let updated = state
        .repo
        .set_permission_enabled(id, module_id, payload.enabled)
        .await?;
    Ok(Json(updated))
}

/// get_my_preferences
///
/// [Authenticated Route] Returns all of the caller's preferences as a map of
/// keys to decoded values.
#[utoipa::path(
    get,
    path = "/me/preferences",
    responses((status = 200, description = "Preference map"))
)]
pub async fn get_my_preferences(
    AuthUser { id, .. }: AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<HashMap<String, Value>>> {
    let preferences = state.repo.list_preferences(id).await?;
    let map = preferences
        .iter()
        .map(|p| (p.preference_key.clone(), p.decoded_value()))
        .collect();
    Ok(Json(map))
}

/// get_my_preference
///
/// [Authenticated Route] Returns a single preference, decoded back to its
/// original shape (structured values parse as JSON, plain text comes back
/// verbatim). An unset key is a 404.
#[utoipa::path(
    get,
    path = "/me/preferences/{key}",
    params(("key" = String, Path, description = "Preference key")),
    responses(
        (status = 200, description = "Decoded value", body = PreferenceValueResponse),
        (status = 404, description = "Key unset")
    )
)]
pub async fn get_my_preference(
    AuthUser { id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<PreferenceValueResponse>> {
    let preference = state
        .repo
        .get_preference(id, &key)
        .await?
        .ok_or(ApiError::NotFound("preference"))?;
    Ok(Json(PreferenceValueResponse {
        key,
        value: preference.decoded_value(),
    }))
}

/// set_my_preferences
///
/// [Authenticated Route] Upserts a batch of preferences by key: existing
/// keys are overwritten, new keys are created. Returns the keys written.
#[utoipa::path(
    put,
    path = "/me/preferences",
    request_body = SetPreferencesRequest,
    responses((status = 200, description = "Keys written", body = SetPreferencesResponse))
)]
pub async fn set_my_preferences(
    AuthUser { id, .. }: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<SetPreferencesRequest>,
) -> ApiResult<Json<SetPreferencesResponse>> {
    let updated = state
        .repo
        .upsert_preferences(id, &payload.preferences)
        .await?;
    Ok(Json(SetPreferencesResponse { updated }))
}

// --- Admin Handlers: Module Registry (/admin/modules) ---

/// list_modules_admin
///
/// [Admin Route] Lists every registry module, sorted by `sort_order`
/// (creation order breaks ties), optionally filtered to active ones.
#[utoipa::path(
    get,
    path = "/admin/modules",
    params(ModuleFilter),
    responses((status = 200, description = "Registry modules", body = [Module]))
)]
pub async fn list_modules_admin(
    caller: AuthUser,
    State(state): State<AppState>,
    Query(filter): Query<ModuleFilter>,
) -> ApiResult<Json<Vec<Module>>> {
    policy::require_admin(&caller)?;
    let modules = state
        .repo
        .list_modules(filter.active_only.unwrap_or(false))
        .await?;
    Ok(Json(modules))
}

/// create_module
///
/// [Admin Route] Registers a new module. Name and display name must be
/// non-empty; a duplicate slug is a 409. The admin guard runs before any
/// validation or store access, so a rejected call has no effect.
#[utoipa::path(
    post,
    path = "/admin/modules",
    request_body = CreateModuleRequest,
    responses(
        (status = 201, description = "Created", body = Module),
        (status = 400, description = "Empty name or display_name"),
        (status = 403, description = "Caller is not an admin"),
        (status = 409, description = "Name already registered")
    )
)]
pub async fn create_module(
    caller: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateModuleRequest>,
) -> ApiResult<(StatusCode, Json<Module>)> {
    policy::require_admin(&caller)?;

    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".to_string()));
    }
    if payload.display_name.trim().is_empty() {
        return Err(ApiError::Validation(
            "display_name must not be empty".to_string(),
        ));
    }

    let module = state.repo.create_module(payload).await?;
    Ok((StatusCode::CREATED, Json(module)))
}

/// update_module
///
/// [Admin Route] Applies a partial update to a module. Only the whitelisted
/// fields (display_name, description, icon, is_active, requires_admin,
/// sort_order) are mutable — the slug never changes after creation.
#[utoipa::path(
    put,
    path = "/admin/modules/{id}",
    params(("id" = i64, Path, description = "Module ID")),
    request_body = UpdateModuleRequest,
    responses(
        (status = 200, description = "Updated", body = Module),
        (status = 404, description = "Unknown module")
    )
)]
pub async fn update_module(
    caller: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateModuleRequest>,
) -> ApiResult<Json<Module>> {
    policy::require_admin(&caller)?;
    let module = state.repo.update_module(id, payload).await?;
    Ok(Json(module))
}

/// delete_module
///
/// [Admin Route] Removes a module and cascades deletion of every grant
/// referencing it. `dashboard` and `admin` are structurally permanent and
/// refuse deletion regardless of who asks.
#[utoipa::path(
    delete,
    path = "/admin/modules/{id}",
    params(("id" = i64, Path, description = "Module ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Protected module"),
        (status = 404, description = "Unknown module")
    )
)]
pub async fn delete_module(
    caller: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    policy::require_admin(&caller)?;

    let module = state.repo.get_module(id).await?;
    if policy::is_delete_protected(&module.name) {
        return Err(ApiError::Forbidden(format!(
            "module '{}' cannot be deleted",
            module.name
        )));
    }

    state.repo.delete_module(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// get_module_permissions
///
/// [Admin Route] Every grant referencing a module — the explicit counterpart
/// of an ORM backref, used before deactivating or deleting a module to see
/// who is affected.
#[utoipa::path(
    get,
    path = "/admin/modules/{id}/permissions",
    params(("id" = i64, Path, description = "Module ID")),
    responses(
        (status = 200, description = "Grants for the module", body = [Permission]),
        (status = 404, description = "Unknown module")
    )
)]
pub async fn get_module_permissions(
    caller: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Permission>>> {
    policy::require_admin(&caller)?;
    // Distinguish "module unknown" from "module has no grants".
    state.repo.get_module(id).await?;
    let permissions = state.repo.list_permissions_for_module(id).await?;
    Ok(Json(permissions))
}

// --- Admin Handlers: Permission Store (/admin/users) ---

/// grant_module
///
/// [Admin Route] Grants a module to a user, enabled. Exactly one grant may
/// exist per (user, module) pair: a duplicate is a 409 and the caller must
/// use the enable endpoint to re-enable a disabled grant. The granting
/// admin is recorded on the row.
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/modules/{module_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user ID"),
        ("module_id" = i64, Path, description = "Module ID")
    ),
    responses(
        (status = 201, description = "Granted", body = Permission),
        (status = 404, description = "Unknown user or module"),
        (status = 409, description = "Already granted")
    )
)]
pub async fn grant_module(
    caller: AuthUser,
    State(state): State<AppState>,
    Path((user_id, module_id)): Path<(Uuid, i64)>,
) -> ApiResult<(StatusCode, Json<Permission>)> {
    policy::require_admin(&caller)?;
    let permission = state
        .repo
        .grant_permission(user_id, module_id, Some(caller.id))
        .await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

/// revoke_module
///
/// [Admin Route] Deletes a user's grant. `dashboard` access can never be
/// revoked through this path — the grant is pinned for everyone. Note the
/// asymmetry with deletion protection: `admin` grants stay revocable.
#[utoipa::path(
    delete,
    path = "/admin/users/{user_id}/modules/{module_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user ID"),
        ("module_id" = i64, Path, description = "Module ID")
    ),
    responses(
        (status = 204, description = "Revoked"),
        (status = 403, description = "Pinned module"),
        (status = 404, description = "Unknown module or no grant")
    )
)]
pub async fn revoke_module(
    caller: AuthUser,
    State(state): State<AppState>,
    Path((user_id, module_id)): Path<(Uuid, i64)>,
) -> ApiResult<StatusCode> {
    policy::require_admin(&caller)?;

    let module = state.repo.get_module(module_id).await?;
    if policy::is_pinned(&module.name) {
        return Err(ApiError::Forbidden(format!(
            "module '{}' access cannot be revoked",
            module.name
        )));
    }

    state.repo.revoke_permission(user_id, module_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// get_user_module_status
///
/// [Admin Route] Audit/management view of one user's access: every registry
/// module regardless of usability, annotated with the grant state for the
/// target user. A disabled or inactive module still shows its grant here.
#[utoipa::path(
    get,
    path = "/admin/users/{user_id}/modules",
    params(("user_id" = Uuid, Path, description = "Target user ID")),
    responses(
        (status = 200, description = "Per-module access status", body = [ModuleAccessStatus]),
        (status = 404, description = "Unknown user")
    )
)]
pub async fn get_user_module_status(
    caller: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ModuleAccessStatus>>> {
    policy::require_admin(&caller)?;

    state
        .repo
        .get_user(user_id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    let modules = state.repo.list_modules(false).await?;
    let mut statuses = Vec::with_capacity(modules.len());
    for module in modules {
        let permission = state.repo.get_permission(user_id, module.id).await?;
        statuses.push(ModuleAccessStatus {
            has_permission: permission.is_some(),
            is_enabled: permission.as_ref().map(|p| p.is_enabled).unwrap_or(false),
            granted_at: permission.map(|p| p.granted_at),
            module,
        });
    }
    Ok(Json(statuses))
}

/// get_user_permissions
///
/// [Admin Route] The user's raw grant rows, each joined with the owning
/// module's current metadata at read time.
#[utoipa::path(
    get,
    path = "/admin/users/{user_id}/permissions",
    params(("user_id" = Uuid, Path, description = "Target user ID")),
    responses(
        (status = 200, description = "Grant rows", body = [PermissionView]),
        (status = 404, description = "Unknown user")
    )
)]
pub async fn get_user_permissions(
    caller: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<PermissionView>>> {
    policy::require_admin(&caller)?;

    state
        .repo
        .get_user(user_id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    let views = state.repo.list_permissions_for_user(user_id).await?;
    Ok(Json(views))
}
