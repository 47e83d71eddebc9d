use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Admin Router Module
///
/// Registry management and per-user grant administration. Authentication is
/// enforced by the layer above; authorization (the admin role) is checked
/// inside every handler via `policy::require_admin`, before any store
/// access, so a rejected request leaves no trace in state.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // GET  /admin/modules?active_only=  — full registry listing
        // POST /admin/modules               — register a new module
        .route(
            "/modules",
            get(handlers::list_modules_admin).post(handlers::create_module),
        )
        // PUT    /admin/modules/{id} — partial update (whitelisted fields)
        // DELETE /admin/modules/{id} — delete with cascade; protected names refuse
        .route(
            "/modules/{id}",
            put(handlers::update_module).delete(handlers::delete_module),
        )
        // GET /admin/modules/{id}/permissions
        // Who holds a grant on this module (explicit reverse lookup).
        .route(
            "/modules/{id}/permissions",
            get(handlers::get_module_permissions),
        )
        // POST   /admin/users/{user_id}/modules/{module_id} — grant
        // DELETE /admin/users/{user_id}/modules/{module_id} — revoke (dashboard pinned)
        .route(
            "/users/{user_id}/modules/{module_id}",
            post(handlers::grant_module).delete(handlers::revoke_module),
        )
        // GET /admin/users/{user_id}/modules
        // Audit view: every module annotated with the target user's grant state.
        .route(
            "/users/{user_id}/modules",
            get(handlers::get_user_module_status),
        )
        // GET /admin/users/{user_id}/permissions
        // Raw grant rows joined with current module metadata.
        .route(
            "/users/{user_id}/permissions",
            get(handlers::get_user_permissions),
        )
}
