use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Authenticated Router Module
///
/// Self-service routes: each handler receives the resolved `AuthUser` and
/// operates only on the caller's own grants and preferences. The `AuthUser`
/// middleware layer above this router guarantees identity; no handler here
/// needs the admin guard.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // GET /me/modules
        // The caller's usable modules (enabled grant + active module +
        // admin gate satisfied), with the per-user enabled flag attached.
        .route("/me/modules", get(handlers::get_my_modules))
        // POST /me/modules/{id}/toggle
        // Flips the caller's enabled flag on an existing grant. No grant
        // means 403, never an implicit row creation. `dashboard` is pinned.
        .route(
            "/me/modules/{module_id}/toggle",
            post(handlers::toggle_module),
        )
        // PUT /me/modules/{id}/enabled
        // Explicit form of the toggle; disabling `dashboard` is refused.
        .route(
            "/me/modules/{module_id}/enabled",
            put(handlers::set_module_enabled),
        )
        // --- Preferences ---
        // GET  /me/preferences        — full decoded map
        // PUT  /me/preferences        — upsert-by-key batch write
        .route(
            "/me/preferences",
            get(handlers::get_my_preferences).put(handlers::set_my_preferences),
        )
        // GET /me/preferences/{key}
        // Single decoded value; an unset key is a 404.
        .route("/me/preferences/{key}", get(handlers::get_my_preference))
}
