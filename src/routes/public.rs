use crate::AppState;
use axum::{Router, routing::get};

/// Public Router Module
///
/// The only unauthenticated surface of this core. Everything else — module
/// listings included — depends on a resolved caller identity, so there are
/// no anonymous data routes.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Load-balancer liveness probe. Returns "ok" without touching state.
        .route("/health", get(|| async { "ok" }))
}
