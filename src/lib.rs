use axum::{
    Router,
    extract::{FromRef, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::Response,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod repository;
pub mod seed;

// Routing segregation (Public, Authenticated, Admin).
pub mod routes;
use auth::AuthUser;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use repository::{MemoryRepository, PostgresRepository, RepositoryState};

/// ApiDoc
///
/// Aggregates every annotated handler and schema into the OpenAPI document
/// served at `/api-docs/openapi.json` (browsable via `/swagger-ui`).
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_my_modules, handlers::toggle_module, handlers::set_module_enabled,
        handlers::get_my_preferences, handlers::get_my_preference, handlers::set_my_preferences,
        handlers::list_modules_admin, handlers::create_module, handlers::update_module,
        handlers::delete_module, handlers::get_module_permissions,
        handlers::grant_module, handlers::revoke_module,
        handlers::get_user_module_status, handlers::get_user_permissions,
    ),
    components(
        schemas(
            models::Module, models::Permission, models::PermissionView,
            models::AvailableModule, models::ModuleAccessStatus,
            models::CreateModuleRequest, models::UpdateModuleRequest,
            models::SetEnabledRequest, models::SetPreferencesRequest,
            models::SetPreferencesResponse, models::PreferenceValueResponse,
            models::User,
        )
    ),
    tags(
        (name = "helm-portal", description = "Module access control API")
    )
)]
struct ApiDoc;

/// AppState
///
/// The single shared container for the request-scoped services: the
/// persistence layer behind its trait object and the immutable configuration.
/// There is no other long-lived state — every operation runs to completion
/// within one request.
#[derive(Clone)]
pub struct AppState {
    /// Persistence behind the `Repository` trait (Postgres or in-memory).
    pub repo: RepositoryState,
    /// Loaded, immutable environment configuration.
    pub config: AppConfig,
}

// FromRef implementations let extractors (notably AuthUser) pull individual
// components out of the shared state.

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// auth_middleware
///
/// Enforces authentication for the protected route groups by running the
/// `AuthUser` extractor; a failed extraction rejects with 401 before the
/// handler executes. Role checks happen later, inside the handlers.
async fn auth_middleware(_auth_user: AuthUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// create_router
///
/// Assembles the routing tree, the authentication layer, and the
/// observability stack (request IDs, trace spans, CORS).
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Public routes: no middleware.
        .merge(public::public_routes())
        // Self-service routes: authentication required.
        .merge(
            authenticated::authenticated_routes()
                .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        // Admin routes: authenticated here, role-checked inside each handler.
        .nest(
            "/admin",
            admin::admin_routes()
                .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                // Every request gets a correlation UUID...
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                // ...which the trace span carries for all log lines...
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                // ...and which is echoed back to the client.
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// Span factory for `TraceLayer`: includes the method, URI, and the request
/// correlation ID so every log line of a request can be tied together.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
