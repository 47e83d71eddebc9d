/// Router Module Index
///
/// Routing is segregated by access level so that authentication and
/// authorization are applied explicitly per module rather than per handler.

/// Unauthenticated endpoints (health check only — this core exposes no
/// anonymous data access).
pub mod public;

/// Self-service endpoints behind the `AuthUser` extractor middleware: the
/// caller's own module visibility, toggles, and preferences.
pub mod authenticated;

/// Administrative endpoints. Authentication comes from the layer above;
/// every handler here additionally runs the `require_admin` guard before
/// touching the store.
pub mod admin;
