use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    models::{Module, Permission},
};

/// Modules that can never be deleted from the registry, regardless of caller.
pub const DELETE_PROTECTED_MODULES: [&str; 2] = ["dashboard", "admin"];

/// The single module whose grant can never be revoked or disabled through the
/// permission store: once granted, `dashboard` stays granted and enabled.
///
/// Note the deliberate asymmetry with [`DELETE_PROTECTED_MODULES`]: `admin` is
/// delete-protected but its grants remain revocable. This mirrors observed
/// product behavior and is recorded as a product decision, not a bug.
pub const PINNED_MODULE: &str = "dashboard";

/// True if the module's registry row is structurally permanent.
pub fn is_delete_protected(module_name: &str) -> bool {
    DELETE_PROTECTED_MODULES.contains(&module_name)
}

/// True if the module's grants can neither be revoked nor disabled.
pub fn is_pinned(module_name: &str) -> bool {
    module_name == PINNED_MODULE
}

/// The visibility decision: "module M is usable by user U".
///
/// All four conjuncts are evaluated fresh on every query — nothing here is
/// cached or denormalized, because grant existence, the enabled flag, the
/// module's active flag, and the user's admin flag can each change
/// independently.
pub fn usable(user_is_admin: bool, module: &Module, permission: Option<&Permission>) -> bool {
    let enabled_grant = permission.map(|p| p.is_enabled).unwrap_or(false);
    enabled_grant && module.is_active && (!module.requires_admin || user_is_admin)
}

/// Guard for admin-only operations, called before any store access so a
/// rejected request has no effect on state. Failing the guard is a
/// `PermissionDenied` (caller's role is insufficient), never conflated with
/// "module doesn't exist".
pub fn require_admin(caller: &AuthUser) -> ApiResult<()> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied)
    }
}
