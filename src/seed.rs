use crate::error::ApiResult;
use crate::models::CreateModuleRequest;
use crate::repository::RepositoryState;

fn module(
    name: &str,
    display_name: &str,
    description: &str,
    icon: &str,
    sort_order: i32,
    requires_admin: bool,
) -> CreateModuleRequest {
    CreateModuleRequest {
        name: name.to_string(),
        display_name: display_name.to_string(),
        description: Some(description.to_string()),
        icon: Some(icon.to_string()),
        is_active: true,
        requires_admin,
        sort_order,
    }
}

/// The stock module catalog shipped with a fresh installation. `dashboard`
/// and `admin` are the two structurally permanent entries; `admin` is the
/// only stock module gated to administrators.
fn default_modules() -> Vec<CreateModuleRequest> {
    vec![
        module(
            "dashboard",
            "Dashboard",
            "Main dashboard with overview and statistics",
            "dashboard",
            1,
            false,
        ),
        module(
            "boats",
            "Fleet Management",
            "Manage your boats and fleet information",
            "boat",
            2,
            false,
        ),
        module(
            "trips",
            "Trip Logbook",
            "Log and track your sailing trips with GPS support",
            "map",
            3,
            false,
        ),
        module(
            "equipment",
            "Equipment Tracker",
            "Manage your sailing equipment and inventory",
            "tools",
            4,
            false,
        ),
        module(
            "maintenance",
            "Maintenance Log",
            "Track maintenance records and schedules",
            "wrench",
            5,
            false,
        ),
        module(
            "events",
            "Events Calendar",
            "Manage sailing events, races, and gatherings",
            "calendar",
            6,
            false,
        ),
        module(
            "navigation",
            "Weather & Routes",
            "Weather information and route planning tools",
            "compass",
            7,
            false,
        ),
        module(
            "social",
            "Crew Network",
            "Connect with other sailors and crew members",
            "users",
            8,
            false,
        ),
        module(
            "admin",
            "Admin Panel",
            "System administration and user management",
            "settings",
            99,
            true,
        ),
    ]
}

/// Seeds any missing stock modules through the registry's own create
/// operation. Idempotent: names that already exist are left untouched, so
/// operator edits (disabled modules, reordered navigation) survive restarts.
pub async fn ensure_default_modules(repo: &RepositoryState) -> ApiResult<usize> {
    let mut created = 0;
    for request in default_modules() {
        if repo.get_module_by_name(&request.name).await?.is_none() {
            let name = request.name.clone();
            repo.create_module(request).await?;
            tracing::info!(module = %name, "seeded default module");
            created += 1;
        }
    }
    Ok(created)
}
