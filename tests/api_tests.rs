use chrono::Utc;
use helm_portal::{
    AppConfig, AppState, MemoryRepository, RepositoryState, create_router,
    models::{Module, Permission, User},
    seed,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

pub struct TestApp {
    pub address: String,
    pub repo: RepositoryState,
}

/// Boots the full router on an ephemeral port, backed by the in-memory
/// repository and the Local config (which enables the `x-user-id` auth
/// bypass used by every request below).
async fn spawn_app() -> TestApp {
    let repo = Arc::new(MemoryRepository::new()) as RepositoryState;
    let config = AppConfig::default();

    let state = AppState {
        repo: repo.clone(),
        config,
    };
    let router = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp { address, repo }
}

async fn seed_user(app: &TestApp, is_admin: bool) -> Uuid {
    let id = Uuid::new_v4();
    app.repo
        .create_user(User {
            id,
            username: format!("user-{}", &id.to_string()[..8]),
            email: format!("{}@example.com", &id.to_string()[..8]),
            is_admin,
            is_active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("req fail");
    assert!(response.status().is_success());
}

#[tokio::test]
async fn test_unauthenticated_requests_are_rejected() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/me/modules", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/admin/modules", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_module_lifecycle_and_visibility() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    // Admin registers the module.
    let response = client
        .post(format!("{}/admin/modules", app.address))
        .header("x-user-id", admin_id.to_string())
        .json(&json!({
            "name": "races", "display_name": "Race Tracker", "sort_order": 5
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let module: Module = response.json().await.unwrap();
    assert!(module.is_active);
    assert!(!module.requires_admin);

    // Not yet granted: invisible to the user.
    let response = client
        .get(format!("{}/me/modules", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let visible: Vec<Value> = response.json().await.unwrap();
    assert!(visible.is_empty());

    // Admin grants it; it appears with is_enabled=true.
    let response = client
        .post(format!(
            "{}/admin/users/{}/modules/{}",
            app.address, user_id, module.id
        ))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let permission: Permission = response.json().await.unwrap();
    assert!(permission.is_enabled);
    assert_eq!(permission.granted_by, Some(admin_id));

    let response = client
        .get(format!("{}/me/modules", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let visible: Vec<Value> = response.json().await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0]["name"], "races");
    assert_eq!(visible[0]["is_enabled"], true);

    // Admin deactivates the module globally: it disappears from the user's
    // view but the grant row survives in the audit view.
    let response = client
        .put(format!("{}/admin/modules/{}", app.address, module.id))
        .header("x-user-id", admin_id.to_string())
        .json(&json!({"is_active": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/me/modules", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let visible: Vec<Value> = response.json().await.unwrap();
    assert!(visible.is_empty());

    let response = client
        .get(format!("{}/admin/users/{}/permissions", app.address, user_id))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    let rows: Vec<Value> = response.json().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["module_name"], "races");
    assert_eq!(rows[0]["is_enabled"], true);
}

#[tokio::test]
async fn test_duplicate_grant_is_conflict() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    let module = app
        .repo
        .create_module(helm_portal::models::CreateModuleRequest {
            name: "trips".to_string(),
            display_name: "Trip Logbook".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let grant_url = format!(
        "{}/admin/users/{}/modules/{}",
        app.address, user_id, module.id
    );
    let response = client
        .post(&grant_url)
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Second grant for the same pair is a conflict, not an upsert.
    let response = client
        .post(&grant_url)
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_toggle_without_grant_is_forbidden_and_creates_nothing() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let user_id = seed_user(&app, false).await;

    let module = app
        .repo
        .create_module(helm_portal::models::CreateModuleRequest {
            name: "boats".to_string(),
            display_name: "Fleet Management".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let response = client
        .post(format!(
            "{}/me/modules/{}/toggle",
            app.address, module.id
        ))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "forbidden");

    // No row was silently created.
    assert!(
        app.repo
            .get_permission(user_id, module.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_toggle_flips_between_granted_states() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    let module = app
        .repo
        .create_module(helm_portal::models::CreateModuleRequest {
            name: "events".to_string(),
            display_name: "Events Calendar".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    app.repo
        .grant_permission(user_id, module.id, Some(admin_id))
        .await
        .unwrap();

    let toggle_url = format!("{}/me/modules/{}/toggle", app.address, module.id);

    let response = client
        .post(&toggle_url)
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let permission: Permission = response.json().await.unwrap();
    assert!(!permission.is_enabled);

    let response = client
        .post(&toggle_url)
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let permission: Permission = response.json().await.unwrap();
    assert!(permission.is_enabled);
}

#[tokio::test]
async fn test_dashboard_is_pinned() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    seed::ensure_default_modules(&app.repo).await.unwrap();
    let dashboard = app
        .repo
        .get_module_by_name("dashboard")
        .await
        .unwrap()
        .unwrap();

    // Granting dashboard works normally.
    let response = client
        .post(format!(
            "{}/admin/users/{}/modules/{}",
            app.address, user_id, dashboard.id
        ))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Toggling it is forbidden, even by the owner.
    let response = client
        .post(format!(
            "{}/me/modules/{}/toggle",
            app.address, dashboard.id
        ))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Disabling it is forbidden...
    let response = client
        .put(format!(
            "{}/me/modules/{}/enabled",
            app.address, dashboard.id
        ))
        .header("x-user-id", user_id.to_string())
        .json(&json!({"enabled": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // ...but re-asserting enabled=true is allowed.
    let response = client
        .put(format!(
            "{}/me/modules/{}/enabled",
            app.address, dashboard.id
        ))
        .header("x-user-id", user_id.to_string())
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Revoking it is forbidden even for the admin.
    let response = client
        .delete(format!(
            "{}/admin/users/{}/modules/{}",
            app.address, user_id, dashboard.id
        ))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn test_protected_modules_refuse_deletion_others_cascade() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    seed::ensure_default_modules(&app.repo).await.unwrap();

    for name in ["dashboard", "admin"] {
        let module = app.repo.get_module_by_name(name).await.unwrap().unwrap();
        let response = client
            .delete(format!("{}/admin/modules/{}", app.address, module.id))
            .header("x-user-id", admin_id.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403, "deleting '{}' must be refused", name);
    }

    // A regular module deletes fine and takes its grants with it.
    let boats = app.repo.get_module_by_name("boats").await.unwrap().unwrap();
    app.repo
        .grant_permission(user_id, boats.id, Some(admin_id))
        .await
        .unwrap();

    let response = client
        .delete(format!("{}/admin/modules/{}", app.address, boats.id))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(
        app.repo
            .get_permission(user_id, boats.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_admin_revoke_of_admin_module_stays_allowed() {
    // Deliberate asymmetry: `admin` refuses deletion but its grants are
    // revocable, unlike `dashboard`.
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    seed::ensure_default_modules(&app.repo).await.unwrap();
    let admin_module = app.repo.get_module_by_name("admin").await.unwrap().unwrap();
    app.repo
        .grant_permission(user_id, admin_module.id, Some(admin_id))
        .await
        .unwrap();

    let response = client
        .delete(format!(
            "{}/admin/users/{}/modules/{}",
            app.address, user_id, admin_module.id
        ))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn test_non_admin_cannot_mutate_registry() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let user_id = seed_user(&app, false).await;

    let response = client
        .post(format!("{}/admin/modules", app.address))
        .header("x-user-id", user_id.to_string())
        .json(&json!({"name": "sneaky", "display_name": "Sneaky"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    // Access-control failure, distinct from the structural `forbidden` kind.
    assert_eq!(body["error"], "permission_denied");

    // Rejection happens before any store access: nothing was created.
    assert!(
        app.repo
            .get_module_by_name("sneaky")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_create_module_validation_and_conflict() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;

    let response = client
        .post(format!("{}/admin/modules", app.address))
        .header("x-user-id", admin_id.to_string())
        .json(&json!({"name": "", "display_name": "Nameless"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let payload = json!({"name": "races", "display_name": "Race Tracker"});
    let response = client
        .post(format!("{}/admin/modules", app.address))
        .header("x-user-id", admin_id.to_string())
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let response = client
        .post(format!("{}/admin/modules", app.address))
        .header("x-user-id", admin_id.to_string())
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_admin_only_module_hidden_from_non_admin() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    let module = app
        .repo
        .create_module(helm_portal::models::CreateModuleRequest {
            name: "audit".to_string(),
            display_name: "Audit Log".to_string(),
            requires_admin: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Both users hold enabled grants.
    for uid in [admin_id, user_id] {
        app.repo
            .grant_permission(uid, module.id, Some(admin_id))
            .await
            .unwrap();
    }

    let response = client
        .get(format!("{}/me/modules", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let visible: Vec<Value> = response.json().await.unwrap();
    assert!(visible.is_empty());

    let response = client
        .get(format!("{}/me/modules", app.address))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    let visible: Vec<Value> = response.json().await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0]["name"], "audit");
}

#[tokio::test]
async fn test_admin_audit_view_annotates_every_module() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let admin_id = seed_user(&app, true).await;
    let user_id = seed_user(&app, false).await;

    seed::ensure_default_modules(&app.repo).await.unwrap();
    let dashboard = app
        .repo
        .get_module_by_name("dashboard")
        .await
        .unwrap()
        .unwrap();
    app.repo
        .grant_permission(user_id, dashboard.id, Some(admin_id))
        .await
        .unwrap();

    let response = client
        .get(format!("{}/admin/users/{}/modules", app.address, user_id))
        .header("x-user-id", admin_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let statuses: Vec<Value> = response.json().await.unwrap();
    // Every registry module appears, granted or not.
    assert_eq!(statuses.len(), 9);

    let dash = statuses.iter().find(|s| s["name"] == "dashboard").unwrap();
    assert_eq!(dash["has_permission"], true);
    assert_eq!(dash["is_enabled"], true);
    let boats = statuses.iter().find(|s| s["name"] == "boats").unwrap();
    assert_eq!(boats["has_permission"], false);
    assert!(boats["granted_at"].is_null());
}

#[tokio::test]
async fn test_preferences_round_trip() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let user_id = seed_user(&app, false).await;

    let response = client
        .put(format!("{}/me/preferences", app.address))
        .header("x-user-id", user_id.to_string())
        .json(&json!({"preferences": {"theme": "dark", "k": {"a": 1}}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let mut written: Vec<String> = body["updated"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    written.sort();
    assert_eq!(written, vec!["k".to_string(), "theme".to_string()]);

    // Plain string comes back verbatim.
    let response = client
        .get(format!("{}/me/preferences/theme", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["value"], "dark");

    // Structured value comes back structurally equal.
    let response = client
        .get(format!("{}/me/preferences/k", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["value"], json!({"a": 1}));

    // Overwrite by key is an upsert, not a conflict.
    let response = client
        .put(format!("{}/me/preferences", app.address))
        .header("x-user-id", user_id.to_string())
        .json(&json!({"preferences": {"theme": "light"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/me/preferences", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    let all: Value = response.json().await.unwrap();
    assert_eq!(all["theme"], "light");
    assert_eq!(all["k"], json!({"a": 1}));

    // Unset key is a 404.
    let response = client
        .get(format!("{}/me/preferences/unset", app.address))
        .header("x-user-id", user_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
