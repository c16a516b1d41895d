//! HTTP surface
//!
//! One module per surface area; `build_router` wires them to the shared
//! state. All bodies are JSON and all errors are `{"error": message}`.

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod account_routes;
pub mod admin_routes;
pub mod filesystem_routes;
pub mod gpu_routes;
pub mod launch_routes;
pub mod seed_routes;
pub mod vm_routes;

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "charon-server",
        "version": crate::VERSION,
    }))
}

/// Assemble the full router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/me", get(account_routes::me))
        .route("/api/gpu-types", get(gpu_routes::list_gpu_types))
        .route("/api/vms", get(vm_routes::list_vms))
        .route("/api/vms/launch", post(vm_routes::launch_vm))
        .route("/api/vms/terminate", post(vm_routes::terminate_vm))
        .route("/api/vms/restart", post(vm_routes::restart_vm))
        .route("/api/filesystems", get(filesystem_routes::list_filesystems))
        .route(
            "/api/launch-requests",
            get(launch_routes::list_requests).post(launch_routes::submit_request),
        )
        .route("/api/launch-requests/cancel", post(launch_routes::cancel_request))
        .route(
            "/api/admin/candidates",
            get(admin_routes::list_candidates)
                .post(admin_routes::add_candidate)
                .delete(admin_routes::remove_candidate),
        )
        .route("/api/admin/quota", post(admin_routes::set_quota))
        .route(
            "/api/admin/settings",
            get(admin_routes::get_settings).put(admin_routes::put_settings),
        )
        .route("/api/admin/filesystems", delete(filesystem_routes::delete_filesystem))
        .route("/api/seed-complete", post(seed_routes::seed_complete))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
