use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::state::ScheduleState;

pub fn schedule_routes(state: Arc<ScheduleState>) -> Router {
    Router::new()
        // Weekly templates
        .route(
            "/doctor-branches/{doctor_branch_id}/weekly-schedule",
            get(handlers::get_weekly_schedule).post(handlers::save_weekly_schedule),
        )
        .route("/weekly-schedules/{weekly_schedule_id}", delete(handlers::delete_weekly_schedule))

        // Generation and generated slots
        .route(
            "/doctor-branches/{doctor_branch_id}/generate-preview-slots",
            post(handlers::generate_preview_slots),
        )
        .route("/generate", post(handlers::generate_batch))
        .route("/doctor-branches/{doctor_branch_id}/slots", get(handlers::list_slots))
        .route("/slots/mark-expired", post(handlers::mark_expired))

        // Release rules
        .route("/release-rules", post(handlers::save_release_rule))
        .route(
            "/release-rules/{rule_id}",
            get(handlers::get_release_rule).delete(handlers::delete_release_rule),
        )
        .route(
            "/doctor-branches/{doctor_branch_id}/release-rules",
            get(handlers::list_release_rules),
        )
        .route(
            "/doctor-branches/{doctor_branch_id}/release-rules/batch",
            post(handlers::save_release_rules_batch),
        )
        .route(
            "/doctor-branches/{doctor_branch_id}/release-rules/default",
            post(handlers::create_default_release_rule),
        )

        // Exclusions
        .route("/blocked-slots", post(handlers::save_blocked_slot))
        .route(
            "/blocked-slots/{blocked_slot_id}",
            get(handlers::get_blocked_slot).delete(handlers::delete_blocked_slot),
        )
        .route("/doctors/{doctor_id}/blocked-slots", get(handlers::list_blocked_slots))
        .route("/leaves", post(handlers::save_leave))
        .route("/leaves/{leave_id}", get(handlers::get_leave).delete(handlers::delete_leave))
        .route("/leaves/{leave_id}/approve", post(handlers::approve_leave))
        .route("/leaves/{leave_id}/revoke", post(handlers::revoke_leave))
        .route("/doctor-branches/{doctor_branch_id}/leaves", get(handlers::list_leaves))

        .route("/cache/stats", get(handlers::cache_stats))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware))
        .with_state(state)
}
