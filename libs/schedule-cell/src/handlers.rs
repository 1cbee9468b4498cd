use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use tracing::debug;

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_models::Status;

use crate::error::ScheduleError;
use crate::models::{
    BatchGenerateRequest, BatchReleaseRulesRequest, BlockedSlot, BlockedSlotRequest,
    BranchGenerationStatus, DoctorLeave, DoctorLeaveRequest, GenerateQuery, MarkExpiredRequest,
    ReleaseRuleRequest, SaveWeeklyScheduleRequest, Slot, SlotQuery, SlotReleaseRule,
    WeeklySchedule,
};
use crate::services::{
    CacheStats, ExclusionService, ReleaseRuleService, SlotGenerator, SlotService,
    WeeklyScheduleService,
};
use crate::state::ScheduleState;

// ==============================================================================
// WEEKLY SCHEDULE
// ==============================================================================

#[axum::debug_handler]
pub async fn get_weekly_schedule(
    State(state): State<Arc<ScheduleState>>,
    Extension(user): Extension<User>,
    Path(doctor_branch_id): Path<i64>,
) -> Result<Json<Vec<WeeklySchedule>>, AppError> {
    let service = WeeklyScheduleService::new(&state);
    let schedules = service
        .get_weekly_schedule(&user.tenant_id, doctor_branch_id)
        .await?;
    Ok(Json(schedules))
}

#[axum::debug_handler]
pub async fn save_weekly_schedule(
    State(state): State<Arc<ScheduleState>>,
    Extension(user): Extension<User>,
    Path(doctor_branch_id): Path<i64>,
    Json(request): Json<SaveWeeklyScheduleRequest>,
) -> Result<Json<Status>, AppError> {
    debug!("User {} saving weekly schedule of doctor-branch {}", user.id, doctor_branch_id);

    let service = WeeklyScheduleService::new(&state);
    let saved = service.save_weekly_schedule(doctor_branch_id, request).await?;

    Ok(Json(Status::ok(format!(
        "Saved weekly schedule for doctor-branch {} ({} weekdays)",
        doctor_branch_id,
        saved.len()
    ))))
}

#[axum::debug_handler]
pub async fn delete_weekly_schedule(
    State(state): State<Arc<ScheduleState>>,
    Path(weekly_schedule_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    let service = WeeklyScheduleService::new(&state);
    let deleted = service.delete_weekly_schedule(weekly_schedule_id).await?;

    Ok(Json(Status::ok(format!(
        "Deleted weekly schedule {} of doctor-branch {}",
        deleted.id, deleted.doctor_branch_id
    ))))
}

// ==============================================================================
// GENERATION & SLOTS
// ==============================================================================

#[axum::debug_handler]
pub async fn generate_preview_slots(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_branch_id): Path<i64>,
    Query(query): Query<GenerateQuery>,
) -> Result<Json<Status>, AppError> {
    let horizon_days = query.horizon_days.unwrap_or(state.config.default_horizon_days);

    let generator = SlotGenerator::new(&state);
    let outcome = generator.generate(doctor_branch_id, horizon_days).await?;

    Ok(Json(Status::ok(outcome.message())))
}

#[axum::debug_handler]
pub async fn generate_batch(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<Vec<BranchGenerationStatus>>, AppError> {
    if request.doctor_branch_ids.is_empty() {
        return Err(ScheduleError::Validation("doctor_branch_ids must not be empty".to_string()).into());
    }
    let horizon_days = request.horizon_days.unwrap_or(state.config.default_horizon_days);

    let generator = SlotGenerator::new(&state);
    let results = generator
        .generate_many(request.doctor_branch_ids, horizon_days)
        .await;
    Ok(Json(results))
}

#[axum::debug_handler]
pub async fn list_slots(
    State(state): State<Arc<ScheduleState>>,
    Extension(user): Extension<User>,
    Path(doctor_branch_id): Path<i64>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Vec<Slot>>, AppError> {
    let service = SlotService::new(&state);
    let slots = service
        .list_slots(&user.tenant_id, doctor_branch_id, query.date)
        .await?;
    Ok(Json(slots))
}

#[axum::debug_handler]
pub async fn mark_expired(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<MarkExpiredRequest>,
) -> Result<Json<Status>, AppError> {
    let service = SlotService::new(&state);
    let expired = service.mark_expired(request.as_of).await?;
    Ok(Json(Status::ok(format!("Marked {} slots expired", expired.len()))))
}

// ==============================================================================
// RELEASE RULES
// ==============================================================================

#[axum::debug_handler]
pub async fn save_release_rule(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<ReleaseRuleRequest>,
) -> Result<Json<Status>, AppError> {
    let service = ReleaseRuleService::new(&state);
    let saved = service.save_rule(request).await?;

    Ok(Json(Status::ok(format!(
        "Saved {} release rule {} for doctor-branch {}",
        saved.scope, saved.id, saved.doctor_branch_id
    ))))
}

#[axum::debug_handler]
pub async fn get_release_rule(
    State(state): State<Arc<ScheduleState>>,
    Path(rule_id): Path<i64>,
) -> Result<Json<SlotReleaseRule>, AppError> {
    let service = ReleaseRuleService::new(&state);
    Ok(Json(service.get_rule(rule_id).await?))
}

#[axum::debug_handler]
pub async fn delete_release_rule(
    State(state): State<Arc<ScheduleState>>,
    Path(rule_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    let service = ReleaseRuleService::new(&state);
    service.delete_rule(rule_id).await?;
    Ok(Json(Status::ok(format!("Deleted release rule {}", rule_id))))
}

#[axum::debug_handler]
pub async fn list_release_rules(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_branch_id): Path<i64>,
) -> Result<Json<Vec<SlotReleaseRule>>, AppError> {
    let service = ReleaseRuleService::new(&state);
    Ok(Json(service.list_rules(doctor_branch_id).await?))
}

#[axum::debug_handler]
pub async fn save_release_rules_batch(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_branch_id): Path<i64>,
    Json(request): Json<BatchReleaseRulesRequest>,
) -> Result<Json<Status>, AppError> {
    let service = ReleaseRuleService::new(&state);
    let saved = service
        .save_rules_batch(doctor_branch_id, request.rules)
        .await?;

    Ok(Json(Status::ok(format!(
        "Saved {} release rules for doctor-branch {}",
        saved.len(),
        doctor_branch_id
    ))))
}

#[axum::debug_handler]
pub async fn create_default_release_rule(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_branch_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    let service = ReleaseRuleService::new(&state);
    let message = match service.create_default_rule(doctor_branch_id).await? {
        Some(rule) => format!("Created default release rule {}", rule.id),
        None => format!("Doctor-branch {} already has a default release rule", doctor_branch_id),
    };
    Ok(Json(Status::ok(message)))
}

// ==============================================================================
// BLOCKED SLOTS
// ==============================================================================

#[axum::debug_handler]
pub async fn save_blocked_slot(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<BlockedSlotRequest>,
) -> Result<Json<Status>, AppError> {
    let service = ExclusionService::new(&state);
    let saved = service.save_blocked_slot(request).await?;

    Ok(Json(Status::ok(format!(
        "Saved blocked slot {} for doctor {} on {}",
        saved.id, saved.doctor_id, saved.slot_date
    ))))
}

#[axum::debug_handler]
pub async fn get_blocked_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(blocked_slot_id): Path<i64>,
) -> Result<Json<BlockedSlot>, AppError> {
    let service = ExclusionService::new(&state);
    Ok(Json(service.get_blocked_slot(blocked_slot_id).await?))
}

#[axum::debug_handler]
pub async fn delete_blocked_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(blocked_slot_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    let service = ExclusionService::new(&state);
    service.delete_blocked_slot(blocked_slot_id).await?;
    Ok(Json(Status::ok(format!("Deleted blocked slot {}", blocked_slot_id))))
}

#[axum::debug_handler]
pub async fn list_blocked_slots(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_id): Path<i64>,
) -> Result<Json<Vec<BlockedSlot>>, AppError> {
    let service = ExclusionService::new(&state);
    Ok(Json(service.list_blocked_slots(doctor_id).await?))
}

// ==============================================================================
// LEAVE
// ==============================================================================

#[axum::debug_handler]
pub async fn save_leave(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<DoctorLeaveRequest>,
) -> Result<Json<Status>, AppError> {
    let service = ExclusionService::new(&state);
    let saved = service.save_leave(request).await?;

    Ok(Json(Status::ok(format!(
        "Saved leave {} for doctor-branch {} ({})",
        saved.id,
        saved.doctor_branch_id,
        if saved.approved { "approved" } else { "pending approval" }
    ))))
}

#[axum::debug_handler]
pub async fn get_leave(
    State(state): State<Arc<ScheduleState>>,
    Path(leave_id): Path<i64>,
) -> Result<Json<DoctorLeave>, AppError> {
    let service = ExclusionService::new(&state);
    Ok(Json(service.get_leave(leave_id).await?))
}

#[axum::debug_handler]
pub async fn delete_leave(
    State(state): State<Arc<ScheduleState>>,
    Path(leave_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    let service = ExclusionService::new(&state);
    service.delete_leave(leave_id).await?;
    Ok(Json(Status::ok(format!("Deleted leave {}", leave_id))))
}

#[axum::debug_handler]
pub async fn approve_leave(
    State(state): State<Arc<ScheduleState>>,
    Extension(user): Extension<User>,
    Path(leave_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    debug!("User {} approving leave {}", user.id, leave_id);

    let service = ExclusionService::new(&state);
    service.approve_leave(leave_id).await?;
    Ok(Json(Status::ok(format!("Approved leave {}", leave_id))))
}

#[axum::debug_handler]
pub async fn revoke_leave(
    State(state): State<Arc<ScheduleState>>,
    Extension(user): Extension<User>,
    Path(leave_id): Path<i64>,
) -> Result<Json<Status>, AppError> {
    debug!("User {} revoking leave {}", user.id, leave_id);

    let service = ExclusionService::new(&state);
    service.revoke_leave(leave_id).await?;
    Ok(Json(Status::ok(format!("Revoked approval of leave {}", leave_id))))
}

#[axum::debug_handler]
pub async fn list_leaves(
    State(state): State<Arc<ScheduleState>>,
    Path(doctor_branch_id): Path<i64>,
) -> Result<Json<Vec<DoctorLeave>>, AppError> {
    let service = ExclusionService::new(&state);
    Ok(Json(service.list_leaves(doctor_branch_id).await?))
}

// ==============================================================================
// CACHE
// ==============================================================================

#[axum::debug_handler]
pub async fn cache_stats(State(state): State<Arc<ScheduleState>>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}
