use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::ClinicClock;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    weekday_index, BranchGenerationStatus, DoctorBranch, GenerationOutcome, GenerationSummary,
    NewSlot, Slot, SlotKey, SlotReleaseRule, SlotStatus, SlotWindow, TimeRange, WeeklySchedule,
};
use crate::services::cache::ScheduleCache;
use crate::services::exclusion::Exclusions;
use crate::services::lock::GenerationLock;
use crate::services::release::resolve_policy;
use crate::state::ScheduleState;
use crate::store::ScheduleStore;

const BASE_BUDGET: Duration = Duration::from_secs(5);
const BUDGET_PER_RANGE_DAY: Duration = Duration::from_millis(20);
const BATCH_CONCURRENCY: usize = 4;

/// Splits a time range into back-to-back windows of its slot duration.
/// A trailing window that does not fit is dropped.
pub fn tile_time_range(range: &TimeRange) -> Vec<SlotWindow> {
    if range.slot_duration_minutes <= 0 || range.start_time >= range.end_time {
        return Vec::new();
    }

    let step = i64::from(range.slot_duration_minutes) * 60;
    let start = i64::from(range.start_time.num_seconds_from_midnight());
    let end = i64::from(range.end_time.num_seconds_from_midnight());
    let count = (end - start) / step;

    (0..count)
        .filter_map(|i| {
            let window_start = seconds_to_time(start + i * step)?;
            let window_end = seconds_to_time(start + (i + 1) * step)?;
            Some(SlotWindow::new(window_start, window_end))
        })
        .collect()
}

fn seconds_to_time(seconds: i64) -> Option<NaiveTime> {
    NaiveTime::from_num_seconds_from_midnight_opt(u32::try_from(seconds).ok()?, 0)
}

/// Per-invocation time limit, growing with the amount of work up to `ceiling`.
pub fn generation_budget(ceiling: Duration, horizon_days: u32, time_ranges: usize) -> Duration {
    let work = BUDGET_PER_RANGE_DAY.saturating_mul(horizon_days.saturating_mul(time_ranges as u32));
    ceiling.min(BASE_BUDGET.saturating_add(work))
}

/// Writes needed to bring one date in line with the template.
#[derive(Debug, Default)]
pub struct DayPlan {
    pub inserts: Vec<NewSlot>,
    pub updates: Vec<Slot>,
    pub counts: GenerationSummary,
}

pub struct PlanContext<'a> {
    pub doctor_branch_id: i64,
    pub rules: &'a [SlotReleaseRule],
    pub exclusions: &'a Exclusions,
    pub now: NaiveDateTime,
}

/// Expands one weekday template on `date` against the slots already stored.
/// Booked and terminal slots are never touched; windows that already started
/// are skipped.
pub fn plan_day(
    ctx: &PlanContext<'_>,
    date: NaiveDate,
    schedule: &WeeklySchedule,
    existing: &HashMap<SlotKey, Slot>,
) -> DayPlan {
    let mut plan = DayPlan::default();
    let weekday = weekday_index(date);

    for range in &schedule.time_ranges {
        let policy = resolve_policy(ctx.rules, weekday, range.id);

        for window in tile_time_range(range) {
            if date.and_time(window.start_time) <= ctx.now {
                plan.counts.skipped_past += 1;
                continue;
            }

            let key = SlotKey {
                doctor_branch_id: ctx.doctor_branch_id,
                slot_date: date,
                start_time: window.start_time,
                end_time: window.end_time,
            };
            let current = existing.get(&key);

            if current.map_or(false, Slot::is_frozen) {
                plan.counts.skipped_frozen += 1;
                continue;
            }

            if ctx.exclusions.is_excluded(date, &window) {
                match current {
                    Some(slot) => {
                        let mut blocked = slot.clone();
                        blocked.block();
                        plan.updates.push(blocked);
                        plan.counts.blocked += 1;
                    }
                    None => plan.counts.excluded += 1,
                }
                continue;
            }

            let release_at = policy.release_at(date, window.start_time);
            let status = SlotStatus::for_release(release_at, ctx.now);

            match current {
                Some(slot) => {
                    let mut refreshed = slot.clone();
                    refreshed.time_range_id = Some(range.id);
                    refreshed.capacity = range.slot_quantity;
                    refreshed.release_at = release_at;
                    refreshed.status = status;

                    if &refreshed == slot {
                        plan.counts.unchanged += 1;
                    } else {
                        plan.updates.push(refreshed);
                        plan.counts.refreshed += 1;
                    }
                }
                None => {
                    plan.inserts.push(NewSlot {
                        doctor_branch_id: ctx.doctor_branch_id,
                        time_range_id: Some(range.id),
                        slot_date: date,
                        start_time: window.start_time,
                        end_time: window.end_time,
                        capacity: range.slot_quantity,
                        booked_count: 0,
                        release_at,
                        status,
                    });
                    plan.counts.created += 1;
                }
            }
        }
    }

    plan
}

pub struct SlotGenerator {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
    locks: Arc<GenerationLock>,
    clock: ClinicClock,
    ceiling: Duration,
    max_horizon_days: u32,
}

impl SlotGenerator {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            store: state.store.clone(),
            cache: state.cache.clone(),
            locks: state.locks.clone(),
            clock: state.clock,
            ceiling: state.generation_ceiling(),
            max_horizon_days: state.config.max_horizon_days,
        }
    }

    pub async fn generate(&self, doctor_branch_id: i64, horizon_days: u32) -> ScheduleResult<GenerationOutcome> {
        self.generate_at(doctor_branch_id, horizon_days, self.clock.now()).await
    }

    /// Generates `[today, today + horizon_days)` as seen from `now`.
    #[instrument(skip(self))]
    pub async fn generate_at(
        &self,
        doctor_branch_id: i64,
        horizon_days: u32,
        now: NaiveDateTime,
    ) -> ScheduleResult<GenerationOutcome> {
        if horizon_days < 1 || horizon_days > self.max_horizon_days {
            return Err(ScheduleError::Validation(format!(
                "horizon_days must be between 1 and {}, got {}",
                self.max_horizon_days, horizon_days
            )));
        }

        let token = self.locks.acquire(doctor_branch_id, self.ceiling).await?;
        let result = self.run_locked(doctor_branch_id, horizon_days, now).await;

        if let Err(e) = self.locks.release(token).await {
            warn!("Failed to release generation lock for doctor-branch {}: {}", doctor_branch_id, e);
        }
        // Even a failed run may have committed some dates.
        self.cache.invalidate_doctor_branch(doctor_branch_id).await;

        match &result {
            Ok(outcome) => info!("{}", outcome.message()),
            Err(e) => error!("Slot generation for doctor-branch {} failed: {}", doctor_branch_id, e),
        }
        result
    }

    /// Runs independent doctor-branches concurrently. One failure does not
    /// stop the others.
    pub async fn generate_many(&self, doctor_branch_ids: Vec<i64>, horizon_days: u32) -> Vec<BranchGenerationStatus> {
        let now = self.clock.now();
        let mut statuses: Vec<BranchGenerationStatus> = stream::iter(doctor_branch_ids)
            .map(|doctor_branch_id| async move {
                match self.generate_at(doctor_branch_id, horizon_days, now).await {
                    Ok(outcome) => BranchGenerationStatus {
                        doctor_branch_id,
                        success: true,
                        message: outcome.message(),
                    },
                    Err(e) => BranchGenerationStatus {
                        doctor_branch_id,
                        success: false,
                        message: e.to_string(),
                    },
                }
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await;

        statuses.sort_by_key(|status| status.doctor_branch_id);
        statuses
    }

    async fn run_locked(
        &self,
        doctor_branch_id: i64,
        horizon_days: u32,
        now: NaiveDateTime,
    ) -> ScheduleResult<GenerationOutcome> {
        let branch = match self.store.get_doctor_branch(doctor_branch_id).await? {
            Some(branch) if branch.is_active => branch,
            Some(_) => {
                debug!("Doctor-branch {} is inactive", doctor_branch_id);
                return Ok(GenerationOutcome::NoAvailability { doctor_branch_id });
            }
            None => {
                debug!("Doctor-branch {} does not exist", doctor_branch_id);
                return Ok(GenerationOutcome::NoAvailability { doctor_branch_id });
            }
        };

        let schedules = self.store.list_weekly_schedules(doctor_branch_id).await?;
        let range_count: usize = schedules.iter().map(|schedule| schedule.time_ranges.len()).sum();
        if range_count == 0 {
            return Ok(GenerationOutcome::NoAvailability { doctor_branch_id });
        }

        let budget = generation_budget(self.ceiling, horizon_days, range_count);
        match timeout(budget, self.expand(&branch, schedules, horizon_days, now)).await {
            Ok(result) => result.map(GenerationOutcome::Generated),
            Err(_) => Err(ScheduleError::Timeout {
                doctor_branch_id,
                seconds: budget.as_secs_f64().ceil() as u64,
            }),
        }
    }

    async fn expand(
        &self,
        branch: &DoctorBranch,
        schedules: Vec<WeeklySchedule>,
        horizon_days: u32,
        now: NaiveDateTime,
    ) -> ScheduleResult<GenerationSummary> {
        let today = now.date();
        let end = today + chrono::Duration::days(i64::from(horizon_days));

        let rules = self.store.list_release_rules(branch.id).await?;
        let blocked = self
            .store
            .list_blocked_slots(branch.doctor_id, Some(today), Some(end))
            .await?;
        let leaves = self.store.list_leaves(branch.id).await?;
        let exclusions = Exclusions::new(blocked, leaves);

        let existing: HashMap<SlotKey, Slot> = self
            .store
            .list_slots(branch.id, today, Some(end))
            .await?
            .into_iter()
            .map(|slot| (slot.key(), slot))
            .collect();

        let by_weekday: HashMap<i32, WeeklySchedule> = schedules
            .into_iter()
            .map(|schedule| (schedule.weekday, schedule))
            .collect();

        let ctx = PlanContext {
            doctor_branch_id: branch.id,
            rules: &rules,
            exclusions: &exclusions,
            now,
        };

        let mut summary = GenerationSummary {
            doctor_branch_id: branch.id,
            ..GenerationSummary::default()
        };

        for date in today.iter_days().take(horizon_days as usize) {
            summary.dates_scanned += 1;
            let Some(schedule) = by_weekday.get(&weekday_index(date)) else {
                continue;
            };

            let plan = plan_day(&ctx, date, schedule, &existing);

            // Each date is committed on its own; a later failure keeps earlier dates.
            let inserted = self.store.insert_slots(&plan.inserts).await?;
            let mut raced = 0;
            if !plan.updates.is_empty() {
                let refreshed = self.store.refresh_slots(&plan.updates).await?;
                raced = plan.updates.len().saturating_sub(refreshed);
                if raced > 0 {
                    debug!("{} slots on {} were booked during generation, left as is", raced, date);
                }
            }

            let conflicts = plan.inserts.len().saturating_sub(inserted);
            if conflicts > 0 {
                debug!("{} slots on {} already existed, skipped", conflicts, date);
            }

            summary.created += inserted as u32;
            // Rows booked since they were read count as frozen, not as written.
            let raced = raced as u32;
            let raced_refreshed = raced.min(plan.counts.refreshed);
            summary.refreshed += plan.counts.refreshed - raced_refreshed;
            summary.unchanged += plan.counts.unchanged + conflicts as u32;
            summary.blocked += plan.counts.blocked.saturating_sub(raced - raced_refreshed);
            summary.skipped_frozen += raced;
            summary.excluded += plan.counts.excluded;
            summary.skipped_frozen += plan.counts.skipped_frozen;
            summary.skipped_past += plan.counts.skipped_past;
        }

        Ok(summary)
    }
}
