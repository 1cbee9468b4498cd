use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::ClinicClock;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    NewReleaseRule, NewTimeRange, NewWeeklySchedule, ReleaseScope, SaveWeeklyScheduleRequest,
    SlotPurge, SlotStatus, WeeklySchedule, DEFAULT_SLOT_DURATION_MINUTES, DEFAULT_SLOT_QUANTITY,
};
use crate::services::cache::{CacheKey, CachedValue, ScheduleCache};
use crate::services::release::{validate_weekday, ReleaseRuleService};
use crate::state::ScheduleState;
use crate::store::ScheduleStore;

const MINUTES_PER_DAY: i32 = 24 * 60;

/// Statuses of generated slots that a template change may remove.
const REPLACEABLE: [SlotStatus; 3] = [SlotStatus::PendingRelease, SlotStatus::Open, SlotStatus::Blocked];

pub struct WeeklyScheduleService {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
    clock: ClinicClock,
    rules: ReleaseRuleService,
}

impl WeeklyScheduleService {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            store: state.store.clone(),
            cache: state.cache.clone(),
            clock: state.clock,
            rules: ReleaseRuleService::new(state),
        }
    }

    pub async fn get_weekly_schedule(&self, tenant_id: &str, doctor_branch_id: i64) -> ScheduleResult<Vec<WeeklySchedule>> {
        let key = CacheKey::weekly_schedule(tenant_id, doctor_branch_id);
        if let Some(cached) = self.cache.get_weekly_schedule(&key).await {
            return Ok(cached);
        }

        let ticket = self.cache.ticket(doctor_branch_id).await;
        let schedules = self.store.list_weekly_schedules(doctor_branch_id).await?;
        self.cache.put(key, CachedValue::WeeklySchedule(schedules.clone()), ticket).await;
        Ok(schedules)
    }

    /// Replaces the whole week of a doctor-branch.
    #[instrument(skip(self, request))]
    pub async fn save_weekly_schedule(
        &self,
        doctor_branch_id: i64,
        request: SaveWeeklyScheduleRequest,
    ) -> ScheduleResult<Vec<WeeklySchedule>> {
        let week = validate_week(&request)?;

        if self.store.get_doctor_branch(doctor_branch_id).await?.is_none() {
            return Err(ScheduleError::NotFound(format!("Doctor-branch {}", doctor_branch_id)));
        }

        let previous = self.store.list_weekly_schedules(doctor_branch_id).await?;
        let saved = self.store.replace_weekly_schedules(doctor_branch_id, &week).await?;

        let old_range_ids: Vec<i64> = previous.iter().flat_map(WeeklySchedule::time_range_ids).collect();
        if !old_range_ids.is_empty() {
            let purged = self
                .purge_range_slots(doctor_branch_id, old_range_ids)
                .await?;
            debug!("Removed {} unbooked slots of the previous week", purged);
        }

        self.deactivate_dangling_rules(doctor_branch_id, &saved).await?;
        self.rules.ensure_default_rule(doctor_branch_id).await?;
        self.cache.invalidate_doctor_branch(doctor_branch_id).await;

        info!(
            "Saved weekly schedule for doctor-branch {} ({} weekdays)",
            doctor_branch_id,
            saved.len()
        );
        Ok(saved)
    }

    pub async fn delete_weekly_schedule(&self, id: i64) -> ScheduleResult<WeeklySchedule> {
        let schedule = self
            .store
            .get_weekly_schedule(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(format!("Weekly schedule {}", id)))?;

        self.store.delete_weekly_schedule(id).await?;

        let range_ids = schedule.time_range_ids();
        if !range_ids.is_empty() {
            let purged = self.purge_range_slots(schedule.doctor_branch_id, range_ids).await?;
            debug!("Removed {} unbooked slots of weekly schedule {}", purged, id);
        }

        let remaining = self.store.list_weekly_schedules(schedule.doctor_branch_id).await?;
        self.deactivate_dangling_rules(schedule.doctor_branch_id, &remaining).await?;
        self.cache.invalidate_doctor_branch(schedule.doctor_branch_id).await;

        info!(
            "Deleted weekly schedule {} (weekday {}) of doctor-branch {}",
            id, schedule.weekday, schedule.doctor_branch_id
        );
        Ok(schedule)
    }

    async fn purge_range_slots(&self, doctor_branch_id: i64, time_range_ids: Vec<i64>) -> ScheduleResult<usize> {
        let purge = SlotPurge {
            from: Some(self.clock.today()),
            time_range_ids: Some(time_range_ids),
            statuses: Some(REPLACEABLE.to_vec()),
            ..SlotPurge::default()
        };
        self.store.delete_unbooked_slots(doctor_branch_id, &purge).await
    }

    /// TIME_RANGE rules whose range is gone can never apply again.
    async fn deactivate_dangling_rules(&self, doctor_branch_id: i64, current: &[WeeklySchedule]) -> ScheduleResult<()> {
        let live: HashSet<i64> = current.iter().flat_map(WeeklySchedule::time_range_ids).collect();
        let rules = self.store.list_release_rules(doctor_branch_id).await?;

        for rule in rules.iter().filter(|rule| {
            rule.is_active
                && rule.scope == ReleaseScope::TimeRange
                && rule.time_range_id.map_or(true, |id| !live.contains(&id))
        }) {
            warn!("Deactivating release rule {}: its time range no longer exists", rule.id);
            let update = NewReleaseRule {
                doctor_branch_id,
                scope: rule.scope,
                weekday: rule.weekday,
                time_range_id: rule.time_range_id,
                release_days_before: rule.release_days_before,
                release_time: rule.release_time,
                release_minutes_before_slot: rule.release_minutes_before_slot,
                is_active: false,
            };
            self.store.update_release_rule(rule.id, &update).await?;
        }
        Ok(())
    }
}

/// Checks a full week and applies field defaults. Weekdays without ranges
/// are dropped.
pub fn validate_week(request: &SaveWeeklyScheduleRequest) -> ScheduleResult<Vec<NewWeeklySchedule>> {
    let mut seen = HashSet::new();
    let mut week = Vec::with_capacity(request.schedules.len());

    for schedule in &request.schedules {
        validate_weekday(schedule.weekday)?;
        if !seen.insert(schedule.weekday) {
            return Err(ScheduleError::Validation(format!(
                "Weekday {} appears more than once",
                schedule.weekday
            )));
        }

        let mut ranges = Vec::with_capacity(schedule.time_ranges.len());
        for input in &schedule.time_ranges {
            let range = NewTimeRange {
                start_time: input.start_time,
                end_time: input.end_time,
                slot_duration_minutes: input.slot_duration_minutes.unwrap_or(DEFAULT_SLOT_DURATION_MINUTES),
                slot_quantity: input.slot_quantity.unwrap_or(DEFAULT_SLOT_QUANTITY),
            };

            if range.start_time >= range.end_time {
                return Err(ScheduleError::Validation(format!(
                    "Time range {}-{} on weekday {} must start before it ends",
                    range.start_time, range.end_time, schedule.weekday
                )));
            }
            if range.slot_duration_minutes <= 0 || range.slot_duration_minutes > MINUTES_PER_DAY {
                return Err(ScheduleError::Validation(format!(
                    "slot_duration_minutes must be between 1 and {}",
                    MINUTES_PER_DAY
                )));
            }
            if range.slot_quantity < 1 {
                return Err(ScheduleError::Validation(
                    "slot_quantity must be at least 1".to_string(),
                ));
            }

            let span = (range.end_time - range.start_time).num_minutes();
            if span < i64::from(range.slot_duration_minutes) {
                warn!(
                    "Time range {}-{} on weekday {} is shorter than one {} minute slot",
                    range.start_time, range.end_time, schedule.weekday, range.slot_duration_minutes
                );
            }
            ranges.push(range);
        }

        ranges.sort_by_key(|range| range.start_time);
        if let Some(pair) = ranges.windows(2).find(|pair| pair[1].start_time < pair[0].end_time) {
            return Err(ScheduleError::Validation(format!(
                "Time ranges {}-{} and {}-{} on weekday {} overlap",
                pair[0].start_time, pair[0].end_time, pair[1].start_time, pair[1].end_time, schedule.weekday
            )));
        }

        if !ranges.is_empty() {
            week.push(NewWeeklySchedule {
                weekday: schedule.weekday,
                time_ranges: ranges,
            });
        }
    }

    week.sort_by_key(|schedule| schedule.weekday);
    Ok(week)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeRangeInput, WeeklyScheduleInput};
    use assert_matches::assert_matches;
    use chrono::NaiveTime;

    fn range(start: (u32, u32), end: (u32, u32)) -> TimeRangeInput {
        TimeRangeInput {
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            slot_duration_minutes: None,
            slot_quantity: None,
        }
    }

    fn week(schedules: Vec<WeeklyScheduleInput>) -> SaveWeeklyScheduleRequest {
        SaveWeeklyScheduleRequest { schedules }
    }

    #[test]
    fn applies_defaults_and_sorts() {
        let request = week(vec![
            WeeklyScheduleInput { weekday: 3, time_ranges: vec![range((14, 0), (16, 0)), range((9, 0), (12, 0))] },
            WeeklyScheduleInput { weekday: 1, time_ranges: vec![range((9, 0), (9, 30))] },
        ]);

        let validated = validate_week(&request).unwrap();
        assert_eq!(validated.iter().map(|s| s.weekday).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(validated[1].time_ranges[0].start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(validated[0].time_ranges[0].slot_duration_minutes, 15);
        assert_eq!(validated[0].time_ranges[0].slot_quantity, 1);
    }

    #[test]
    fn rejects_slot_duration_longer_than_a_day() {
        let mut long = range((9, 0), (9, 30));
        long.slot_duration_minutes = Some(71_582_789);
        let request = week(vec![WeeklyScheduleInput { weekday: 1, time_ranges: vec![long] }]);
        assert_matches!(
            validate_week(&request),
            Err(ScheduleError::Validation(msg)) if msg.contains("slot_duration_minutes")
        );

        let mut whole_day = range((0, 0), (23, 0));
        whole_day.slot_duration_minutes = Some(MINUTES_PER_DAY);
        let request = week(vec![WeeklyScheduleInput { weekday: 1, time_ranges: vec![whole_day] }]);
        assert!(validate_week(&request).is_ok());
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let request = week(vec![WeeklyScheduleInput {
            weekday: 1,
            time_ranges: vec![range((9, 0), (10, 0)), range((9, 30), (11, 0))],
        }]);
        assert_matches!(validate_week(&request), Err(ScheduleError::Validation(msg)) if msg.contains("overlap"));
    }

    #[test]
    fn adjacent_ranges_are_allowed() {
        let request = week(vec![WeeklyScheduleInput {
            weekday: 1,
            time_ranges: vec![range((9, 0), (10, 0)), range((10, 0), (11, 0))],
        }]);
        assert!(validate_week(&request).is_ok());
    }

    #[test]
    fn rejects_inverted_range_and_bad_fields() {
        let inverted = week(vec![WeeklyScheduleInput { weekday: 1, time_ranges: vec![range((10, 0), (9, 0))] }]);
        assert_matches!(validate_week(&inverted), Err(ScheduleError::Validation(_)));

        let mut zero_duration = range((9, 0), (10, 0));
        zero_duration.slot_duration_minutes = Some(0);
        let request = week(vec![WeeklyScheduleInput { weekday: 1, time_ranges: vec![zero_duration] }]);
        assert_matches!(validate_week(&request), Err(ScheduleError::Validation(_)));

        let mut zero_quantity = range((9, 0), (10, 0));
        zero_quantity.slot_quantity = Some(0);
        let request = week(vec![WeeklyScheduleInput { weekday: 1, time_ranges: vec![zero_quantity] }]);
        assert_matches!(validate_week(&request), Err(ScheduleError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_or_invalid_weekday() {
        let duplicate = week(vec![
            WeeklyScheduleInput { weekday: 1, time_ranges: vec![range((9, 0), (10, 0))] },
            WeeklyScheduleInput { weekday: 1, time_ranges: vec![range((14, 0), (15, 0))] },
        ]);
        assert_matches!(validate_week(&duplicate), Err(ScheduleError::Validation(_)));

        let invalid = week(vec![WeeklyScheduleInput { weekday: 7, time_ranges: vec![] }]);
        assert_matches!(validate_week(&invalid), Err(ScheduleError::Validation(_)));
    }

    #[test]
    fn empty_weekdays_are_dropped() {
        let request = week(vec![WeeklyScheduleInput { weekday: 2, time_ranges: vec![] }]);
        assert!(validate_week(&request).unwrap().is_empty());
    }
}
