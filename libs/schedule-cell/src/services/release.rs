use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    NewReleaseRule, ReleasePolicy, ReleaseRuleRequest, ReleaseScope, RuleTarget, SlotReleaseRule,
    WeeklySchedule, default_release_time, DEFAULT_RELEASE_DAYS_BEFORE,
};
use crate::services::cache::ScheduleCache;
use crate::state::ScheduleState;
use crate::store::ScheduleStore;

/// Picks the active rule that governs `(weekday, time_range_id)`.
///
/// The most specific scope wins. Among rules of equal specificity the most
/// recently updated one wins, then the highest id.
pub fn resolve_policy(rules: &[SlotReleaseRule], weekday: i32, time_range_id: i64) -> ReleasePolicy {
    rules
        .iter()
        .filter(|rule| rule.is_active && rule.applies_to(weekday, time_range_id))
        .max_by_key(|rule| (rule.scope.specificity(), rule.updated_at, rule.id))
        .map(ReleasePolicy::from_rule)
        .unwrap_or_else(ReleasePolicy::fallback)
}

pub struct ReleaseRuleService {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
}

impl ReleaseRuleService {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            store: state.store.clone(),
            cache: state.cache.clone(),
        }
    }

    pub async fn list_rules(&self, doctor_branch_id: i64) -> ScheduleResult<Vec<SlotReleaseRule>> {
        self.store.list_release_rules(doctor_branch_id).await
    }

    pub async fn get_rule(&self, id: i64) -> ScheduleResult<SlotReleaseRule> {
        self.store
            .get_release_rule(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(format!("Release rule {}", id)))
    }

    pub async fn resolve(&self, doctor_branch_id: i64, weekday: i32, time_range_id: i64) -> ScheduleResult<ReleasePolicy> {
        let rules = self.store.list_release_rules(doctor_branch_id).await?;
        Ok(resolve_policy(&rules, weekday, time_range_id))
    }

    /// Creates or updates one rule. Saving an active rule deactivates any other
    /// active rule with the same target so resolution never sees a tie.
    pub async fn save_rule(&self, request: ReleaseRuleRequest) -> ScheduleResult<SlotReleaseRule> {
        let doctor_branch_id = match (request.doctor_branch_id, request.id) {
            (Some(id), _) => id,
            (None, Some(rule_id)) => self.get_rule(rule_id).await?.doctor_branch_id,
            (None, None) => {
                return Err(ScheduleError::Validation(
                    "doctor_branch_id is required for a new release rule".to_string(),
                ))
            }
        };

        self.require_doctor_branch(doctor_branch_id).await?;
        let schedules = self.store.list_weekly_schedules(doctor_branch_id).await?;
        let rule = build_rule(doctor_branch_id, &request, &schedules)?;

        let saved = self.persist(request.id, doctor_branch_id, &rule).await?;
        if saved.is_active {
            self.deactivate_competing(&saved).await?;
        }

        self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        info!(
            "Saved {} release rule {} for doctor-branch {}",
            saved.scope, saved.id, doctor_branch_id
        );
        Ok(saved)
    }

    /// Replaces the rule set of a doctor-branch. Existing active rules that are
    /// not part of the batch are deactivated, never deleted.
    pub async fn save_rules_batch(
        &self,
        doctor_branch_id: i64,
        requests: Vec<ReleaseRuleRequest>,
    ) -> ScheduleResult<Vec<SlotReleaseRule>> {
        self.require_doctor_branch(doctor_branch_id).await?;
        let schedules = self.store.list_weekly_schedules(doctor_branch_id).await?;
        let existing = self.store.list_release_rules(doctor_branch_id).await?;
        let existing_ids: HashSet<i64> = existing.iter().map(|rule| rule.id).collect();

        let mut planned = Vec::with_capacity(requests.len());
        let mut active_targets: HashMap<RuleTarget, usize> = HashMap::new();
        for (index, request) in requests.iter().enumerate() {
            if let Some(other) = request.doctor_branch_id.filter(|id| *id != doctor_branch_id) {
                return Err(ScheduleError::Validation(format!(
                    "Rule {} belongs to doctor-branch {}, not {}",
                    index, other, doctor_branch_id
                )));
            }
            if let Some(id) = request.id {
                if !existing_ids.contains(&id) {
                    return Err(ScheduleError::NotFound(format!(
                        "Release rule {} of doctor-branch {}",
                        id, doctor_branch_id
                    )));
                }
            }

            let rule = build_rule(doctor_branch_id, request, &schedules)?;
            if rule.is_active {
                if let Some(first) = active_targets.insert(rule.target(), index) {
                    return Err(ScheduleError::Validation(format!(
                        "Rules {} and {} are both active for the same {} target",
                        first, index, rule.scope
                    )));
                }
            }
            planned.push((request.id, rule));
        }

        let kept: HashSet<i64> = planned.iter().filter_map(|(id, _)| *id).collect();
        for rule in existing.iter().filter(|rule| rule.is_active && !kept.contains(&rule.id)) {
            debug!("Deactivating release rule {} omitted from batch", rule.id);
            self.store.update_release_rule(rule.id, &deactivated(rule)).await?;
        }

        let mut saved = Vec::with_capacity(planned.len());
        for (id, rule) in &planned {
            saved.push(self.persist(*id, doctor_branch_id, rule).await?);
        }

        self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        info!(
            "Replaced release rules of doctor-branch {} ({} rules)",
            doctor_branch_id,
            saved.len()
        );
        Ok(saved)
    }

    pub async fn delete_rule(&self, id: i64) -> ScheduleResult<SlotReleaseRule> {
        let rule = self.get_rule(id).await?;
        self.store.delete_release_rule(id).await?;
        self.cache.invalidate_doctor_branch(rule.doctor_branch_id).await;
        info!("Deleted release rule {}", id);
        Ok(rule)
    }

    /// Creates the DEFAULT rule if the doctor-branch has no active one.
    /// Returns `None` when one already exists.
    pub async fn create_default_rule(&self, doctor_branch_id: i64) -> ScheduleResult<Option<SlotReleaseRule>> {
        self.require_doctor_branch(doctor_branch_id).await?;
        self.ensure_default_rule(doctor_branch_id).await
    }

    pub(crate) async fn ensure_default_rule(&self, doctor_branch_id: i64) -> ScheduleResult<Option<SlotReleaseRule>> {
        let rules = self.store.list_release_rules(doctor_branch_id).await?;
        if rules
            .iter()
            .any(|rule| rule.is_active && rule.scope == ReleaseScope::Default)
        {
            return Ok(None);
        }

        let created = self
            .store
            .insert_release_rule(&NewReleaseRule::default_for(doctor_branch_id))
            .await?;
        self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        info!("Created default release rule {} for doctor-branch {}", created.id, doctor_branch_id);
        Ok(Some(created))
    }

    async fn require_doctor_branch(&self, doctor_branch_id: i64) -> ScheduleResult<()> {
        match self.store.get_doctor_branch(doctor_branch_id).await? {
            Some(_) => Ok(()),
            None => Err(ScheduleError::NotFound(format!("Doctor-branch {}", doctor_branch_id))),
        }
    }

    async fn persist(
        &self,
        id: Option<i64>,
        doctor_branch_id: i64,
        rule: &NewReleaseRule,
    ) -> ScheduleResult<SlotReleaseRule> {
        match id {
            Some(id) => {
                let existing = self.get_rule(id).await?;
                if existing.doctor_branch_id != doctor_branch_id {
                    return Err(ScheduleError::Validation(format!(
                        "Release rule {} belongs to doctor-branch {}",
                        id, existing.doctor_branch_id
                    )));
                }
                self.store.update_release_rule(id, rule).await
            }
            None => self.store.insert_release_rule(rule).await,
        }
    }

    async fn deactivate_competing(&self, saved: &SlotReleaseRule) -> ScheduleResult<()> {
        let rules = self.store.list_release_rules(saved.doctor_branch_id).await?;
        for rule in rules
            .iter()
            .filter(|rule| rule.id != saved.id && rule.is_active && rule.same_target(saved))
        {
            debug!("Release rule {} superseded by {}", rule.id, saved.id);
            self.store.update_release_rule(rule.id, &deactivated(rule)).await?;
        }
        Ok(())
    }
}

fn deactivated(rule: &SlotReleaseRule) -> NewReleaseRule {
    NewReleaseRule {
        doctor_branch_id: rule.doctor_branch_id,
        scope: rule.scope,
        weekday: rule.weekday,
        time_range_id: rule.time_range_id,
        release_days_before: rule.release_days_before,
        release_time: rule.release_time,
        release_minutes_before_slot: rule.release_minutes_before_slot,
        is_active: false,
    }
}

/// Validates a request against the scope rules and the doctor-branch's
/// current weekly template.
pub fn build_rule(
    doctor_branch_id: i64,
    request: &ReleaseRuleRequest,
    schedules: &[WeeklySchedule],
) -> ScheduleResult<NewReleaseRule> {
    let release_days_before = request.release_days_before.unwrap_or(DEFAULT_RELEASE_DAYS_BEFORE);
    if release_days_before < 0 {
        return Err(ScheduleError::Validation(
            "release_days_before must not be negative".to_string(),
        ));
    }
    if let Some(minutes) = request.release_minutes_before_slot {
        if minutes < 0 {
            return Err(ScheduleError::Validation(
                "release_minutes_before_slot must not be negative".to_string(),
            ));
        }
    }

    let (weekday, time_range_id) = match request.scope {
        ReleaseScope::Default => {
            if request.weekday.is_some() || request.time_range_id.is_some() {
                return Err(ScheduleError::Validation(
                    "DEFAULT rules take neither weekday nor time_range_id".to_string(),
                ));
            }
            (None, None)
        }
        ReleaseScope::Weekday => {
            if request.time_range_id.is_some() {
                return Err(ScheduleError::Validation(
                    "WEEKDAY rules take no time_range_id".to_string(),
                ));
            }
            let weekday = request.weekday.ok_or_else(|| {
                ScheduleError::Validation("WEEKDAY rules require a weekday".to_string())
            })?;
            validate_weekday(weekday)?;
            (Some(weekday), None)
        }
        ReleaseScope::TimeRange => {
            let time_range_id = request.time_range_id.ok_or_else(|| {
                ScheduleError::Validation("TIME_RANGE rules require a time_range_id".to_string())
            })?;
            let owner = schedules
                .iter()
                .find(|schedule| schedule.time_ranges.iter().any(|range| range.id == time_range_id))
                .ok_or_else(|| {
                    ScheduleError::Validation(format!(
                        "Time range {} is not part of doctor-branch {}'s weekly schedule",
                        time_range_id, doctor_branch_id
                    ))
                })?;
            if let Some(weekday) = request.weekday.filter(|weekday| *weekday != owner.weekday) {
                return Err(ScheduleError::Validation(format!(
                    "Time range {} is on weekday {}, not {}",
                    time_range_id, owner.weekday, weekday
                )));
            }
            (Some(owner.weekday), Some(time_range_id))
        }
    };

    Ok(NewReleaseRule {
        doctor_branch_id,
        scope: request.scope,
        weekday,
        time_range_id,
        release_days_before,
        release_time: request.release_time.unwrap_or_else(default_release_time),
        release_minutes_before_slot: request.release_minutes_before_slot,
        is_active: request.is_active.unwrap_or(true),
    })
}

pub(crate) fn validate_weekday(weekday: i32) -> ScheduleResult<()> {
    if (0..=6).contains(&weekday) {
        Ok(())
    } else {
        Err(ScheduleError::Validation(format!(
            "Weekday must be between 0 (Sunday) and 6 (Saturday), got {}",
            weekday
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicySource, TimeRange};
    use assert_matches::assert_matches;
    use chrono::{Duration, NaiveTime, TimeZone, Utc};

    fn rule(id: i64, scope: ReleaseScope, weekday: Option<i32>, time_range_id: Option<i64>, days: i32) -> SlotReleaseRule {
        SlotReleaseRule {
            id,
            doctor_branch_id: 5,
            scope,
            weekday,
            time_range_id,
            release_days_before: days,
            release_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            release_minutes_before_slot: None,
            is_active: true,
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn request(scope: ReleaseScope) -> ReleaseRuleRequest {
        ReleaseRuleRequest {
            id: None,
            doctor_branch_id: Some(5),
            scope,
            weekday: None,
            time_range_id: None,
            release_days_before: None,
            release_time: None,
            release_minutes_before_slot: None,
            is_active: None,
        }
    }

    fn monday_schedule() -> Vec<WeeklySchedule> {
        vec![WeeklySchedule {
            id: 1,
            doctor_branch_id: 5,
            weekday: 1,
            time_ranges: vec![TimeRange {
                id: 11,
                weekly_schedule_id: 1,
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                slot_duration_minutes: 15,
                slot_quantity: 2,
            }],
        }]
    }

    #[test]
    fn fallback_when_no_rules() {
        let policy = resolve_policy(&[], 1, 11);
        assert_eq!(policy.source, PolicySource::Fallback);
        assert_eq!(policy.release_days_before, 1);
        assert_eq!(policy.release_time, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn time_range_beats_weekday_beats_default() {
        let rules = vec![
            rule(1, ReleaseScope::Default, None, None, 1),
            rule(2, ReleaseScope::Weekday, Some(1), None, 2),
            rule(3, ReleaseScope::TimeRange, Some(1), Some(11), 3),
        ];

        assert_eq!(resolve_policy(&rules, 1, 11).release_days_before, 3);
        assert_eq!(resolve_policy(&rules, 1, 12).release_days_before, 2);
        assert_eq!(resolve_policy(&rules, 2, 12).release_days_before, 1);
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut specific = rule(3, ReleaseScope::TimeRange, Some(1), Some(11), 3);
        specific.is_active = false;
        let rules = vec![rule(1, ReleaseScope::Default, None, None, 1), specific];

        assert_eq!(
            resolve_policy(&rules, 1, 11).source,
            PolicySource::Rule { id: 1, scope: ReleaseScope::Default }
        );
    }

    #[test]
    fn equal_specificity_prefers_latest_update_then_id() {
        let older = rule(7, ReleaseScope::Default, None, None, 1);
        let mut newer = rule(4, ReleaseScope::Default, None, None, 2);
        newer.updated_at = older.updated_at + Duration::minutes(5);
        assert_eq!(resolve_policy(&[older.clone(), newer], 0, 1).release_days_before, 2);

        let twin = rule(9, ReleaseScope::Default, None, None, 4);
        assert_eq!(resolve_policy(&[older, twin], 0, 1).release_days_before, 4);
    }

    #[test]
    fn scope_fields_are_validated() {
        let schedules = monday_schedule();

        let mut default_with_weekday = request(ReleaseScope::Default);
        default_with_weekday.weekday = Some(1);
        assert_matches!(build_rule(5, &default_with_weekday, &schedules), Err(ScheduleError::Validation(_)));

        assert_matches!(build_rule(5, &request(ReleaseScope::Weekday), &schedules), Err(ScheduleError::Validation(_)));

        let mut bad_weekday = request(ReleaseScope::Weekday);
        bad_weekday.weekday = Some(7);
        assert_matches!(build_rule(5, &bad_weekday, &schedules), Err(ScheduleError::Validation(_)));

        let mut foreign_range = request(ReleaseScope::TimeRange);
        foreign_range.time_range_id = Some(99);
        assert_matches!(build_rule(5, &foreign_range, &schedules), Err(ScheduleError::Validation(_)));

        let mut negative = request(ReleaseScope::Default);
        negative.release_days_before = Some(-1);
        assert_matches!(build_rule(5, &negative, &schedules), Err(ScheduleError::Validation(_)));
    }

    #[test]
    fn time_range_rule_takes_weekday_from_schedule() {
        let mut time_range = request(ReleaseScope::TimeRange);
        time_range.time_range_id = Some(11);
        time_range.release_days_before = Some(3);

        let built = build_rule(5, &time_range, &monday_schedule()).unwrap();
        assert_eq!(built.weekday, Some(1));
        assert_eq!(built.release_days_before, 3);
        assert!(built.is_active);

        time_range.weekday = Some(2);
        assert_matches!(build_rule(5, &time_range, &monday_schedule()), Err(ScheduleError::Validation(_)));
    }
}
