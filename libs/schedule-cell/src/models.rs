use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SlotTransitionError;

pub const DEFAULT_SLOT_DURATION_MINUTES: i32 = 15;
pub const DEFAULT_SLOT_QUANTITY: i32 = 1;
pub const DEFAULT_RELEASE_DAYS_BEFORE: i32 = 1;

pub fn default_release_time() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default()
}

/// 0 = Sunday, 1 = Monday, ... 6 = Saturday
pub fn weekday_index(date: NaiveDate) -> i32 {
    date.weekday().num_days_from_sunday() as i32
}

// ==============================================================================
// TEMPLATE MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DoctorBranch {
    pub id: i64,
    pub doctor_id: i64,
    pub branch_id: i64,
    pub is_active: bool,
}

/// Half-open `[start_time, end_time)` window within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl SlotWindow {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self { start_time, end_time }
    }

    pub fn overlaps(&self, other: &SlotWindow) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub id: i64,
    pub weekly_schedule_id: i64,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_duration_minutes: i32,
    pub slot_quantity: i32,
}

impl TimeRange {
    pub fn window(&self) -> SlotWindow {
        SlotWindow::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub id: i64,
    pub doctor_branch_id: i64,
    pub weekday: i32,
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
}

impl WeeklySchedule {
    pub fn time_range_ids(&self) -> Vec<i64> {
        self.time_ranges.iter().map(|range| range.id).collect()
    }
}

// ==============================================================================
// RELEASE RULES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseScope {
    Default,
    Weekday,
    TimeRange,
}

impl ReleaseScope {
    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        match self {
            ReleaseScope::Default => 0,
            ReleaseScope::Weekday => 1,
            ReleaseScope::TimeRange => 2,
        }
    }
}

impl std::fmt::Display for ReleaseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseScope::Default => write!(f, "DEFAULT"),
            ReleaseScope::Weekday => write!(f, "WEEKDAY"),
            ReleaseScope::TimeRange => write!(f, "TIME_RANGE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReleaseRule {
    pub id: i64,
    pub doctor_branch_id: i64,
    pub scope: ReleaseScope,
    pub weekday: Option<i32>,
    pub time_range_id: Option<i64>,
    pub release_days_before: i32,
    pub release_time: NaiveTime,
    pub release_minutes_before_slot: Option<i32>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl SlotReleaseRule {
    pub fn applies_to(&self, weekday: i32, time_range_id: i64) -> bool {
        match self.scope {
            ReleaseScope::Default => true,
            ReleaseScope::Weekday => self.weekday == Some(weekday),
            ReleaseScope::TimeRange => self.time_range_id == Some(time_range_id),
        }
    }

    /// Two rules with the same target compete for the same slots.
    pub fn same_target(&self, other: &SlotReleaseRule) -> bool {
        self.doctor_branch_id == other.doctor_branch_id && self.target() == other.target()
    }

    pub fn target(&self) -> RuleTarget {
        RuleTarget::new(self.scope, self.weekday, self.time_range_id)
    }
}

/// What a rule is attached to, ignoring its timing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleTarget {
    pub scope: ReleaseScope,
    pub weekday: Option<i32>,
    pub time_range_id: Option<i64>,
}

impl RuleTarget {
    pub fn new(scope: ReleaseScope, weekday: Option<i32>, time_range_id: Option<i64>) -> Self {
        match scope {
            ReleaseScope::Default => Self { scope, weekday: None, time_range_id: None },
            ReleaseScope::Weekday => Self { scope, weekday, time_range_id: None },
            ReleaseScope::TimeRange => Self { scope, weekday: None, time_range_id },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySource {
    Rule { id: i64, scope: ReleaseScope },
    Fallback,
}

/// Effective release timing for one time range on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePolicy {
    pub source: PolicySource,
    pub release_days_before: i32,
    pub release_time: NaiveTime,
    pub release_minutes_before_slot: Option<i32>,
}

impl ReleasePolicy {
    pub fn fallback() -> Self {
        Self {
            source: PolicySource::Fallback,
            release_days_before: DEFAULT_RELEASE_DAYS_BEFORE,
            release_time: default_release_time(),
            release_minutes_before_slot: None,
        }
    }

    pub fn from_rule(rule: &SlotReleaseRule) -> Self {
        Self {
            source: PolicySource::Rule { id: rule.id, scope: rule.scope },
            release_days_before: rule.release_days_before,
            release_time: rule.release_time,
            release_minutes_before_slot: rule.release_minutes_before_slot,
        }
    }

    pub fn release_at(&self, slot_date: NaiveDate, start_time: NaiveTime) -> NaiveDateTime {
        match self.release_minutes_before_slot {
            Some(minutes) => {
                slot_date.and_time(start_time) - Duration::minutes(i64::from(minutes))
            }
            None => {
                let release_date = slot_date - Duration::days(i64::from(self.release_days_before));
                release_date.and_time(self.release_time)
            }
        }
    }
}

// ==============================================================================
// EXCLUSIONS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSlot {
    pub id: i64,
    pub doctor_id: i64,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub reason: Option<String>,
}

impl BlockedSlot {
    pub fn window(&self) -> SlotWindow {
        SlotWindow::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorLeave {
    pub id: i64,
    pub doctor_branch_id: i64,
    pub leave_start: NaiveDate,
    pub leave_end: NaiveDate,
    pub reason: Option<String>,
    pub approved: bool,
}

impl DoctorLeave {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.leave_start <= date && date <= self.leave_end
    }
}

// ==============================================================================
// GENERATED SLOTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    PendingRelease,
    Open,
    Full,
    Blocked,
    Expired,
}

impl SlotStatus {
    /// Statuses the generator never rewrites.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotStatus::Blocked | SlotStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::PendingRelease => "PENDING_RELEASE",
            SlotStatus::Open => "OPEN",
            SlotStatus::Full => "FULL",
            SlotStatus::Blocked => "BLOCKED",
            SlotStatus::Expired => "EXPIRED",
        }
    }

    pub fn for_release(release_at: NaiveDateTime, now: NaiveDateTime) -> Self {
        if now >= release_at {
            SlotStatus::Open
        } else {
            SlotStatus::PendingRelease
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a slot; unique per doctor-branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub doctor_branch_id: i64,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: i64,
    pub doctor_branch_id: i64,
    pub time_range_id: Option<i64>,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: i32,
    pub booked_count: i32,
    pub release_at: NaiveDateTime,
    pub status: SlotStatus,
}

impl Slot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            doctor_branch_id: self.doctor_branch_id,
            slot_date: self.slot_date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn window(&self) -> SlotWindow {
        SlotWindow::new(self.start_time, self.end_time)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.slot_date.and_time(self.start_time)
    }

    /// Booked or terminal slots are left alone by regeneration.
    pub fn is_frozen(&self) -> bool {
        self.booked_count > 0 || self.status.is_terminal()
    }

    /// Status as seen at `now`, counting a release that the sweep has not applied yet.
    pub fn effective_status(&self, now: NaiveDateTime) -> SlotStatus {
        match self.status {
            SlotStatus::PendingRelease if now >= self.release_at => SlotStatus::Open,
            status => status,
        }
    }

    pub fn remaining_capacity(&self) -> i32 {
        (self.capacity - self.booked_count).max(0)
    }

    pub fn record_booking(&mut self) -> Result<(), SlotTransitionError> {
        match self.status {
            SlotStatus::Open => {}
            SlotStatus::Full => return Err(SlotTransitionError::Full),
            SlotStatus::PendingRelease => return Err(SlotTransitionError::NotReleased),
            status => return Err(SlotTransitionError::Closed(status)),
        }
        if self.booked_count >= self.capacity {
            return Err(SlotTransitionError::Full);
        }

        self.booked_count += 1;
        if self.booked_count == self.capacity {
            self.status = SlotStatus::Full;
        }
        Ok(())
    }

    pub fn record_cancellation(&mut self) -> Result<(), SlotTransitionError> {
        if self.booked_count == 0 {
            return Err(SlotTransitionError::NoBookings);
        }

        self.booked_count -= 1;
        if self.status == SlotStatus::Full {
            self.status = SlotStatus::Open;
        }
        Ok(())
    }

    /// PENDING_RELEASE -> OPEN once `now` reaches `release_at`.
    pub fn release(&mut self, now: NaiveDateTime) -> bool {
        if self.status == SlotStatus::PendingRelease && now >= self.release_at {
            self.status = SlotStatus::Open;
            return true;
        }
        false
    }

    pub fn block(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = SlotStatus::Blocked;
        true
    }

    /// Unbooked, unreleased or open slots whose start has passed become EXPIRED.
    pub fn expire(&mut self, as_of: NaiveDateTime) -> bool {
        let expirable = matches!(self.status, SlotStatus::PendingRelease | SlotStatus::Open);
        if expirable && self.booked_count == 0 && self.starts_at() <= as_of {
            self.status = SlotStatus::Expired;
            return true;
        }
        false
    }
}

/// A slot about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSlot {
    pub doctor_branch_id: i64,
    pub time_range_id: Option<i64>,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: i32,
    pub booked_count: i32,
    pub release_at: NaiveDateTime,
    pub status: SlotStatus,
}

impl NewSlot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            doctor_branch_id: self.doctor_branch_id,
            slot_date: self.slot_date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn into_slot(self, id: i64) -> Slot {
        Slot {
            id,
            doctor_branch_id: self.doctor_branch_id,
            time_range_id: self.time_range_id,
            slot_date: self.slot_date,
            start_time: self.start_time,
            end_time: self.end_time,
            capacity: self.capacity,
            booked_count: self.booked_count,
            release_at: self.release_at,
            status: self.status,
        }
    }
}

/// Selects unbooked slots of one doctor-branch for removal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotPurge {
    pub from: Option<NaiveDate>,
    /// Exclusive.
    pub to: Option<NaiveDate>,
    pub time_range_ids: Option<Vec<i64>>,
    pub window: Option<SlotWindow>,
    pub statuses: Option<Vec<SlotStatus>>,
}

impl SlotPurge {
    pub fn matches(&self, slot: &Slot) -> bool {
        slot.booked_count == 0
            && self.from.map_or(true, |from| slot.slot_date >= from)
            && self.to.map_or(true, |to| slot.slot_date < to)
            && self.time_range_ids.as_ref().map_or(true, |ids| {
                slot.time_range_id.map_or(false, |id| ids.contains(&id))
            })
            && self.window.map_or(true, |window| window.overlaps(&slot.window()))
            && self.statuses.as_ref().map_or(true, |statuses| statuses.contains(&slot.status))
    }
}

// ==============================================================================
// REQUEST DTOs
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRangeInput {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_duration_minutes: Option<i32>,
    pub slot_quantity: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyScheduleInput {
    pub weekday: i32,
    #[serde(default)]
    pub time_ranges: Vec<TimeRangeInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveWeeklyScheduleRequest {
    pub schedules: Vec<WeeklyScheduleInput>,
}

/// Validated weekday template handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWeeklySchedule {
    pub weekday: i32,
    pub time_ranges: Vec<NewTimeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTimeRange {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_duration_minutes: i32,
    pub slot_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRuleRequest {
    pub id: Option<i64>,
    pub doctor_branch_id: Option<i64>,
    pub scope: ReleaseScope,
    pub weekday: Option<i32>,
    pub time_range_id: Option<i64>,
    pub release_days_before: Option<i32>,
    pub release_time: Option<NaiveTime>,
    pub release_minutes_before_slot: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReleaseRulesRequest {
    pub rules: Vec<ReleaseRuleRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReleaseRule {
    pub doctor_branch_id: i64,
    pub scope: ReleaseScope,
    pub weekday: Option<i32>,
    pub time_range_id: Option<i64>,
    pub release_days_before: i32,
    pub release_time: NaiveTime,
    pub release_minutes_before_slot: Option<i32>,
    pub is_active: bool,
}

impl NewReleaseRule {
    pub fn default_for(doctor_branch_id: i64) -> Self {
        Self {
            doctor_branch_id,
            scope: ReleaseScope::Default,
            weekday: None,
            time_range_id: None,
            release_days_before: DEFAULT_RELEASE_DAYS_BEFORE,
            release_time: default_release_time(),
            release_minutes_before_slot: None,
            is_active: true,
        }
    }

    pub fn target(&self) -> RuleTarget {
        RuleTarget::new(self.scope, self.weekday, self.time_range_id)
    }

    pub fn into_rule(self, id: i64, updated_at: DateTime<Utc>) -> SlotReleaseRule {
        SlotReleaseRule {
            id,
            doctor_branch_id: self.doctor_branch_id,
            scope: self.scope,
            weekday: self.weekday,
            time_range_id: self.time_range_id,
            release_days_before: self.release_days_before,
            release_time: self.release_time,
            release_minutes_before_slot: self.release_minutes_before_slot,
            is_active: self.is_active,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedSlotRequest {
    pub id: Option<i64>,
    pub doctor_id: i64,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockedSlot {
    pub doctor_id: i64,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub reason: Option<String>,
}

impl From<&BlockedSlotRequest> for NewBlockedSlot {
    fn from(request: &BlockedSlotRequest) -> Self {
        Self {
            doctor_id: request.doctor_id,
            slot_date: request.slot_date,
            start_time: request.start_time,
            end_time: request.end_time,
            reason: request.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorLeaveRequest {
    pub id: Option<i64>,
    pub doctor_branch_id: i64,
    pub leave_start: NaiveDate,
    pub leave_end: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDoctorLeave {
    pub doctor_branch_id: i64,
    pub leave_start: NaiveDate,
    pub leave_end: NaiveDate,
    pub reason: Option<String>,
    pub approved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateQuery {
    pub horizon_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGenerateRequest {
    pub doctor_branch_ids: Vec<i64>,
    pub horizon_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotQuery {
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkExpiredRequest {
    pub as_of: Option<NaiveDateTime>,
}

// ==============================================================================
// RESULTS
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub doctor_branch_id: i64,
    pub dates_scanned: u32,
    pub created: u32,
    pub refreshed: u32,
    pub unchanged: u32,
    pub blocked: u32,
    pub excluded: u32,
    pub skipped_frozen: u32,
    pub skipped_past: u32,
}

impl GenerationSummary {
    /// Rows written by this run.
    pub fn changed(&self) -> u32 {
        self.created + self.refreshed + self.blocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationOutcome {
    NoAvailability { doctor_branch_id: i64 },
    Generated(GenerationSummary),
}

impl GenerationOutcome {
    pub fn message(&self) -> String {
        match self {
            GenerationOutcome::NoAvailability { doctor_branch_id } => format!(
                "No availability configured for doctor-branch {}",
                doctor_branch_id
            ),
            GenerationOutcome::Generated(summary) => format!(
                "Generated slots for doctor-branch {}: {} created, {} updated, {} blocked, {} skipped",
                summary.doctor_branch_id,
                summary.created,
                summary.refreshed,
                summary.blocked,
                summary.excluded + summary.skipped_frozen + summary.skipped_past
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchGenerationStatus {
    pub doctor_branch_id: i64,
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn open_slot(capacity: i32) -> Slot {
        Slot {
            id: 1,
            doctor_branch_id: 5,
            time_range_id: Some(10),
            slot_date: date(2024, 1, 8),
            start_time: time(9, 0),
            end_time: time(9, 15),
            capacity,
            booked_count: 0,
            release_at: date(2024, 1, 7).and_time(time(6, 0)),
            status: SlotStatus::Open,
        }
    }

    #[test]
    fn weekday_index_starts_on_sunday() {
        assert_eq!(weekday_index(date(2024, 1, 7)), 0);
        assert_eq!(weekday_index(date(2024, 1, 8)), 1);
        assert_eq!(weekday_index(date(2024, 1, 13)), 6);
    }

    #[test]
    fn windows_overlap_half_open() {
        let a = SlotWindow::new(time(9, 0), time(9, 30));
        assert!(a.overlaps(&SlotWindow::new(time(9, 15), time(9, 45))));
        assert!(!a.overlaps(&SlotWindow::new(time(9, 30), time(10, 0))));
        assert!(!a.overlaps(&SlotWindow::new(time(8, 30), time(9, 0))));
    }

    #[test]
    fn booking_fills_then_cancellation_reopens() {
        let mut slot = open_slot(2);

        slot.record_booking().unwrap();
        assert_eq!(slot.status, SlotStatus::Open);
        slot.record_booking().unwrap();
        assert_eq!(slot.status, SlotStatus::Full);
        assert_eq!(slot.booked_count, 2);
        assert_matches!(slot.record_booking(), Err(SlotTransitionError::Full));

        slot.record_cancellation().unwrap();
        assert_eq!(slot.status, SlotStatus::Open);
        assert_eq!(slot.remaining_capacity(), 1);
    }

    #[test]
    fn pending_and_closed_slots_reject_bookings() {
        let mut slot = open_slot(1);
        slot.status = SlotStatus::PendingRelease;
        assert_matches!(slot.record_booking(), Err(SlotTransitionError::NotReleased));

        slot.status = SlotStatus::Blocked;
        assert_matches!(slot.record_booking(), Err(SlotTransitionError::Closed(SlotStatus::Blocked)));

        slot.status = SlotStatus::Open;
        assert_matches!(slot.record_cancellation(), Err(SlotTransitionError::NoBookings));
    }

    #[test]
    fn block_keeps_counts_and_is_idempotent() {
        let mut slot = open_slot(2);
        slot.record_booking().unwrap();

        assert!(slot.block());
        assert_eq!(slot.status, SlotStatus::Blocked);
        assert_eq!(slot.booked_count, 1);
        assert!(!slot.block());
    }

    #[test]
    fn expire_only_unbooked_started_slots() {
        let mut slot = open_slot(1);
        let before = slot.starts_at() - Duration::minutes(1);
        assert!(!slot.expire(before));
        assert!(slot.expire(slot.starts_at()));
        assert_eq!(slot.status, SlotStatus::Expired);

        let mut booked = open_slot(2);
        booked.record_booking().unwrap();
        assert!(!booked.expire(booked.starts_at() + Duration::hours(1)));
    }

    #[test]
    fn effective_status_reports_due_release() {
        let mut slot = open_slot(1);
        slot.status = SlotStatus::PendingRelease;

        let release_at = slot.release_at;
        assert_eq!(slot.effective_status(release_at - Duration::seconds(1)), SlotStatus::PendingRelease);
        assert_eq!(slot.effective_status(release_at), SlotStatus::Open);

        assert!(slot.release(release_at));
        assert_eq!(slot.status, SlotStatus::Open);
    }

    #[test]
    fn release_policy_days_before_at_time() {
        let policy = ReleasePolicy {
            source: PolicySource::Fallback,
            release_days_before: 2,
            release_time: time(6, 0),
            release_minutes_before_slot: None,
        };
        assert_eq!(
            policy.release_at(date(2024, 1, 10), time(9, 0)),
            date(2024, 1, 8).and_time(time(6, 0))
        );
    }

    #[test]
    fn release_policy_minutes_before_slot_wins() {
        let policy = ReleasePolicy {
            release_minutes_before_slot: Some(90),
            ..ReleasePolicy::fallback()
        };
        assert_eq!(
            policy.release_at(date(2024, 1, 10), time(9, 0)),
            date(2024, 1, 10).and_time(time(7, 30))
        );
    }

    #[test]
    fn scope_and_status_serialize_upper_case() {
        assert_eq!(serde_json::to_string(&ReleaseScope::TimeRange).unwrap(), "\"TIME_RANGE\"");
        assert_eq!(serde_json::to_string(&SlotStatus::PendingRelease).unwrap(), "\"PENDING_RELEASE\"");
        assert_eq!(SlotStatus::PendingRelease.to_string(), "PENDING_RELEASE");
    }

    #[test]
    fn purge_never_matches_booked_slots() {
        let mut slot = open_slot(2);
        let purge = SlotPurge {
            time_range_ids: Some(vec![10]),
            ..SlotPurge::default()
        };
        assert!(purge.matches(&slot));

        slot.record_booking().unwrap();
        assert!(!purge.matches(&slot));
    }
}
