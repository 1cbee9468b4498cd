pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::error::ScheduleError;
use crate::models::{
    BlockedSlot, DoctorBranch, DoctorLeave, NewBlockedSlot, NewDoctorLeave, NewReleaseRule,
    NewSlot, NewWeeklySchedule, Slot, SlotPurge, SlotReleaseRule, WeeklySchedule,
};

pub use memory::InMemoryScheduleStore;
pub use supabase::SupabaseScheduleStore;

pub type StoreResult<T> = Result<T, ScheduleError>;

/// Persistence boundary for templates, exclusions and generated slots.
///
/// Date ranges are `[from, to)`. Slot inserts ignore rows whose natural key
/// (doctor-branch, date, start, end) already exists.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get_doctor_branch(&self, id: i64) -> StoreResult<Option<DoctorBranch>>;
    async fn list_doctor_branches_for_doctor(&self, doctor_id: i64) -> StoreResult<Vec<DoctorBranch>>;

    async fn list_weekly_schedules(&self, doctor_branch_id: i64) -> StoreResult<Vec<WeeklySchedule>>;
    async fn get_weekly_schedule(&self, id: i64) -> StoreResult<Option<WeeklySchedule>>;
    /// Swaps the whole weekly template of a doctor-branch in one step.
    async fn replace_weekly_schedules(
        &self,
        doctor_branch_id: i64,
        schedules: &[NewWeeklySchedule],
    ) -> StoreResult<Vec<WeeklySchedule>>;
    async fn delete_weekly_schedule(&self, id: i64) -> StoreResult<bool>;

    async fn list_release_rules(&self, doctor_branch_id: i64) -> StoreResult<Vec<SlotReleaseRule>>;
    async fn get_release_rule(&self, id: i64) -> StoreResult<Option<SlotReleaseRule>>;
    async fn insert_release_rule(&self, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule>;
    async fn update_release_rule(&self, id: i64, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule>;
    async fn delete_release_rule(&self, id: i64) -> StoreResult<bool>;

    async fn list_blocked_slots(
        &self,
        doctor_id: i64,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<BlockedSlot>>;
    async fn get_blocked_slot(&self, id: i64) -> StoreResult<Option<BlockedSlot>>;
    async fn insert_blocked_slot(&self, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot>;
    async fn update_blocked_slot(&self, id: i64, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot>;
    async fn delete_blocked_slot(&self, id: i64) -> StoreResult<bool>;

    async fn list_leaves(&self, doctor_branch_id: i64) -> StoreResult<Vec<DoctorLeave>>;
    async fn get_leave(&self, id: i64) -> StoreResult<Option<DoctorLeave>>;
    async fn insert_leave(&self, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave>;
    async fn update_leave(&self, id: i64, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave>;
    async fn delete_leave(&self, id: i64) -> StoreResult<bool>;

    async fn list_slots(
        &self,
        doctor_branch_id: i64,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<Slot>>;
    /// Returns how many rows were actually inserted.
    async fn insert_slots(&self, slots: &[NewSlot]) -> StoreResult<usize>;
    /// Writes status, capacity, release instant and time range of existing rows
    /// that are still unbooked PENDING_RELEASE/OPEN. Other rows are left as they are.
    async fn refresh_slots(&self, slots: &[Slot]) -> StoreResult<usize>;
    /// Sets BLOCKED on the given rows unless they are already BLOCKED or EXPIRED.
    /// Booking counts and capacity are not written.
    async fn block_slots(&self, slot_ids: &[i64]) -> StoreResult<usize>;
    async fn delete_unbooked_slots(&self, doctor_branch_id: i64, purge: &SlotPurge) -> StoreResult<usize>;
    /// PENDING_RELEASE slots whose release instant is at or before `as_of` become OPEN.
    async fn release_due_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>>;
    /// Unbooked PENDING_RELEASE/OPEN slots starting at or before `as_of` become EXPIRED.
    async fn expire_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>>;
}
