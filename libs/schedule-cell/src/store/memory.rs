use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ScheduleError;
use crate::models::{
    BlockedSlot, DoctorBranch, DoctorLeave, NewBlockedSlot, NewDoctorLeave, NewReleaseRule,
    NewSlot, NewWeeklySchedule, Slot, SlotPurge, SlotReleaseRule, TimeRange, WeeklySchedule,
};

use super::{ScheduleStore, StoreResult};

#[derive(Default)]
struct Tables {
    next_id: i64,
    doctor_branches: BTreeMap<i64, DoctorBranch>,
    weekly_schedules: BTreeMap<i64, WeeklySchedule>,
    release_rules: BTreeMap<i64, SlotReleaseRule>,
    blocked_slots: BTreeMap<i64, BlockedSlot>,
    leaves: BTreeMap<i64, DoctorLeave>,
    slots: BTreeMap<i64, Slot>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryScheduleStore {
    tables: RwLock<Tables>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_doctor_branch(&self, doctor_branch: DoctorBranch) {
        let mut tables = self.tables.write().await;
        tables.next_id = tables.next_id.max(doctor_branch.id);
        tables.doctor_branches.insert(doctor_branch.id, doctor_branch);
    }

    pub async fn all_slots(&self) -> Vec<Slot> {
        self.tables.read().await.slots.values().cloned().collect()
    }

    pub async fn get_slot(&self, id: i64) -> Option<Slot> {
        self.tables.read().await.slots.get(&id).cloned()
    }

    /// Books one seat, the way the appointment flow would.
    pub async fn record_booking(&self, slot_id: i64) -> StoreResult<Slot> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| ScheduleError::NotFound(format!("Slot {}", slot_id)))?;
        slot.record_booking()?;
        Ok(slot.clone())
    }

    pub async fn record_cancellation(&self, slot_id: i64) -> StoreResult<Slot> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| ScheduleError::NotFound(format!("Slot {}", slot_id)))?;
        slot.record_cancellation()?;
        Ok(slot.clone())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn get_doctor_branch(&self, id: i64) -> StoreResult<Option<DoctorBranch>> {
        Ok(self.tables.read().await.doctor_branches.get(&id).copied())
    }

    async fn list_doctor_branches_for_doctor(&self, doctor_id: i64) -> StoreResult<Vec<DoctorBranch>> {
        Ok(self
            .tables
            .read()
            .await
            .doctor_branches
            .values()
            .filter(|branch| branch.doctor_id == doctor_id)
            .copied()
            .collect())
    }

    async fn list_weekly_schedules(&self, doctor_branch_id: i64) -> StoreResult<Vec<WeeklySchedule>> {
        let mut schedules: Vec<WeeklySchedule> = self
            .tables
            .read()
            .await
            .weekly_schedules
            .values()
            .filter(|schedule| schedule.doctor_branch_id == doctor_branch_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|schedule| schedule.weekday);
        Ok(schedules)
    }

    async fn get_weekly_schedule(&self, id: i64) -> StoreResult<Option<WeeklySchedule>> {
        Ok(self.tables.read().await.weekly_schedules.get(&id).cloned())
    }

    async fn replace_weekly_schedules(
        &self,
        doctor_branch_id: i64,
        schedules: &[NewWeeklySchedule],
    ) -> StoreResult<Vec<WeeklySchedule>> {
        let mut tables = self.tables.write().await;
        tables
            .weekly_schedules
            .retain(|_, schedule| schedule.doctor_branch_id != doctor_branch_id);

        let mut saved = Vec::with_capacity(schedules.len());
        for input in schedules {
            let schedule_id = tables.next_id();
            let mut time_ranges = Vec::with_capacity(input.time_ranges.len());
            for range in &input.time_ranges {
                time_ranges.push(TimeRange {
                    id: tables.next_id(),
                    weekly_schedule_id: schedule_id,
                    start_time: range.start_time,
                    end_time: range.end_time,
                    slot_duration_minutes: range.slot_duration_minutes,
                    slot_quantity: range.slot_quantity,
                });
            }
            let schedule = WeeklySchedule {
                id: schedule_id,
                doctor_branch_id,
                weekday: input.weekday,
                time_ranges,
            };
            tables.weekly_schedules.insert(schedule_id, schedule.clone());
            saved.push(schedule);
        }

        debug!("Replaced weekly schedule of doctor-branch {} in memory", doctor_branch_id);
        Ok(saved)
    }

    async fn delete_weekly_schedule(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.write().await.weekly_schedules.remove(&id).is_some())
    }

    async fn list_release_rules(&self, doctor_branch_id: i64) -> StoreResult<Vec<SlotReleaseRule>> {
        Ok(self
            .tables
            .read()
            .await
            .release_rules
            .values()
            .filter(|rule| rule.doctor_branch_id == doctor_branch_id)
            .cloned()
            .collect())
    }

    async fn get_release_rule(&self, id: i64) -> StoreResult<Option<SlotReleaseRule>> {
        Ok(self.tables.read().await.release_rules.get(&id).cloned())
    }

    async fn insert_release_rule(&self, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let saved = rule.clone().into_rule(id, Utc::now());
        tables.release_rules.insert(id, saved.clone());
        Ok(saved)
    }

    async fn update_release_rule(&self, id: i64, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule> {
        let mut tables = self.tables.write().await;
        if !tables.release_rules.contains_key(&id) {
            return Err(ScheduleError::NotFound(format!("Release rule {}", id)));
        }
        let saved = rule.clone().into_rule(id, Utc::now());
        tables.release_rules.insert(id, saved.clone());
        Ok(saved)
    }

    async fn delete_release_rule(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.write().await.release_rules.remove(&id).is_some())
    }

    async fn list_blocked_slots(
        &self,
        doctor_id: i64,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<BlockedSlot>> {
        Ok(self
            .tables
            .read()
            .await
            .blocked_slots
            .values()
            .filter(|blocked| blocked.doctor_id == doctor_id)
            .filter(|blocked| from.map_or(true, |from| blocked.slot_date >= from))
            .filter(|blocked| to.map_or(true, |to| blocked.slot_date < to))
            .cloned()
            .collect())
    }

    async fn get_blocked_slot(&self, id: i64) -> StoreResult<Option<BlockedSlot>> {
        Ok(self.tables.read().await.blocked_slots.get(&id).cloned())
    }

    async fn insert_blocked_slot(&self, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let saved = BlockedSlot {
            id,
            doctor_id: blocked.doctor_id,
            slot_date: blocked.slot_date,
            start_time: blocked.start_time,
            end_time: blocked.end_time,
            reason: blocked.reason.clone(),
        };
        tables.blocked_slots.insert(id, saved.clone());
        Ok(saved)
    }

    async fn update_blocked_slot(&self, id: i64, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .blocked_slots
            .get_mut(&id)
            .ok_or_else(|| ScheduleError::NotFound(format!("Blocked slot {}", id)))?;
        existing.doctor_id = blocked.doctor_id;
        existing.slot_date = blocked.slot_date;
        existing.start_time = blocked.start_time;
        existing.end_time = blocked.end_time;
        existing.reason = blocked.reason.clone();
        Ok(existing.clone())
    }

    async fn delete_blocked_slot(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.write().await.blocked_slots.remove(&id).is_some())
    }

    async fn list_leaves(&self, doctor_branch_id: i64) -> StoreResult<Vec<DoctorLeave>> {
        Ok(self
            .tables
            .read()
            .await
            .leaves
            .values()
            .filter(|leave| leave.doctor_branch_id == doctor_branch_id)
            .cloned()
            .collect())
    }

    async fn get_leave(&self, id: i64) -> StoreResult<Option<DoctorLeave>> {
        Ok(self.tables.read().await.leaves.get(&id).cloned())
    }

    async fn insert_leave(&self, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let saved = DoctorLeave {
            id,
            doctor_branch_id: leave.doctor_branch_id,
            leave_start: leave.leave_start,
            leave_end: leave.leave_end,
            reason: leave.reason.clone(),
            approved: leave.approved,
        };
        tables.leaves.insert(id, saved.clone());
        Ok(saved)
    }

    async fn update_leave(&self, id: i64, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .leaves
            .get_mut(&id)
            .ok_or_else(|| ScheduleError::NotFound(format!("Leave {}", id)))?;
        existing.doctor_branch_id = leave.doctor_branch_id;
        existing.leave_start = leave.leave_start;
        existing.leave_end = leave.leave_end;
        existing.reason = leave.reason.clone();
        existing.approved = leave.approved;
        Ok(existing.clone())
    }

    async fn delete_leave(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.write().await.leaves.remove(&id).is_some())
    }

    async fn list_slots(
        &self,
        doctor_branch_id: i64,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<Slot>> {
        let mut slots: Vec<Slot> = self
            .tables
            .read()
            .await
            .slots
            .values()
            .filter(|slot| slot.doctor_branch_id == doctor_branch_id)
            .filter(|slot| slot.slot_date >= from && to.map_or(true, |to| slot.slot_date < to))
            .cloned()
            .collect();
        slots.sort_by_key(|slot| (slot.slot_date, slot.start_time, slot.end_time));
        Ok(slots)
    }

    async fn insert_slots(&self, slots: &[NewSlot]) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for slot in slots {
            let key = slot.key();
            if tables.slots.values().any(|existing| existing.key() == key) {
                continue;
            }
            let id = tables.next_id();
            tables.slots.insert(id, slot.clone().into_slot(id));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn refresh_slots(&self, slots: &[Slot]) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for slot in slots {
            if let Some(existing) = tables.slots.get_mut(&slot.id) {
                if existing.is_frozen() {
                    continue;
                }
                existing.time_range_id = slot.time_range_id;
                existing.capacity = slot.capacity;
                existing.release_at = slot.release_at;
                existing.status = slot.status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn block_slots(&self, slot_ids: &[i64]) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let mut blocked = 0;
        for id in slot_ids {
            if let Some(slot) = tables.slots.get_mut(id) {
                if slot.block() {
                    blocked += 1;
                }
            }
        }
        Ok(blocked)
    }

    async fn delete_unbooked_slots(&self, doctor_branch_id: i64, purge: &SlotPurge) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.slots.len();
        tables
            .slots
            .retain(|_, slot| !(slot.doctor_branch_id == doctor_branch_id && purge.matches(slot)));
        Ok(before - tables.slots.len())
    }

    async fn release_due_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .slots
            .values_mut()
            .filter_map(|slot| slot.release(as_of).then(|| slot.clone()))
            .collect())
    }

    async fn expire_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .slots
            .values_mut()
            .filter_map(|slot| slot.expire(as_of).then(|| slot.clone()))
            .collect())
    }
}
