use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    BlockedSlot, BlockedSlotRequest, DoctorLeave, DoctorLeaveRequest, NewBlockedSlot,
    NewDoctorLeave, SlotPurge, SlotStatus, SlotWindow,
};
use crate::services::cache::ScheduleCache;
use crate::state::ScheduleState;
use crate::store::ScheduleStore;

/// Exclusion windows that apply to one doctor-branch during a generation run.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    blocked: Vec<BlockedSlot>,
    leaves: Vec<DoctorLeave>,
}

impl Exclusions {
    /// Unapproved leave is kept out; it never suppresses slots.
    pub fn new(blocked: Vec<BlockedSlot>, leaves: Vec<DoctorLeave>) -> Self {
        Self {
            blocked,
            leaves: leaves.into_iter().filter(|leave| leave.approved).collect(),
        }
    }

    pub fn on_leave(&self, date: NaiveDate) -> bool {
        self.leaves.iter().any(|leave| leave.covers(date))
    }

    pub fn is_excluded(&self, date: NaiveDate, window: &SlotWindow) -> bool {
        self.on_leave(date)
            || self
                .blocked
                .iter()
                .any(|blocked| blocked.slot_date == date && blocked.window().overlaps(window))
    }
}

pub struct ExclusionService {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
}

impl ExclusionService {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            store: state.store.clone(),
            cache: state.cache.clone(),
        }
    }

    // ==========================================================================
    // BLOCKED SLOTS
    // ==========================================================================

    pub async fn get_blocked_slot(&self, id: i64) -> ScheduleResult<BlockedSlot> {
        self.store
            .get_blocked_slot(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(format!("Blocked slot {}", id)))
    }

    pub async fn list_blocked_slots(&self, doctor_id: i64) -> ScheduleResult<Vec<BlockedSlot>> {
        self.store.list_blocked_slots(doctor_id, None, None).await
    }

    /// Saves a blocked period and blocks the doctor's generated slots inside it.
    pub async fn save_blocked_slot(&self, request: BlockedSlotRequest) -> ScheduleResult<BlockedSlot> {
        if request.start_time >= request.end_time {
            return Err(ScheduleError::Validation(
                "Blocked slot must start before it ends".to_string(),
            ));
        }

        let input = NewBlockedSlot::from(&request);
        let saved = match request.id {
            Some(id) => {
                let previous = self.get_blocked_slot(id).await?;
                let saved = self.store.update_blocked_slot(id, &input).await?;
                if previous.doctor_id != saved.doctor_id
                    || previous.slot_date != saved.slot_date
                    || previous.window() != saved.window()
                {
                    self.unblock_for_doctor(&previous).await?;
                }
                saved
            }
            None => self.store.insert_blocked_slot(&input).await?,
        };

        let mut blocked = 0;
        for doctor_branch_id in self.doctor_branch_ids(saved.doctor_id).await? {
            blocked += self
                .block_slots(doctor_branch_id, saved.slot_date, saved.slot_date.succ_opt(), Some(saved.window()))
                .await?;
            self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        }

        info!(
            "Saved blocked slot {} for doctor {} on {} ({} slots blocked)",
            saved.id, saved.doctor_id, saved.slot_date, blocked
        );
        Ok(saved)
    }

    pub async fn delete_blocked_slot(&self, id: i64) -> ScheduleResult<BlockedSlot> {
        let blocked = self.get_blocked_slot(id).await?;
        self.store.delete_blocked_slot(id).await?;
        self.unblock_for_doctor(&blocked).await?;
        info!("Deleted blocked slot {}", id);
        Ok(blocked)
    }

    async fn unblock_for_doctor(&self, blocked: &BlockedSlot) -> ScheduleResult<()> {
        for doctor_branch_id in self.doctor_branch_ids(blocked.doctor_id).await? {
            self.purge_blocked(
                doctor_branch_id,
                blocked.slot_date,
                blocked.slot_date.succ_opt(),
                Some(blocked.window()),
            )
            .await?;
            self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        }
        Ok(())
    }

    async fn doctor_branch_ids(&self, doctor_id: i64) -> ScheduleResult<Vec<i64>> {
        Ok(self
            .store
            .list_doctor_branches_for_doctor(doctor_id)
            .await?
            .into_iter()
            .map(|branch| branch.id)
            .collect())
    }

    // ==========================================================================
    // LEAVE
    // ==========================================================================

    pub async fn get_leave(&self, id: i64) -> ScheduleResult<DoctorLeave> {
        self.store
            .get_leave(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(format!("Leave {}", id)))
    }

    pub async fn list_leaves(&self, doctor_branch_id: i64) -> ScheduleResult<Vec<DoctorLeave>> {
        self.store.list_leaves(doctor_branch_id).await
    }

    /// New leave starts unapproved. Changing the dates of approved leave
    /// withdraws the approval.
    pub async fn save_leave(&self, request: DoctorLeaveRequest) -> ScheduleResult<DoctorLeave> {
        if request.leave_start > request.leave_end {
            return Err(ScheduleError::Validation(
                "leave_start must not be after leave_end".to_string(),
            ));
        }
        if self.store.get_doctor_branch(request.doctor_branch_id).await?.is_none() {
            return Err(ScheduleError::NotFound(format!(
                "Doctor-branch {}",
                request.doctor_branch_id
            )));
        }

        let mut input = NewDoctorLeave {
            doctor_branch_id: request.doctor_branch_id,
            leave_start: request.leave_start,
            leave_end: request.leave_end,
            reason: request.reason.clone(),
            approved: false,
        };

        let saved = match request.id {
            Some(id) => {
                let previous = self.get_leave(id).await?;
                let moved = previous.doctor_branch_id != input.doctor_branch_id
                    || previous.leave_start != input.leave_start
                    || previous.leave_end != input.leave_end;

                input.approved = previous.approved && !moved;
                let saved = self.store.update_leave(id, &input).await?;
                if previous.approved && moved {
                    info!("Leave {} changed dates, approval withdrawn", id);
                    self.unblock_leave(&previous).await?;
                }
                saved
            }
            None => self.store.insert_leave(&input).await?,
        };

        self.cache.invalidate_doctor_branch(saved.doctor_branch_id).await;
        Ok(saved)
    }

    pub async fn approve_leave(&self, id: i64) -> ScheduleResult<DoctorLeave> {
        let leave = self.get_leave(id).await?;
        if leave.approved {
            return Ok(leave);
        }

        let approved = self.store.update_leave(id, &leave_update(&leave, true)).await?;
        let blocked = self
            .block_slots(
                approved.doctor_branch_id,
                approved.leave_start,
                approved.leave_end.succ_opt(),
                None,
            )
            .await?;
        self.cache.invalidate_doctor_branch(approved.doctor_branch_id).await;

        info!(
            "Approved leave {} for doctor-branch {} ({} slots blocked)",
            id, approved.doctor_branch_id, blocked
        );
        Ok(approved)
    }

    pub async fn revoke_leave(&self, id: i64) -> ScheduleResult<DoctorLeave> {
        let leave = self.get_leave(id).await?;
        if !leave.approved {
            return Ok(leave);
        }

        let revoked = self.store.update_leave(id, &leave_update(&leave, false)).await?;
        self.unblock_leave(&leave).await?;
        info!("Revoked approval of leave {}", id);
        Ok(revoked)
    }

    pub async fn delete_leave(&self, id: i64) -> ScheduleResult<DoctorLeave> {
        let leave = self.get_leave(id).await?;
        self.store.delete_leave(id).await?;
        if leave.approved {
            self.unblock_leave(&leave).await?;
        }
        self.cache.invalidate_doctor_branch(leave.doctor_branch_id).await;
        info!("Deleted leave {}", id);
        Ok(leave)
    }

    async fn unblock_leave(&self, leave: &DoctorLeave) -> ScheduleResult<()> {
        self.purge_blocked(leave.doctor_branch_id, leave.leave_start, leave.leave_end.succ_opt(), None)
            .await?;
        self.cache.invalidate_doctor_branch(leave.doctor_branch_id).await;
        Ok(())
    }

    // ==========================================================================
    // SLOT EFFECTS
    // ==========================================================================

    /// Blocks every non-terminal slot in the window, booked ones included.
    async fn block_slots(
        &self,
        doctor_branch_id: i64,
        from: NaiveDate,
        to: Option<NaiveDate>,
        window: Option<SlotWindow>,
    ) -> ScheduleResult<usize> {
        let slots = self.store.list_slots(doctor_branch_id, from, to).await?;
        let ids: Vec<i64> = slots
            .iter()
            .filter(|slot| window.map_or(true, |window| window.overlaps(&slot.window())))
            .filter(|slot| !slot.status.is_terminal())
            .map(|slot| slot.id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }
        debug!("Blocking {} slots of doctor-branch {}", ids.len(), doctor_branch_id);
        self.store.block_slots(&ids).await
    }

    /// Removes unbooked BLOCKED slots so the next generation recreates them.
    async fn purge_blocked(
        &self,
        doctor_branch_id: i64,
        from: NaiveDate,
        to: Option<NaiveDate>,
        window: Option<SlotWindow>,
    ) -> ScheduleResult<usize> {
        let purge = SlotPurge {
            from: Some(from),
            to,
            window,
            statuses: Some(vec![SlotStatus::Blocked]),
            ..SlotPurge::default()
        };
        let purged = self.store.delete_unbooked_slots(doctor_branch_id, &purge).await?;
        debug!("Purged {} blocked slots of doctor-branch {}", purged, doctor_branch_id);
        Ok(purged)
    }
}

fn leave_update(leave: &DoctorLeave, approved: bool) -> NewDoctorLeave {
    NewDoctorLeave {
        doctor_branch_id: leave.doctor_branch_id,
        leave_start: leave.leave_start,
        leave_end: leave.leave_end,
        reason: leave.reason.clone(),
        approved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn leave(start: u32, end: u32, approved: bool) -> DoctorLeave {
        DoctorLeave {
            id: 1,
            doctor_branch_id: 5,
            leave_start: date(start),
            leave_end: date(end),
            reason: None,
            approved,
        }
    }

    #[test]
    fn approved_leave_is_inclusive_on_both_ends() {
        let exclusions = Exclusions::new(vec![], vec![leave(8, 10, true)]);
        let window = SlotWindow::new(time(9, 0), time(9, 15));

        assert!(!exclusions.is_excluded(date(7), &window));
        assert!(exclusions.is_excluded(date(8), &window));
        assert!(exclusions.is_excluded(date(10), &window));
        assert!(!exclusions.is_excluded(date(11), &window));
    }

    #[test]
    fn unapproved_leave_is_inert() {
        let exclusions = Exclusions::new(vec![], vec![leave(8, 10, false)]);
        assert!(!exclusions.is_excluded(date(9), &SlotWindow::new(time(9, 0), time(9, 15))));
    }

    #[test]
    fn blocked_slot_excludes_overlapping_windows_on_its_date() {
        let blocked = BlockedSlot {
            id: 1,
            doctor_id: 3,
            slot_date: date(8),
            start_time: time(9, 10),
            end_time: time(9, 20),
            reason: Some("meeting".to_string()),
        };
        let exclusions = Exclusions::new(vec![blocked], vec![]);

        assert!(exclusions.is_excluded(date(8), &SlotWindow::new(time(9, 0), time(9, 15))));
        assert!(exclusions.is_excluded(date(8), &SlotWindow::new(time(9, 15), time(9, 30))));
        assert!(!exclusions.is_excluded(date(8), &SlotWindow::new(time(9, 20), time(9, 35))));
        assert!(!exclusions.is_excluded(date(9), &SlotWindow::new(time(9, 0), time(9, 15))));
    }
}
