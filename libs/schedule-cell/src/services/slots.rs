use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::clock::ClinicClock;
use crate::error::ScheduleResult;
use crate::models::Slot;
use crate::services::cache::{CacheKey, CachedValue, ScheduleCache};
use crate::state::ScheduleState;
use crate::store::ScheduleStore;

pub struct SlotService {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
    clock: ClinicClock,
}

impl SlotService {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            store: state.store.clone(),
            cache: state.cache.clone(),
            clock: state.clock,
        }
    }

    /// Slots on `date`, or from today onwards. Statuses are reported as of now.
    pub async fn list_slots(
        &self,
        tenant_id: &str,
        doctor_branch_id: i64,
        date: Option<NaiveDate>,
    ) -> ScheduleResult<Vec<Slot>> {
        let (from, to) = match date {
            Some(date) => (date, date.succ_opt()),
            None => (self.clock.today(), None),
        };

        let key = CacheKey::slots(tenant_id, doctor_branch_id, from, to);
        let slots = match self.cache.get_slots(&key).await {
            Some(slots) => slots,
            None => {
                let ticket = self.cache.ticket(doctor_branch_id).await;
                let slots = self.store.list_slots(doctor_branch_id, from, to).await?;
                self.cache.put(key, CachedValue::Slots(slots.clone()), ticket).await;
                slots
            }
        };

        let now = self.clock.now();
        Ok(slots
            .into_iter()
            .map(|mut slot| {
                slot.status = slot.effective_status(now);
                slot
            })
            .collect())
    }

    /// Expires unbooked slots that started at or before `as_of` (default now).
    pub async fn mark_expired(&self, as_of: Option<NaiveDateTime>) -> ScheduleResult<Vec<Slot>> {
        let as_of = as_of.unwrap_or_else(|| self.clock.now());
        let expired = self.store.expire_slots(as_of).await?;
        self.invalidate(&expired).await;

        if !expired.is_empty() {
            info!("Marked {} slots expired as of {}", expired.len(), as_of);
        }
        Ok(expired)
    }

    /// Opens pending slots whose release instant is at or before `as_of`.
    pub async fn release_due(&self, as_of: Option<NaiveDateTime>) -> ScheduleResult<Vec<Slot>> {
        let as_of = as_of.unwrap_or_else(|| self.clock.now());
        let released = self.store.release_due_slots(as_of).await?;
        self.invalidate(&released).await;

        if !released.is_empty() {
            debug!("Released {} slots as of {}", released.len(), as_of);
        }
        Ok(released)
    }

    async fn invalidate(&self, slots: &[Slot]) {
        let doctor_branches: BTreeSet<i64> = slots.iter().map(|slot| slot.doctor_branch_id).collect();
        for doctor_branch_id in doctor_branches {
            self.cache.invalidate_doctor_branch(doctor_branch_id).await;
        }
    }
}
