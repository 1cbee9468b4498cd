use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::error::ScheduleResult;
use crate::services::slots::SlotService;
use crate::state::ScheduleState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub expired: usize,
}

/// Periodically opens due slots and expires started ones.
pub struct SlotSweeper {
    slots: SlotService,
    period: Duration,
    is_shutdown: RwLock<bool>,
}

impl SlotSweeper {
    pub fn new(state: &ScheduleState) -> Self {
        Self {
            slots: SlotService::new(state),
            period: Duration::from_secs(state.config.sweep_interval_seconds.max(1)),
            is_shutdown: RwLock::new(false),
        }
    }

    /// One pass: release first so a slot due and started in the same tick
    /// still ends up EXPIRED.
    pub async fn tick(&self) -> ScheduleResult<SweepReport> {
        let released = self.slots.release_due(None).await?.len();
        let expired = self.slots.mark_expired(None).await?.len();
        Ok(SweepReport { released, expired })
    }

    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!("Slot sweeper started, running every {:?}", self.period);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if *self.is_shutdown.read().await {
                break;
            }

            match self.tick().await {
                Ok(report) if report != SweepReport::default() => {
                    debug!("Sweep released {} and expired {} slots", report.released, report.expired)
                }
                Ok(_) => {}
                Err(e) => error!("Slot sweep failed: {}", e),
            }
        }

        info!("Slot sweeper stopped");
    }

    pub async fn shutdown(&self) {
        *self.is_shutdown.write().await = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use shared_utils::test_utils::TestConfig;
    use tokio_test::assert_ok;

    use crate::clock::ClinicClock;
    use crate::models::{NewSlot, SlotStatus};
    use crate::services::lock::GenerationLock;
    use crate::store::{InMemoryScheduleStore, ScheduleStore};

    fn at(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    fn slot(start: NaiveDateTime, release_at: NaiveDateTime, status: SlotStatus) -> NewSlot {
        NewSlot {
            doctor_branch_id: 5,
            time_range_id: None,
            slot_date: start.date(),
            start_time: start.time(),
            end_time: start.time() + chrono::Duration::minutes(15),
            capacity: 1,
            booked_count: 0,
            release_at,
            status,
        }
    }

    async fn state_at(now: NaiveDateTime) -> (ScheduleState, Arc<InMemoryScheduleStore>) {
        let store = Arc::new(InMemoryScheduleStore::new());
        store
            .insert_slots(&[
                slot(at(8, 9), at(8, 6), SlotStatus::PendingRelease),
                slot(at(7, 7), at(6, 6), SlotStatus::Open),
            ])
            .await
            .unwrap();

        let state = ScheduleState::new(
            TestConfig::default().to_arc(),
            store.clone() as Arc<dyn ScheduleStore>,
            GenerationLock::local(),
        )
        .with_clock(ClinicClock::fixed(now));
        (state, store)
    }

    #[tokio::test]
    async fn tick_releases_then_expires() {
        let (state, store) = state_at(at(8, 7)).await;
        let sweeper = SlotSweeper::new(&state);

        let report = assert_ok!(sweeper.tick().await);
        assert_eq!(report, SweepReport { released: 1, expired: 1 });

        let statuses: Vec<SlotStatus> = store.all_slots().await.iter().map(|s| s.status).collect();
        assert!(statuses.contains(&SlotStatus::Open));
        assert!(statuses.contains(&SlotStatus::Expired));

        assert_eq!(assert_ok!(sweeper.tick().await), SweepReport::default());
    }

    #[tokio::test]
    async fn run_stops_after_shutdown() {
        let (state, _) = state_at(at(8, 7)).await;
        let sweeper = SlotSweeper::new(&state);
        sweeper.shutdown().await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), sweeper.run()).await;
        assert!(stopped.is_ok());
    }
}
