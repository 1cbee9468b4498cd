#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use schedule_cell::services::GenerationLock;
use schedule_cell::{
    ClinicClock, DoctorBranch, InMemoryScheduleStore, SaveWeeklyScheduleRequest, ScheduleState,
    ScheduleStore, TimeRangeInput, WeeklyScheduleInput,
};
use shared_config::AppConfig;
use shared_utils::test_utils::TestConfig;

pub const DOCTOR_BRANCH: i64 = 5;
pub const DOCTOR: i64 = 3;

pub fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 2024-01-07 is a Sunday.
pub fn sunday() -> NaiveDate {
    date(2024, 1, 7)
}

pub fn monday() -> NaiveDate {
    date(2024, 1, 8)
}

pub fn sunday_morning() -> NaiveDateTime {
    sunday().and_time(time(8, 0))
}

pub fn test_config() -> AppConfig {
    TestConfig::default().to_app_config()
}

pub struct Harness {
    pub state: Arc<ScheduleState>,
    pub store: Arc<InMemoryScheduleStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let store = Arc::new(InMemoryScheduleStore::new());
        store
            .insert_doctor_branch(DoctorBranch {
                id: DOCTOR_BRANCH,
                doctor_id: DOCTOR,
                branch_id: 1,
                is_active: true,
            })
            .await;

        let state = ScheduleState::new(
            Arc::new(config),
            store.clone() as Arc<dyn ScheduleStore>,
            GenerationLock::local(),
        )
        .with_clock(ClinicClock::fixed(sunday_morning()));

        Self {
            state: Arc::new(state),
            store,
        }
    }

    /// Same store, different wall clock.
    pub fn at(&self, now: NaiveDateTime) -> ScheduleState {
        (*self.state).clone().with_clock(ClinicClock::fixed(now))
    }
}

pub fn range(start: NaiveTime, end: NaiveTime, duration: i32, quantity: i32) -> TimeRangeInput {
    TimeRangeInput {
        start_time: start,
        end_time: end,
        slot_duration_minutes: Some(duration),
        slot_quantity: Some(quantity),
    }
}

/// Monday 09:00-09:30, 15 minute slots.
pub fn monday_week(quantity: i32) -> SaveWeeklyScheduleRequest {
    SaveWeeklyScheduleRequest {
        schedules: vec![WeeklyScheduleInput {
            weekday: 1,
            time_ranges: vec![range(time(9, 0), time(9, 30), 15, quantity)],
        }],
    }
}
