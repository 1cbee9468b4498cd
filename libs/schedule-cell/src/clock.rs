use chrono::{FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use tracing::warn;

/// Wall clock of the clinic. Slot dates, times and release instants are all
/// local to this offset.
#[derive(Debug, Clone, Copy)]
pub struct ClinicClock {
    offset: FixedOffset,
    pinned: Option<NaiveDateTime>,
}

impl ClinicClock {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| {
            warn!(
                "Clinic UTC offset of {} minutes is out of range, using UTC",
                utc_offset_minutes
            );
            Utc.fix()
        });
        Self { offset, pinned: None }
    }

    pub fn utc() -> Self {
        Self::new(0)
    }

    /// A clock that always reads `at`.
    pub fn fixed(at: NaiveDateTime) -> Self {
        Self {
            offset: Utc.fix(),
            pinned: Some(at),
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        match self.pinned {
            Some(at) => at,
            None => Utc::now().with_timezone(&self.offset).naive_local(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date()
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Default for ClinicClock {
    fn default() -> Self {
        Self::utc()
    }
}
