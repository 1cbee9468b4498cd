pub mod clock;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod store;

pub use clock::ClinicClock;
pub use error::{ScheduleError, ScheduleResult, SlotTransitionError};
pub use models::*;
pub use router::schedule_routes;
pub use state::ScheduleState;
pub use store::{InMemoryScheduleStore, ScheduleStore, SupabaseScheduleStore};
