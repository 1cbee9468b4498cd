pub mod cache;
pub mod exclusion;
pub mod generator;
pub mod lock;
pub mod release;
pub mod schedule;
pub mod slots;
pub mod sweep;

pub use cache::{CacheKey, CacheStats, CacheTicket, ScheduleCache};
pub use exclusion::{ExclusionService, Exclusions};
pub use generator::{generation_budget, plan_day, tile_time_range, SlotGenerator};
pub use lock::GenerationLock;
pub use release::{resolve_policy, ReleaseRuleService};
pub use schedule::{validate_week, WeeklyScheduleService};
pub use slots::SlotService;
pub use sweep::{SlotSweeper, SweepReport};
