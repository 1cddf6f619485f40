//! Drip campaign engine: time-shifted campaign instances, candidate
//! resolution, dedup against sent records, and the delivery pipeline.

pub mod audience;
pub mod drip;
pub mod shift;
pub mod store;
pub mod trigger;

pub use audience::{AllUsers, Audience, FnAudience};
pub use drip::{Drip, DripContext, TimelineEntry};
pub use shift::{TimeShift, Walk};
pub use store::{DripStore, Fixtures, MemoryStore};
pub use trigger::{CampaignRun, RunOutcome, TriggerDispatcher};
