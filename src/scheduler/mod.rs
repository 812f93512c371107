pub mod automation;
pub mod planner;
pub mod selector;
pub mod sequence;

pub use automation::{CycleOutcome, Phase, Scheduler};
pub use planner::{Plan, PlanOutcome, PlannedSong};
