//! Device facade: protocol-agnostic read/write over tag sets.

mod facade;
mod plan;

pub use facade::{Device, WriteOutcome};
pub use plan::{plan_read_windows, plan_write_runs, TagBinding, Window};
