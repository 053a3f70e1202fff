//! Persistence layer
//!
//! SQLite-based storage for plan records and plan results.

mod database;
mod plans;

pub use database::{Database, SharedDatabase};
pub use plans::{PlanStore, PlanSummary};
