//! Readiness polling.

mod interest;
mod set;

pub use interest::Interest;
pub use set::{PollSet, Readiness};
