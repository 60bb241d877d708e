//! Data models for CostWatch

mod alert;
mod usage;

pub use alert::*;
pub use usage::*;
