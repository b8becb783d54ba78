//! Normalized listing entities.

pub mod types;
