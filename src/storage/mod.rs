//! Durable listing metadata.

pub mod sqlite;
