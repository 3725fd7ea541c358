//! Database module for Waypost.
//!
//! Provides the storage traits the monitoring core depends on and a SQLite
//! implementation of them.

mod models;
mod repository;
mod store;

pub use models::*;
pub use repository::*;
pub use store::*;
