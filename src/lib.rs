//! esi-mirror - Local-first mirror of ESI character data.
//!
//! Syncs paginated, cache-aware ESI endpoints (character assets, killmail
//! details) into a local SQLite database, reconciling deletions and keeping
//! repeated runs idempotent.

pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use db::pool::DbPool;
pub use error::AppError;
