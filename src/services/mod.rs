//! Business logic services.
//!
//! This module contains the core logic for talking to ESI and mirroring its
//! responses into local storage: the HTTP client with conditional requests,
//! the paged asset sync with reconciliation, the killmail graph builder, and
//! the background sync engine that schedules them.
//!
//! Services take their fetch collaborator through the [`EsiFetch`] trait so
//! tests can drive them without a network.

pub mod asset_sync;
pub mod esi_client;
pub mod killmail_sync;
pub mod sync_engine;

pub use asset_sync::{sync_character_assets, AssetSyncOutcome};
pub use esi_client::{EsiClient, EsiClientConfig, EsiFetch};
pub use killmail_sync::{sync_killmail, KillmailListener, KillmailSyncOutcome};
pub use sync_engine::{SyncConfig, SyncEngine, SyncHandle, SyncStatus};
