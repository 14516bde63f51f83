//! Background sync engine.
//!
//! This module provides the scheduling shell around the sync units:
//! - Periodic asset mirroring for every tracked character
//! - On-demand killmail detail fetches
//! - Sync logging for status display
//!
//! Each unit of work (one character's assets, one killmail) is independent;
//! a failure in one never aborts the others, and the external caller may
//! re-trigger any unit at will because every write is safe to repeat.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::character;
use crate::services::asset_sync;
use crate::services::esi_client::EsiFetch;
use crate::services::killmail_sync::{self, KillmailListener};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio::time;

/// Default sync interval in seconds (ESI caches the asset list for an hour).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;

/// Maximum number of log entries to keep.
const MAX_LOG_ENTRIES: i64 = 50;

/// Get the current Unix timestamp.
fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync interval in seconds.
    pub interval_secs: u64,

    /// Whether the periodic tick mirrors asset collections.
    pub sync_assets: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sync_assets: true,
        }
    }
}

/// Status of the sync engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Whether sync is currently running.
    pub is_syncing: bool,

    /// Last successful sync timestamp.
    pub last_sync_time: Option<i64>,

    /// Last sync error message.
    pub last_error: Option<String>,

    /// Number of characters synced in the last run.
    pub last_characters_synced: i64,
}

/// Sync log entry matching the sync_log table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation: String,
    pub status: String,
    pub subject_id: Option<i64>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

/// Result of a full sync pass over all tracked characters.
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Characters whose collections were traversed.
    pub characters_synced: i64,

    /// Characters skipped because page 1 was unchanged.
    pub characters_unchanged: i64,

    /// Asset rows upserted across all characters.
    pub assets_upserted: i64,

    /// Stale asset rows deleted by reconciliation.
    pub assets_deleted: i64,

    /// Per-character errors (unit failures do not abort the pass).
    pub errors: Vec<String>,

    /// Duration of the pass in milliseconds.
    pub duration_ms: i64,
}

/// Commands that can be sent to the sync engine.
#[derive(Debug)]
pub enum SyncCommand {
    /// Trigger an immediate asset sync pass.
    TriggerSync,

    /// Fetch and store one killmail's record graph.
    SyncKillmail {
        killmail_id: i64,
        killmail_hash: String,
    },

    /// Update the sync configuration.
    UpdateConfig(SyncConfig),

    /// Stop the sync engine.
    Stop,
}

/// Lightweight handle for controlling the background sync engine.
///
/// Communicates with the background loop via an mpsc channel, avoiding lock
/// contention.
#[derive(Clone)]
pub struct SyncHandle {
    /// Command channel sender.
    command_tx: mpsc::Sender<SyncCommand>,

    /// Shared configuration (readable without locking the engine).
    config: Arc<RwLock<SyncConfig>>,
}

impl SyncHandle {
    /// Trigger an immediate asset sync pass.
    pub async fn trigger_sync(&self) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::TriggerSync)
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Request a killmail fetch.
    pub async fn sync_killmail(
        &self,
        killmail_id: i64,
        killmail_hash: impl Into<String>,
    ) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::SyncKillmail {
                killmail_id,
                killmail_hash: killmail_hash.into(),
            })
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Update the sync configuration.
    pub async fn update_config(&self, config: SyncConfig) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::UpdateConfig(config))
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Stop the background loop.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.command_tx
            .send(SyncCommand::Stop)
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }
}

/// Background sync engine.
pub struct SyncEngine {
    /// Database connection pool.
    pool: DbPool,

    /// Fetch collaborator.
    fetcher: Arc<dyn EsiFetch>,

    /// Current configuration.
    config: Arc<RwLock<SyncConfig>>,

    /// Sync status.
    status: Arc<RwLock<SyncStatus>>,

    /// Optional killmail post-commit subscriber.
    listener: Option<Arc<dyn KillmailListener>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(pool: DbPool, fetcher: Arc<dyn EsiFetch>) -> Self {
        Self {
            pool,
            fetcher,
            config: Arc::new(RwLock::new(SyncConfig::default())),
            status: Arc::new(RwLock::new(SyncStatus::default())),
            listener: None,
        }
    }

    /// Register a killmail listener, invoked synchronously after a killmail
    /// graph is stored for the first time.
    pub fn with_listener(mut self, listener: Arc<dyn KillmailListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get a snapshot of the current sync status.
    pub async fn get_status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Start the background sync loop.
    ///
    /// Spawns a task that owns the engine and runs a sync pass at the
    /// configured interval. Returns a lightweight `SyncHandle` for sending
    /// commands (trigger, killmail, config update, stop) without holding a
    /// lock.
    pub fn start_background(mut self, config: SyncConfig) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);
        let config_shared = Arc::new(RwLock::new(config.clone()));
        self.config = config_shared.clone();

        tokio::spawn(async move {
            let engine = self;

            let interval_secs = { engine.config.read().await.interval_secs };
            let mut interval = time::interval(Duration::from_secs(interval_secs));
            // The first tick fires immediately, giving an initial sync
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        log::info!("running periodic sync pass");
                        if let Err(e) = engine.run_sync().await {
                            log::warn!("periodic sync error: {}", e);
                        }
                    }
                    Some(cmd) = rx.recv() => {
                        match cmd {
                            SyncCommand::TriggerSync => {
                                log::info!("manual sync triggered");
                                if let Err(e) = engine.run_sync().await {
                                    log::warn!("manual sync error: {}", e);
                                }
                            }
                            SyncCommand::SyncKillmail { killmail_id, killmail_hash } => {
                                if let Err(e) = engine.run_killmail_sync(killmail_id, &killmail_hash).await {
                                    log::warn!("killmail {} sync error: {}", killmail_id, e);
                                }
                            }
                            SyncCommand::UpdateConfig(new_config) => {
                                log::info!("config updated, interval={}s", new_config.interval_secs);
                                interval = time::interval(Duration::from_secs(new_config.interval_secs));
                                // Skip the immediate tick of the fresh interval
                                interval.tick().await;
                                *engine.config.write().await = new_config;
                            }
                            SyncCommand::Stop => {
                                log::info!("sync engine stopping");
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("sync engine stopped");
        });

        SyncHandle {
            command_tx: tx,
            config: config_shared,
        }
    }

    /// Run a single sync pass over every tracked character.
    pub async fn run_sync(&self) -> Result<SyncResult, AppError> {
        let start = Instant::now();

        {
            let mut status = self.status.write().await;
            status.is_syncing = true;
        }

        let mut result = SyncResult::default();

        let config = self.config.read().await.clone();
        if config.sync_assets {
            let characters = character::list_characters(&self.pool).await?;
            log::debug!("syncing {} tracked character(s)", characters.len());

            for tracked in characters {
                let unit_start = Instant::now();
                match asset_sync::sync_character_assets(
                    &self.pool,
                    self.fetcher.as_ref(),
                    tracked.character_id,
                )
                .await
                {
                    Ok(outcome) if outcome.unchanged => {
                        result.characters_unchanged += 1;
                    }
                    Ok(outcome) => {
                        result.characters_synced += 1;
                        result.assets_upserted += outcome.upserted;
                        result.assets_deleted += outcome.deleted;

                        self.log_sync_operation(
                            "asset_sync",
                            "success",
                            Some(tracked.character_id),
                            Some(format!(
                                "{} upserted, {} deleted over {} page(s)",
                                outcome.upserted, outcome.deleted, outcome.pages
                            )),
                            Some(unit_start.elapsed().as_millis() as i64),
                        )
                        .await?;
                    }
                    Err(e) => {
                        result
                            .errors
                            .push(format!("character {}: {}", tracked.character_id, e));

                        self.log_sync_operation(
                            "asset_sync",
                            "error",
                            Some(tracked.character_id),
                            Some(e.to_string()),
                            Some(unit_start.elapsed().as_millis() as i64),
                        )
                        .await?;
                    }
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as i64;

        {
            let mut status = self.status.write().await;
            status.is_syncing = false;
            status.last_sync_time = Some(now());
            status.last_characters_synced = result.characters_synced;
            status.last_error = if result.errors.is_empty() {
                None
            } else {
                Some(result.errors.join("; "))
            };
        }

        self.log_sync_operation(
            "sync_complete",
            if result.errors.is_empty() {
                "success"
            } else {
                "error"
            },
            None,
            Some(format!(
                "{} synced, {} unchanged, {} errors",
                result.characters_synced,
                result.characters_unchanged,
                result.errors.len()
            )),
            Some(result.duration_ms),
        )
        .await?;

        Ok(result)
    }

    /// Run a single killmail sync unit.
    pub async fn run_killmail_sync(
        &self,
        killmail_id: i64,
        killmail_hash: &str,
    ) -> Result<(), AppError> {
        let start = Instant::now();

        let outcome = killmail_sync::sync_killmail(
            &self.pool,
            self.fetcher.as_ref(),
            self.listener.as_ref(),
            killmail_id,
            killmail_hash,
        )
        .await;

        match &outcome {
            Ok(o) => {
                self.log_sync_operation(
                    "killmail_sync",
                    "success",
                    Some(killmail_id),
                    Some(if o.unchanged {
                        "unchanged".to_string()
                    } else {
                        format!(
                            "{} attackers, {} items",
                            o.attackers_created, o.items_attached
                        )
                    }),
                    Some(start.elapsed().as_millis() as i64),
                )
                .await?;
            }
            Err(e) => {
                self.log_sync_operation(
                    "killmail_sync",
                    "error",
                    Some(killmail_id),
                    Some(e.to_string()),
                    Some(start.elapsed().as_millis() as i64),
                )
                .await?;
            }
        }

        outcome.map(|_| ())
    }

    /// Log a sync operation to the sync_log table.
    pub async fn log_sync_operation(
        &self,
        operation: &str,
        status: &str,
        subject_id: Option<i64>,
        message: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<(), AppError> {
        // Insert the log entry
        sqlx::query(
            r#"
            INSERT INTO sync_log (operation, status, subject_id, message, duration_ms, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(operation)
        .bind(status)
        .bind(subject_id)
        .bind(&message)
        .bind(duration_ms)
        .bind(now())
        .execute(&self.pool)
        .await?;

        // Prune old log entries (keep only MAX_LOG_ENTRIES)
        sqlx::query(
            r#"
            DELETE FROM sync_log WHERE id NOT IN (
                SELECT id FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?
            )
            "#,
        )
        .bind(MAX_LOG_ENTRIES)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get recent sync log entries.
    pub async fn get_sync_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>, AppError> {
        let entries = sqlx::query_as::<_, SyncLogEntry>(
            "SELECT id, operation, status, subject_id, message, duration_ms, timestamp
             FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
