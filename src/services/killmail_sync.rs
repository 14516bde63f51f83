//! Killmail detail synchronization.
//!
//! A killmail is a single immutable payload describing several related
//! records at once: the parent detail row, the victim, a variable-length
//! attacker list and the victim's item pivot. One conditional fetch
//! materializes the whole graph with create-if-absent semantics, then
//! notifies a registered listener the first time a killmail is stored.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::killmail::{
    self, KillmailDetail, KillmailVictim, NewAttacker, VictimItem,
};
use crate::services::esi_client::{EsiFetch, KillmailDto};
use std::sync::Arc;

/// Post-commit notification subscriber.
///
/// Invoked synchronously after graph construction, only on a non-cached run
/// that created the parent detail row for the first time.
pub trait KillmailListener: Send + Sync {
    fn on_killmail_stored(&self, killmail_id: i64);
}

/// Outcome of one killmail sync run.
#[derive(Debug, Clone, Default)]
pub struct KillmailSyncOutcome {
    /// True when the payload was unchanged and nothing was processed.
    pub unchanged: bool,

    /// True when this run created the parent detail row.
    pub created: bool,

    /// Number of attacker rows created by this run.
    pub attackers_created: i64,

    /// Number of victim item pivot rows created by this run.
    pub items_attached: i64,
}

/// Fetch and materialize one killmail's record graph.
///
/// Every upstream optional field is read defensively and stored as NULL
/// when absent; rows that already exist are never touched, so re-running
/// against a changed payload keeps the first successful run's values.
pub async fn sync_killmail<F: EsiFetch + ?Sized>(
    pool: &DbPool,
    fetcher: &F,
    listener: Option<&Arc<dyn KillmailListener>>,
    killmail_id: i64,
    killmail_hash: &str,
) -> Result<KillmailSyncOutcome, AppError> {
    let payload = fetcher.fetch_killmail(killmail_id, killmail_hash).await?;

    let Some(detail) = payload.into_fresh() else {
        log::debug!("killmail {} unchanged, skipping", killmail_id);
        return Ok(KillmailSyncOutcome {
            unchanged: true,
            ..Default::default()
        });
    };

    let outcome = build_graph(pool, killmail_id, &detail).await?;

    if outcome.created {
        if let Some(listener) = listener {
            listener.on_killmail_stored(killmail_id);
        }
    }

    Ok(outcome)
}

/// Materialize the four entity kinds from a fresh payload, in order:
/// parent detail, victim, attackers, victim items.
async fn build_graph(
    pool: &DbPool,
    killmail_id: i64,
    detail: &KillmailDto,
) -> Result<KillmailSyncOutcome, AppError> {
    let created = killmail::create_detail_if_absent(
        pool,
        &KillmailDetail {
            killmail_id,
            killmail_time: parse_iso_timestamp(&detail.killmail_time)?,
            solar_system_id: detail.solar_system_id,
            moon_id: detail.moon_id,
            war_id: detail.war_id,
        },
    )
    .await?;

    killmail::create_victim_if_absent(
        pool,
        &KillmailVictim {
            killmail_id,
            character_id: detail.victim.character_id,
            corporation_id: detail.victim.corporation_id,
            alliance_id: detail.victim.alliance_id,
            faction_id: detail.victim.faction_id,
            damage_taken: detail.victim.damage_taken,
            ship_type_id: detail.victim.ship_type_id,
            x: detail.victim.position.map(|p| p.x),
            y: detail.victim.position.map(|p| p.y),
            z: detail.victim.position.map(|p| p.z),
        },
    )
    .await?;

    let mut attackers_created = 0;
    for attacker in &detail.attackers {
        let inserted = killmail::create_attacker_if_absent(
            pool,
            &NewAttacker {
                killmail_id,
                character_id: attacker.character_id,
                corporation_id: attacker.corporation_id,
                alliance_id: attacker.alliance_id,
                faction_id: attacker.faction_id,
                security_status: attacker.security_status,
                final_blow: attacker.final_blow,
                damage_done: attacker.damage_done,
                ship_type_id: attacker.ship_type_id,
                weapon_type_id: attacker.weapon_type_id,
            },
        )
        .await?;

        if inserted {
            attackers_created += 1;
        }
    }

    let mut items_attached = 0;
    if let Some(items) = &detail.victim.items {
        for item in items {
            let attached = killmail::attach_victim_item(
                pool,
                &VictimItem {
                    killmail_id,
                    item_type_id: item.item_type_id,
                    flag: item.flag,
                    singleton: item.singleton,
                    quantity_destroyed: item.quantity_destroyed,
                    quantity_dropped: item.quantity_dropped,
                },
            )
            .await?;

            if attached {
                items_attached += 1;
            }
        }
    }

    if created {
        log::info!(
            "stored killmail {}: {} attackers, {} items",
            killmail_id,
            attackers_created,
            items_attached
        );
    }

    Ok(KillmailSyncOutcome {
        unchanged: false,
        created,
        attackers_created,
        items_attached,
    })
}

/// Parse an ISO 8601 timestamp to Unix seconds.
///
/// The detail row is immutable once stored, so a malformed time fails the
/// whole unit before any write; a later corrected payload can still land.
fn parse_iso_timestamp(s: &str) -> Result<i64, AppError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|e| AppError::invalid_input(format!("Bad killmail_time '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::services::esi_client::{
        CharacterAssetDto, Conditional, EsiPage, KillmailAttackerDto, KillmailVictimDto,
        PositionDto, VictimItemDto,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    async fn setup_test_db() -> (tempfile::TempDir, sqlx::SqlitePool) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = db::initialize(&db_path).await.unwrap();
        (dir, pool)
    }

    fn sample_payload() -> KillmailDto {
        KillmailDto {
            killmail_time: "2024-01-15T10:30:00Z".to_string(),
            solar_system_id: 30000142,
            moon_id: None,
            war_id: Some(7),
            victim: KillmailVictimDto {
                character_id: Some(90000009),
                corporation_id: Some(98000001),
                alliance_id: None,
                faction_id: None,
                damage_taken: 12500,
                ship_type_id: 587,
                position: Some(PositionDto {
                    x: 1.5e11,
                    y: -2.0e10,
                    z: 3.0e9,
                }),
                items: Some(vec![
                    VictimItemDto {
                        item_type_id: 3520,
                        flag: 5,
                        singleton: 0,
                        quantity_destroyed: Some(2),
                        quantity_dropped: None,
                    },
                    VictimItemDto {
                        item_type_id: 2048,
                        flag: 11,
                        singleton: 1,
                        quantity_destroyed: None,
                        quantity_dropped: Some(1),
                    },
                ]),
            },
            attackers: vec![
                KillmailAttackerDto {
                    character_id: Some(90000001),
                    corporation_id: Some(98000002),
                    alliance_id: None,
                    faction_id: None,
                    security_status: -1.2,
                    final_blow: true,
                    damage_done: 9000,
                    ship_type_id: Some(17918),
                    weapon_type_id: Some(2456),
                },
                KillmailAttackerDto {
                    character_id: None,
                    corporation_id: None,
                    alliance_id: None,
                    faction_id: Some(500001),
                    security_status: 0.0,
                    final_blow: false,
                    damage_done: 3500,
                    // No ship/weapon identity at all
                    ship_type_id: None,
                    weapon_type_id: None,
                },
            ],
        }
    }

    /// Fetcher serving a fixed killmail payload, switchable to 304.
    struct ScriptedFetcher {
        payload: Mutex<KillmailDto>,
        unchanged: bool,
        fetched: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(payload: KillmailDto) -> Self {
            Self {
                payload: Mutex::new(payload),
                unchanged: false,
                fetched: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EsiFetch for ScriptedFetcher {
        async fn fetch_assets_page(
            &self,
            _character_id: i64,
            _page: u32,
            _conditional: bool,
        ) -> Result<EsiPage<CharacterAssetDto>, AppError> {
            unimplemented!("not used by killmail tests")
        }

        async fn fetch_killmail(
            &self,
            _killmail_id: i64,
            _killmail_hash: &str,
        ) -> Result<Conditional<KillmailDto>, AppError> {
            self.fetched.fetch_add(1, Ordering::SeqCst);
            if self.unchanged {
                return Ok(Conditional::Unchanged);
            }
            Ok(Conditional::Fresh(self.payload.lock().unwrap().clone()))
        }
    }

    struct RecordingListener {
        seen: Mutex<Vec<i64>>,
    }

    impl KillmailListener for RecordingListener {
        fn on_killmail_stored(&self, killmail_id: i64) {
            self.seen.lock().unwrap().push(killmail_id);
        }
    }

    #[tokio::test]
    async fn test_unchanged_payload_short_circuits() {
        let (_dir, pool) = setup_test_db().await;

        let mut fetcher = ScriptedFetcher::new(sample_payload());
        fetcher.unchanged = true;

        let outcome = sync_killmail(&pool, &fetcher, None, 1, "abc")
            .await
            .unwrap();
        assert!(outcome.unchanged);

        assert!(killmail::get_detail(&pool, 1).await.unwrap().is_none());
        assert!(killmail::get_victim(&pool, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_graph_materialization() {
        let (_dir, pool) = setup_test_db().await;
        let fetcher = ScriptedFetcher::new(sample_payload());

        let outcome = sync_killmail(&pool, &fetcher, None, 77, "abc")
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.attackers_created, 2);
        assert_eq!(outcome.items_attached, 2);

        let detail = killmail::get_detail(&pool, 77).await.unwrap().unwrap();
        assert_eq!(detail.solar_system_id, 30000142);
        assert_eq!(detail.war_id, Some(7));
        assert!(detail.moon_id.is_none());
        assert!(detail.killmail_time > 0);

        let victim = killmail::get_victim(&pool, 77).await.unwrap().unwrap();
        assert_eq!(victim.character_id, Some(90000009));
        assert_eq!(victim.x, Some(1.5e11));

        let attackers = killmail::list_attackers(&pool, 77).await.unwrap();
        assert_eq!(attackers.len(), 2);
        // Attacker without ship/weapon identity stored with NULLs, not an error
        assert!(attackers[1].ship_type_id.is_none());
        assert!(attackers[1].weapon_type_id.is_none());
        assert_eq!(attackers[1].damage_done, 3500);

        let items = killmail::list_victim_items(&pool, 77).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent_and_keeps_first_run_values() {
        let (_dir, pool) = setup_test_db().await;
        let fetcher = ScriptedFetcher::new(sample_payload());

        let first = sync_killmail(&pool, &fetcher, None, 5, "abc").await.unwrap();
        assert!(first.created);

        // Hypothetical upstream correction changes the payload
        {
            let mut payload = fetcher.payload.lock().unwrap();
            payload.solar_system_id = 31000001;
            payload.victim.damage_taken = 1;
        }

        let second = sync_killmail(&pool, &fetcher, None, 5, "abc").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.attackers_created, 0);
        assert_eq!(second.items_attached, 0);

        // No duplicate rows, first-run values retained
        let detail = killmail::get_detail(&pool, 5).await.unwrap().unwrap();
        assert_eq!(detail.solar_system_id, 30000142);
        let victim = killmail::get_victim(&pool, 5).await.unwrap().unwrap();
        assert_eq!(victim.damage_taken, 12500);
        assert_eq!(killmail::list_attackers(&pool, 5).await.unwrap().len(), 2);
        assert_eq!(killmail::list_victim_items(&pool, 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_victim_without_position_stores_null_coordinates() {
        let (_dir, pool) = setup_test_db().await;

        let mut payload = sample_payload();
        payload.victim.position = None;
        payload.victim.items = None;
        let fetcher = ScriptedFetcher::new(payload);

        let outcome = sync_killmail(&pool, &fetcher, None, 9, "abc").await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.items_attached, 0);

        let victim = killmail::get_victim(&pool, 9).await.unwrap().unwrap();
        assert!(victim.x.is_none());
        assert!(victim.y.is_none());
        assert!(victim.z.is_none());
    }

    #[tokio::test]
    async fn test_listener_fires_once_per_killmail() {
        let (_dir, pool) = setup_test_db().await;
        let fetcher = ScriptedFetcher::new(sample_payload());

        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
        });
        let listener_dyn: Arc<dyn KillmailListener> = listener.clone();

        sync_killmail(&pool, &fetcher, Some(&listener_dyn), 42, "abc")
            .await
            .unwrap();
        // Second run creates nothing, so no second notification
        sync_killmail(&pool, &fetcher, Some(&listener_dyn), 42, "abc")
            .await
            .unwrap();

        assert_eq!(*listener.seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_parse_iso_timestamp() {
        let ts = parse_iso_timestamp("2024-01-15T10:30:00Z").unwrap();
        assert!(ts > 0);

        let ts2 = parse_iso_timestamp("2024-01-15T10:30:00+00:00").unwrap();
        assert_eq!(ts, ts2);

        assert!(parse_iso_timestamp("invalid").is_err());
    }

    #[tokio::test]
    async fn test_malformed_time_fails_unit_without_writes() {
        let (_dir, pool) = setup_test_db().await;

        let mut payload = sample_payload();
        payload.killmail_time = "not-a-timestamp".to_string();
        let fetcher = ScriptedFetcher::new(payload);

        let err = sync_killmail(&pool, &fetcher, None, 11, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));

        // No row was written, so a corrected payload can still be stored
        assert!(killmail::get_detail(&pool, 11).await.unwrap().is_none());
        assert!(killmail::get_victim(&pool, 11).await.unwrap().is_none());
        assert!(killmail::list_attackers(&pool, 11).await.unwrap().is_empty());
    }
}
