//! Character asset synchronization.
//!
//! Drives the page-by-page traversal of one character's asset collection
//! and reconciles the local mirror afterwards: rows whose item_id was not
//! observed anywhere in a complete traversal are deleted. A traversal that
//! fails partway performs no deletions at all; the upserts it already made
//! are safe and self-correct on the next run.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::asset::{self, CharacterAsset};
use crate::services::esi_client::{CharacterAssetDto, EsiFetch};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp.
fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Outcome of one asset sync run.
#[derive(Debug, Clone, Default)]
pub struct AssetSyncOutcome {
    /// Number of records upserted across all pages.
    pub upserted: i64,

    /// Number of stale rows deleted by reconciliation.
    pub deleted: i64,

    /// Number of pages traversed.
    pub pages: u32,

    /// True when page 1 was unchanged and the run did nothing.
    pub unchanged: bool,
}

impl AssetSyncOutcome {
    fn unchanged() -> Self {
        Self {
            unchanged: true,
            ..Default::default()
        }
    }
}

/// Mirror one character's asset collection.
///
/// Pages are fetched strictly in order and each page's records are fully
/// upserted before the next fetch; the observed-key set accumulates across
/// all pages so an item_id repeated on two pages (upstream pagination
/// drift) is never deleted. Only page 1 is fetched conditionally: if it is
/// unchanged since the last run the whole sync is skipped before any write.
pub async fn sync_character_assets<F: EsiFetch + ?Sized>(
    pool: &DbPool,
    fetcher: &F,
    character_id: i64,
) -> Result<AssetSyncOutcome, AppError> {
    let mut observed: HashSet<i64> = HashSet::new();
    let mut page = 1u32;
    let synced_at = now();

    loop {
        let batch = fetcher
            .fetch_assets_page(character_id, page, page == 1)
            .await?;

        if batch.is_unchanged && page == 1 {
            log::debug!("assets for character {} unchanged, skipping", character_id);
            return Ok(AssetSyncOutcome::unchanged());
        }

        for record in &batch.records {
            asset::upsert_asset(pool, &map_asset(character_id, record, synced_at)).await?;
            observed.insert(record.item_id);
        }

        if page >= batch.total_pages {
            break;
        }
        page += 1;
    }

    // Reconciliation runs only after an exception-free full traversal; any
    // error above has already propagated and left the mirror untouched.
    let deleted = asset::delete_missing(pool, character_id, &observed).await?;

    if deleted > 0 {
        log::info!(
            "reconciled assets for character {}: {} stale rows deleted",
            character_id,
            deleted
        );
    }

    Ok(AssetSyncOutcome {
        upserted: observed.len() as i64,
        deleted,
        pages: page,
        unchanged: false,
    })
}

/// Map an upstream asset record onto a local row.
fn map_asset(character_id: i64, dto: &CharacterAssetDto, synced_at: i64) -> CharacterAsset {
    CharacterAsset {
        character_id,
        item_id: dto.item_id,
        type_id: dto.type_id,
        quantity: dto.quantity,
        location_id: dto.location_id,
        location_flag: dto.location_flag.clone(),
        location_type: dto.location_type.clone(),
        is_singleton: dto.is_singleton,
        synced_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::services::esi_client::{Conditional, EsiPage, KillmailDto};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    async fn setup_test_db() -> (tempfile::TempDir, sqlx::SqlitePool) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = db::initialize(&db_path).await.unwrap();
        (dir, pool)
    }

    fn dto(item_id: i64, quantity: i64) -> CharacterAssetDto {
        CharacterAssetDto {
            item_id,
            type_id: 587,
            quantity,
            location_id: 60003760,
            location_flag: "Hangar".to_string(),
            location_type: "station".to_string(),
            is_singleton: false,
        }
    }

    /// Scripted fetcher: serves fixed pages, optionally reporting page 1 as
    /// unchanged or failing after a given number of fetches.
    struct ScriptedFetcher {
        pages: Vec<Vec<CharacterAssetDto>>,
        first_page_unchanged: bool,
        fail_after_pages: Option<u32>,
        fetched: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Vec<CharacterAssetDto>>) -> Self {
            Self {
                pages,
                first_page_unchanged: false,
                fail_after_pages: None,
                fetched: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EsiFetch for ScriptedFetcher {
        async fn fetch_assets_page(
            &self,
            _character_id: i64,
            page: u32,
            conditional: bool,
        ) -> Result<EsiPage<CharacterAssetDto>, AppError> {
            let fetched = self.fetched.fetch_add(1, Ordering::SeqCst) + 1;
            let total_pages = self.pages.len() as u32;

            if page == 1 && self.first_page_unchanged {
                assert!(conditional, "page 1 must be fetched conditionally");
                return Ok(EsiPage::unchanged(total_pages));
            }

            if let Some(limit) = self.fail_after_pages {
                if fetched > limit {
                    return Err(AppError::network("connection reset"));
                }
            }

            let records = self.pages[(page - 1) as usize].clone();
            Ok(EsiPage {
                records,
                total_pages,
                is_unchanged: false,
            })
        }

        async fn fetch_killmail(
            &self,
            _killmail_id: i64,
            _killmail_hash: &str,
        ) -> Result<Conditional<KillmailDto>, AppError> {
            unimplemented!("not used by asset sync tests")
        }
    }

    #[tokio::test]
    async fn test_unchanged_first_page_short_circuits() {
        let (_dir, pool) = setup_test_db().await;

        // Seed a row that must survive untouched
        asset::upsert_asset(
            &pool,
            &map_asset(1, &dto(100, 5), 12345),
        )
        .await
        .unwrap();

        let mut fetcher = ScriptedFetcher::new(vec![vec![dto(200, 1)], vec![dto(300, 1)]]);
        fetcher.first_page_unchanged = true;

        let outcome = sync_character_assets(&pool, &fetcher, 1).await.unwrap();
        assert!(outcome.unchanged);
        assert_eq!(outcome.upserted, 0);
        assert_eq!(outcome.deleted, 0);

        // Exactly one fetch, no subsequent pages checked
        assert_eq!(fetcher.fetched.load(Ordering::SeqCst), 1);

        // No writes, no deletes: the stale-looking row is still there
        let rows = asset::list_assets(&pool, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, 100);
        assert_eq!(rows[0].synced_at, 12345);
    }

    #[tokio::test]
    async fn test_reconciliation_matches_fresh_traversal() {
        let (_dir, pool) = setup_test_db().await;

        // Stored set {A=100, B=101, C=102}
        for id in [100, 101, 102] {
            asset::upsert_asset(&pool, &map_asset(1, &dto(id, 1), 0))
                .await
                .unwrap();
        }

        // Fresh traversal returns {A, C, D=103} with updated quantities
        let fetcher = ScriptedFetcher::new(vec![vec![dto(100, 7), dto(102, 2), dto(103, 1)]]);

        let outcome = sync_character_assets(&pool, &fetcher, 1).await.unwrap();
        assert_eq!(outcome.upserted, 3);
        assert_eq!(outcome.deleted, 1);

        let rows = asset::list_assets(&pool, 1).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|a| a.item_id).collect();
        assert_eq!(ids, vec![100, 102, 103]);
        // A's fields fully refreshed
        assert_eq!(rows[0].quantity, 7);
    }

    #[tokio::test]
    async fn test_key_repeated_across_pages_is_never_deleted() {
        let (_dir, pool) = setup_test_db().await;

        // Item 500 shows up on page 1 and again on page 2 (pagination drift)
        let fetcher = ScriptedFetcher::new(vec![
            vec![dto(500, 1), dto(501, 1)],
            vec![dto(500, 1), dto(502, 1)],
        ]);

        let outcome = sync_character_assets(&pool, &fetcher, 1).await.unwrap();
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.upserted, 3);
        assert_eq!(outcome.deleted, 0);

        let ids: Vec<i64> = asset::list_assets(&pool, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.item_id)
            .collect();
        assert_eq!(ids, vec![500, 501, 502]);
    }

    #[tokio::test]
    async fn test_partial_failure_suppresses_deletion() {
        let (_dir, pool) = setup_test_db().await;

        // Pre-existing row that a complete traversal would delete
        asset::upsert_asset(&pool, &map_asset(1, &dto(999, 1), 0))
            .await
            .unwrap();

        let mut fetcher = ScriptedFetcher::new(vec![
            vec![dto(100, 1)],
            vec![dto(101, 1)],
            vec![dto(102, 1)],
        ]);
        fetcher.fail_after_pages = Some(1);

        let err = sync_character_assets(&pool, &fetcher, 1).await.unwrap_err();
        assert!(matches!(err, AppError::Network { .. }));

        let ids: Vec<i64> = asset::list_assets(&pool, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.item_id)
            .collect();
        // Page-1 upserts persisted; nothing was deleted
        assert_eq!(ids, vec![100, 999]);
    }
}
