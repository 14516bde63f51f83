//! Character asset model.
//!
//! Assets form a mirrored collection: the stored set for a character must
//! equal the key set of the most recent complete upstream traversal. Writes
//! are replace-on-key upserts; reconciliation deletes everything a complete
//! traversal did not observe.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashSet;

/// A single mirrored asset row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CharacterAsset {
    /// Owning character (scopes the natural key).
    pub character_id: i64,

    /// Upstream-assigned item ID, unique within the owner's collection.
    pub item_id: i64,

    /// Item classification (type) ID.
    pub type_id: i64,

    /// Stack size.
    pub quantity: i64,

    /// Containing station, structure, or parent item.
    pub location_id: i64,

    /// Slot/hangar flag, e.g. `Hangar`, `Cargo`.
    pub location_flag: String,

    /// Location category: `station`, `solar_system`, `item`, `other`.
    pub location_type: String,

    /// Whether the item is a singleton (assembled) rather than stacked.
    pub is_singleton: bool,

    /// Unix timestamp of the last sync that observed this row.
    pub synced_at: i64,
}

/// Upsert an asset row, overwriting every non-key field on conflict.
pub async fn upsert_asset(pool: &sqlx::SqlitePool, asset: &CharacterAsset) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO character_assets (
            character_id, item_id, type_id, quantity, location_id,
            location_flag, location_type, is_singleton, synced_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(character_id, item_id) DO UPDATE SET
           type_id = excluded.type_id,
           quantity = excluded.quantity,
           location_id = excluded.location_id,
           location_flag = excluded.location_flag,
           location_type = excluded.location_type,
           is_singleton = excluded.is_singleton,
           synced_at = excluded.synced_at",
    )
    .bind(asset.character_id)
    .bind(asset.item_id)
    .bind(asset.type_id)
    .bind(asset.quantity)
    .bind(asset.location_id)
    .bind(&asset.location_flag)
    .bind(&asset.location_type)
    .bind(asset.is_singleton)
    .bind(asset.synced_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Maximum number of item ids deleted per statement. Keeps bind-variable
/// counts well under SQLite's limit for arbitrarily large collections.
const DELETE_CHUNK: usize = 500;

/// Delete every asset row for a character whose item_id was not observed
/// in a complete traversal.
///
/// Callers must only invoke this after an exception-free full traversal;
/// an empty observed set deletes the character's entire collection. Stale
/// keys are diffed in memory and deleted in bounded IN batches.
pub async fn delete_missing(
    pool: &sqlx::SqlitePool,
    character_id: i64,
    observed: &HashSet<i64>,
) -> Result<i64, sqlx::Error> {
    if observed.is_empty() {
        let result = sqlx::query("DELETE FROM character_assets WHERE character_id = ?")
            .bind(character_id)
            .execute(pool)
            .await?;
        return Ok(result.rows_affected() as i64);
    }

    let stored: Vec<(i64,)> =
        sqlx::query_as("SELECT item_id FROM character_assets WHERE character_id = ?")
            .bind(character_id)
            .fetch_all(pool)
            .await?;

    let stale: Vec<i64> = stored
        .into_iter()
        .map(|(id,)| id)
        .filter(|id| !observed.contains(id))
        .collect();

    let mut deleted = 0i64;
    for chunk in stale.chunks(DELETE_CHUNK) {
        let placeholders: Vec<&str> = chunk.iter().map(|_| "?").collect();
        let query = format!(
            "DELETE FROM character_assets WHERE character_id = ? AND item_id IN ({})",
            placeholders.join(", ")
        );

        let mut query_builder = sqlx::query(&query).bind(character_id);
        for id in chunk {
            query_builder = query_builder.bind(*id);
        }

        deleted += query_builder.execute(pool).await?.rows_affected() as i64;
    }

    Ok(deleted)
}

/// List a character's mirrored assets ordered by item_id.
pub async fn list_assets(
    pool: &sqlx::SqlitePool,
    character_id: i64,
) -> Result<Vec<CharacterAsset>, sqlx::Error> {
    sqlx::query_as::<_, CharacterAsset>(
        "SELECT character_id, item_id, type_id, quantity, location_id,
                location_flag, location_type, is_singleton, synced_at
         FROM character_assets WHERE character_id = ? ORDER BY item_id",
    )
    .bind(character_id)
    .fetch_all(pool)
    .await
}

/// Count a character's mirrored assets.
pub async fn count_assets(
    pool: &sqlx::SqlitePool,
    character_id: i64,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM character_assets WHERE character_id = ?")
            .bind(character_id)
            .fetch_one(pool)
            .await?;

    Ok(row.0)
}
