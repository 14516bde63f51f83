//! Tracked character model.
//!
//! A tracked character is the owner of a mirrored asset collection; its id
//! scopes every natural key used during reconciliation.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A character whose ESI data is mirrored locally.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrackedCharacter {
    /// EVE character ID.
    pub character_id: i64,

    /// Character name (display only).
    pub character_name: String,

    /// ESI access token for authenticated endpoints.
    pub access_token: Option<String>,

    /// Unix timestamp when tracking started.
    pub added_at: i64,
}

/// Add a character to the tracked set, updating name/token if present.
pub async fn upsert_character(
    pool: &sqlx::SqlitePool,
    character: &TrackedCharacter,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tracked_characters (character_id, character_name, access_token, added_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(character_id) DO UPDATE SET
           character_name = excluded.character_name,
           access_token = excluded.access_token",
    )
    .bind(character.character_id)
    .bind(&character.character_name)
    .bind(&character.access_token)
    .bind(character.added_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// List all tracked characters ordered by id.
pub async fn list_characters(
    pool: &sqlx::SqlitePool,
) -> Result<Vec<TrackedCharacter>, sqlx::Error> {
    sqlx::query_as::<_, TrackedCharacter>(
        "SELECT character_id, character_name, access_token, added_at
         FROM tracked_characters ORDER BY character_id",
    )
    .fetch_all(pool)
    .await
}

/// Look up a single tracked character.
pub async fn get_character(
    pool: &sqlx::SqlitePool,
    character_id: i64,
) -> Result<Option<TrackedCharacter>, sqlx::Error> {
    sqlx::query_as::<_, TrackedCharacter>(
        "SELECT character_id, character_name, access_token, added_at
         FROM tracked_characters WHERE character_id = ?",
    )
    .bind(character_id)
    .fetch_optional(pool)
    .await
}

/// Stop tracking a character and drop its mirrored assets.
pub async fn remove_character(
    pool: &sqlx::SqlitePool,
    character_id: i64,
) -> Result<bool, sqlx::Error> {
    sqlx::query("DELETE FROM character_assets WHERE character_id = ?")
        .bind(character_id)
        .execute(pool)
        .await?;

    let result = sqlx::query("DELETE FROM tracked_characters WHERE character_id = ?")
        .bind(character_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
