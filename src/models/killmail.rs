//! Killmail event-graph models.
//!
//! One killmail materializes four kinds of rows: a parent detail row, a
//! singleton victim row, zero-or-more attacker rows, and an optional pivot
//! between the victim and item types. Every write here is create-if-absent:
//! once stored, rows are never mutated by re-processing the same killmail.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Parent killmail record, keyed solely by killmail_id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KillmailDetail {
    pub killmail_id: i64,

    /// Occurrence time (Unix).
    pub killmail_time: i64,

    pub solar_system_id: i64,

    /// Present only for moon-related kills.
    pub moon_id: Option<i64>,

    /// Present only for war kills.
    pub war_id: Option<i64>,
}

/// Victim row, one per killmail. All identity fields are optional: an
/// anonymized victim stores NULLs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KillmailVictim {
    pub killmail_id: i64,
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub damage_taken: i64,
    pub ship_type_id: i64,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

/// Attacker input. The logical key is killmail_id plus the four identity
/// fields; the table's AUTOINCREMENT id is storage-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttacker {
    pub killmail_id: i64,
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub security_status: f64,
    pub final_blow: bool,
    pub damage_done: i64,
    pub ship_type_id: Option<i64>,
    pub weapon_type_id: Option<i64>,
}

/// Stored attacker row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KillmailAttacker {
    pub id: i64,
    pub killmail_id: i64,
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub security_status: f64,
    pub final_blow: bool,
    pub damage_done: i64,
    pub ship_type_id: Option<i64>,
    pub weapon_type_id: Option<i64>,
}

/// Pivot attributes for one victim item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VictimItem {
    pub killmail_id: i64,
    pub item_type_id: i64,
    pub flag: i64,
    pub singleton: i64,
    pub quantity_destroyed: Option<i64>,
    pub quantity_dropped: Option<i64>,
}

/// Create the parent detail row if absent.
///
/// Returns true when a row was created; an existing row is left untouched,
/// keeping the first-seen values.
pub async fn create_detail_if_absent(
    pool: &sqlx::SqlitePool,
    detail: &KillmailDetail,
) -> Result<bool, sqlx::Error> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT killmail_id FROM killmail_details WHERE killmail_id = ?")
            .bind(detail.killmail_id)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO killmail_details (killmail_id, killmail_time, solar_system_id, moon_id, war_id)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(detail.killmail_id)
    .bind(detail.killmail_time)
    .bind(detail.solar_system_id)
    .bind(detail.moon_id)
    .bind(detail.war_id)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Create the victim row if absent.
pub async fn create_victim_if_absent(
    pool: &sqlx::SqlitePool,
    victim: &KillmailVictim,
) -> Result<bool, sqlx::Error> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT killmail_id FROM killmail_victims WHERE killmail_id = ?")
            .bind(victim.killmail_id)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO killmail_victims (
            killmail_id, character_id, corporation_id, alliance_id, faction_id,
            damage_taken, ship_type_id, x, y, z
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(victim.killmail_id)
    .bind(victim.character_id)
    .bind(victim.corporation_id)
    .bind(victim.alliance_id)
    .bind(victim.faction_id)
    .bind(victim.damage_taken)
    .bind(victim.ship_type_id)
    .bind(victim.x)
    .bind(victim.y)
    .bind(victim.z)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Create an attacker row if no row with the same composite identity key
/// exists.
///
/// The key comparison is NULL-safe (`IS`): an absent identity field matches
/// another absent identity field, so two fully anonymized attackers collapse
/// into one stored row.
pub async fn create_attacker_if_absent(
    pool: &sqlx::SqlitePool,
    attacker: &NewAttacker,
) -> Result<bool, sqlx::Error> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM killmail_attackers
         WHERE killmail_id = ?
           AND character_id IS ?
           AND corporation_id IS ?
           AND alliance_id IS ?
           AND faction_id IS ?",
    )
    .bind(attacker.killmail_id)
    .bind(attacker.character_id)
    .bind(attacker.corporation_id)
    .bind(attacker.alliance_id)
    .bind(attacker.faction_id)
    .fetch_optional(pool)
    .await?;

    if existing.is_some() {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO killmail_attackers (
            killmail_id, character_id, corporation_id, alliance_id, faction_id,
            security_status, final_blow, damage_done, ship_type_id, weapon_type_id
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(attacker.killmail_id)
    .bind(attacker.character_id)
    .bind(attacker.corporation_id)
    .bind(attacker.alliance_id)
    .bind(attacker.faction_id)
    .bind(attacker.security_status)
    .bind(attacker.final_blow)
    .bind(attacker.damage_done)
    .bind(attacker.ship_type_id)
    .bind(attacker.weapon_type_id)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Attach one item to the victim's item list.
///
/// The pivot is unique on (killmail_id, item_type_id, flag, singleton);
/// re-attaching the same item is a no-op.
pub async fn attach_victim_item(
    pool: &sqlx::SqlitePool,
    item: &VictimItem,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO killmail_victim_items (
            killmail_id, item_type_id, flag, singleton, quantity_destroyed, quantity_dropped
         ) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(item.killmail_id)
    .bind(item.item_type_id)
    .bind(item.flag)
    .bind(item.singleton)
    .bind(item.quantity_destroyed)
    .bind(item.quantity_dropped)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a stored killmail detail row.
pub async fn get_detail(
    pool: &sqlx::SqlitePool,
    killmail_id: i64,
) -> Result<Option<KillmailDetail>, sqlx::Error> {
    sqlx::query_as::<_, KillmailDetail>(
        "SELECT killmail_id, killmail_time, solar_system_id, moon_id, war_id
         FROM killmail_details WHERE killmail_id = ?",
    )
    .bind(killmail_id)
    .fetch_optional(pool)
    .await
}

/// Fetch the victim row for a killmail.
pub async fn get_victim(
    pool: &sqlx::SqlitePool,
    killmail_id: i64,
) -> Result<Option<KillmailVictim>, sqlx::Error> {
    sqlx::query_as::<_, KillmailVictim>(
        "SELECT killmail_id, character_id, corporation_id, alliance_id, faction_id,
                damage_taken, ship_type_id, x, y, z
         FROM killmail_victims WHERE killmail_id = ?",
    )
    .bind(killmail_id)
    .fetch_optional(pool)
    .await
}

/// List attacker rows for a killmail in insertion order.
pub async fn list_attackers(
    pool: &sqlx::SqlitePool,
    killmail_id: i64,
) -> Result<Vec<KillmailAttacker>, sqlx::Error> {
    sqlx::query_as::<_, KillmailAttacker>(
        "SELECT id, killmail_id, character_id, corporation_id, alliance_id, faction_id,
                security_status, final_blow, damage_done, ship_type_id, weapon_type_id
         FROM killmail_attackers WHERE killmail_id = ? ORDER BY id",
    )
    .bind(killmail_id)
    .fetch_all(pool)
    .await
}

/// List victim item pivot rows for a killmail.
pub async fn list_victim_items(
    pool: &sqlx::SqlitePool,
    killmail_id: i64,
) -> Result<Vec<VictimItem>, sqlx::Error> {
    sqlx::query_as::<_, VictimItem>(
        "SELECT killmail_id, item_type_id, flag, singleton, quantity_destroyed, quantity_dropped
         FROM killmail_victim_items WHERE killmail_id = ? ORDER BY item_type_id, flag",
    )
    .bind(killmail_id)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::tempdir;

    async fn setup_test_db() -> (tempfile::TempDir, sqlx::SqlitePool) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = db::initialize(&db_path).await.unwrap();
        (dir, pool)
    }

    fn detail(killmail_id: i64, solar_system_id: i64) -> KillmailDetail {
        KillmailDetail {
            killmail_id,
            killmail_time: 1700000000,
            solar_system_id,
            moon_id: None,
            war_id: None,
        }
    }

    #[tokio::test]
    async fn test_detail_create_if_absent_keeps_first_values() {
        let (_dir, pool) = setup_test_db().await;

        assert!(create_detail_if_absent(&pool, &detail(1, 30000142)).await.unwrap());
        // Second create with different values is a no-op
        assert!(!create_detail_if_absent(&pool, &detail(1, 30002187)).await.unwrap());

        let stored = get_detail(&pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.solar_system_id, 30000142);
    }

    #[tokio::test]
    async fn test_victim_with_all_optional_fields_null() {
        let (_dir, pool) = setup_test_db().await;

        let victim = KillmailVictim {
            killmail_id: 1,
            character_id: None,
            corporation_id: None,
            alliance_id: None,
            faction_id: None,
            damage_taken: 4200,
            ship_type_id: 587,
            x: None,
            y: None,
            z: None,
        };
        assert!(create_victim_if_absent(&pool, &victim).await.unwrap());

        let stored = get_victim(&pool, 1).await.unwrap().unwrap();
        assert!(stored.character_id.is_none());
        assert!(stored.x.is_none());
        assert_eq!(stored.damage_taken, 4200);
    }

    #[tokio::test]
    async fn test_attacker_null_identity_collapses() {
        let (_dir, pool) = setup_test_db().await;

        let anon = NewAttacker {
            killmail_id: 1,
            character_id: None,
            corporation_id: None,
            alliance_id: None,
            faction_id: None,
            security_status: 0.0,
            final_blow: false,
            damage_done: 100,
            ship_type_id: None,
            weapon_type_id: None,
        };

        assert!(create_attacker_if_absent(&pool, &anon).await.unwrap());
        // An identical all-NULL identity key collapses into the first row
        assert!(!create_attacker_if_absent(&pool, &anon).await.unwrap());

        let named = NewAttacker {
            character_id: Some(90000001),
            ..anon.clone()
        };
        assert!(create_attacker_if_absent(&pool, &named).await.unwrap());

        assert_eq!(list_attackers(&pool, 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attach_victim_item_no_duplicates() {
        let (_dir, pool) = setup_test_db().await;

        let item = VictimItem {
            killmail_id: 1,
            item_type_id: 3520,
            flag: 5,
            singleton: 0,
            quantity_destroyed: Some(2),
            quantity_dropped: None,
        };

        assert!(attach_victim_item(&pool, &item).await.unwrap());
        assert!(!attach_victim_item(&pool, &item).await.unwrap());

        // Same type in a different slot is a distinct pivot row
        let other_slot = VictimItem { flag: 11, ..item.clone() };
        assert!(attach_victim_item(&pool, &other_slot).await.unwrap());

        let items = list_victim_items(&pool, 1).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].quantity_destroyed, Some(2));
        assert!(items[0].quantity_dropped.is_none());
    }
}
