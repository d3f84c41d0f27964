use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::WishError;

/// A named, time-boxed draw pool. Owned externally; the core only resolves it
/// by identifier and rejects submissions against unknown banners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Banner {
    pub id: String,
    pub name: String,
}

/// One submitted wish history for a banner, identified by its content
/// fingerprint. Never mutated in place: a re-submission with the same
/// fingerprint deletes this row (and its pulls) and inserts a fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WishEntry {
    pub id: i64,
    pub banner_id: String,
    /// Seeded xxh64 over the submission's first-pull markers, lowercase hex.
    pub fingerprint: String,
    pub legendary: i64,
    pub rare: i64,
    pub rare_pity: i64,
    pub total: i64,
}

/// One draw event owned by a wish entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRecord {
    pub id: i64,
    pub wish_id: i64,
    /// Civil timestamp in fixed UTC+8, e.g. `2021-01-01 08:00:00+8`.
    pub time: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub pity: i64,
    pub grouped: bool,
}

/// Wish row built in memory before persistence.
#[derive(Debug, Clone)]
pub struct NewWish {
    pub banner_id: String,
    pub fingerprint: String,
    pub legendary: i64,
    pub rare: i64,
    pub rare_pity: i64,
    pub total: i64,
}

/// Pull row built in memory before persistence.
#[derive(Debug, Clone)]
pub struct NewPull {
    pub time: String,
    pub name: String,
    pub item_type: String,
    pub pity: i64,
    pub grouped: bool,
}

pub fn setup_database(conn: &Connection) -> Result<(), WishError> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS banners (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS wishes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            banner_id TEXT NOT NULL REFERENCES banners(id),
            fingerprint TEXT NOT NULL,
            legendary INTEGER NOT NULL,
            rare INTEGER NOT NULL,
            rare_pity INTEGER NOT NULL,
            total INTEGER NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pulls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            wish_id INTEGER NOT NULL REFERENCES wishes(id),
            time TEXT NOT NULL,
            name TEXT NOT NULL,
            item_type TEXT NOT NULL,
            pity INTEGER NOT NULL,
            grouped INTEGER NOT NULL
        )",
        [],
    )?;

    // One live entry per fingerprint. The replace path deletes the stale row
    // before inserting, so a violation only fires when two submissions race
    // on the same content; the loser's transaction rolls back whole.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_wishes_fingerprint ON wishes(fingerprint)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_wishes_banner ON wishes(banner_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pulls_wish ON pulls(wish_id)",
        [],
    )?;

    Ok(())
}

pub fn create_banner(conn: &Connection, id: &str, name: &str) -> Result<Banner, WishError> {
    conn.execute(
        "INSERT INTO banners (id, name) VALUES (?1, ?2)",
        params![id, name],
    )?;

    Ok(Banner {
        id: id.to_string(),
        name: name.to_string(),
    })
}

pub fn get_banner(conn: &Connection, id: &str) -> Result<Option<Banner>, WishError> {
    let banner = conn
        .query_row(
            "SELECT id, name FROM banners WHERE id = ?1",
            params![id],
            |row| {
                Ok(Banner {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;

    Ok(banner)
}

/// Look up a live wish entry by fingerprint across ALL banners.
///
/// This is the lookup the write path uses: deduplication is global, so the
/// same history submitted under two banners keeps only the latest entry.
pub fn find_wish_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<WishEntry>, WishError> {
    let entry = conn
        .query_row(
            "SELECT id, banner_id, fingerprint, legendary, rare, rare_pity, total
             FROM wishes WHERE fingerprint = ?1",
            params![fingerprint],
            wish_from_row,
        )
        .optional()?;

    Ok(entry)
}

/// Banner-scoped variant of [`find_wish_by_fingerprint`], for callers that
/// want deduplication per banner instead of across the whole ledger.
pub fn find_wish_by_fingerprint_for_banner(
    conn: &Connection,
    fingerprint: &str,
    banner_id: &str,
) -> Result<Option<WishEntry>, WishError> {
    let entry = conn
        .query_row(
            "SELECT id, banner_id, fingerprint, legendary, rare, rare_pity, total
             FROM wishes WHERE fingerprint = ?1 AND banner_id = ?2",
            params![fingerprint, banner_id],
            wish_from_row,
        )
        .optional()?;

    Ok(entry)
}

pub fn pulls_for_wish(conn: &Connection, wish_id: i64) -> Result<Vec<PullRecord>, WishError> {
    let mut stmt = conn.prepare(
        "SELECT id, wish_id, time, name, item_type, pity, grouped
         FROM pulls WHERE wish_id = ?1 ORDER BY id",
    )?;

    let rows = stmt.query_map(params![wish_id], pull_from_row)?;

    let mut pulls = Vec::new();
    for row in rows {
        pulls.push(row?);
    }

    Ok(pulls)
}

/// Atomically replace any stale wish entry with a freshly built one.
///
/// Inside a single transaction: delete the stale entry's pulls, delete the
/// stale entry, insert the new entry, insert its pulls. All four steps commit
/// together or none do, so no reader ever observes zero or two live entries
/// for the same fingerprint. The pull cascade is spelled out as explicit
/// deletes rather than left to the schema.
pub fn replace_wish(
    conn: &mut Connection,
    stale: Option<&WishEntry>,
    new: &NewWish,
    pulls: &[NewPull],
) -> Result<(WishEntry, Vec<PullRecord>), WishError> {
    let tx = conn.transaction()?;

    if let Some(stale) = stale {
        tx.execute("DELETE FROM pulls WHERE wish_id = ?1", params![stale.id])?;
        tx.execute("DELETE FROM wishes WHERE id = ?1", params![stale.id])?;
    }

    tx.execute(
        "INSERT INTO wishes (banner_id, fingerprint, legendary, rare, rare_pity, total)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.banner_id,
            new.fingerprint,
            new.legendary,
            new.rare,
            new.rare_pity,
            new.total,
        ],
    )?;
    let wish_id = tx.last_insert_rowid();

    let mut saved_pulls = Vec::with_capacity(pulls.len());
    for pull in pulls {
        tx.execute(
            "INSERT INTO pulls (wish_id, time, name, item_type, pity, grouped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                wish_id,
                pull.time,
                pull.name,
                pull.item_type,
                pull.pity,
                pull.grouped,
            ],
        )?;
        saved_pulls.push(PullRecord {
            id: tx.last_insert_rowid(),
            wish_id,
            time: pull.time.clone(),
            name: pull.name.clone(),
            item_type: pull.item_type.clone(),
            pity: pull.pity,
            grouped: pull.grouped,
        });
    }

    tx.commit()?;

    Ok((
        WishEntry {
            id: wish_id,
            banner_id: new.banner_id.clone(),
            fingerprint: new.fingerprint.clone(),
            legendary: new.legendary,
            rare: new.rare,
            rare_pity: new.rare_pity,
            total: new.total,
        },
        saved_pulls,
    ))
}

/// True when a replace failed because another live entry already holds the
/// fingerprint: a submission with the same content committed between the
/// caller's stale lookup and its insert. SQLite reports the violated
/// `idx_wishes_fingerprint` index as `wishes.fingerprint`.
pub fn is_fingerprint_conflict(err: &WishError) -> bool {
    matches!(
        err,
        WishError::TransactionFailure(msg)
            if msg.contains("UNIQUE constraint failed: wishes.fingerprint")
    )
}

fn wish_from_row(row: &rusqlite::Row) -> rusqlite::Result<WishEntry> {
    Ok(WishEntry {
        id: row.get(0)?,
        banner_id: row.get(1)?,
        fingerprint: row.get(2)?,
        legendary: row.get(3)?,
        rare: row.get(4)?,
        rare_pity: row.get(5)?,
        total: row.get(6)?,
    })
}

fn pull_from_row(row: &rusqlite::Row) -> rusqlite::Result<PullRecord> {
    Ok(PullRecord {
        id: row.get(0)?,
        wish_id: row.get(1)?,
        time: row.get(2)?,
        name: row.get(3)?,
        item_type: row.get(4)?,
        pity: row.get(5)?,
        grouped: row.get(6)?,
    })
}
