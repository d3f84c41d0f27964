// Tally computation and the memoizing cache in front of it.
//
// Computing a banner's tally walks every ledger entry and pull row for that
// banner, so the read endpoint never calls it directly: lookups go through
// `TallyCache`, which memoizes results per banner id for a fixed TTL and
// collapses concurrent misses into a single in-flight computation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::db;
use crate::error::WishError;

/// Default cache lifetime for a computed tally.
pub const TALLY_TTL: Duration = Duration::from_secs(3600);

/// Aggregate statistics over a banner's ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WishTally {
    pub banner: String,
    /// Number of live ledger entries (distinct submitted histories).
    pub wishes: i64,
    pub legendary: i64,
    pub rare: i64,
    pub total: i64,
    pub rare_pity_avg: f64,
    /// Legendary item frequency across all pull records, most pulled first.
    pub items: Vec<ItemStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStat {
    pub name: String,
    pub count: i64,
    pub pity_avg: f64,
}

/// Aggregate a banner's ledger. Fails with `NotFound` for an unknown banner;
/// store failures surface as `ComputationFailure`.
pub fn calculate_wish_tally(conn: &Connection, banner: &str) -> Result<WishTally, WishError> {
    let banner = db::get_banner(conn, banner)
        .map_err(|e| WishError::ComputationFailure(e.to_string()))?
        .ok_or_else(|| WishError::NotFound(banner.to_string()))?;

    let (wishes, legendary, rare, total, rare_pity_avg) = conn
        .query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(legendary), 0),
                    COALESCE(SUM(rare), 0),
                    COALESCE(SUM(total), 0),
                    COALESCE(AVG(rare_pity), 0.0)
             FROM wishes WHERE banner_id = ?1",
            params![banner.id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )
        .map_err(|e| WishError::ComputationFailure(e.to_string()))?;

    let mut stmt = conn
        .prepare(
            "SELECT pulls.name, COUNT(*), AVG(pulls.pity)
             FROM pulls JOIN wishes ON pulls.wish_id = wishes.id
             WHERE wishes.banner_id = ?1
             GROUP BY pulls.name
             ORDER BY COUNT(*) DESC, pulls.name",
        )
        .map_err(|e| WishError::ComputationFailure(e.to_string()))?;

    let rows = stmt
        .query_map(params![banner.id], |row| {
            Ok(ItemStat {
                name: row.get(0)?,
                count: row.get(1)?,
                pity_avg: row.get(2)?,
            })
        })
        .map_err(|e| WishError::ComputationFailure(e.to_string()))?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(|e| WishError::ComputationFailure(e.to_string()))?);
    }

    Ok(WishTally {
        banner: banner.id,
        wishes,
        legendary,
        rare,
        total,
        rare_pity_avg,
        items,
    })
}

/// The expensive computation the cache fronts.
#[async_trait]
pub trait TallySource: Send + Sync {
    async fn compute(&self, banner: &str) -> Result<WishTally, WishError>;
}

/// Source backed by the shared SQLite connection.
pub struct SqliteTallySource {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTallySource {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        SqliteTallySource { db }
    }
}

#[async_trait]
impl TallySource for SqliteTallySource {
    async fn compute(&self, banner: &str) -> Result<WishTally, WishError> {
        let conn = self
            .db
            .lock()
            .map_err(|_| WishError::ComputationFailure("database lock poisoned".to_string()))?;
        calculate_wish_tally(&conn, banner)
    }
}

enum Lookup {
    Hit(WishTally),
    Wait(watch::Receiver<Option<Result<WishTally, WishError>>>),
    Miss,
}

enum Slot {
    /// A settled computation, valid until `cached_at + ttl`.
    Ready { tally: WishTally, cached_at: Instant },
    /// A computation in flight; waiters hold the receiver and get the same
    /// value or the same error the leader publishes.
    Pending(watch::Receiver<Option<Result<WishTally, WishError>>>),
}

/// Single-flight memoizing cache keyed by banner identifier.
///
/// Keys are used verbatim - callers must pass a consistent representation or
/// they fragment the cache. Results expire after `ttl`; failures are never
/// cached, so the next caller recomputes. Ledger writes do NOT invalidate
/// entries: readers may observe a tally up to one TTL stale after a write.
pub struct TallyCache<S: TallySource> {
    source: S,
    ttl: Duration,
    slots: tokio::sync::Mutex<HashMap<String, Slot>>,
}

impl<S: TallySource> TallyCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        TallyCache {
            source,
            ttl,
            slots: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached tally for `banner`, computing it on a miss.
    ///
    /// Concurrent callers of an uncached key share one underlying
    /// computation; each receives a clone of its result.
    pub async fn get(&self, banner: &str) -> Result<WishTally, WishError> {
        loop {
            let mut slots = self.slots.lock().await;

            let lookup = match slots.get(banner) {
                Some(Slot::Ready { tally, cached_at }) if cached_at.elapsed() < self.ttl => {
                    Lookup::Hit(tally.clone())
                }
                Some(Slot::Pending(rx)) => Lookup::Wait(rx.clone()),
                // Vacant or expired: this caller leads the recomputation.
                _ => Lookup::Miss,
            };

            match lookup {
                Lookup::Hit(tally) => return Ok(tally),
                Lookup::Wait(mut rx) => {
                    drop(slots);
                    let mut settled = None;
                    loop {
                        if let Some(result) = rx.borrow_and_update().clone() {
                            settled = Some(result);
                            break;
                        }
                        if rx.changed().await.is_err() {
                            // Leader was cancelled without publishing. Clear
                            // its dead slot (if still ours) so the retry below
                            // can claim the flight instead of spinning on a
                            // channel that will never settle.
                            let mut slots = self.slots.lock().await;
                            let dead = matches!(
                                slots.get(banner),
                                Some(Slot::Pending(cur)) if cur.same_channel(&rx)
                            );
                            if dead {
                                slots.remove(banner);
                            }
                            break;
                        }
                    }
                    match settled {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                Lookup::Miss => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(banner.to_string(), Slot::Pending(rx));
                    drop(slots);

                    let result = self.source.compute(banner).await;

                    let mut slots = self.slots.lock().await;
                    match &result {
                        Ok(tally) => {
                            slots.insert(
                                banner.to_string(),
                                Slot::Ready {
                                    tally: tally.clone(),
                                    cached_at: Instant::now(),
                                },
                            );
                        }
                        // Errors are not cached; the slot is freed so the
                        // next caller re-attempts.
                        Err(_) => {
                            slots.remove(banner);
                        }
                    }
                    drop(slots);

                    tx.send_replace(Some(result.clone()));
                    return result;
                }
            }
        }
    }
}
