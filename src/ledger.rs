// Ledger Writer - validates a submitted wish history and atomically replaces
// any prior ledger entry carrying the same content fingerprint.

use chrono::{DateTime, FixedOffset};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{self, NewPull, NewWish, PullRecord, WishEntry};
use crate::error::WishError;
use crate::fingerprint::FingerprintGenerator;

/// Pull timestamps are stored as civil time in fixed UTC+8.
const PULL_TZ_OFFSET_SECS: i32 = 8 * 3600;

/// A wish history as submitted by a client.
///
/// `first_pulls` is used only for fingerprinting; `legendary_pulls` become the
/// persisted pull records. Each legendary pull is an ordered sequence of at
/// least five fields: epoch seconds, item name, item type, pity counter, and
/// a flag marking membership in a multi-pull batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WishSubmission {
    pub banner: String,
    #[serde(rename = "firstPulls")]
    pub first_pulls: Vec<Vec<Value>>,
    #[serde(rename = "legendaryPulls")]
    pub legendary_pulls: Vec<Value>,
    pub legendary: i64,
    pub rare: i64,
    #[serde(rename = "rarePulls")]
    pub rare_pulls: i64,
    pub total: i64,
}

/// The persisted entry and its pull records, as returned to the submitter.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub wish: WishEntry,
    pub pulls: Vec<PullRecord>,
}

pub struct LedgerWriter {
    fingerprints: FingerprintGenerator,
}

impl LedgerWriter {
    pub fn new(fingerprints: FingerprintGenerator) -> Self {
        LedgerWriter { fingerprints }
    }

    /// Record a submitted history against a banner.
    ///
    /// Validation happens strictly before any persistence side effect: the
    /// banner must exist (`NotFound`) and every legendary pull must be a
    /// well-formed sequence (`InvalidInput` rejects the entire batch). The
    /// entry and its pull rows are built fully in memory, then any stale
    /// entry with the same fingerprint is removed and the new one saved as a
    /// single transaction. After a successful call exactly one live entry
    /// exists for the fingerprint; a failed call leaves prior state untouched.
    pub fn submit(
        &self,
        conn: &mut Connection,
        data: &WishSubmission,
    ) -> Result<SubmitOutcome, WishError> {
        let banner = db::get_banner(conn, &data.banner)?
            .ok_or_else(|| WishError::NotFound(data.banner.clone()))?;

        let pulls = build_pull_rows(&data.legendary_pulls)?;

        let fingerprint = self.fingerprints.fingerprint(&data.first_pulls);

        let new = NewWish {
            banner_id: banner.id,
            fingerprint: fingerprint.clone(),
            legendary: data.legendary,
            rare: data.rare,
            rare_pity: data.rare_pulls,
            total: data.total,
        };

        // Deduplication is global, not banner-scoped: a history re-submitted
        // under a different banner still supersedes the original entry.
        let stale = db::find_wish_by_fingerprint(conn, &fingerprint)?;

        let (wish, pulls) = replace_with_retry(conn, stale.as_ref(), &new, &pulls)?;

        Ok(SubmitOutcome { wish, pulls })
    }
}

/// Replace, retrying once on a fingerprint conflict.
///
/// Two submissions racing on the same content can both miss the stale lookup;
/// the loser's insert then trips the unique fingerprint index. Equal
/// fingerprint means equal logical content, so the recovery is to re-run the
/// lookup, pick up the winner's entry as the stale row, and replace it.
fn replace_with_retry(
    conn: &mut Connection,
    stale: Option<&WishEntry>,
    new: &NewWish,
    pulls: &[NewPull],
) -> Result<(WishEntry, Vec<PullRecord>), WishError> {
    match db::replace_wish(conn, stale, new, pulls) {
        Err(err) if db::is_fingerprint_conflict(&err) => {
            let stale = db::find_wish_by_fingerprint(conn, &new.fingerprint)?;
            db::replace_wish(conn, stale.as_ref(), new, pulls)
        }
        other => other,
    }
}

/// Validate every submitted legendary pull and build its row. The first
/// malformed entry rejects the whole batch; no partial set of rows is ever
/// handed to the store.
fn build_pull_rows(legendary_pulls: &[Value]) -> Result<Vec<NewPull>, WishError> {
    let mut rows = Vec::with_capacity(legendary_pulls.len());

    for (i, pull) in legendary_pulls.iter().enumerate() {
        let fields = pull
            .as_array()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} is not a sequence", i)))?;

        if fields.len() < 5 {
            return Err(WishError::InvalidInput(format!(
                "pull {} has {} fields, expected at least 5",
                i,
                fields.len()
            )));
        }

        let epoch = fields[0]
            .as_i64()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} time is not an integer", i)))?;
        let name = fields[1]
            .as_str()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} name is not a string", i)))?;
        let item_type = fields[2]
            .as_str()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} type is not a string", i)))?;
        let pity = fields[3]
            .as_i64()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} pity is not an integer", i)))?;
        let grouped = fields[4]
            .as_bool()
            .ok_or_else(|| WishError::InvalidInput(format!("pull {} grouped is not a bool", i)))?;

        rows.push(NewPull {
            time: format_pull_time(epoch)
                .ok_or_else(|| WishError::InvalidInput(format!("pull {} time out of range", i)))?,
            name: name.to_string(),
            item_type: item_type.to_string(),
            pity,
            grouped,
        });
    }

    Ok(rows)
}

/// Convert epoch seconds to the stored `YYYY-MM-DD HH:MM:SS+8` civil string.
fn format_pull_time(epoch: i64) -> Option<String> {
    let tz = FixedOffset::east_opt(PULL_TZ_OFFSET_SECS)?;
    let dt = DateTime::from_timestamp(epoch, 0)?.with_timezone(&tz);
    Some(dt.format("%Y-%m-%d %H:%M:%S+8").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn writer() -> LedgerWriter {
        LedgerWriter::new(FingerprintGenerator::new(42))
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        db::create_banner(&conn, "b1", "Ballad in Goblets").unwrap();
        conn
    }

    fn submission(banner: &str) -> WishSubmission {
        WishSubmission {
            banner: banner.to_string(),
            first_pulls: vec![
                vec![json!("a"), json!("1")],
                vec![json!("b"), json!("2")],
            ],
            legendary_pulls: vec![
                json!([1609459200, "Keqing", "Character", 74, false]),
                json!([1609462800, "Skyward Blade", "Weapon", 12, true]),
            ],
            legendary: 2,
            rare: 14,
            rare_pulls: 3,
            total: 180,
        }
    }

    fn wish_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM wishes", [], |r| r.get(0))
            .unwrap()
    }

    fn pull_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM pulls", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_submit_persists_entry_and_pulls() {
        let mut conn = test_conn();

        let outcome = writer().submit(&mut conn, &submission("b1")).unwrap();

        assert_eq!(outcome.wish.banner_id, "b1");
        assert_eq!(outcome.wish.legendary, 2);
        assert_eq!(outcome.wish.rare_pity, 3);
        assert_eq!(outcome.pulls.len(), 2);
        assert_eq!(outcome.pulls[0].name, "Keqing");
        assert_eq!(outcome.pulls[0].time, "2021-01-01 08:00:00+8");
        assert!(outcome.pulls[1].grouped);
        assert_eq!(wish_count(&conn), 1);
        assert_eq!(pull_count(&conn), 2);
    }

    #[test]
    fn test_fingerprint_matches_flattened_first_pulls() {
        let mut conn = test_conn();
        let seed = 42;

        let outcome = writer().submit(&mut conn, &submission("b1")).unwrap();

        let expected = format!(
            "{:016x}",
            xxhash_rust::xxh64::xxh64(b"a;1;b;2", seed)
        );
        assert_eq!(outcome.wish.fingerprint, expected);
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let mut conn = test_conn();
        let writer = writer();

        let first = writer.submit(&mut conn, &submission("b1")).unwrap();
        let second = writer.submit(&mut conn, &submission("b1")).unwrap();

        assert_eq!(first.wish.fingerprint, second.wish.fingerprint);
        assert_ne!(first.wish.id, second.wish.id);

        // Exactly one live entry; the second submission's pulls superseded
        // the first's.
        assert_eq!(wish_count(&conn), 1);
        assert_eq!(pull_count(&conn), 2);
        assert!(db::pulls_for_wish(&conn, first.wish.id).unwrap().is_empty());
        assert_eq!(
            db::pulls_for_wish(&conn, second.wish.id).unwrap(),
            second.pulls
        );
    }

    #[test]
    fn test_resubmission_under_other_banner_supersedes_globally() {
        let mut conn = test_conn();
        db::create_banner(&conn, "b2", "Epitome Invocation").unwrap();
        let writer = writer();

        writer.submit(&mut conn, &submission("b1")).unwrap();
        let second = writer.submit(&mut conn, &submission("b2")).unwrap();

        // Same content under a different banner: the global deduplication
        // keeps only the latest entry.
        assert_eq!(wish_count(&conn), 1);
        let live = db::find_wish_by_fingerprint(&conn, &second.wish.fingerprint)
            .unwrap()
            .unwrap();
        assert_eq!(live.banner_id, "b2");
    }

    #[test]
    fn test_raced_identical_submission_retries_and_supersedes() {
        let mut conn = test_conn();
        let first = writer().submit(&mut conn, &submission("b1")).unwrap();

        // A raced writer whose stale lookup ran before `first` committed
        // passes no stale entry; its insert conflicts on the fingerprint
        // index and the retry must pick up the live entry and replace it.
        let new = NewWish {
            banner_id: "b1".to_string(),
            fingerprint: first.wish.fingerprint.clone(),
            legendary: 2,
            rare: 14,
            rare_pity: 3,
            total: 180,
        };
        let (wish, _) = replace_with_retry(&mut conn, None, &new, &[]).unwrap();

        assert_ne!(wish.id, first.wish.id);
        assert_eq!(wish_count(&conn), 1);
        assert_eq!(
            db::find_wish_by_fingerprint(&conn, &first.wish.fingerprint)
                .unwrap()
                .unwrap()
                .id,
            wish.id
        );
    }

    #[test]
    fn test_unknown_banner_is_rejected_before_any_write() {
        let mut conn = test_conn();

        let err = writer().submit(&mut conn, &submission("nope"));

        assert!(matches!(err, Err(WishError::NotFound(ref b)) if b == "nope"));
        assert_eq!(wish_count(&conn), 0);
        assert_eq!(pull_count(&conn), 0);
    }

    #[test]
    fn test_scalar_pull_rejects_whole_batch() {
        let mut conn = test_conn();

        let mut data = submission("b1");
        data.legendary_pulls = vec![
            json!([1609459200, "Keqing", "Character", 74, false]),
            json!("not-a-sequence"),
        ];

        let err = writer().submit(&mut conn, &data);

        assert!(matches!(err, Err(WishError::InvalidInput(_))));
        // No partial commit: zero rows of any kind.
        assert_eq!(wish_count(&conn), 0);
        assert_eq!(pull_count(&conn), 0);
    }

    #[test]
    fn test_short_pull_sequence_is_rejected() {
        let mut conn = test_conn();

        let mut data = submission("b1");
        data.legendary_pulls = vec![json!([1609459200, "Keqing", "Character", 74])];

        let err = writer().submit(&mut conn, &data);

        assert!(matches!(err, Err(WishError::InvalidInput(_))));
        assert_eq!(wish_count(&conn), 0);
    }

    #[test]
    fn test_wrongly_typed_pull_field_is_rejected() {
        let mut conn = test_conn();

        let mut data = submission("b1");
        data.legendary_pulls = vec![json!(["yesterday", "Keqing", "Character", 74, false])];

        let err = writer().submit(&mut conn, &data);

        assert!(matches!(err, Err(WishError::InvalidInput(_))));
        assert_eq!(wish_count(&conn), 0);
    }

    #[test]
    fn test_pull_time_converts_to_utc_plus_8() {
        assert_eq!(
            format_pull_time(1609459200).unwrap(),
            "2021-01-01 08:00:00+8"
        );
        assert_eq!(
            format_pull_time(1614545400).unwrap(),
            "2021-03-01 04:50:00+8"
        );
    }
}
