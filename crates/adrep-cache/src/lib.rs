//! Freshness-gated phrase cache: a write-through store of keyword search
//! volumes keyed by phrase text, with time-based invalidation, monotonic
//! count reconciliation, and soft-deletion.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{info, warn};

use adrep_core::FRESHNESS_WINDOW_DAYS;

pub const CRATE_NAME: &str = "adrep-cache";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("phrase store error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("phrase store lock poisoned")]
    Poisoned,
}

/// Region/device scope attached to every stored record. Defaults match the
/// scope the volume service is queried with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseScope {
    pub regions: String,
    pub devices: String,
}

impl Default for PhraseScope {
    fn default() -> Self {
        Self {
            regions: "[213]".to_string(),
            devices: r#"["all"]"#.to_string(),
        }
    }
}

/// Persistent cache row. Multiple historical rows may exist per phrase; at
/// most one is live (not soft-deleted) at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseRecord {
    pub id: i64,
    pub phrase: String,
    pub regions: String,
    pub devices: String,
    pub request_count: i64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-call tally of what `reconcile` did, for audit logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// New live rows for phrases with no prior live record.
    pub inserted: usize,
    /// Stale live rows soft-deleted and replaced.
    pub superseded: usize,
    /// Fresh rows whose count was raised to a strictly greater value.
    pub updated: usize,
    /// Fresh rows left untouched.
    pub skipped: usize,
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS phrase_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    phrase        TEXT    NOT NULL,
    regions       TEXT    NOT NULL,
    devices       TEXT    NOT NULL,
    request_count INTEGER NOT NULL,
    is_deleted    INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT    NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS phrase_records_live
    ON phrase_records(phrase) WHERE is_deleted = 0;
CREATE INDEX IF NOT EXISTS phrase_records_by_phrase
    ON phrase_records(phrase);
";

/// SQLite-backed phrase cache. The connection mutex serializes concurrent
/// reconciles, which is what preserves the single-live-record invariant
/// together with the partial unique index.
pub struct PhraseCache {
    conn: Mutex<Connection>,
    scope: PhraseScope,
}

impl PhraseCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            scope: PhraseScope::default(),
        })
    }

    pub fn with_scope(mut self, scope: PhraseScope) -> Self {
        self.scope = scope;
        self
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&mut conn)
    }

    /// True only if a live record exists whose creation time falls inside
    /// the freshness window. Absence, staleness, and storage errors all
    /// answer false: false means "must (re)fetch", not "something broke".
    pub fn is_fresh(&self, phrase: &str) -> bool {
        self.is_fresh_at(phrase, Utc::now())
    }

    fn is_fresh_at(&self, phrase: &str, now: DateTime<Utc>) -> bool {
        match self.live_record(phrase) {
            Ok(Some(record)) => is_within_window(record.created_at, now),
            Ok(None) => false,
            Err(err) => {
                warn!(phrase, error = %err, "freshness check failed, treating phrase as stale");
                false
            }
        }
    }

    /// Most recent live row for a phrase, if any.
    pub fn live_record(&self, phrase: &str) -> Result<Option<PhraseRecord>, CacheError> {
        self.with_conn(|conn| {
            let record = conn
                .prepare(
                    r"
                    SELECT id, phrase, regions, devices, request_count, is_deleted, created_at
                    FROM phrase_records
                    WHERE phrase = ?1 AND is_deleted = 0
                    ORDER BY created_at DESC
                    LIMIT 1
                    ",
                )?
                .query_row(params![phrase], record_from_row)
                .optional()?;
            Ok(record)
        })
    }

    /// Folds a fresh fetch result into the store inside one transaction.
    ///
    /// The subject phrase and every related phrase follow the same aging
    /// rule: no live record inserts, a stale live record is soft-deleted
    /// and replaced outright (even by a lower count). A fresh related
    /// record only has its count raised, and only to a strictly greater
    /// value; a fresh subject record is left alone. Any failure rolls the
    /// whole batch back.
    pub fn reconcile(
        &self,
        phrase: &str,
        new_count: i64,
        related: &[(String, i64)],
    ) -> Result<ReconcileSummary, CacheError> {
        self.reconcile_at(phrase, new_count, related, Utc::now())
    }

    fn reconcile_at(
        &self,
        phrase: &str,
        new_count: i64,
        related: &[(String, i64)],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, CacheError> {
        let scope = self.scope.clone();
        let summary = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut summary = ReconcileSummary::default();

            apply_phrase(&tx, &scope, phrase, new_count, now, false, &mut summary)?;
            for (related_phrase, count) in related {
                apply_phrase(&tx, &scope, related_phrase, *count, now, true, &mut summary)?;
            }

            tx.commit()?;
            Ok(summary)
        })?;

        info!(
            phrase,
            inserted = summary.inserted,
            superseded = summary.superseded,
            updated = summary.updated,
            skipped = summary.skipped,
            "phrase reconcile committed"
        );
        Ok(summary)
    }

    /// Total number of rows ever written for a phrase, live or not.
    pub fn history_len(&self, phrase: &str) -> Result<usize, CacheError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM phrase_records WHERE phrase = ?1",
                params![phrase],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

fn is_within_window(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    created_at > now - Duration::days(FRESHNESS_WINDOW_DAYS)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PhraseRecord> {
    let created_at: String = row.get(6)?;
    let created_at = created_at
        .parse::<DateTime<Utc>>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(err)))?;
    Ok(PhraseRecord {
        id: row.get(0)?,
        phrase: row.get(1)?,
        regions: row.get(2)?,
        devices: row.get(3)?,
        request_count: row.get(4)?,
        is_deleted: row.get::<_, i64>(5)? != 0,
        created_at,
    })
}

fn live_record_in_tx(
    tx: &rusqlite::Transaction<'_>,
    phrase: &str,
) -> Result<Option<PhraseRecord>, CacheError> {
    let record = tx
        .prepare(
            r"
            SELECT id, phrase, regions, devices, request_count, is_deleted, created_at
            FROM phrase_records
            WHERE phrase = ?1 AND is_deleted = 0
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )?
        .query_row(params![phrase], record_from_row)
        .optional()?;
    Ok(record)
}

fn insert_live(
    tx: &rusqlite::Transaction<'_>,
    scope: &PhraseScope,
    phrase: &str,
    count: i64,
    now: DateTime<Utc>,
) -> Result<(), CacheError> {
    tx.execute(
        r"
        INSERT INTO phrase_records(phrase, regions, devices, request_count, is_deleted, created_at)
        VALUES (?1, ?2, ?3, ?4, 0, ?5)
        ",
        params![phrase, scope.regions, scope.devices, count, now.to_rfc3339()],
    )?;
    Ok(())
}

fn apply_phrase(
    tx: &rusqlite::Transaction<'_>,
    scope: &PhraseScope,
    phrase: &str,
    count: i64,
    now: DateTime<Utc>,
    raise_fresh_count: bool,
    summary: &mut ReconcileSummary,
) -> Result<(), CacheError> {
    let existing = live_record_in_tx(tx, phrase)?;

    match existing {
        None => {
            insert_live(tx, scope, phrase, count, now)?;
            summary.inserted += 1;
        }
        Some(record) if !is_within_window(record.created_at, now) => {
            // Stale data is assumed fully superseded, lower counts included.
            tx.execute(
                "UPDATE phrase_records SET is_deleted = 1 WHERE id = ?1",
                params![record.id],
            )?;
            insert_live(tx, scope, phrase, count, now)?;
            summary.superseded += 1;
        }
        Some(record) if raise_fresh_count && count > record.request_count => {
            tx.execute(
                "UPDATE phrase_records SET request_count = ?1 WHERE id = ?2",
                params![count, record.id],
            )?;
            summary.updated += 1;
        }
        Some(_) => {
            summary.skipped += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PhraseCache {
        PhraseCache::open_in_memory().expect("in-memory cache")
    }

    fn backdate(cache: &PhraseCache, phrase: &str, count: i64, days_ago: i64) {
        let created = Utc::now() - Duration::days(days_ago);
        cache
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                insert_live(&tx, &PhraseScope::default(), phrase, count, created)?;
                tx.commit()?;
                Ok(())
            })
            .expect("backdated insert");
    }

    #[test]
    fn unknown_phrase_is_not_fresh_and_reconcile_inserts_one_live_row() {
        let cache = cache();
        assert!(!cache.is_fresh("buy widgets"));

        let summary = cache.reconcile("buy widgets", 120, &[]).expect("reconcile");
        assert_eq!(summary.inserted, 1);

        let record = cache
            .live_record("buy widgets")
            .expect("lookup")
            .expect("live record");
        assert_eq!(record.request_count, 120);
        assert!(!record.is_deleted);
        assert_eq!(cache.history_len("buy widgets").unwrap(), 1);
        assert!(cache.is_fresh("buy widgets"));
    }

    #[test]
    fn eight_day_old_record_is_stale_and_replaced_even_by_a_lower_count() {
        let cache = cache();
        backdate(&cache, "buy widgets", 500, 8);
        assert!(!cache.is_fresh("buy widgets"));

        let summary = cache.reconcile("buy widgets", 40, &[]).expect("reconcile");
        assert_eq!(summary.superseded, 1);
        assert_eq!(summary.inserted, 0);

        let record = cache.live_record("buy widgets").unwrap().unwrap();
        assert_eq!(record.request_count, 40);
        // The old row survives as history, soft-deleted.
        assert_eq!(cache.history_len("buy widgets").unwrap(), 2);
        assert!(cache.is_fresh("buy widgets"));
    }

    #[test]
    fn fresh_related_record_only_accepts_strictly_greater_counts() {
        let cache = cache();
        backdate(&cache, "widget price", 50, 2);

        // First call also inserts the subject phrase "unrelated".
        let lower = cache
            .reconcile("unrelated", 10, &[("widget price".to_string(), 40)])
            .expect("reconcile");
        assert_eq!(lower.inserted, 1);
        assert_eq!(lower.skipped, 1);
        assert_eq!(
            cache.live_record("widget price").unwrap().unwrap().request_count,
            50
        );

        // Subject is now fresh too, so it counts as skipped from here on.
        let equal = cache
            .reconcile("unrelated", 10, &[("widget price".to_string(), 50)])
            .expect("reconcile");
        assert_eq!(equal.skipped, 2);

        let higher = cache
            .reconcile("unrelated", 10, &[("widget price".to_string(), 60)])
            .expect("reconcile");
        assert_eq!(higher.updated, 1);
        assert_eq!(higher.skipped, 1);
        assert_eq!(
            cache.live_record("widget price").unwrap().unwrap().request_count,
            60
        );
        // No new row and no soft-deletion in either direction.
        assert_eq!(cache.history_len("widget price").unwrap(), 1);
    }

    #[test]
    fn fresh_subject_phrase_is_left_untouched() {
        let cache = cache();
        backdate(&cache, "buy widgets", 50, 2);

        let summary = cache.reconcile("buy widgets", 999, &[]).expect("reconcile");
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            cache.live_record("buy widgets").unwrap().unwrap().request_count,
            50
        );
        assert_eq!(cache.history_len("buy widgets").unwrap(), 1);
    }

    #[test]
    fn stale_related_phrases_are_replaced_in_the_same_call() {
        let cache = cache();
        backdate(&cache, "widget repair", 300, 9);

        let summary = cache
            .reconcile(
                "buy widgets",
                120,
                &[
                    ("widget repair".to_string(), 150),
                    ("widget rental".to_string(), 75),
                ],
            )
            .expect("reconcile");

        assert_eq!(summary.inserted, 2); // subject + brand-new related phrase
        assert_eq!(summary.superseded, 1);
        assert_eq!(
            cache.live_record("widget repair").unwrap().unwrap().request_count,
            150
        );
        assert_eq!(
            cache.live_record("widget rental").unwrap().unwrap().request_count,
            75
        );
    }

    #[test]
    fn at_most_one_live_row_per_phrase_after_repeated_reconciles() {
        let cache = cache();
        backdate(&cache, "buy widgets", 10, 8);
        cache.reconcile("buy widgets", 20, &[]).unwrap();
        cache.reconcile("buy widgets", 30, &[]).unwrap();

        let live: i64 = cache
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM phrase_records WHERE phrase = ?1 AND is_deleted = 0",
                    params!["buy widgets"],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(live, 1);
    }

    #[test]
    fn records_survive_reopening_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("phrases.db");

        {
            let cache = PhraseCache::open(&path).expect("open");
            cache.reconcile("buy widgets", 120, &[]).unwrap();
        }

        let reopened = PhraseCache::open(&path).expect("reopen");
        assert!(reopened.is_fresh("buy widgets"));
        assert_eq!(
            reopened.live_record("buy widgets").unwrap().unwrap().request_count,
            120
        );
    }

    #[test]
    fn storage_errors_fail_open_to_refetch() {
        let cache = cache();
        cache
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE phrase_records")?;
                Ok(())
            })
            .unwrap();

        assert!(!cache.is_fresh("buy widgets"));
    }

    #[test]
    fn poisoned_lock_degrades_to_stale_instead_of_panicking() {
        let cache = std::sync::Arc::new(cache());
        let poisoner = std::sync::Arc::clone(&cache);
        std::thread::spawn(move || {
            let _guard = poisoner.conn.lock().unwrap();
            panic!("poison the lock");
        })
        .join()
        .unwrap_err();

        assert!(matches!(
            cache.live_record("buy widgets"),
            Err(CacheError::Poisoned)
        ));
        assert!(!cache.is_fresh("buy widgets"));
    }

    #[test]
    fn reconcile_rolls_back_as_a_unit_on_failure() {
        let cache = cache();
        cache
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER poison_phrase BEFORE INSERT ON phrase_records
                     WHEN NEW.phrase = 'poison'
                     BEGIN SELECT RAISE(ABORT, 'poison phrase'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        // The subject insert succeeds, the second related insert aborts;
        // nothing from the call may survive.
        let result = cache.reconcile(
            "buy widgets",
            120,
            &[
                ("widget repair".to_string(), 10),
                ("poison".to_string(), 10),
            ],
        );

        assert!(result.is_err());
        assert!(cache.live_record("buy widgets").unwrap().is_none());
        assert!(cache.live_record("widget repair").unwrap().is_none());
        assert_eq!(cache.history_len("buy widgets").unwrap(), 0);
    }
}
