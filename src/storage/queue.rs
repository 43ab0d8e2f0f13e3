//! `SQLite`-backed durable photo spool.
//!
//! Every captured frame is committed here before any network activity. Rows
//! are keyed by an autoincrement sequence number, so capture order is the
//! delivery order. Delivered rows are deleted; `spool_meta` keeps the
//! lifetime delivered count and the number of times the spool was opened.

use super::connection::{acquire_lock, configure_connection, map_sqlite_error};
use crate::models::{DeliveryState, ExposureMode, Photo, QueueEntry};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS spool (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    mode TEXT NOT NULL,
    exposure_us INTEGER,
    clock_sane INTEGER NOT NULL,
    payload BLOB,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spool_state_seq ON spool(state, seq);

CREATE TABLE IF NOT EXISTS spool_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// `spool_meta` key counting agent starts.
const META_RUNS: &str = "runs";

/// `spool_meta` key counting acknowledged frames.
const META_DELIVERED: &str = "delivered";

const SELECT_COLUMNS: &str = "seq, filename, captured_at, mode, exposure_us, clock_sane, \
                              payload, state, attempts, last_error, enqueued_at";

/// Entry counts per delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Waiting for delivery.
    pub pending: u64,
    /// Currently handed to the uploader.
    pub delivering: u64,
    /// Acknowledged by the receiver over the spool's lifetime.
    pub delivered: u64,
    /// Rejected by the receiver.
    pub failed_permanent: u64,
    /// Payload bytes still waiting for delivery.
    pub pending_bytes: u64,
}

impl QueueStats {
    /// Entries not yet acknowledged or rejected.
    #[must_use]
    pub const fn backlog(&self) -> u64 {
        self.pending + self.delivering
    }
}

/// Durable FIFO of captured photos.
///
/// Shared between the capture and upload threads behind an `Arc`. All access
/// goes through one connection guarded by a mutex; a separate condition
/// variable lets an idle uploader sleep until the next enqueue.
pub struct SpoolQueue {
    conn: Mutex<Connection>,
    arrivals: Mutex<u64>,
    arrived: Condvar,
    run: u64,
}

impl SpoolQueue {
    /// Opens (or creates) the spool at `path` and starts a new run.
    ///
    /// Entries left `delivering` by a previous run are returned to `pending`,
    /// so an upload interrupted by a crash is retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::operation("create_spool_dir", format!("{}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::operation("open_spool", format!("{}: {e}", path.display())))?;
        let queue = Self::with_connection(conn, true)?;

        let recovered = queue.recover_in_flight()?;
        if recovered > 0 {
            tracing::info!(
                recovered,
                run = queue.run,
                path = %path.display(),
                "Returned interrupted uploads to the queue"
            );
        }
        Ok(queue)
    }

    /// Opens an existing spool without touching in-flight entries or
    /// starting a run.
    ///
    /// For inspecting or maintaining a spool that a running agent may be
    /// using at the same time.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool does not exist or cannot be opened.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::operation("attach_spool", format!("{}: {e}", path.display())))?;
        Self::with_connection(conn, false)
    }

    /// Creates an in-memory spool (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::operation("open_spool_memory", e))?;
        Self::with_connection(conn, true)
    }

    fn with_connection(conn: Connection, start_run: bool) -> Result<Self> {
        configure_connection(&conn)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::operation("initialize_spool_schema", e))?;
        if start_run {
            bump_meta(&conn, META_RUNS).map_err(|e| map_sqlite_error("start_run", &e))?;
        }
        let run = read_meta(&conn, META_RUNS).map_err(|e| map_sqlite_error("start_run", &e))?;
        Ok(Self {
            conn: Mutex::new(conn),
            arrivals: Mutex::new(0),
            arrived: Condvar::new(),
            run,
        })
    }

    /// How many times the spool has been opened by an agent, including this
    /// one. Starts at 1 and never repeats for the same spool file.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "UPDATE spool SET state = ?1 WHERE state = ?2",
            params![
                DeliveryState::Pending.as_str(),
                DeliveryState::Delivering.as_str()
            ],
        )
        .map_err(|e| map_sqlite_error("recover_in_flight", &e))
    }

    /// Durably stores a photo as `pending`.
    ///
    /// Returns only after the row is committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageExhausted`] when the disk is full, otherwise
    /// [`Error::OperationFailed`].
    pub fn enqueue(&self, photo: Photo) -> Result<QueueEntry> {
        let enqueued_at = Utc::now();
        let exposure_us = photo
            .exposure()
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));

        let seq = {
            let conn = acquire_lock(&self.conn);
            conn.execute(
                "INSERT INTO spool (filename, captured_at, mode, exposure_us, clock_sane, \
                 payload, state, attempts, enqueued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    photo.filename(),
                    photo.captured_at().timestamp_millis(),
                    photo.mode().as_str(),
                    exposure_us,
                    photo.clock_sane(),
                    photo.data(),
                    DeliveryState::Pending.as_str(),
                    enqueued_at.timestamp_millis(),
                ],
            )
            .map_err(|e| map_sqlite_error("enqueue", &e))?;
            conn.last_insert_rowid()
        };

        metrics::counter!("lapse_queue_enqueued_total").increment(1);
        self.wake();

        Ok(QueueEntry::new(
            seq,
            photo,
            DeliveryState::Pending,
            0,
            None,
            enqueued_at,
        ))
    }

    /// Claims the oldest pending entry, moving it to `delivering`.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read or updated.
    pub fn next_pending(&self) -> Result<Option<QueueEntry>> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_error("next_pending", &e))?;

        let raw = tx
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM spool WHERE state = ?1 ORDER BY seq LIMIT 1"
                ),
                params![DeliveryState::Pending.as_str()],
                RawEntry::from_row,
            )
            .optional()
            .map_err(|e| map_sqlite_error("next_pending", &e))?;

        let Some(mut raw) = raw else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE spool SET state = ?1 WHERE seq = ?2",
            params![DeliveryState::Delivering.as_str(), raw.seq],
        )
        .map_err(|e| map_sqlite_error("next_pending", &e))?;
        tx.commit()
            .map_err(|e| map_sqlite_error("next_pending", &e))?;

        raw.state = DeliveryState::Delivering.as_str().to_string();
        raw.into_entry().map(Some)
    }

    /// Removes an acknowledged entry and counts it as delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the entry is not `delivering`.
    pub fn mark_delivered(&self, entry: &QueueEntry) -> Result<()> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_error("mark_delivered", &e))?;
        let changed = tx
            .execute(
                "DELETE FROM spool WHERE seq = ?1 AND state = ?2",
                params![entry.seq(), DeliveryState::Delivering.as_str()],
            )
            .map_err(|e| map_sqlite_error("mark_delivered", &e))?;
        ensure_transitioned(changed, entry.seq(), "mark_delivered")?;
        bump_meta(&tx, META_DELIVERED).map_err(|e| map_sqlite_error("mark_delivered", &e))?;
        tx.commit()
            .map_err(|e| map_sqlite_error("mark_delivered", &e))
    }

    /// Records a failed attempt.
    ///
    /// A transient failure puts the entry back to `pending` under the same
    /// sequence number, so it stays at the head of the queue. A permanent
    /// failure parks it in `failed_permanent` with its payload kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the entry is not `delivering`.
    pub fn mark_failed(&self, entry: &QueueEntry, permanent: bool, reason: &str) -> Result<()> {
        let target = if permanent {
            DeliveryState::FailedPermanent
        } else {
            DeliveryState::Pending
        };
        let conn = acquire_lock(&self.conn);
        let changed = conn
            .execute(
                "UPDATE spool SET state = ?1, attempts = attempts + 1, last_error = ?2 \
                 WHERE seq = ?3 AND state = ?4",
                params![
                    target.as_str(),
                    reason,
                    entry.seq(),
                    DeliveryState::Delivering.as_str(),
                ],
            )
            .map_err(|e| map_sqlite_error("mark_failed", &e))?;
        ensure_transitioned(changed, entry.seq(), "mark_failed")
    }

    /// Returns a claimed entry to `pending` without counting an attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be updated.
    pub fn release(&self, entry: &QueueEntry) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "UPDATE spool SET state = ?1 WHERE seq = ?2 AND state = ?3",
            params![
                DeliveryState::Pending.as_str(),
                entry.seq(),
                DeliveryState::Delivering.as_str(),
            ],
        )
        .map_err(|e| map_sqlite_error("release", &e))?;
        Ok(())
    }

    /// Moves every `failed_permanent` entry back to `pending`.
    ///
    /// Returns the number of entries moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be updated.
    pub fn requeue_failed(&self) -> Result<usize> {
        let changed = {
            let conn = acquire_lock(&self.conn);
            conn.execute(
                "UPDATE spool SET state = ?1 WHERE state = ?2",
                params![
                    DeliveryState::Pending.as_str(),
                    DeliveryState::FailedPermanent.as_str(),
                ],
            )
            .map_err(|e| map_sqlite_error("requeue_failed", &e))?
        };
        if changed > 0 {
            self.wake();
        }
        Ok(changed)
    }

    /// Counts entries per state.
    ///
    /// `delivered` comes from the lifetime counter, since delivered rows are
    /// not kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read.
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT state, COUNT(*), COALESCE(SUM(length(payload)), 0) \
                 FROM spool GROUP BY state",
            )
            .map_err(|e| map_sqlite_error("queue_stats", &e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| map_sqlite_error("queue_stats", &e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (state, count, bytes) = row.map_err(|e| map_sqlite_error("queue_stats", &e))?;
            let count = u64::try_from(count).unwrap_or(0);
            match state.parse::<DeliveryState>()? {
                DeliveryState::Pending => {
                    stats.pending = count;
                    stats.pending_bytes = u64::try_from(bytes).unwrap_or(0);
                },
                DeliveryState::Delivering => stats.delivering = count,
                DeliveryState::Delivered => stats.delivered = count,
                DeliveryState::FailedPermanent => stats.failed_permanent = count,
            }
        }
        let delivered =
            read_meta(&conn, META_DELIVERED).map_err(|e| map_sqlite_error("queue_stats", &e))?;
        stats.delivered = stats.delivered.saturating_add(delivered);
        Ok(stats)
    }

    /// Looks up one entry by sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read.
    pub fn get(&self, seq: i64) -> Result<Option<QueueEntry>> {
        let conn = acquire_lock(&self.conn);
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM spool WHERE seq = ?1"),
                params![seq],
                RawEntry::from_row,
            )
            .optional()
            .map_err(|e| map_sqlite_error("get_entry", &e))?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Lists entries in `state`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read.
    pub fn list(&self, state: DeliveryState, limit: usize) -> Result<Vec<QueueEntry>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM spool WHERE state = ?1 ORDER BY seq LIMIT ?2"
            ))
            .map_err(|e| map_sqlite_error("list_entries", &e))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![state.as_str(), limit], RawEntry::from_row)
            .map_err(|e| map_sqlite_error("list_entries", &e))?;

        rows.map(|row| {
            row.map_err(|e| map_sqlite_error("list_entries", &e))
                .and_then(RawEntry::into_entry)
        })
        .collect()
    }

    /// Blocks until a pending entry exists or `timeout` elapses.
    ///
    /// Returns `true` if work is available.
    pub fn wait_for_arrival(&self, timeout: Duration) -> bool {
        let arrivals = acquire_lock(&self.arrivals);
        if self.has_pending() {
            return true;
        }
        let seen = *arrivals;
        let (arrivals, _) = self
            .arrived
            .wait_timeout_while(arrivals, timeout, |count| *count == seen)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(arrivals);
        self.has_pending()
    }

    /// Wakes any thread blocked in [`Self::wait_for_arrival`].
    pub fn wake(&self) {
        let mut arrivals = acquire_lock(&self.arrivals);
        *arrivals = arrivals.wrapping_add(1);
        self.arrived.notify_all();
    }

    fn has_pending(&self) -> bool {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM spool WHERE state = ?1)",
            params![DeliveryState::Pending.as_str()],
            |row| row.get::<_, bool>(0),
        )
        .unwrap_or(false)
    }
}

fn bump_meta(conn: &Connection, key: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO spool_meta (key, value) VALUES (?1, 1) \
         ON CONFLICT(key) DO UPDATE SET value = value + 1",
        params![key],
    )
    .map(|_| ())
}

fn read_meta(conn: &Connection, key: &str) -> rusqlite::Result<u64> {
    let value = conn
        .query_row(
            "SELECT value FROM spool_meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
}

fn ensure_transitioned(changed: usize, seq: i64, operation: &str) -> Result<()> {
    if changed == 0 {
        return Err(Error::InvalidInput(format!(
            "{operation}: entry {seq} is not being delivered"
        )));
    }
    Ok(())
}

/// A spool row as stored, before parsing.
struct RawEntry {
    seq: i64,
    filename: String,
    captured_at: i64,
    mode: String,
    exposure_us: Option<i64>,
    clock_sane: bool,
    payload: Option<Vec<u8>>,
    state: String,
    attempts: i64,
    last_error: Option<String>,
    enqueued_at: i64,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            filename: row.get(1)?,
            captured_at: row.get(2)?,
            mode: row.get(3)?,
            exposure_us: row.get(4)?,
            clock_sane: row.get(5)?,
            payload: row.get(6)?,
            state: row.get(7)?,
            attempts: row.get(8)?,
            last_error: row.get(9)?,
            enqueued_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry> {
        let captured_at = from_millis(self.captured_at, "captured_at")?;
        let enqueued_at = from_millis(self.enqueued_at, "enqueued_at")?;
        let mode: ExposureMode = self.mode.parse()?;
        let state: DeliveryState = self.state.parse()?;
        let exposure = self
            .exposure_us
            .and_then(|us| u64::try_from(us).ok())
            .map(Duration::from_micros);

        let photo = Photo::new(
            captured_at,
            mode,
            exposure,
            self.clock_sane,
            self.filename,
            self.payload.unwrap_or_default(),
        );
        Ok(QueueEntry::new(
            self.seq,
            photo,
            state,
            u32::try_from(self.attempts).unwrap_or(u32::MAX),
            self.last_error,
            enqueued_at,
        ))
    }
}

fn from_millis(millis: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::InvalidInput(format!("{column} out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    fn photo(n: u32) -> Photo {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, n).unwrap();
        Photo::new(
            at,
            ExposureMode::Manual,
            Some(Duration::from_millis(2500)),
            true,
            format!("pic_01_2026-03-14_18-00-{n:02}.jpg"),
            vec![0xFF, 0xD8, 0xFF, 0xE0, u8::try_from(n).unwrap()],
        )
    }

    #[test]
    fn test_enqueue_then_claim_in_order() {
        let queue = SpoolQueue::in_memory().unwrap();
        let first = queue.enqueue(photo(1)).unwrap();
        let second = queue.enqueue(photo(2)).unwrap();
        assert!(second.seq() > first.seq());

        let claimed = queue.next_pending().unwrap().unwrap();
        assert_eq!(claimed.seq(), first.seq());
        assert_eq!(claimed.state(), DeliveryState::Delivering);
        assert_eq!(claimed.photo(), first.photo());

        let claimed = queue.next_pending().unwrap().unwrap();
        assert_eq!(claimed.seq(), second.seq());
        assert!(queue.next_pending().unwrap().is_none());
    }

    #[test]
    fn test_photo_metadata_survives_storage() {
        let queue = SpoolQueue::in_memory().unwrap();
        let entry = queue.enqueue(photo(7)).unwrap();
        let stored = queue.get(entry.seq()).unwrap().unwrap();

        assert_eq!(stored.photo().mode(), ExposureMode::Manual);
        assert_eq!(stored.photo().exposure(), Some(Duration::from_millis(2500)));
        assert_eq!(stored.photo().captured_at(), entry.photo().captured_at());
        assert!(stored.photo().clock_sane());
        assert_eq!(stored.photo().data(), entry.photo().data());
    }

    fn row_count(queue: &SpoolQueue) -> i64 {
        let conn = acquire_lock(&queue.conn);
        conn.query_row("SELECT COUNT(*) FROM spool", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_delivered_entry_is_removed() {
        let queue = SpoolQueue::in_memory().unwrap();
        queue.enqueue(photo(1)).unwrap();
        let claimed = queue.next_pending().unwrap().unwrap();
        queue.mark_delivered(&claimed).unwrap();

        assert!(queue.get(claimed.seq()).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().delivered, 1);
        assert!(matches!(
            queue.mark_delivered(&claimed),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(queue.stats().unwrap().delivered, 1);
    }

    #[test]
    fn test_delivery_keeps_spool_bounded() {
        let queue = SpoolQueue::in_memory().unwrap();
        for round in 0..50 {
            queue.enqueue(photo(round % 60)).unwrap();
            let claimed = queue.next_pending().unwrap().unwrap();
            queue.mark_delivered(&claimed).unwrap();
            assert_eq!(row_count(&queue), 0);
        }

        let stats = queue.stats().unwrap();
        assert_eq!(stats.delivered, 50);
        assert_eq!(stats.backlog(), 0);
    }

    #[test]
    fn test_each_open_starts_a_new_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.db");

        let first = SpoolQueue::open(&path).unwrap().run_id();
        let second = SpoolQueue::open(&path).unwrap().run_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(SpoolQueue::attach(&path).unwrap().run_id(), 2);
        assert_eq!(SpoolQueue::in_memory().unwrap().run_id(), 1);
    }

    #[test]
    fn test_delivered_count_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.db");
        {
            let queue = SpoolQueue::open(&path).unwrap();
            queue.enqueue(photo(1)).unwrap();
            let claimed = queue.next_pending().unwrap().unwrap();
            queue.mark_delivered(&claimed).unwrap();
        }

        let queue = SpoolQueue::open(&path).unwrap();
        assert_eq!(queue.stats().unwrap().delivered, 1);
        assert_eq!(row_count(&queue), 0);
    }

    #[test]
    fn test_transient_failure_keeps_head_of_line() {
        let queue = SpoolQueue::in_memory().unwrap();
        let first = queue.enqueue(photo(1)).unwrap();
        queue.enqueue(photo(2)).unwrap();

        let claimed = queue.next_pending().unwrap().unwrap();
        queue.mark_failed(&claimed, false, "connection refused").unwrap();

        let again = queue.next_pending().unwrap().unwrap();
        assert_eq!(again.seq(), first.seq());
        assert_eq!(again.attempts(), 1);
        assert_eq!(again.last_error(), Some("connection refused"));
    }

    #[test]
    fn test_permanent_failure_retains_bytes_and_advances() {
        let queue = SpoolQueue::in_memory().unwrap();
        let first = queue.enqueue(photo(1)).unwrap();
        let second = queue.enqueue(photo(2)).unwrap();

        let claimed = queue.next_pending().unwrap().unwrap();
        queue.mark_failed(&claimed, true, "HTTP 400").unwrap();

        let stored = queue.get(first.seq()).unwrap().unwrap();
        assert_eq!(stored.state(), DeliveryState::FailedPermanent);
        assert_eq!(stored.photo().data(), first.photo().data());

        let next = queue.next_pending().unwrap().unwrap();
        assert_eq!(next.seq(), second.seq());
    }

    #[test]
    fn test_transitions_require_delivering() {
        let queue = SpoolQueue::in_memory().unwrap();
        let entry = queue.enqueue(photo(1)).unwrap();
        assert!(matches!(
            queue.mark_delivered(&entry),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            queue.mark_failed(&entry, true, "x"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_release_does_not_count_attempt() {
        let queue = SpoolQueue::in_memory().unwrap();
        queue.enqueue(photo(1)).unwrap();
        let claimed = queue.next_pending().unwrap().unwrap();
        queue.release(&claimed).unwrap();

        let again = queue.next_pending().unwrap().unwrap();
        assert_eq!(again.seq(), claimed.seq());
        assert_eq!(again.attempts(), 0);
    }

    #[test]
    fn test_requeue_failed() {
        let queue = SpoolQueue::in_memory().unwrap();
        queue.enqueue(photo(1)).unwrap();
        let claimed = queue.next_pending().unwrap().unwrap();
        queue.mark_failed(&claimed, true, "HTTP 403").unwrap();
        assert_eq!(queue.stats().unwrap().failed_permanent, 1);

        assert_eq!(queue.requeue_failed().unwrap(), 1);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed_permanent, 0);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_stats_counts_and_bytes() {
        let queue = SpoolQueue::in_memory().unwrap();
        for n in 1..=3 {
            queue.enqueue(photo(n)).unwrap();
        }
        queue.next_pending().unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.delivering, 1);
        assert_eq!(stats.pending_bytes, 10);
        assert_eq!(stats.backlog(), 3);
    }

    #[test]
    fn test_list_by_state() {
        let queue = SpoolQueue::in_memory().unwrap();
        for n in 1..=4 {
            queue.enqueue(photo(n)).unwrap();
        }
        let pending = queue.list(DeliveryState::Pending, 2).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].seq() < pending[1].seq());
    }

    #[test]
    fn test_reopen_reclassifies_delivering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("spool.db");

        let seq = {
            let queue = SpoolQueue::open(&path).unwrap();
            queue.enqueue(photo(1)).unwrap();
            let claimed = queue.next_pending().unwrap().unwrap();
            claimed.seq()
        };

        let queue = SpoolQueue::open(&path).unwrap();
        let stored = queue.get(seq).unwrap().unwrap();
        assert_eq!(stored.state(), DeliveryState::Pending);
        assert_eq!(queue.next_pending().unwrap().unwrap().seq(), seq);
    }

    #[test]
    fn test_attach_leaves_in_flight_entries_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.db");

        let owner = SpoolQueue::open(&path).unwrap();
        owner.enqueue(photo(1)).unwrap();
        let claimed = owner.next_pending().unwrap().unwrap();

        let observer = SpoolQueue::attach(&path).unwrap();
        assert_eq!(observer.stats().unwrap().delivering, 1);

        owner.mark_delivered(&claimed).unwrap();
        assert_eq!(observer.stats().unwrap().delivered, 1);
    }

    #[test]
    fn test_attach_requires_existing_spool() {
        let dir = TempDir::new().unwrap();
        assert!(SpoolQueue::attach(dir.path().join("missing.db")).is_err());
    }

    #[test]
    fn test_full_disk_is_storage_exhausted() {
        let queue = SpoolQueue::in_memory().unwrap();
        {
            let conn = acquire_lock(&queue.conn);
            let pages: i64 = conn
                .pragma_query_value(None, "page_count", |row| row.get(0))
                .unwrap();
            conn.pragma_update(None, "max_page_count", pages).unwrap();
        }

        let big = Photo::new(
            Utc::now(),
            ExposureMode::Auto,
            None,
            true,
            "pic_01_2026-03-14_18-00-00.jpg",
            vec![0u8; 256 * 1024],
        );
        assert!(matches!(
            queue.enqueue(big),
            Err(Error::StorageExhausted(_))
        ));
    }

    #[test]
    fn test_wait_for_arrival_wakes_on_enqueue() {
        let queue = Arc::new(SpoolQueue::in_memory().unwrap());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.enqueue(photo(1)).unwrap();
        });

        let start = Instant::now();
        assert!(queue.wait_for_arrival(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_arrival_times_out_when_empty() {
        let queue = SpoolQueue::in_memory().unwrap();
        assert!(!queue.wait_for_arrival(Duration::from_millis(20)));
    }
}
