// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job Store: the single source of truth for job state, backed by SQLite.
//
// The store holds job metadata only; document bytes live in the spool and
// published artifacts are referenced by path.  Every state change goes
// through a compare-and-set `UPDATE ... WHERE status = <expected>`, so a
// transition observed by one caller can never be repeated by another, and
// terminal jobs are never rewritten.
//
// `seq` (AUTOINCREMENT) is the FIFO order and doubles as the IPP job-id.
//
// The methods are synchronous and short; the connection sits behind a mutex
// so the store can be shared across tasks as `Arc<JobStore>`.

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument, warn};

use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{AccountId, DocumentFormat, JobId, JobOrigin, JobStatus, PrintJob};

/// SQLite schema for the jobs table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        owner TEXT,
        origin TEXT NOT NULL,
        source_addr TEXT NOT NULL,
        document_name TEXT NOT NULL,
        format TEXT NOT NULL,
        status TEXT NOT NULL,
        spool_path TEXT NOT NULL,
        spool_size INTEGER NOT NULL DEFAULT 0,
        document_hash TEXT NOT NULL,
        document_ref TEXT,
        thumbnail_ref TEXT,
        error_message TEXT,
        error_history TEXT NOT NULL DEFAULT '[]',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        not_before_ms INTEGER,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS jobs_status_seq ON jobs (status, seq);
    CREATE INDEX IF NOT EXISTS jobs_owner_seq ON jobs (owner, seq);
"#;

const JOB_COLUMNS: &str = "seq, id, owner, origin, source_addr, document_name, format, status,
    spool_path, spool_size, document_hash, document_ref, thumbnail_ref, error_message,
    error_history, attempts, max_attempts, not_before_ms, cancel_requested, created_at,
    updated_at, completed_at";

/// Result of an attempt to claim a specific job.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller now owns the job; it is in `processing`.
    Claimed(PrintJob),
    /// Someone else got there first, or the job is no longer pending.
    AlreadyClaimed(JobStatus),
    NotFound,
}

/// Result of an owner's cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job is being converted; the worker will stop at its next check.
    CancelRequested,
    /// Nothing to do: the job already finished.
    AlreadyTerminal(JobStatus),
}

/// `which-jobs` style filter for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    /// Pending and processing.
    NotCompleted,
    /// Completed, failed, and cancelled.
    Completed,
    All,
}

impl JobFilter {
    fn sql(&self) -> &'static str {
        match self {
            Self::NotCompleted => "status IN ('pending', 'processing')",
            Self::Completed => "status IN ('completed', 'failed', 'cancelled')",
            Self::All => "1 = 1",
        }
    }
}

/// Persistent job store.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (or create) the job database at `path`, in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PrintgateError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PrintgateError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| PrintgateError::Database(format!("create table: {e}")))?;

        info!("job store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PrintgateError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| PrintgateError::Database(format!("create table: {e}")))?;

        debug!("in-memory job store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PrintgateError::Database("job store lock poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Insert a new job and return it with its assigned `number`.
    ///
    /// A pending job is only accepted while fewer than `max_depth` jobs are
    /// pending; the count and the insert happen under one lock.  Jobs created
    /// directly in a terminal state (a truncated raw upload) bypass the bound.
    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    pub fn create_job(&self, job: &PrintJob, max_depth: usize) -> Result<PrintJob> {
        let conn = self.lock()?;

        if job.status == JobStatus::Pending {
            let depth = pending_count(&conn)?;
            if depth >= max_depth {
                warn!(depth, limit = max_depth, "queue full, job refused");
                return Err(PrintgateError::Capacity {
                    depth,
                    limit: max_depth,
                });
            }
        }

        let history = serde_json::to_string(&job.error_history)?;
        conn.execute(
            "INSERT INTO jobs (id, owner, origin, source_addr, document_name, format, status,
             spool_path, spool_size, document_hash, document_ref, thumbnail_ref, error_message,
             error_history, attempts, max_attempts, not_before_ms, cancel_requested, created_at,
             updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)",
            params![
                job.id.to_string(),
                job.owner.as_ref().map(|o| o.as_str()),
                job.origin.as_str(),
                job.source_addr.to_string(),
                job.document_name,
                job.format.mime_type(),
                job.status.as_str(),
                job.spool_path,
                job.spool_size as i64,
                job.document_hash,
                job.document_ref,
                job.thumbnail_ref,
                job.error_message,
                history,
                job.attempts,
                job.max_attempts,
                job.not_before.map(|t| t.timestamp_millis()),
                job.cancel_requested,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| PrintgateError::Database(format!("insert job: {e}")))?;

        let mut created = job.clone();
        created.number = conn.last_insert_rowid();
        info!(job_id = %job.id, number = created.number, owner = ?job.owner, "job created");
        Ok(created)
    }

    /// Number of jobs waiting for a worker.
    pub fn queue_depth(&self) -> Result<usize> {
        pending_count(&*self.lock()?)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Atomically move one specific pending job to `processing`.
    ///
    /// Exactly one of any number of concurrent callers gets `Claimed`.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn claim(&self, id: &JobId) -> Result<ClaimOutcome> {
        let conn = self.lock()?;
        claim_locked(&conn, id)
    }

    /// Claim the oldest pending job that is due, if any.
    pub fn claim_next(&self) -> Result<Option<PrintJob>> {
        let conn = self.lock()?;
        let now_ms = Utc::now().timestamp_millis();
        loop {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs
                     WHERE status = 'pending'
                       AND (not_before_ms IS NULL OR not_before_ms <= ?1)
                     ORDER BY seq ASC LIMIT 1",
                    params![now_ms],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PrintgateError::Database(format!("select next: {e}")))?;

            let Some(id) = id else {
                return Ok(None);
            };
            let id = parse_job_id(&id)?;
            match claim_locked(&conn, &id)? {
                ClaimOutcome::Claimed(job) => return Ok(Some(job)),
                // Lost a race with another process on the same database.
                ClaimOutcome::AlreadyClaimed(_) | ClaimOutcome::NotFound => continue,
            }
        }
    }

    /// Earliest `not_before` among pending jobs, so an idle worker knows
    /// when a backed-off job becomes due.
    pub fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn
            .query_row(
                "SELECT MIN(not_before_ms) FROM jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| PrintgateError::Database(format!("next due: {e}")))?;
        Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    // -----------------------------------------------------------------------
    // Worker transitions
    // -----------------------------------------------------------------------

    /// `processing -> completed`, recording the published artifacts.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn complete(&self, id: &JobId, document_ref: &str, thumbnail_ref: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'completed', document_ref = ?1, thumbnail_ref = ?2,
                 error_message = NULL, not_before_ms = NULL, updated_at = ?3, completed_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![document_ref, thumbnail_ref, now, id.to_string()],
            )
            .map_err(|e| PrintgateError::Database(format!("complete: {e}")))?;
        expect_transition(&conn, id, rows, JobStatus::Completed)?;
        info!(job_id = %id, "job completed");
        Ok(())
    }

    /// `processing -> pending` after a retryable failure.  The job is not
    /// claimable again before `not_before`.
    #[instrument(skip(self, error), fields(job_id = %id))]
    pub fn requeue(&self, id: &JobId, error: &str, not_before: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let history = appended_history(&conn, id, error)?;
        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'pending', error_message = ?1, error_history = ?2,
                 not_before_ms = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'processing'",
                params![
                    error,
                    history,
                    not_before.timestamp_millis(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .map_err(|e| PrintgateError::Database(format!("requeue: {e}")))?;
        expect_transition(&conn, id, rows, JobStatus::Pending)?;
        info!(job_id = %id, %not_before, "job requeued");
        Ok(())
    }

    /// `processing -> failed`, terminally.
    #[instrument(skip(self, error), fields(job_id = %id))]
    pub fn fail(&self, id: &JobId, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let history = appended_history(&conn, id, error)?;
        let now = Utc::now().to_rfc3339();
        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1, error_history = ?2,
                 not_before_ms = NULL, updated_at = ?3, completed_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![error, history, now, id.to_string()],
            )
            .map_err(|e| PrintgateError::Database(format!("fail: {e}")))?;
        expect_transition(&conn, id, rows, JobStatus::Failed)?;
        warn!(job_id = %id, error, "job failed");
        Ok(())
    }

    /// `processing -> cancelled`, once the worker has stopped.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn finish_cancelled(&self, id: &JobId) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', not_before_ms = NULL,
                 updated_at = ?1, completed_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![now, id.to_string()],
            )
            .map_err(|e| PrintgateError::Database(format!("finish cancel: {e}")))?;
        expect_transition(&conn, id, rows, JobStatus::Cancelled)?;
        info!(job_id = %id, "in-flight job cancelled");
        Ok(())
    }

    /// Whether the owner has asked for a running job to stop.
    pub fn cancel_requested(&self, id: &JobId) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT cancel_requested FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get::<_, bool>(0),
        )
        .optional()
        .map_err(|e| PrintgateError::Database(format!("cancel flag: {e}")))?
        .ok_or(PrintgateError::JobNotFound(*id))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Owner-initiated cancel: immediate for pending jobs, cooperative for
    /// processing ones.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn request_cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', not_before_ms = NULL,
                 updated_at = ?1, completed_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id.to_string()],
            )
            .map_err(|e| PrintgateError::Database(format!("cancel pending: {e}")))?;
        if rows == 1 {
            info!(job_id = %id, "pending job cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        let rows = conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![now, id.to_string()],
            )
            .map_err(|e| PrintgateError::Database(format!("cancel processing: {e}")))?;
        if rows == 1 {
            info!(job_id = %id, "cancel requested for in-flight job");
            return Ok(CancelOutcome::CancelRequested);
        }

        match status_of(&conn, id)? {
            Some(status) => Ok(CancelOutcome::AlreadyTerminal(status)),
            None => Err(PrintgateError::JobNotFound(*id)),
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Requeue jobs a previous run left in `processing`.
    ///
    /// The interrupted run already counted as an attempt; jobs with no
    /// attempts left fail, and jobs with a pending cancel are cancelled.
    /// Returns the number of jobs moved back to `pending`.
    #[instrument(skip(self))]
    pub fn recover_processing(&self) -> Result<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let interrupted = "interrupted by shutdown";

        let cancelled = conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', updated_at = ?1, completed_at = ?1
                 WHERE status = 'processing' AND cancel_requested = 1",
                params![now],
            )
            .map_err(|e| PrintgateError::Database(format!("recover cancel: {e}")))?;

        let exhausted = conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1,
                 updated_at = ?2, completed_at = ?2
                 WHERE status = 'processing' AND attempts >= max_attempts",
                params![interrupted, now],
            )
            .map_err(|e| PrintgateError::Database(format!("recover exhausted: {e}")))?;

        let requeued = conn
            .execute(
                "UPDATE jobs SET status = 'pending', not_before_ms = NULL, updated_at = ?1
                 WHERE status = 'processing'",
                params![now],
            )
            .map_err(|e| PrintgateError::Database(format!("recover requeue: {e}")))?;

        if requeued + exhausted + cancelled > 0 {
            info!(requeued, exhausted, cancelled, "recovered interrupted jobs");
        }
        Ok(requeued)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Retrieve a single job by its ID.
    pub fn get_job(&self, id: &JobId) -> Result<Option<PrintJob>> {
        let conn = self.lock()?;
        get_locked(&conn, id)
    }

    /// Retrieve a job by its IPP job-id.
    pub fn get_by_number(&self, number: i64) -> Result<Option<PrintJob>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE seq = ?1"),
            params![number],
            row_to_print_job,
        )
        .optional()
        .map_err(|e| PrintgateError::Database(format!("get by number: {e}")))
    }

    /// An owner's jobs, newest first.
    pub fn list_for_owner(
        &self,
        owner: &AccountId,
        filter: JobFilter,
        limit: Option<usize>,
    ) -> Result<Vec<PrintJob>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner = ?1 AND {} ORDER BY seq DESC LIMIT ?2",
            filter.sql()
        );
        query_jobs(&conn, &sql, params![owner.as_str(), sql_limit(limit)])
    }

    /// Unattributed jobs awaiting administrator review, newest first.
    pub fn list_orphaned(&self) -> Result<Vec<PrintJob>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE owner IS NULL ORDER BY seq DESC");
        query_jobs(&conn, &sql, params![])
    }

    /// Every job in one state, oldest first.
    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<PrintJob>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY seq ASC");
        query_jobs(&conn, &sql, params![status.as_str()])
    }
}

// ---------------------------------------------------------------------------
// Helpers (caller holds the lock)
// ---------------------------------------------------------------------------

fn pending_count(conn: &Connection) -> Result<usize> {
    conn.query_row("SELECT COUNT(*) FROM jobs WHERE status = 'pending'", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as usize)
    .map_err(|e| PrintgateError::Database(format!("count pending: {e}")))
}

fn claim_locked(conn: &Connection, id: &JobId) -> Result<ClaimOutcome> {
    let rows = conn
        .execute(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1,
             not_before_ms = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(|e| PrintgateError::Database(format!("claim: {e}")))?;

    if rows == 1 {
        let job = get_locked(conn, id)?.ok_or(PrintgateError::JobNotFound(*id))?;
        debug!(job_id = %id, attempt = job.attempts, "job claimed");
        return Ok(ClaimOutcome::Claimed(job));
    }
    Ok(match status_of(conn, id)? {
        Some(status) => ClaimOutcome::AlreadyClaimed(status),
        None => ClaimOutcome::NotFound,
    })
}

fn get_locked(conn: &Connection, id: &JobId) -> Result<Option<PrintJob>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id.to_string()],
        row_to_print_job,
    )
    .optional()
    .map_err(|e| PrintgateError::Database(format!("get job: {e}")))
}

fn status_of(conn: &Connection, id: &JobId) -> Result<Option<JobStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| PrintgateError::Database(format!("status: {e}")))?;
    status
        .map(|s| s.parse::<JobStatus>().map_err(PrintgateError::Database))
        .transpose()
}

/// Turn a zero-row CAS update into the right error.
fn expect_transition(conn: &Connection, id: &JobId, rows: usize, to: JobStatus) -> Result<()> {
    if rows == 1 {
        return Ok(());
    }
    match status_of(conn, id)? {
        Some(from) => Err(PrintgateError::InvalidTransition { id: *id, from, to }),
        None => Err(PrintgateError::JobNotFound(*id)),
    }
}

fn appended_history(conn: &Connection, id: &JobId, error: &str) -> Result<String> {
    let current: Option<String> = conn
        .query_row(
            "SELECT error_history FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| PrintgateError::Database(format!("error history: {e}")))?;
    let current = current.ok_or(PrintgateError::JobNotFound(*id))?;
    let mut history: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
    history.push(error.to_string());
    Ok(serde_json::to_string(&history)?)
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PrintJob>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| PrintgateError::Database(format!("prepare: {e}")))?;
    let jobs = stmt
        .query_map(params, row_to_print_job)
        .map_err(|e| PrintgateError::Database(format!("query: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PrintgateError::Database(format!("collect rows: {e}")))?;
    Ok(jobs)
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|n| n as i64).unwrap_or(-1)
}

fn parse_job_id(s: &str) -> Result<JobId> {
    uuid::Uuid::parse_str(s)
        .map(JobId)
        .map_err(|e| PrintgateError::Database(format!("bad job id {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_err<E>(col: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn text_err(col: usize, msg: String) -> rusqlite::Error {
    conversion_err(col, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn parse_time(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(col, e))
}

/// Map a SQLite row to a `PrintJob`.
///
/// Column indices must match `JOB_COLUMNS`.
fn row_to_print_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let number: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let owner: Option<String> = row.get(2)?;
    let origin_str: String = row.get(3)?;
    let addr_str: String = row.get(4)?;
    let document_name: String = row.get(5)?;
    let format_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let spool_path: String = row.get(8)?;
    let spool_size: i64 = row.get(9)?;
    let document_hash: String = row.get(10)?;
    let document_ref: Option<String> = row.get(11)?;
    let thumbnail_ref: Option<String> = row.get(12)?;
    let error_message: Option<String> = row.get(13)?;
    let history_json: String = row.get(14)?;
    let attempts: u32 = row.get(15)?;
    let max_attempts: u32 = row.get(16)?;
    let not_before_ms: Option<i64> = row.get(17)?;
    let cancel_requested: bool = row.get(18)?;
    let created_at_str: String = row.get(19)?;
    let updated_at_str: String = row.get(20)?;
    let completed_at_str: Option<String> = row.get(21)?;

    let uuid = uuid::Uuid::parse_str(&id_str).map_err(|e| conversion_err(1, e))?;
    let origin: JobOrigin = origin_str.parse().map_err(|e| text_err(3, e))?;
    let source_addr: IpAddr = addr_str.parse().map_err(|e| conversion_err(4, e))?;
    let format = DocumentFormat::from_mime(&format_str).unwrap_or(DocumentFormat::OctetStream);
    let status: JobStatus = status_str.parse().map_err(|e| text_err(7, e))?;
    let error_history: Vec<String> = serde_json::from_str(&history_json).unwrap_or_default();

    Ok(PrintJob {
        id: JobId(uuid),
        number,
        owner: owner.map(AccountId),
        origin,
        source_addr,
        document_name,
        format,
        status,
        spool_path,
        spool_size: spool_size.max(0) as u64,
        document_hash,
        document_ref,
        thumbnail_ref,
        error_message,
        error_history,
        attempts,
        max_attempts,
        not_before: not_before_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
        cancel_requested,
        created_at: parse_time(19, &created_at_str)?,
        updated_at: parse_time(20, &updated_at_str)?,
        completed_at: completed_at_str.as_deref().map(|s| parse_time(21, s)).transpose()?,
    })
}
