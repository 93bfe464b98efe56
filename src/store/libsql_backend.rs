//! libSQL backend: async `Database` trait implementation.
//!
//! A single connection is shared by all callers. Multi-statement units run
//! inside a transaction while holding the write side of `gate`; plain reads
//! hold the read side, so no reader can observe a unit half-applied on the
//! shared connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{
    Cleaner, DispatchAttempt, Job, JobStatus, Landlord, OfferStatus, Property, PropertyCleaner,
    Review,
};
use crate::store::migrations;
use crate::store::traits::{AcceptResult, AssignResult, CancelResult, Database, DeleteResult};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self, context: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("{context} begin: {e}")))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Transaction,
    context: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Transaction(format!("{context} commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                warn!(context, error = %rb, "Rollback failed");
            }
            Err(err)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding. Fixed width so text comparison in SQL
/// orders the same as time.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

/// Read a column, naming the field in the error.
macro_rules! col {
    ($row:expr, $idx:expr, $field:expr) => {
        $row.get($idx)
            .map_err(|e| DatabaseError::Query(format!("{}: {e}", $field)))
    };
}

const LANDLORD_COLUMNS: &str = "id, name, chat_id, created_at";

const PROPERTY_COLUMNS: &str = "id, landlord_id, name, address, created_at";

const CLEANER_COLUMNS: &str = "id, landlord_id, name, chat_id, active, notes, created_at";

const JOB_COLUMNS: &str = "id, property_id, landlord_id, window_start, window_end, status, assigned_cleaner_id, reminder_sent_at, booking_ref, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, job_id, cleaner_id, offer_token, status, sent_at, responded_at";

const REVIEW_COLUMNS: &str = "id, job_id, cleaner_id, rating, tags, comment, created_at";

fn row_to_landlord(row: &libsql::Row) -> Result<Landlord, DatabaseError> {
    let id: String = col!(row, 0, "landlord.id")?;
    let created: String = col!(row, 3, "landlord.created_at")?;
    Ok(Landlord {
        id: parse_uuid(&id, "landlord.id")?,
        name: col!(row, 1, "landlord.name")?,
        chat_id: col!(row, 2, "landlord.chat_id")?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_property(row: &libsql::Row) -> Result<Property, DatabaseError> {
    let id: String = col!(row, 0, "property.id")?;
    let landlord_id: String = col!(row, 1, "property.landlord_id")?;
    let created: String = col!(row, 4, "property.created_at")?;
    Ok(Property {
        id: parse_uuid(&id, "property.id")?,
        landlord_id: parse_uuid(&landlord_id, "property.landlord_id")?,
        name: col!(row, 2, "property.name")?,
        address: col!(row, 3, "property.address")?,
        created_at: parse_datetime(&created),
    })
}

/// Map a cleaner starting at column `base` (joins put it after other columns).
fn row_to_cleaner_at(row: &libsql::Row, base: i32) -> Result<Cleaner, DatabaseError> {
    let id: String = col!(row, base, "cleaner.id")?;
    let landlord_id: String = col!(row, base + 1, "cleaner.landlord_id")?;
    let active: i64 = col!(row, base + 4, "cleaner.active")?;
    let created: String = col!(row, base + 6, "cleaner.created_at")?;
    Ok(Cleaner {
        id: parse_uuid(&id, "cleaner.id")?,
        landlord_id: parse_uuid(&landlord_id, "cleaner.landlord_id")?,
        name: col!(row, base + 2, "cleaner.name")?,
        chat_id: col!(row, base + 3, "cleaner.chat_id")?,
        active: active != 0,
        notes: col!(row, base + 5, "cleaner.notes")?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = col!(row, 0, "job.id")?;
    let property_id: String = col!(row, 1, "job.property_id")?;
    let landlord_id: String = col!(row, 2, "job.landlord_id")?;
    let window_start: String = col!(row, 3, "job.window_start")?;
    let window_end: String = col!(row, 4, "job.window_end")?;
    let status: String = col!(row, 5, "job.status")?;
    let assigned: Option<String> = col!(row, 6, "job.assigned_cleaner_id")?;
    let reminder: Option<String> = col!(row, 7, "job.reminder_sent_at")?;
    let created: String = col!(row, 9, "job.created_at")?;
    let updated: String = col!(row, 10, "job.updated_at")?;

    Ok(Job {
        id: parse_uuid(&id, "job.id")?,
        property_id: parse_uuid(&property_id, "job.property_id")?,
        landlord_id: parse_uuid(&landlord_id, "job.landlord_id")?,
        window_start: parse_datetime(&window_start),
        window_end: parse_datetime(&window_end),
        status: status.parse().map_err(DatabaseError::Query)?,
        assigned_cleaner_id: assigned
            .as_deref()
            .map(|s| parse_uuid(s, "job.assigned_cleaner_id"))
            .transpose()?,
        reminder_sent_at: parse_optional_datetime(&reminder),
        booking_ref: col!(row, 8, "job.booking_ref")?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<DispatchAttempt, DatabaseError> {
    let id: String = col!(row, 0, "attempt.id")?;
    let job_id: String = col!(row, 1, "attempt.job_id")?;
    let cleaner_id: String = col!(row, 2, "attempt.cleaner_id")?;
    let status: String = col!(row, 4, "attempt.status")?;
    let sent: String = col!(row, 5, "attempt.sent_at")?;
    let responded: Option<String> = col!(row, 6, "attempt.responded_at")?;
    Ok(DispatchAttempt {
        id: parse_uuid(&id, "attempt.id")?,
        job_id: parse_uuid(&job_id, "attempt.job_id")?,
        cleaner_id: parse_uuid(&cleaner_id, "attempt.cleaner_id")?,
        offer_token: col!(row, 3, "attempt.offer_token")?,
        status: status.parse().map_err(DatabaseError::Query)?,
        sent_at: parse_datetime(&sent),
        responded_at: parse_optional_datetime(&responded),
    })
}

fn row_to_review(row: &libsql::Row) -> Result<Review, DatabaseError> {
    let id: String = col!(row, 0, "review.id")?;
    let job_id: String = col!(row, 1, "review.job_id")?;
    let cleaner_id: String = col!(row, 2, "review.cleaner_id")?;
    let rating: i64 = col!(row, 3, "review.rating")?;
    let tags: Option<String> = col!(row, 4, "review.tags")?;
    let created: String = col!(row, 6, "review.created_at")?;
    Ok(Review {
        id: parse_uuid(&id, "review.id")?,
        job_id: parse_uuid(&job_id, "review.job_id")?,
        cleaner_id: parse_uuid(&cleaner_id, "review.cleaner_id")?,
        rating: rating as u8,
        tags: tags
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default(),
        comment: col!(row, 5, "review.comment")?,
        created_at: parse_datetime(&created),
    })
}

// ── Statement helpers usable inside or outside a transaction ────────

async fn fetch_job(conn: &Connection, id: Uuid) -> Result<Option<Job>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_job row: {e}"))),
    }
}

async fn fetch_attempt(
    conn: &Connection,
    filter: &str,
    value: String,
) -> Result<Option<DispatchAttempt>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM dispatch_attempts WHERE {filter} = ?1"),
            params![value],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_attempt: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_attempt row: {e}"))),
    }
}

/// Attempts of `job_id` still in `sent`, optionally excluding one attempt.
async fn live_attempts(
    conn: &Connection,
    job_id: Uuid,
    except: Option<Uuid>,
) -> Result<Vec<DispatchAttempt>, DatabaseError> {
    let except = except.map(|id| id.to_string()).unwrap_or_default();
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM dispatch_attempts WHERE job_id = ?1 AND id != ?2 AND status = 'sent' ORDER BY sent_at ASC"
            ),
            params![job_id.to_string(), except],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("live_attempts: {e}")))?;

    let mut attempts = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("live_attempts row: {e}")))?
    {
        attempts.push(row_to_attempt(&row)?);
    }
    Ok(attempts)
}

/// Cancel every live attempt of `job_id` other than `except`.
async fn withdraw_live_attempts(
    conn: &Connection,
    job_id: Uuid,
    except: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<Vec<DispatchAttempt>, DatabaseError> {
    let mut withdrawn = live_attempts(conn, job_id, except).await?;
    if withdrawn.is_empty() {
        return Ok(withdrawn);
    }
    let except = except.map(|id| id.to_string()).unwrap_or_default();
    conn.execute(
        "UPDATE dispatch_attempts SET status = 'cancelled', responded_at = ?1 WHERE job_id = ?2 AND id != ?3 AND status = 'sent'",
        params![fmt_ts(&at), job_id.to_string(), except],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("withdraw_live_attempts: {e}")))?;

    for attempt in &mut withdrawn {
        attempt.status = OfferStatus::Cancelled;
        attempt.responded_at = Some(at);
    }
    Ok(withdrawn)
}

async fn accept_offer_in(
    conn: &Connection,
    attempt_id: Uuid,
    at: DateTime<Utc>,
) -> Result<AcceptResult, DatabaseError> {
    let Some(mut attempt) = fetch_attempt(conn, "id", attempt_id.to_string()).await? else {
        return Ok(AcceptResult::AttemptMissing);
    };
    if attempt.status != OfferStatus::Sent {
        return Ok(AcceptResult::AttemptClosed {
            status: attempt.status,
        });
    }

    let mut job = fetch_job(conn, attempt.job_id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "job".into(),
            id: attempt.job_id.to_string(),
        })?;

    if !job.status.is_dispatchable() || job.assigned_cleaner_id.is_some() {
        conn.execute(
            "UPDATE dispatch_attempts SET status = 'cancelled', responded_at = ?1 WHERE id = ?2 AND status = 'sent'",
            params![fmt_ts(&at), attempt_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("accept_offer lose: {e}")))?;
        return Ok(AcceptResult::JobUnavailable { job });
    }

    let changed = conn
        .execute(
            "UPDATE jobs SET status = 'accepted', assigned_cleaner_id = ?1, updated_at = ?2 WHERE id = ?3 AND assigned_cleaner_id IS NULL AND status IN ('new', 'offered')",
            params![attempt.cleaner_id.to_string(), fmt_ts(&at), job.id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("accept_offer job: {e}")))?;
    if changed != 1 {
        return Err(DatabaseError::Transaction(format!(
            "accept_offer: job {} changed inside the unit",
            job.id
        )));
    }

    let changed = conn
        .execute(
            "UPDATE dispatch_attempts SET status = 'accepted', responded_at = ?1 WHERE id = ?2 AND status = 'sent'",
            params![fmt_ts(&at), attempt_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("accept_offer attempt: {e}")))?;
    if changed != 1 {
        return Err(DatabaseError::Transaction(format!(
            "accept_offer: attempt {attempt_id} changed inside the unit"
        )));
    }

    let cancelled = withdraw_live_attempts(conn, job.id, Some(attempt_id), at).await?;

    job.status = JobStatus::Accepted;
    job.assigned_cleaner_id = Some(attempt.cleaner_id);
    job.updated_at = at;
    attempt.status = OfferStatus::Accepted;
    attempt.responded_at = Some(at);

    Ok(AcceptResult::Accepted {
        job,
        attempt,
        cancelled,
    })
}

async fn assign_directly_in(
    conn: &Connection,
    job_id: Uuid,
    cleaner_id: Uuid,
    token: &str,
    at: DateTime<Utc>,
) -> Result<AssignResult, DatabaseError> {
    let Some(mut job) = fetch_job(conn, job_id).await? else {
        return Ok(AssignResult::JobMissing);
    };
    if !job.status.is_dispatchable() || job.assigned_cleaner_id.is_some() {
        return Ok(AssignResult::JobUnavailable { job });
    }

    let mut rows = conn
        .query(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM dispatch_attempts WHERE job_id = ?1 AND cleaner_id = ?2"
            ),
            params![job_id.to_string(), cleaner_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("assign_directly lookup: {e}")))?;
    let existing = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("assign_directly lookup row: {e}")))?
    {
        Some(row) => Some(row_to_attempt(&row)?),
        None => None,
    };

    conn.execute(
        "UPDATE jobs SET status = 'accepted', assigned_cleaner_id = ?1, updated_at = ?2 WHERE id = ?3 AND assigned_cleaner_id IS NULL AND status IN ('new', 'offered')",
        params![cleaner_id.to_string(), fmt_ts(&at), job_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_write("assign_directly job", e))?;

    let attempt = match existing {
        Some(mut live) if live.status == OfferStatus::Sent => {
            conn.execute(
                "UPDATE dispatch_attempts SET status = 'accepted', responded_at = ?1 WHERE id = ?2",
                params![fmt_ts(&at), live.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_directly promote: {e}")))?;
            live.status = OfferStatus::Accepted;
            live.responded_at = Some(at);
            Some(live)
        }
        // The pair was already tried; keep its history untouched.
        Some(_) => None,
        None => {
            let created = DispatchAttempt {
                id: Uuid::new_v4(),
                job_id,
                cleaner_id,
                offer_token: token.to_string(),
                status: OfferStatus::Accepted,
                sent_at: at,
                responded_at: Some(at),
            };
            insert_attempt_in(conn, &created).await?;
            Some(created)
        }
    };

    let keep = attempt.as_ref().map(|a| a.id);
    let cancelled = withdraw_live_attempts(conn, job_id, keep, at).await?;

    job.status = JobStatus::Accepted;
    job.assigned_cleaner_id = Some(cleaner_id);
    job.updated_at = at;

    Ok(AssignResult::Assigned {
        job,
        attempt,
        cancelled,
    })
}

async fn cancel_job_in(
    conn: &Connection,
    job_id: Uuid,
    at: DateTime<Utc>,
) -> Result<CancelResult, DatabaseError> {
    let Some(job) = fetch_job(conn, job_id).await? else {
        return Ok(CancelResult::JobMissing);
    };
    if !job.status.can_transition_to(JobStatus::Cancelled) {
        return Ok(CancelResult::NotCancellable { status: job.status });
    }

    conn.execute(
        "UPDATE jobs SET status = 'cancelled', assigned_cleaner_id = NULL, updated_at = ?1 WHERE id = ?2",
        params![fmt_ts(&at), job_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("cancel_job: {e}")))?;

    let withdrawn = withdraw_live_attempts(conn, job_id, None, at).await?;

    Ok(CancelResult::Cancelled {
        previous: job,
        withdrawn,
    })
}

async fn delete_job_in(conn: &Connection, job_id: Uuid) -> Result<DeleteResult, DatabaseError> {
    let Some(job) = fetch_job(conn, job_id).await? else {
        return Ok(DeleteResult::JobMissing);
    };
    let withdrawn = live_attempts(conn, job_id, None).await?;

    let id = job_id.to_string();
    for (table, sql) in [
        ("reviews", "DELETE FROM reviews WHERE job_id = ?1"),
        ("dispatch_attempts", "DELETE FROM dispatch_attempts WHERE job_id = ?1"),
        ("jobs", "DELETE FROM jobs WHERE id = ?1"),
    ] {
        conn.execute(sql, params![id.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job {table}: {e}")))?;
    }

    Ok(DeleteResult::Deleted { job, withdrawn })
}

async fn complete_with_review_in(conn: &Connection, review: &Review) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE jobs SET status = 'completed', updated_at = ?1
             WHERE id = ?2 AND status = 'done_awaiting_review' AND assigned_cleaner_id = ?3
               AND NOT EXISTS (SELECT 1 FROM reviews WHERE job_id = ?2)",
            params![
                fmt_ts(&review.created_at),
                review.job_id.to_string(),
                review.cleaner_id.to_string()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("complete_with_review job: {e}")))?;
    if changed == 0 {
        return Ok(false);
    }

    let tags = if review.tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&review.tags).unwrap_or_default())
    };
    conn.execute(
        "INSERT INTO reviews (id, job_id, cleaner_id, rating, tags, comment, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            review.id.to_string(),
            review.job_id.to_string(),
            review.cleaner_id.to_string(),
            review.rating as i64,
            tags,
            review.comment.clone(),
            fmt_ts(&review.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("complete_with_review insert", e))?;
    Ok(true)
}

async fn insert_attempt_in(conn: &Connection, attempt: &DispatchAttempt) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO dispatch_attempts (id, job_id, cleaner_id, offer_token, status, sent_at, responded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            attempt.id.to_string(),
            attempt.job_id.to_string(),
            attempt.cleaner_id.to_string(),
            attempt.offer_token.as_str(),
            attempt.status.as_str(),
            fmt_ts(&attempt.sent_at),
            attempt.responded_at.map(|t| fmt_ts(&t)),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("insert_attempt", e))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Landlords & properties ──────────────────────────────────────

    async fn insert_landlord(&self, landlord: &Landlord) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        self.conn()
            .execute(
                "INSERT INTO landlords (id, name, chat_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    landlord.id.to_string(),
                    landlord.name.as_str(),
                    landlord.chat_id.clone(),
                    fmt_ts(&landlord.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_landlord", e))?;
        debug!(landlord_id = %landlord.id, "Landlord inserted");
        Ok(())
    }

    async fn get_landlord(&self, id: Uuid) -> Result<Option<Landlord>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LANDLORD_COLUMNS} FROM landlords WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_landlord: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_landlord(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_landlord row: {e}"))),
        }
    }

    async fn set_landlord_chat_id(&self, id: Uuid, chat_id: &str) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE landlords SET chat_id = ?1 WHERE id = ?2",
                params![chat_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_landlord_chat_id: {e}")))?;
        Ok(changed > 0)
    }

    async fn insert_property(&self, property: &Property) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        self.conn()
            .execute(
                "INSERT INTO properties (id, landlord_id, name, address, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    property.id.to_string(),
                    property.landlord_id.to_string(),
                    property.name.as_str(),
                    property.address.clone(),
                    fmt_ts(&property.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_property", e))?;
        Ok(())
    }

    async fn get_property(&self, id: Uuid) -> Result<Option<Property>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_property: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_property(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_property row: {e}"))),
        }
    }

    // ── Cleaners ────────────────────────────────────────────────────

    async fn insert_cleaner(&self, cleaner: &Cleaner) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        self.conn()
            .execute(
                "INSERT INTO cleaners (id, landlord_id, name, chat_id, active, notes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cleaner.id.to_string(),
                    cleaner.landlord_id.to_string(),
                    cleaner.name.as_str(),
                    cleaner.chat_id.clone(),
                    cleaner.active as i64,
                    cleaner.notes.clone(),
                    fmt_ts(&cleaner.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_cleaner", e))?;
        debug!(cleaner_id = %cleaner.id, "Cleaner inserted");
        Ok(())
    }

    async fn get_cleaner(&self, id: Uuid) -> Result<Option<Cleaner>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLEANER_COLUMNS} FROM cleaners WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cleaner: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cleaner_at(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cleaner row: {e}"))),
        }
    }

    async fn set_cleaner_chat_id(&self, id: Uuid, chat_id: &str) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE cleaners SET chat_id = ?1 WHERE id = ?2",
                params![chat_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_cleaner_chat_id: {e}")))?;
        Ok(changed > 0)
    }

    async fn update_cleaner(&self, cleaner: &Cleaner) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE cleaners SET name = ?1, chat_id = ?2, notes = ?3, active = ?4 WHERE id = ?5",
                params![
                    cleaner.name.as_str(),
                    cleaner.chat_id.clone(),
                    cleaner.notes.clone(),
                    cleaner.active as i64,
                    cleaner.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("update_cleaner", e))?;
        debug!(cleaner_id = %cleaner.id, changed, "Cleaner updated");
        Ok(changed > 0)
    }

    async fn list_linked_cleaners(&self, landlord_id: Uuid) -> Result<Vec<Cleaner>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLEANER_COLUMNS} FROM cleaners
                     WHERE landlord_id = ?1 AND active = 1 AND chat_id IS NOT NULL AND TRIM(chat_id) != ''
                     ORDER BY name ASC, id ASC"
                ),
                params![landlord_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_linked_cleaners: {e}")))?;

        let mut cleaners = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_cleaner_at(&row, 0) {
                Ok(cleaner) => cleaners.push(cleaner),
                Err(e) => warn!("Skipping cleaner row: {e}"),
            }
        }
        Ok(cleaners)
    }

    async fn link_property_cleaner(&self, link: &PropertyCleaner) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        self.conn()
            .execute(
                "INSERT INTO property_cleaners (property_id, cleaner_id, priority, is_primary) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (property_id, cleaner_id) DO UPDATE SET priority = excluded.priority, is_primary = excluded.is_primary",
                params![
                    link.property_id.to_string(),
                    link.cleaner_id.to_string(),
                    link.priority,
                    link.is_primary as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("link_property_cleaner", e))?;
        Ok(())
    }

    async fn list_property_cleaners(
        &self,
        property_id: Uuid,
    ) -> Result<Vec<(PropertyCleaner, Cleaner)>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT pc.property_id, pc.cleaner_id, pc.priority, pc.is_primary,
                        c.id, c.landlord_id, c.name, c.chat_id, c.active, c.notes, c.created_at
                 FROM property_cleaners pc JOIN cleaners c ON c.id = pc.cleaner_id
                 WHERE pc.property_id = ?1
                 ORDER BY pc.is_primary DESC, pc.priority ASC, c.name ASC",
                params![property_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_property_cleaners: {e}")))?;

        let mut ranked = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_property_cleaners row: {e}")))?
        {
            let pid: String = col!(&row, 0, "link.property_id")?;
            let cid: String = col!(&row, 1, "link.cleaner_id")?;
            let is_primary: i64 = col!(&row, 3, "link.is_primary")?;
            let link = PropertyCleaner {
                property_id: parse_uuid(&pid, "link.property_id")?,
                cleaner_id: parse_uuid(&cid, "link.cleaner_id")?,
                priority: col!(&row, 2, "link.priority")?,
                is_primary: is_primary != 0,
            };
            ranked.push((link, row_to_cleaner_at(&row, 4)?));
        }
        Ok(ranked)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        self.conn()
            .execute(
                "INSERT INTO jobs (id, property_id, landlord_id, window_start, window_end, status, assigned_cleaner_id, reminder_sent_at, booking_ref, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.property_id.to_string(),
                    job.landlord_id.to_string(),
                    fmt_ts(&job.window_start),
                    fmt_ts(&job.window_end),
                    job.status.as_str(),
                    job.assigned_cleaner_id.map(|id| id.to_string()),
                    job.reminder_sent_at.map(|t| fmt_ts(&t)),
                    job.booking_ref.clone(),
                    fmt_ts(&job.created_at),
                    fmt_ts(&job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_job", e))?;
        debug!(job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let _read = self.gate.read().await;
        fetch_job(self.conn(), id).await
    }

    async fn list_jobs_by_landlord(&self, landlord_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE landlord_id = ?1 ORDER BY window_start ASC"
                ),
                params![landlord_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs_by_landlord: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        booking_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET window_start = ?1, window_end = ?2, booking_ref = ?3, updated_at = ?4
                 WHERE id = ?5 AND status IN ('new', 'offered') AND assigned_cleaner_id IS NULL",
                params![
                    fmt_ts(&window_start),
                    fmt_ts(&window_end),
                    booking_ref.map(str::to_string),
                    fmt_ts(&at),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("reschedule_job", e))?;
        debug!(job_id = %id, changed, "Job reschedule");
        Ok(changed > 0)
    }

    async fn delete_job(&self, id: Uuid) -> Result<DeleteResult, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("delete_job").await?;
        let result = delete_job_in(&tx, id).await;
        finish(tx, "delete_job", result).await
    }

    async fn mark_job_offered(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'offered', updated_at = ?1 WHERE id = ?2 AND status IN ('new', 'offered')",
                params![fmt_ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_job_offered: {e}")))?;
        Ok(changed > 0)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), fmt_ts(&Utc::now()), id.to_string(), from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("transition_job", e))?;
        debug!(job_id = %id, %from, %to, changed, "Job transition");
        Ok(changed > 0)
    }

    async fn list_jobs_needing_reminder(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('accepted', 'in_progress') AND reminder_sent_at IS NULL
                       AND assigned_cleaner_id IS NOT NULL
                       AND window_start > ?1 AND window_start <= ?2
                     ORDER BY window_start ASC"
                ),
                params![fmt_ts(&after), fmt_ts(&until)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs_needing_reminder: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn mark_reminder_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET reminder_sent_at = ?1, updated_at = ?1 WHERE id = ?2 AND reminder_sent_at IS NULL",
                params![fmt_ts(&at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_reminder_sent: {e}")))?;
        Ok(changed > 0)
    }

    // ── Dispatch attempts ───────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &DispatchAttempt) -> Result<(), DatabaseError> {
        let _write = self.gate.write().await;
        insert_attempt_in(self.conn(), attempt).await?;
        debug!(attempt_id = %attempt.id, job_id = %attempt.job_id, cleaner_id = %attempt.cleaner_id, "Attempt inserted");
        Ok(())
    }

    async fn insert_offer_attempt(&self, attempt: &DispatchAttempt) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO dispatch_attempts (id, job_id, cleaner_id, offer_token, status, sent_at, responded_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                 WHERE EXISTS (
                     SELECT 1 FROM jobs
                     WHERE id = ?2 AND status IN ('new', 'offered') AND assigned_cleaner_id IS NULL
                 )",
                params![
                    attempt.id.to_string(),
                    attempt.job_id.to_string(),
                    attempt.cleaner_id.to_string(),
                    attempt.offer_token.as_str(),
                    attempt.status.as_str(),
                    fmt_ts(&attempt.sent_at),
                    attempt.responded_at.map(|t| fmt_ts(&t)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_offer_attempt", e))?;
        debug!(attempt_id = %attempt.id, job_id = %attempt.job_id, changed, "Offer attempt insert");
        Ok(changed > 0)
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<DispatchAttempt>, DatabaseError> {
        let _read = self.gate.read().await;
        fetch_attempt(self.conn(), "id", id.to_string()).await
    }

    async fn get_attempt_by_token(
        &self,
        token: &str,
    ) -> Result<Option<DispatchAttempt>, DatabaseError> {
        let _read = self.gate.read().await;
        fetch_attempt(self.conn(), "offer_token", token.to_string()).await
    }

    async fn list_attempts_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<DispatchAttempt>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM dispatch_attempts WHERE job_id = ?1 ORDER BY sent_at ASC"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_job: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_job row: {e}")))?
        {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn close_attempt(
        &self,
        id: Uuid,
        status: OfferStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        if status == OfferStatus::Sent {
            return Err(DatabaseError::Constraint(
                "close_attempt: target status must be terminal".into(),
            ));
        }
        let _write = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE dispatch_attempts SET status = ?1, responded_at = ?2 WHERE id = ?3 AND status = 'sent'",
                params![status.as_str(), fmt_ts(&at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("close_attempt: {e}")))?;
        debug!(attempt_id = %id, %status, changed, "Attempt close");
        Ok(changed > 0)
    }

    // ── Atomic units ────────────────────────────────────────────────

    async fn accept_offer(
        &self,
        attempt_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AcceptResult, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("accept_offer").await?;
        let result = accept_offer_in(&tx, attempt_id, at).await;
        finish(tx, "accept_offer", result).await
    }

    async fn timeout_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchAttempt>, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("timeout_stale_attempts").await?;
        let result = async {
            let mut rows = tx
                .query(
                    &format!(
                        "SELECT {ATTEMPT_COLUMNS} FROM dispatch_attempts WHERE status = 'sent' AND sent_at < ?1 ORDER BY sent_at ASC"
                    ),
                    params![fmt_ts(&cutoff)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("timeout_stale_attempts: {e}")))?;
            let mut swept = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("timeout_stale_attempts row: {e}")))?
            {
                let mut attempt = row_to_attempt(&row)?;
                attempt.status = OfferStatus::Timeout;
                swept.push(attempt);
            }
            if !swept.is_empty() {
                tx.execute(
                    "UPDATE dispatch_attempts SET status = 'timeout' WHERE status = 'sent' AND sent_at < ?1",
                    params![fmt_ts(&cutoff)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("timeout_stale_attempts update: {e}")))?;
            }
            Ok(swept)
        }
        .await;
        let swept = finish(tx, "timeout_stale_attempts", result).await?;
        if !swept.is_empty() {
            info!(count = swept.len(), "Timed out stale offers");
        }
        Ok(swept)
    }

    async fn assign_directly(
        &self,
        job_id: Uuid,
        cleaner_id: Uuid,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<AssignResult, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("assign_directly").await?;
        let result = assign_directly_in(&tx, job_id, cleaner_id, token, at).await;
        finish(tx, "assign_directly", result).await
    }

    async fn cancel_job(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CancelResult, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("cancel_job").await?;
        let result = cancel_job_in(&tx, job_id, at).await;
        finish(tx, "cancel_job", result).await
    }

    async fn complete_with_review(&self, review: &Review) -> Result<bool, DatabaseError> {
        let _write = self.gate.write().await;
        let tx = self.begin("complete_with_review").await?;
        let result = complete_with_review_in(&tx, review).await;
        finish(tx, "complete_with_review", result).await
    }

    async fn get_review_for_job(&self, job_id: Uuid) -> Result<Option<Review>, DatabaseError> {
        let _read = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE job_id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_review_for_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_review(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_review_for_job row: {e}"))),
        }
    }
}
