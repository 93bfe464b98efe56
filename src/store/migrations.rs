//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS landlords (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                chat_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                landlord_id TEXT NOT NULL REFERENCES landlords(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                address TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_properties_landlord ON properties(landlord_id);

            CREATE TABLE IF NOT EXISTS cleaners (
                id TEXT PRIMARY KEY,
                landlord_id TEXT NOT NULL REFERENCES landlords(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                chat_id TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                notes TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cleaners_landlord ON cleaners(landlord_id);
            CREATE INDEX IF NOT EXISTS idx_cleaners_chat ON cleaners(chat_id);

            CREATE TABLE IF NOT EXISTS property_cleaners (
                property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL REFERENCES cleaners(id) ON DELETE CASCADE,
                priority INTEGER NOT NULL DEFAULT 0,
                is_primary INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (property_id, cleaner_id)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
                landlord_id TEXT NOT NULL REFERENCES landlords(id) ON DELETE CASCADE,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                assigned_cleaner_id TEXT REFERENCES cleaners(id),
                reminder_sent_at TEXT,
                booking_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (
                    (assigned_cleaner_id IS NOT NULL)
                    = (status IN ('accepted', 'in_progress', 'done_awaiting_review', 'completed'))
                )
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_landlord ON jobs(landlord_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_window_start ON jobs(window_start);

            CREATE TABLE IF NOT EXISTS dispatch_attempts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL REFERENCES cleaners(id) ON DELETE CASCADE,
                offer_token TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'sent',
                sent_at TEXT NOT NULL,
                responded_at TEXT,
                UNIQUE (job_id, cleaner_id)
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_job ON dispatch_attempts(job_id);
            CREATE INDEX IF NOT EXISTS idx_attempts_status_sent ON dispatch_attempts(status, sent_at);
        "#,
    },
    Migration {
        version: 2,
        name: "reviews",
        sql: r#"
            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL REFERENCES cleaners(id) ON DELETE CASCADE,
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                tags TEXT,
                comment TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_cleaner ON reviews(cleaner_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "landlords",
            "properties",
            "cleaners",
            "property_cleaners",
            "jobs",
            "dispatch_attempts",
            "reviews",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(n2, "reviews");
    }

    #[tokio::test]
    async fn job_assignee_check_constraint() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute_batch(
            "INSERT INTO landlords (id, name, created_at) VALUES ('l1', 'L', '2026-01-01');
             INSERT INTO properties (id, landlord_id, name, created_at) VALUES ('p1', 'l1', 'P', '2026-01-01');",
        )
        .await
        .unwrap();

        // Accepted without an assignee violates the invariant.
        let result = conn
            .execute(
                "INSERT INTO jobs (id, property_id, landlord_id, window_start, window_end, status, created_at, updated_at)
                 VALUES ('j1', 'p1', 'l1', 'a', 'b', 'accepted', 'x', 'x')",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
