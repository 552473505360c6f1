//! Database connection utilities.

use sea_orm::{Database, DatabaseConnection, DbErr};

/// Whether a URL points at an on-disk SQLite database.
///
/// In-memory databases (`sqlite::memory:`) skip the WAL pragmas, which do
/// not apply to them.
fn is_sqlite_file(database_url: &str) -> bool {
    database_url.starts_with("sqlite:") && !database_url.contains(":memory:")
}

/// Configure SQLite-specific pragmas.
///
/// This sets:
/// - `journal_mode=WAL` - readers don't block the sync writer
/// - `busy_timeout=5000` - wait up to 5 seconds for locks
/// - `synchronous=NORMAL` - safe with WAL
/// - `foreign_keys=ON` - removing a workspace cascades to its rows
async fn configure_sqlite(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm::{ConnectionTrait, Statement};

    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA busy_timeout=5000",
        "PRAGMA synchronous=NORMAL",
        "PRAGMA foreign_keys=ON",
    ] {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            pragma.to_string(),
        ))
        .await?;
    }

    Ok(())
}

/// Establish a connection to the database.
///
/// # Arguments
/// * `database_url` - e.g. `sqlite:///path/to/projectlens.db?mode=rwc` or `postgres:///projectlens`
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    if is_sqlite_file(database_url) {
        configure_sqlite(&db).await?;
    }

    Ok(db)
}

/// Establish a connection to the database and run all pending migrations.
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established or migrations fail.
///
/// # Example
/// ```ignore
/// let db = projectlens::connect_and_migrate("sqlite::memory:").await?;
/// ```
#[cfg(feature = "migrate")]
pub async fn connect_and_migrate(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    use sea_orm_migration::MigratorTrait;

    let db = connect(database_url).await?;
    crate::migration::Migrator::up(&db, None).await?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[test]
    fn is_sqlite_file_skips_memory_and_other_backends() {
        assert!(is_sqlite_file("sqlite:///tmp/projectlens.db?mode=rwc"));
        assert!(is_sqlite_file("sqlite://projectlens.db"));
        assert!(!is_sqlite_file("sqlite::memory:"));
        assert!(!is_sqlite_file("postgres:///projectlens"));
    }

    #[tokio::test]
    async fn configure_sqlite_runs_all_pragmas() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_results((0..4).map(|_| MockExecResult {
                rows_affected: 0,
                last_insert_id: 0,
            }))
            .into_connection();

        configure_sqlite(&db)
            .await
            .expect("mock sqlite pragma execs should succeed");
    }

    #[tokio::test]
    async fn connect_returns_error_for_invalid_database_url() {
        let err = connect("this-is-not-a-db-url")
            .await
            .expect_err("invalid URL should error");
        let msg = err.to_string().to_ascii_lowercase();
        assert!(
            msg.contains("error") || msg.contains("invalid"),
            "unexpected error message: {err}"
        );
    }
}
