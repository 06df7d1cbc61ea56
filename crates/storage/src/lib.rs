use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;

use loanbook_core::ports::RepositoryError;

mod investments;
mod investors;
mod loans;

pub use investments::LoanInvestmentStore;
pub use investors::InvestorStore;
pub use loans::LoanStore;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Foreign keys and the busy timeout are per-connection settings, so they are
    /// applied through the connect options rather than a one-off pragma.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the `loans` table.
    pub fn loans(&self) -> LoanStore {
        LoanStore::new(self.pool.clone())
    }

    /// Returns a handle to the `investors` table.
    pub fn investors(&self) -> InvestorStore {
        InvestorStore::new(self.pool.clone())
    }

    /// Returns a handle to the `loan_investments` table and the funding transaction.
    pub fn loan_investments(&self) -> LoanInvestmentStore {
        LoanInvestmentStore::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

const UNIQUE_VIOLATION: &str = "2067";
const FOREIGN_KEY_VIOLATION: &str = "787";

fn backend(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(Box::new(err))
}

/// Maps a write failure, translating constraint codes into domain errors.
fn write_error(
    err: sqlx::Error,
    on_unique: RepositoryError,
    on_foreign_key: RepositoryError,
) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(UNIQUE_VIOLATION) => return on_unique,
            Some(FOREIGN_KEY_VIOLATION) => return on_foreign_key,
            _ => {}
        }
    }
    backend(err)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
