use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use loanbook_core::ports::{InvestorRepository, RepositoryError};
use loanbook_core::types::{Investor, InvestorLookup, InvestorsFilter, NewInvestor};

use crate::{backend, to_rfc3339, write_error};

const INVESTOR_COLUMNS: &str = "id, email, created_at, updated_at";

/// SQLite implementation of [`InvestorRepository`].
#[derive(Clone)]
pub struct InvestorStore {
    pool: SqlitePool,
}

impl InvestorStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &InvestorsFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            builder.push(" AND 1 = 0");
            return;
        }
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }
}

#[async_trait]
impl InvestorRepository for InvestorStore {
    async fn create(&self, investor: NewInvestor) -> Result<Investor, RepositoryError> {
        sqlx::query_as::<_, InvestorRow>(&format!(
            "INSERT INTO investors (email, created_at) VALUES (?, ?) RETURNING {INVESTOR_COLUMNS}"
        ))
        .bind(&investor.email)
        .bind(to_rfc3339(investor.created_at))
        .fetch_one(&self.pool)
        .await
        .map(Investor::from)
        .map_err(|err| {
            write_error(
                err,
                RepositoryError::DuplicateEmail,
                RepositoryError::NotFound("investor"),
            )
        })
    }

    async fn update(&self, investor: &Investor) -> Result<Investor, RepositoryError> {
        sqlx::query_as::<_, InvestorRow>(&format!(
            "UPDATE investors SET email = ?, updated_at = ? WHERE id = ? RETURNING {INVESTOR_COLUMNS}"
        ))
        .bind(&investor.email)
        .bind(investor.updated_at.map(to_rfc3339))
        .bind(investor.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            write_error(
                err,
                RepositoryError::DuplicateEmail,
                RepositoryError::NotFound("investor"),
            )
        })?
        .map(Investor::from)
        .ok_or(RepositoryError::NotFound("investor"))
    }

    /// Investors holding investments cannot be removed; the foreign key
    /// violation surfaces as a backend error.
    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM investors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound("investor"));
        }
        Ok(())
    }

    async fn investors(&self, filter: &InvestorsFilter) -> Result<Vec<Investor>, RepositoryError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {INVESTOR_COLUMNS} FROM investors"));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<InvestorRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(Investor::from).collect())
    }

    async fn count_investors(&self, filter: &InvestorsFilter) -> Result<i64, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM investors");
        push_filter(&mut builder, filter);

        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn investor(&self, lookup: &InvestorLookup) -> Result<Investor, RepositoryError> {
        if lookup.is_empty() {
            return Err(RepositoryError::MissingPredicate("investor"));
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {INVESTOR_COLUMNS} FROM investors WHERE 1 = 1"
        ));
        if let Some(id) = lookup.id {
            builder.push(" AND id = ").push_bind(id);
        }
        if let Some(email) = &lookup.email {
            builder.push(" AND email = ").push_bind(email.clone());
        }
        builder.push(" LIMIT 1");

        builder
            .build_query_as::<InvestorRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(Investor::from)
            .ok_or(RepositoryError::NotFound("investor"))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvestorRow {
    id: i64,
    email: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<InvestorRow> for Investor {
    fn from(row: InvestorRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
