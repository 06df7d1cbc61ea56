use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use loanbook_core::ports::{LoanInvestmentRepository, RepositoryError};
use loanbook_core::types::{
    FundingReceipt, LoanInvestment, LoanInvestmentLookup, LoanInvestmentsFilter, LoanStatus,
    NewLoanInvestment,
};

use crate::{backend, to_rfc3339, write_error};

const INVESTMENT_COLUMNS: &str = "id, loan_id, investor_id, amount, created_at";

/// SQLite implementation of [`LoanInvestmentRepository`].
#[derive(Clone)]
pub struct LoanInvestmentStore {
    pool: SqlitePool,
}

impl LoanInvestmentStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &LoanInvestmentsFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(loan_id) = filter.loan_id {
        builder.push(" AND loan_id = ").push_bind(loan_id);
    }
}

#[async_trait]
impl LoanInvestmentRepository for LoanInvestmentStore {
    async fn invest(
        &self,
        investment: NewLoanInvestment,
        now: DateTime<Utc>,
    ) -> Result<FundingReceipt, RepositoryError> {
        let now_text = to_rfc3339(now);
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Ceiling and status are re-checked at write time.
        let funded = sqlx::query(
            "UPDATE loans \
             SET invested_amount = invested_amount + ?1, \
                 status = CASE WHEN invested_amount + ?1 = amount THEN 'INVESTED' ELSE status END, \
                 fully_invested_at = CASE WHEN invested_amount + ?1 = amount THEN ?2 ELSE fully_invested_at END, \
                 updated_at = ?2 \
             WHERE id = ?3 AND status = 'APPROVED' AND ?1 <= amount - invested_amount \
             RETURNING invested_amount, amount, status",
        )
        .bind(investment.amount)
        .bind(&now_text)
        .bind(investment.loan_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(funded) = funded else {
            return Err(RepositoryError::FundingConflict);
        };
        let invested_amount: i64 = funded.get("invested_amount");
        let loan_amount: i64 = funded.get("amount");
        let status: String = funded.get("status");

        let row = sqlx::query_as::<_, InvestmentRow>(&format!(
            "INSERT INTO loan_investments (loan_id, investor_id, amount, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING {INVESTMENT_COLUMNS}"
        ))
        .bind(investment.loan_id)
        .bind(investment.investor_id)
        .bind(investment.amount)
        .bind(&now_text)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            write_error(
                err,
                RepositoryError::DuplicateInvestment,
                RepositoryError::NotFound("investor"),
            )
        })?;

        tx.commit().await.map_err(backend)?;

        Ok(FundingReceipt {
            investment: row.into(),
            invested_amount,
            loan_amount,
            fully_funded: status == LoanStatus::Invested.as_str(),
        })
    }

    async fn loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<Vec<LoanInvestment>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {INVESTMENT_COLUMNS} FROM loan_investments"
        ));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<InvestmentRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(LoanInvestment::from).collect())
    }

    async fn count_loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<i64, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM loan_investments");
        push_filter(&mut builder, filter);

        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn loan_investment(
        &self,
        lookup: &LoanInvestmentLookup,
    ) -> Result<LoanInvestment, RepositoryError> {
        if lookup.is_empty() {
            return Err(RepositoryError::MissingPredicate("loan investment"));
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {INVESTMENT_COLUMNS} FROM loan_investments WHERE 1 = 1"
        ));
        if let Some(id) = lookup.id {
            builder.push(" AND id = ").push_bind(id);
        }
        if let Some(loan_id) = lookup.loan_id {
            builder.push(" AND loan_id = ").push_bind(loan_id);
        }
        if let Some(investor_id) = lookup.investor_id {
            builder.push(" AND investor_id = ").push_bind(investor_id);
        }
        builder.push(" ORDER BY id LIMIT 1");

        builder
            .build_query_as::<InvestmentRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(LoanInvestment::from)
            .ok_or(RepositoryError::NotFound("loan investment"))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvestmentRow {
    id: i64,
    loan_id: i64,
    investor_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<InvestmentRow> for LoanInvestment {
    fn from(row: InvestmentRow) -> Self {
        Self {
            id: row.id,
            loan_id: row.loan_id,
            investor_id: row.investor_id,
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}
