use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use loanbook_core::ports::{LoanRepository, RepositoryError};
use loanbook_core::types::{Loan, LoanLookup, LoanStatus, LoansFilter, NewLoan};

use crate::{backend, to_rfc3339};

pub(crate) const LOAN_COLUMNS: &str = "id, user_id, amount, status, invested_amount, rate, term, \
    term_unit, photo_proof_url, approved_by_employee_id, approved_at, fully_invested_at, \
    draft_agreement_letter_url, agreement_letter_url, agreement_collected_by_employee_id, \
    disbursed_by_employee_id, disbursed_at, created_at, updated_at";

/// SQLite implementation of [`LoanRepository`].
#[derive(Clone)]
pub struct LoanStore {
    pool: SqlitePool,
}

impl LoanStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn write(
        &self,
        loan: &Loan,
        expected: Option<LoanStatus>,
    ) -> Result<Loan, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE loans SET user_id = ");
        builder
            .push_bind(loan.user_id)
            .push(", amount = ")
            .push_bind(loan.amount)
            .push(", status = ")
            .push_bind(loan.status.as_str())
            .push(", rate = ")
            .push_bind(loan.rate)
            .push(", term = ")
            .push_bind(loan.term)
            .push(", term_unit = ")
            .push_bind(loan.term_unit.as_str())
            .push(", photo_proof_url = ")
            .push_bind(loan.photo_proof_url.clone())
            .push(", approved_by_employee_id = ")
            .push_bind(loan.approved_by_employee_id)
            .push(", approved_at = ")
            .push_bind(loan.approved_at.map(to_rfc3339))
            .push(", agreement_letter_url = ")
            .push_bind(loan.agreement_letter_url.clone())
            .push(", agreement_collected_by_employee_id = ")
            .push_bind(loan.agreement_collected_by_employee_id)
            .push(", disbursed_by_employee_id = ")
            .push_bind(loan.disbursed_by_employee_id)
            .push(", disbursed_at = ")
            .push_bind(loan.disbursed_at.map(to_rfc3339))
            .push(", updated_at = ")
            .push_bind(loan.updated_at.map(to_rfc3339))
            .push(" WHERE id = ")
            .push_bind(loan.id);
        if let Some(expected) = expected {
            builder.push(" AND status = ").push_bind(expected.as_str());
        }
        builder.push(format!(" RETURNING {LOAN_COLUMNS}"));

        let row = builder
            .build_query_as::<LoanRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(self.missing_or_stale(loan.id).await),
        }
    }

    async fn missing_or_stale(&self, id: i64) -> RepositoryError {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM loans WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await;
        match exists {
            Ok(0) => RepositoryError::NotFound("loan"),
            Ok(_) => RepositoryError::StaleWrite,
            Err(err) => backend(err),
        }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &LoansFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
}

#[async_trait]
impl LoanRepository for LoanStore {
    async fn create(&self, loan: NewLoan) -> Result<Loan, RepositoryError> {
        let status = loan.status.unwrap_or(LoanStatus::Proposed);
        let row = sqlx::query_as::<_, LoanRow>(&format!(
            "INSERT INTO loans (user_id, amount, status, invested_amount, rate, term, term_unit, created_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?) \
             RETURNING {LOAN_COLUMNS}"
        ))
        .bind(loan.user_id)
        .bind(loan.amount)
        .bind(status.as_str())
        .bind(loan.rate)
        .bind(loan.term)
        .bind(loan.term_unit.as_str())
        .bind(to_rfc3339(loan.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        row.into_domain()
    }

    async fn update(&self, loan: &Loan) -> Result<Loan, RepositoryError> {
        self.write(loan, None).await
    }

    async fn update_if_status(
        &self,
        loan: &Loan,
        expected: LoanStatus,
    ) -> Result<Loan, RepositoryError> {
        self.write(loan, Some(expected)).await
    }

    async fn record_draft_agreement(
        &self,
        loan_id: i64,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<Loan, RepositoryError> {
        let row = sqlx::query_as::<_, LoanRow>(&format!(
            "UPDATE loans SET draft_agreement_letter_url = ?, updated_at = ? \
             WHERE id = ? AND draft_agreement_letter_url IS NULL \
             RETURNING {LOAN_COLUMNS}"
        ))
        .bind(url)
        .bind(to_rfc3339(at))
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(self.missing_or_stale(loan_id).await),
        }
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM loans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound("loan"));
        }
        Ok(())
    }

    async fn loans(&self, filter: &LoansFilter) -> Result<Vec<Loan>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {LOAN_COLUMNS} FROM loans"));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id");

        builder
            .build_query_as::<LoanRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(LoanRow::into_domain)
            .collect()
    }

    async fn count_loans(&self, filter: &LoansFilter) -> Result<i64, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM loans");
        push_filter(&mut builder, filter);

        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn loan(&self, lookup: &LoanLookup) -> Result<Loan, RepositoryError> {
        let Some(id) = lookup.id else {
            return Err(RepositoryError::MissingPredicate("loan"));
        };

        sqlx::query_as::<_, LoanRow>(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(RepositoryError::NotFound("loan"))?
            .into_domain()
    }
}

/// Raw `loans` row. Enum columns stay text until [`LoanRow::into_domain`].
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LoanRow {
    id: i64,
    user_id: i64,
    amount: i64,
    status: String,
    invested_amount: i64,
    rate: f64,
    term: i64,
    term_unit: String,
    photo_proof_url: Option<String>,
    approved_by_employee_id: Option<i64>,
    approved_at: Option<DateTime<Utc>>,
    fully_invested_at: Option<DateTime<Utc>>,
    draft_agreement_letter_url: Option<String>,
    agreement_letter_url: Option<String>,
    agreement_collected_by_employee_id: Option<i64>,
    disbursed_by_employee_id: Option<i64>,
    disbursed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl LoanRow {
    pub(crate) fn into_domain(self) -> Result<Loan, RepositoryError> {
        let status = self
            .status
            .parse::<LoanStatus>()
            .map_err(|err| RepositoryError::Corrupt(format!("loan {}: {err}", self.id)))?;
        let term_unit = self
            .term_unit
            .parse()
            .map_err(|err| RepositoryError::Corrupt(format!("loan {}: {err}", self.id)))?;

        Ok(Loan {
            id: self.id,
            user_id: self.user_id,
            amount: self.amount,
            status,
            invested_amount: self.invested_amount,
            rate: self.rate,
            term: self.term,
            term_unit,
            photo_proof_url: self.photo_proof_url,
            approved_by_employee_id: self.approved_by_employee_id,
            approved_at: self.approved_at,
            fully_invested_at: self.fully_invested_at,
            draft_agreement_letter_url: self.draft_agreement_letter_url,
            agreement_letter_url: self.agreement_letter_url,
            agreement_collected_by_employee_id: self.agreement_collected_by_employee_id,
            disbursed_by_employee_id: self.disbursed_by_employee_id,
            disbursed_at: self.disbursed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
