//! Seams between the loan workflow and its collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::agreement::{AgreementDocument, AgreementMail};
use crate::types::{
    FundingReceipt, Investor, InvestorLookup, InvestorsFilter, Loan, LoanInvestment,
    LoanInvestmentLookup, LoanInvestmentsFilter, LoanLookup, LoanStatus, LoansFilter, NewInvestor,
    NewLoan, NewLoanInvestment,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} lookup requires at least one predicate")]
    MissingPredicate(&'static str),
    #[error("investor has already invested in this loan")]
    DuplicateInvestment,
    #[error("investor email already registered")]
    DuplicateEmail,
    #[error("loan funding changed concurrently")]
    FundingConflict,
    #[error("record changed concurrently")]
    StaleWrite,
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

#[async_trait]
pub trait LoanRepository: Send + Sync {
    async fn create(&self, loan: NewLoan) -> Result<Loan, RepositoryError>;

    /// Writes every mutable column except `invested_amount`, which only the
    /// funding transaction moves.
    async fn update(&self, loan: &Loan) -> Result<Loan, RepositoryError>;

    /// Same as [`LoanRepository::update`] but only when the stored status still
    /// equals `expected`. Otherwise returns [`RepositoryError::StaleWrite`].
    async fn update_if_status(
        &self,
        loan: &Loan,
        expected: LoanStatus,
    ) -> Result<Loan, RepositoryError>;

    /// Stores the generated agreement URL once. A second write is a
    /// [`RepositoryError::StaleWrite`].
    async fn record_draft_agreement(
        &self,
        loan_id: i64,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<Loan, RepositoryError>;

    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;

    async fn loans(&self, filter: &LoansFilter) -> Result<Vec<Loan>, RepositoryError>;

    async fn count_loans(&self, filter: &LoansFilter) -> Result<i64, RepositoryError>;

    async fn loan(&self, lookup: &LoanLookup) -> Result<Loan, RepositoryError>;
}

#[async_trait]
pub trait LoanInvestmentRepository: Send + Sync {
    /// Records an investment and advances the loan total in one transaction.
    ///
    /// The total is only advanced while the loan is `APPROVED` and the new total
    /// stays within the principal; otherwise nothing is written and
    /// [`RepositoryError::FundingConflict`] is returned.
    async fn invest(
        &self,
        investment: NewLoanInvestment,
        now: DateTime<Utc>,
    ) -> Result<FundingReceipt, RepositoryError>;

    async fn loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<Vec<LoanInvestment>, RepositoryError>;

    async fn count_loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<i64, RepositoryError>;

    async fn loan_investment(
        &self,
        lookup: &LoanInvestmentLookup,
    ) -> Result<LoanInvestment, RepositoryError>;
}

#[async_trait]
pub trait InvestorRepository: Send + Sync {
    async fn create(&self, investor: NewInvestor) -> Result<Investor, RepositoryError>;

    async fn update(&self, investor: &Investor) -> Result<Investor, RepositoryError>;

    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;

    async fn investors(&self, filter: &InvestorsFilter) -> Result<Vec<Investor>, RepositoryError>;

    async fn count_investors(&self, filter: &InvestorsFilter) -> Result<i64, RepositoryError>;

    async fn investor(&self, lookup: &InvestorLookup) -> Result<Investor, RepositoryError>;
}

/// Failure rendering or storing an agreement artifact.
#[derive(Debug, Error)]
#[error("agreement generation failed: {0}")]
pub struct DocumentError(#[source] pub BoxError);

/// Produces an agreement artifact and returns where it can be fetched.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(&self, document: &AgreementDocument) -> Result<String, DocumentError>;
}

/// Failure delivering one notification.
#[derive(Debug, Error)]
#[error("notification to {recipient} failed: {source}")]
pub struct NotifyError {
    pub recipient: String,
    #[source]
    pub source: BoxError,
}

/// Delivers one agreement notification to one investor.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_agreement(&self, mail: &AgreementMail) -> Result<(), NotifyError>;
}
