use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use loanbook_core::lifecycle::{Approval, Disbursement, TransitionError};
use loanbook_core::ports::{
    InvestorRepository, LoanInvestmentRepository, LoanRepository, RepositoryError,
};
use loanbook_core::types::{
    InvestorLookup, Loan, LoanInvestment, LoanInvestmentLookup, LoanInvestmentsFilter, LoanLookup,
    LoanStatus, LoansFilter, NewLoan, NewLoanInvestment, TermUnit,
};

use crate::agreement::{AgreementJob, AgreementQueue};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DUPLICATE_INVESTMENT: &str = "investor has already invested in this loan";

/// Collaborators required by [`LoanService`].
pub struct LoanServiceDeps {
    pub loans: Arc<dyn LoanRepository>,
    pub investments: Arc<dyn LoanInvestmentRepository>,
    pub investors: Arc<dyn InvestorRepository>,
    pub agreements: AgreementQueue,
    pub clock: Clock,
}

/// Owns the loan state machine and the hand-off to the agreement worker.
#[derive(Clone)]
pub struct LoanService {
    loans: Arc<dyn LoanRepository>,
    investments: Arc<dyn LoanInvestmentRepository>,
    investors: Arc<dyn InvestorRepository>,
    agreements: AgreementQueue,
    clock: Clock,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProposeLoanInput {
    pub user_id: i64,
    pub amount: i64,
    pub rate: f64,
    pub term: i64,
    pub term_unit: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApproveLoanInput {
    pub id: i64,
    pub employee_id: i64,
    pub photo_proof_url: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvestLoanInput {
    pub loan_id: i64,
    pub investor_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DisburseLoanInput {
    pub id: i64,
    pub disbursed_by_employee_id: i64,
    pub loan_agreement_letter_url: String,
    pub agreement_collected_by_employee_id: i64,
}

/// Errors returned by the loan workflow.
#[derive(Debug, Error)]
pub enum LoanServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    StateConflict(String),
    #[error("failed to update loan invested amount, possibly exceeding loan amount")]
    FundingConflict,
    #[error("total investment does not match loan amount, please contact admin/cs")]
    Integrity { expected: i64, actual: i64 },
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl LoanServiceError {
    fn validation(message: &str) -> Self {
        Self::Validation(message.to_string())
    }

    fn conflict(message: impl ToString) -> Self {
        Self::StateConflict(message.to_string())
    }
}

impl From<RepositoryError> for LoanServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(entity) => Self::NotFound(entity),
            RepositoryError::DuplicateInvestment => Self::conflict(DUPLICATE_INVESTMENT),
            RepositoryError::DuplicateEmail => Self::conflict("investor email already registered"),
            RepositoryError::FundingConflict => Self::FundingConflict,
            RepositoryError::StaleWrite => Self::conflict("record was modified concurrently"),
            other => Self::Repository(other),
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

impl LoanService {
    pub fn new(deps: LoanServiceDeps) -> Self {
        Self {
            loans: deps.loans,
            investments: deps.investments,
            investors: deps.investors,
            agreements: deps.agreements,
            clock: deps.clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates a `PROPOSED` loan for a borrower.
    pub async fn propose_loan(&self, input: ProposeLoanInput) -> Result<Loan, LoanServiceError> {
        if input.user_id == 0 {
            return Err(LoanServiceError::validation("userId is required"));
        }
        if input.amount == 0 {
            return Err(LoanServiceError::validation("amount is required"));
        }
        if input.amount < 0 {
            return Err(LoanServiceError::validation("amount must be positive"));
        }
        if input.rate == 0.0 {
            return Err(LoanServiceError::validation("rate is required"));
        }
        if input.term == 0 {
            return Err(LoanServiceError::validation("term is required"));
        }
        let term_unit: TermUnit = input
            .term_unit
            .trim()
            .parse()
            .map_err(|_| LoanServiceError::validation("termUnit is invalid"))?;

        let loan = self
            .loans
            .create(NewLoan {
                user_id: input.user_id,
                amount: input.amount,
                rate: input.rate,
                term: input.term,
                term_unit,
                status: None,
                created_at: self.now(),
            })
            .await?;

        counter!("loan_transitions_total", "to" => LoanStatus::Proposed.as_str()).increment(1);
        info!(stage = "loan", loan_id = loan.id, user_id = loan.user_id, amount = loan.amount, "loan proposed");
        Ok(loan)
    }

    /// Moves a loan from `PROPOSED` to `APPROVED`.
    pub async fn approve_loan(&self, input: ApproveLoanInput) -> Result<Loan, LoanServiceError> {
        if input.id == 0 {
            return Err(LoanServiceError::validation("id is required"));
        }
        if input.employee_id == 0 {
            return Err(LoanServiceError::validation("employeeId is required"));
        }
        if is_blank(&input.photo_proof_url) {
            return Err(LoanServiceError::validation("photoProofUrl is required"));
        }

        let mut loan = self.loans.loan(&LoanLookup::by_id(input.id)).await?;
        let previous = loan.status;
        loan.approve(Approval {
            employee_id: input.employee_id,
            photo_proof_url: &input.photo_proof_url,
            at: self.now(),
        })
        .map_err(LoanServiceError::conflict)?;

        let saved = self
            .loans
            .update_if_status(&loan, previous)
            .await
            .map_err(|err| match err {
                RepositoryError::StaleWrite => {
                    LoanServiceError::conflict(TransitionError::NotProposed { current: previous })
                }
                other => other.into(),
            })?;

        counter!("loan_transitions_total", "to" => LoanStatus::Approved.as_str()).increment(1);
        info!(stage = "loan", loan_id = saved.id, employee_id = input.employee_id, "loan approved");
        Ok(saved)
    }

    /// Records an investment. The completing investment hands the loan to the
    /// agreement worker and returns without waiting for it.
    pub async fn invest_loan(
        &self,
        input: InvestLoanInput,
    ) -> Result<LoanInvestment, LoanServiceError> {
        if input.loan_id == 0 {
            return Err(LoanServiceError::validation("loanId is required"));
        }
        if input.investor_id == 0 {
            return Err(LoanServiceError::validation("investorId is required"));
        }
        if input.amount == 0 {
            return Err(LoanServiceError::validation("amount is required"));
        }
        if input.amount < 0 {
            return Err(LoanServiceError::validation("amount must be positive"));
        }

        self.investors
            .investor(&InvestorLookup::by_id(input.investor_id))
            .await?;
        let loan = self.loans.loan(&LoanLookup::by_id(input.loan_id)).await?;
        if let Err(rejection) = loan.check_funding(input.amount) {
            counter!("loan_investments_total", "result" => "rejected").increment(1);
            return Err(LoanServiceError::conflict(rejection));
        }

        match self
            .investments
            .loan_investment(&LoanInvestmentLookup::for_investor(
                input.loan_id,
                input.investor_id,
            ))
            .await
        {
            Ok(_) => {
                counter!("loan_investments_total", "result" => "rejected").increment(1);
                return Err(LoanServiceError::conflict(DUPLICATE_INVESTMENT));
            }
            Err(RepositoryError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let receipt = match self
            .investments
            .invest(
                NewLoanInvestment {
                    loan_id: input.loan_id,
                    investor_id: input.investor_id,
                    amount: input.amount,
                },
                self.now(),
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                counter!("loan_investments_total", "result" => "conflict").increment(1);
                warn!(stage = "loan", loan_id = input.loan_id, investor_id = input.investor_id, error = %err, "investment rejected by store");
                return Err(err.into());
            }
        };

        counter!("loan_investments_total", "result" => "accepted").increment(1);
        info!(
            stage = "loan",
            loan_id = input.loan_id,
            investor_id = input.investor_id,
            amount = input.amount,
            invested_amount = receipt.invested_amount,
            "investment recorded"
        );

        if receipt.fully_funded {
            counter!("loan_transitions_total", "to" => LoanStatus::Invested.as_str()).increment(1);
            info!(stage = "loan", loan_id = input.loan_id, "loan fully funded");
            self.agreements.enqueue(AgreementJob {
                loan_id: input.loan_id,
            });
        }

        Ok(receipt.investment)
    }

    /// Moves a fully invested loan to `DISBURSED` once paperwork is collected.
    pub async fn disburse_loan(&self, input: DisburseLoanInput) -> Result<Loan, LoanServiceError> {
        if input.id == 0 {
            return Err(LoanServiceError::validation("id is required"));
        }
        if input.disbursed_by_employee_id == 0 {
            return Err(LoanServiceError::validation(
                "disbursedByEmployeeId is required",
            ));
        }
        if is_blank(&input.loan_agreement_letter_url) {
            return Err(LoanServiceError::validation(
                "loanAgreementLetterUrl is required",
            ));
        }
        if input.agreement_collected_by_employee_id == 0 {
            return Err(LoanServiceError::validation(
                "agreementCollectedByEmployeeId is required",
            ));
        }

        let mut loan = self.loans.loan(&LoanLookup::by_id(input.id)).await?;
        let previous = loan.status;
        loan.disburse(Disbursement {
            disbursed_by_employee_id: input.disbursed_by_employee_id,
            agreement_letter_url: &input.loan_agreement_letter_url,
            agreement_collected_by_employee_id: input.agreement_collected_by_employee_id,
            at: self.now(),
        })
        .map_err(LoanServiceError::conflict)?;

        let actual: i64 = self
            .investments
            .loan_investments(&LoanInvestmentsFilter::for_loan(loan.id))
            .await?
            .iter()
            .map(|investment| investment.amount)
            .sum();
        if actual != loan.amount {
            error!(
                stage = "loan",
                loan_id = loan.id,
                expected = loan.amount,
                actual,
                "investment total does not match loan amount"
            );
            return Err(LoanServiceError::Integrity {
                expected: loan.amount,
                actual,
            });
        }

        let saved = self
            .loans
            .update_if_status(&loan, previous)
            .await
            .map_err(|err| match err {
                RepositoryError::StaleWrite => {
                    LoanServiceError::conflict(TransitionError::NotInvested { current: previous })
                }
                other => other.into(),
            })?;

        counter!("loan_transitions_total", "to" => LoanStatus::Disbursed.as_str()).increment(1);
        info!(
            stage = "loan",
            loan_id = saved.id,
            disbursed_by = input.disbursed_by_employee_id,
            "loan disbursed"
        );
        Ok(saved)
    }

    pub async fn loans(&self, filter: &LoansFilter) -> Result<Vec<Loan>, LoanServiceError> {
        Ok(self.loans.loans(filter).await?)
    }

    pub async fn count_loans(&self, filter: &LoansFilter) -> Result<i64, LoanServiceError> {
        Ok(self.loans.count_loans(filter).await?)
    }

    pub async fn loan(&self, id: i64) -> Result<Loan, LoanServiceError> {
        Ok(self.loans.loan(&LoanLookup::by_id(id)).await?)
    }

    /// URL of the generated agreement, available once the worker has run.
    pub async fn draft_agreement_letter(&self, id: i64) -> Result<String, LoanServiceError> {
        let loan = self.loan(id).await?;
        if loan.fully_invested_at.is_none() {
            return Err(LoanServiceError::conflict("loan is not fully funded yet"));
        }
        loan.draft_agreement_letter_url
            .ok_or_else(|| LoanServiceError::conflict("loan agreement letter is not available"))
    }

    /// URL of the signed agreement collected at disbursement.
    pub async fn signed_agreement_letter(&self, id: i64) -> Result<String, LoanServiceError> {
        let loan = self.loan(id).await?;
        if loan.status != LoanStatus::Disbursed {
            return Err(LoanServiceError::conflict("loan is not disbursed yet"));
        }
        loan.agreement_letter_url
            .ok_or_else(|| LoanServiceError::conflict("loan agreement letter is not available"))
    }
}
