use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Loan, LoanStatus};

/// Approval details recorded by an employee.
#[derive(Debug, Clone, Copy)]
pub struct Approval<'a> {
    pub employee_id: i64,
    pub photo_proof_url: &'a str,
    pub at: DateTime<Utc>,
}

/// Disbursement details recorded once the signed agreement is collected.
#[derive(Debug, Clone, Copy)]
pub struct Disbursement<'a> {
    pub disbursed_by_employee_id: i64,
    pub agreement_letter_url: &'a str,
    pub agreement_collected_by_employee_id: i64,
    pub at: DateTime<Utc>,
}

/// Rejected status transition. The loan is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("only proposed loan can be approved")]
    NotProposed { current: LoanStatus },
    #[error("only fully invested loan can be disbursed")]
    NotInvested { current: LoanStatus },
}

/// Reason an investment is refused before touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FundingRejection {
    #[error("loan is already fully funded")]
    AlreadyFullyFunded,
    #[error("only approved loan can be invested")]
    NotApproved { current: LoanStatus },
    #[error("investment would exceed loan amount")]
    ExceedsPrincipal { remaining: i64 },
}

impl Loan {
    /// Applies the `PROPOSED → APPROVED` edge.
    pub fn approve(&mut self, approval: Approval<'_>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(LoanStatus::Approved) {
            return Err(TransitionError::NotProposed {
                current: self.status,
            });
        }

        self.approved_by_employee_id = Some(approval.employee_id);
        self.photo_proof_url = Some(approval.photo_proof_url.trim().to_string());
        self.approved_at = Some(approval.at);
        self.status = LoanStatus::Approved;
        self.updated_at = Some(approval.at);
        Ok(())
    }

    /// Read-time checks for a prospective investment of `amount`.
    ///
    /// The store re-evaluates the ceiling at commit time; this only gives early,
    /// specific feedback.
    pub fn check_funding(&self, amount: i64) -> Result<(), FundingRejection> {
        if self.is_fully_funded() {
            return Err(FundingRejection::AlreadyFullyFunded);
        }
        if self.status != LoanStatus::Approved {
            return Err(FundingRejection::NotApproved {
                current: self.status,
            });
        }
        if amount > self.remaining_amount() {
            return Err(FundingRejection::ExceedsPrincipal {
                remaining: self.remaining_amount(),
            });
        }
        Ok(())
    }

    /// Applies the `INVESTED → DISBURSED` edge.
    pub fn disburse(&mut self, disbursement: Disbursement<'_>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(LoanStatus::Disbursed) || !self.is_fully_funded() {
            return Err(TransitionError::NotInvested {
                current: self.status,
            });
        }

        self.disbursed_by_employee_id = Some(disbursement.disbursed_by_employee_id);
        self.agreement_letter_url = Some(disbursement.agreement_letter_url.trim().to_string());
        self.agreement_collected_by_employee_id =
            Some(disbursement.agreement_collected_by_employee_id);
        self.disbursed_at = Some(disbursement.at);
        self.status = LoanStatus::Disbursed;
        self.updated_at = Some(disbursement.at);
        Ok(())
    }
}
