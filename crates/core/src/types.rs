use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a loan.
///
/// Statuses only ever move forward: `PROPOSED → APPROVED → INVESTED → DISBURSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Proposed,
    Approved,
    Invested,
    Disbursed,
}

impl LoanStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Approved => "APPROVED",
            Self::Invested => "INVESTED",
            Self::Disbursed => "DISBURSED",
        }
    }

    /// Returns `true` when `next` is the single legal successor of this status.
    pub fn can_transition_to(self, next: LoanStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Approved)
                | (Self::Approved, Self::Invested)
                | (Self::Invested, Self::Disbursed)
        )
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoanStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PROPOSED" => Ok(Self::Proposed),
            "APPROVED" => Ok(Self::Approved),
            "INVESTED" => Ok(Self::Invested),
            "DISBURSED" => Ok(Self::Disbursed),
            other => Err(UnknownValue {
                kind: "loan status",
                value: other.to_string(),
            }),
        }
    }
}

/// Unit in which a loan term is expressed. Only weekly terms are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TermUnit {
    Weekly,
}

impl TermUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "WEEKLY",
        }
    }

    /// Human readable label used in agreement documents.
    pub fn label(self) -> &'static str {
        match self {
            Self::Weekly => "week(s)",
        }
    }
}

impl FromStr for TermUnit {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "WEEKLY" => Ok(Self::Weekly),
            other => Err(UnknownValue {
                kind: "term unit",
                value: other.to_string(),
            }),
        }
    }
}

/// Raised when a persisted or submitted enum value is outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

/// Loan record as persisted in the `loans` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: i64,
    pub user_id: i64,
    /// Principal in minor currency units.
    pub amount: i64,
    pub status: LoanStatus,
    /// Running total funded so far. Only the funding transaction moves it.
    pub invested_amount: i64,
    pub rate: f64,
    pub term: i64,
    pub term_unit: TermUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_proof_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by_employee_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fully_invested_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_agreement_letter_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_letter_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_collected_by_employee_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disbursed_by_employee_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disbursed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Loan {
    /// Amount still open for investment.
    pub fn remaining_amount(&self) -> i64 {
        (self.amount - self.invested_amount).max(0)
    }

    pub fn is_fully_funded(&self) -> bool {
        self.invested_amount >= self.amount
    }
}

/// Data required to create a loan row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLoan {
    pub user_id: i64,
    pub amount: i64,
    pub rate: f64,
    pub term: i64,
    pub term_unit: TermUnit,
    /// Defaults to `PROPOSED` when unset.
    pub status: Option<LoanStatus>,
    pub created_at: DateTime<Utc>,
}

/// Registered investor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investor {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Data required to register an investor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvestor {
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Portion of a loan funded by a single investor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanInvestment {
    pub id: i64,
    pub loan_id: i64,
    pub investor_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Data required to record an investment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewLoanInvestment {
    pub loan_id: i64,
    pub investor_id: i64,
    pub amount: i64,
}

/// Result of the atomic funding transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingReceipt {
    pub investment: LoanInvestment,
    /// Loan total after the commit.
    pub invested_amount: i64,
    pub loan_amount: i64,
    /// `true` only for the commit that moved the loan from `APPROVED` to `INVESTED`.
    pub fully_funded: bool,
}

/// Filter for listing loans. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoansFilter {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub status: Option<LoanStatus>,
}

/// Predicate for loading a single loan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoanLookup {
    pub id: Option<i64>,
}

impl LoanLookup {
    pub fn by_id(id: i64) -> Self {
        Self { id: Some(id) }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }
}

/// Filter for listing investors. `Some(vec![])` matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvestorsFilter {
    pub ids: Option<Vec<i64>>,
}

impl InvestorsFilter {
    pub fn by_ids(ids: Vec<i64>) -> Self {
        Self { ids: Some(ids) }
    }
}

/// Predicate for loading a single investor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvestorLookup {
    pub id: Option<i64>,
    pub email: Option<String>,
}

impl InvestorLookup {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            email: None,
        }
    }

    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            id: None,
            email: Some(email.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none()
    }
}

/// Filter for listing investments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanInvestmentsFilter {
    #[serde(default)]
    pub loan_id: Option<i64>,
}

impl LoanInvestmentsFilter {
    pub fn for_loan(loan_id: i64) -> Self {
        Self {
            loan_id: Some(loan_id),
        }
    }
}

/// Predicate for loading a single investment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoanInvestmentLookup {
    pub id: Option<i64>,
    pub loan_id: Option<i64>,
    pub investor_id: Option<i64>,
}

impl LoanInvestmentLookup {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Looks up the investment a given investor holds in a given loan.
    pub fn for_investor(loan_id: i64, investor_id: i64) -> Self {
        Self {
            id: None,
            loan_id: Some(loan_id),
            investor_id: Some(investor_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.loan_id.is_none() && self.investor_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_database_form() {
        for status in [
            LoanStatus::Proposed,
            LoanStatus::Approved,
            LoanStatus::Invested,
            LoanStatus::Disbursed,
        ] {
            assert_eq!(status.as_str().parse::<LoanStatus>(), Ok(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "PAID".parse::<LoanStatus>().unwrap_err();
        assert_eq!(err.value, "PAID");
        assert_eq!(err.to_string(), "unknown loan status: PAID");
    }

    #[test]
    fn transitions_only_move_forward_one_step() {
        use LoanStatus::*;
        assert!(Proposed.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Invested));
        assert!(Invested.can_transition_to(Disbursed));

        assert!(!Proposed.can_transition_to(Invested));
        assert!(!Approved.can_transition_to(Disbursed));
        assert!(!Approved.can_transition_to(Proposed));
        assert!(!Disbursed.can_transition_to(Invested));
        assert!(!Approved.can_transition_to(Approved));
    }

    #[test]
    fn status_serializes_in_screaming_case() {
        let value = serde_json::to_value(LoanStatus::Invested).expect("serialize");
        assert_eq!(value, serde_json::json!("INVESTED"));
    }

    #[test]
    fn loan_fields_use_camel_case_on_the_wire() {
        let filter: LoansFilter =
            serde_json::from_value(serde_json::json!({ "userId": 4, "status": "APPROVED" }))
                .expect("deserialize");
        assert_eq!(filter.user_id, Some(4));
        assert_eq!(filter.status, Some(LoanStatus::Approved));
    }

    #[test]
    fn lookups_report_missing_predicates() {
        assert!(LoanLookup::default().is_empty());
        assert!(!LoanLookup::by_id(1).is_empty());
        assert!(InvestorLookup::default().is_empty());
        assert!(!InvestorLookup::by_email("a@example.com").is_empty());
        assert!(LoanInvestmentLookup::default().is_empty());
        assert!(!LoanInvestmentLookup::for_investor(1, 2).is_empty());
    }
}
