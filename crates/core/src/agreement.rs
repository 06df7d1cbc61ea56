use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;

use crate::types::{Investor, Loan, LoanInvestment, TermUnit};

/// Date layout used on agreements and investor mail, e.g. `02 Jan 2024`.
pub const DATE_FORMAT: &str = "%d %b %Y";

const PARI_PASSU_CLAUSE: &str = "All payments received from the Borrower shall be applied and \
distributed to the Lenders on a pari passu, pro-rata basis according to their respective \
shares above.";

/// Input to the agreement generator. Pure data with no knowledge of persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgreementDocument {
    pub agreement_no: String,
    pub effective_on: String,
    pub borrower: String,
    pub amount: i64,
    pub rate: f64,
    pub term: i64,
    pub term_unit: TermUnit,
    pub lenders: Vec<AgreementLender>,
}

/// One row of the lender schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgreementLender {
    pub name: String,
    pub amount: i64,
    pub percent: f64,
}

/// Failure assembling an agreement from stored records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgreementBuildError {
    #[error("loan {0} has not been fully invested")]
    NotFullyInvested(i64),
    #[error("investor {0} referenced by an investment does not exist")]
    MissingInvestor(i64),
}

impl AgreementDocument {
    /// Builds the agreement for a fully funded loan.
    ///
    /// Lenders are listed in investment order and identified by email.
    pub fn from_funding(
        loan: &Loan,
        investments: &[LoanInvestment],
        investors: &[Investor],
    ) -> Result<Self, AgreementBuildError> {
        let effective_on = loan
            .fully_invested_at
            .ok_or(AgreementBuildError::NotFullyInvested(loan.id))?;
        let by_id: HashMap<i64, &Investor> = investors.iter().map(|i| (i.id, i)).collect();

        let lenders = investments
            .iter()
            .map(|investment| {
                let investor = by_id
                    .get(&investment.investor_id)
                    .ok_or(AgreementBuildError::MissingInvestor(investment.investor_id))?;
                Ok(AgreementLender {
                    name: investor.email.clone(),
                    amount: investment.amount,
                    percent: share_percent(investment.amount, loan.amount),
                })
            })
            .collect::<Result<Vec<_>, AgreementBuildError>>()?;

        Ok(Self {
            agreement_no: loan.id.to_string(),
            effective_on: effective_on.format(DATE_FORMAT).to_string(),
            borrower: loan.user_id.to_string(),
            amount: loan.amount,
            rate: loan.rate,
            term: loan.term,
            term_unit: loan.term_unit,
            lenders,
        })
    }
}

/// Share of the principal held by one investor, in percent.
pub fn share_percent(amount: i64, principal: i64) -> f64 {
    if principal == 0 {
        return 0.0;
    }
    amount as f64 / principal as f64 * 100.0
}

/// Renders the fixed agreement layout as plain text.
pub fn render_agreement(document: &AgreementDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:^80}", "LOAN AGREEMENT");
    out.push('\n');
    let _ = writeln!(out, "Agreement No: {}", document.agreement_no);
    let _ = writeln!(out, "Effective Date: {}", document.effective_on);
    let _ = writeln!(out, "Borrower: {}", document.borrower);
    let _ = writeln!(out, "Loan Amount (Aggregate): {}", document.amount);
    let _ = writeln!(
        out,
        "Interest: {:.2}   Term: {} {}",
        document.rate,
        document.term,
        document.term_unit.label()
    );
    out.push('\n');

    let _ = writeln!(out, "Schedule A - Lender List");
    let rule = format!("+{}+{}+{}+", "-".repeat(42), "-".repeat(17), "-".repeat(11));
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "| {:<40} | {:>15} | {:>9} |", "Lender", "Amount", "Share %");
    let _ = writeln!(out, "{rule}");
    for lender in &document.lenders {
        let _ = writeln!(
            out,
            "| {:<40} | {:>15} | {:>9.2} |",
            lender.name, lender.amount, lender.percent
        );
    }
    let _ = writeln!(out, "{rule}");
    out.push('\n');

    let _ = writeln!(out, "{PARI_PASSU_CLAUSE}");
    out.push('\n');
    let _ = writeln!(out, "Signatures:");
    out.push('\n');
    let _ = writeln!(
        out,
        "{:<45}{}",
        "Borrower: ____________________", "Agent/Lender Rep: ____________"
    );
    out
}

/// Notification sent to one investor once the draft agreement exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgreementMail {
    pub to: String,
    pub investor_name: String,
    pub invest_date: String,
    pub amount: i64,
    pub agreement_url: String,
}

impl AgreementMail {
    pub fn for_investment(
        investor: &Investor,
        investment: &LoanInvestment,
        agreement_url: &str,
    ) -> Self {
        Self {
            to: investor.email.clone(),
            investor_name: investor.email.clone(),
            invest_date: investment.created_at.format(DATE_FORMAT).to_string(),
            amount: investment.amount,
            agreement_url: agreement_url.to_string(),
        }
    }
}
