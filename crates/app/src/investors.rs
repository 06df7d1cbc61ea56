use std::sync::Arc;

use metrics::counter;
use serde::Deserialize;
use tracing::info;

use loanbook_core::ports::{InvestorRepository, LoanInvestmentRepository};
use loanbook_core::types::{
    Investor, InvestorLookup, InvestorsFilter, LoanInvestment, LoanInvestmentLookup,
    LoanInvestmentsFilter, NewInvestor,
};

use crate::loans::{Clock, LoanServiceError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddInvestorInput {
    pub email: String,
}

/// Investor registration and lookups.
#[derive(Clone)]
pub struct InvestorService {
    investors: Arc<dyn InvestorRepository>,
    clock: Clock,
}

impl InvestorService {
    pub fn new(investors: Arc<dyn InvestorRepository>, clock: Clock) -> Self {
        Self { investors, clock }
    }

    pub async fn add_investor(&self, input: AddInvestorInput) -> Result<Investor, LoanServiceError> {
        let email = input.email.trim();
        if email.is_empty() {
            return Err(LoanServiceError::Validation("email is required".into()));
        }

        let investor = self
            .investors
            .create(NewInvestor {
                email: email.to_string(),
                created_at: (self.clock)(),
            })
            .await?;

        counter!("investors_registered_total").increment(1);
        info!(stage = "investor", investor_id = investor.id, "investor registered");
        Ok(investor)
    }

    pub async fn investors(
        &self,
        filter: &InvestorsFilter,
    ) -> Result<Vec<Investor>, LoanServiceError> {
        Ok(self.investors.investors(filter).await?)
    }

    pub async fn count_investors(&self, filter: &InvestorsFilter) -> Result<i64, LoanServiceError> {
        Ok(self.investors.count_investors(filter).await?)
    }

    pub async fn investor(&self, lookup: &InvestorLookup) -> Result<Investor, LoanServiceError> {
        Ok(self.investors.investor(lookup).await?)
    }
}

/// Read access to recorded investments.
#[derive(Clone)]
pub struct InvestmentService {
    investments: Arc<dyn LoanInvestmentRepository>,
}

impl InvestmentService {
    pub fn new(investments: Arc<dyn LoanInvestmentRepository>) -> Self {
        Self { investments }
    }

    pub async fn loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<Vec<LoanInvestment>, LoanServiceError> {
        Ok(self.investments.loan_investments(filter).await?)
    }

    pub async fn count_loan_investments(
        &self,
        filter: &LoanInvestmentsFilter,
    ) -> Result<i64, LoanServiceError> {
        Ok(self.investments.count_loan_investments(filter).await?)
    }

    pub async fn loan_investment(
        &self,
        lookup: &LoanInvestmentLookup,
    ) -> Result<LoanInvestment, LoanServiceError> {
        Ok(self.investments.loan_investment(lookup).await?)
    }
}
