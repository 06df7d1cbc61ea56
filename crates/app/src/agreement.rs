use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use loanbook_core::agreement::{AgreementBuildError, AgreementDocument, AgreementMail};
use loanbook_core::ports::{
    DocumentError, DocumentGenerator, InvestorRepository, LoanInvestmentRepository,
    LoanRepository, Notifier, NotifyError, RepositoryError,
};
use loanbook_core::types::{InvestorsFilter, LoanInvestmentsFilter, LoanLookup};
use loanbook_util::DeliveryMode;

use crate::loans::Clock;

/// Request to draft and distribute the agreement for a fully funded loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementJob {
    pub loan_id: i64,
}

/// Sending half of the agreement worker's channel.
#[derive(Clone)]
pub struct AgreementQueue {
    sender: mpsc::UnboundedSender<AgreementJob>,
}

impl AgreementQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgreementJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues a job without waiting. Returns `false` when the worker is gone.
    pub fn enqueue(&self, job: AgreementJob) -> bool {
        match self.sender.send(job) {
            Ok(()) => true,
            Err(_) => {
                counter!("agreement_jobs_total", "result" => "dropped").increment(1);
                warn!(stage = "agreement", loan_id = job.loan_id, "agreement worker is not running; job dropped");
                false
            }
        }
    }
}

/// Collaborators required by [`AgreementWorker`].
pub struct AgreementDeps {
    pub loans: Arc<dyn LoanRepository>,
    pub investments: Arc<dyn LoanInvestmentRepository>,
    pub investors: Arc<dyn InvestorRepository>,
    pub documents: Arc<dyn DocumentGenerator>,
    pub notifier: Arc<dyn Notifier>,
    pub delivery: DeliveryMode,
    pub clock: Clock,
}

/// Background worker that drafts the agreement and notifies investors.
pub struct AgreementWorker {
    deps: AgreementDeps,
    jobs: mpsc::UnboundedReceiver<AgreementJob>,
}

/// Result of one processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementOutcome {
    Drafted { url: String, notified: usize },
    AlreadyDrafted,
}

#[derive(Debug, Error)]
pub enum AgreementError {
    #[error("agreement repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Build(#[from] AgreementBuildError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("{} of {attempted} agreement notifications failed", .failures.len())]
    Notify {
        attempted: usize,
        failures: Vec<NotifyError>,
    },
}

impl AgreementWorker {
    pub fn new(deps: AgreementDeps, jobs: mpsc::UnboundedReceiver<AgreementJob>) -> Self {
        Self { deps, jobs }
    }

    /// Runs the worker until every [`AgreementQueue`] handle is dropped and
    /// the queued jobs are drained.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = self.jobs.recv().await {
                self.handle(job).await;
            }
            info!(stage = "agreement", "agreement worker stopped");
        })
    }

    async fn handle(&self, job: AgreementJob) {
        match self.process(job).await {
            Ok(AgreementOutcome::Drafted { url, notified }) => {
                counter!("agreement_jobs_total", "result" => "drafted").increment(1);
                info!(stage = "agreement", loan_id = job.loan_id, %url, notified, "agreement drafted and sent");
            }
            Ok(AgreementOutcome::AlreadyDrafted) => {
                counter!("agreement_jobs_total", "result" => "skipped").increment(1);
                info!(stage = "agreement", loan_id = job.loan_id, "agreement already drafted");
            }
            Err(err) => {
                counter!("agreement_jobs_total", "result" => "failed").increment(1);
                error!(stage = "agreement", loan_id = job.loan_id, error = %err, "agreement job failed");
            }
        }
    }

    pub async fn process(&self, job: AgreementJob) -> Result<AgreementOutcome, AgreementError> {
        let deps = &self.deps;
        let loan = deps.loans.loan(&LoanLookup::by_id(job.loan_id)).await?;
        if loan.draft_agreement_letter_url.is_some() {
            return Ok(AgreementOutcome::AlreadyDrafted);
        }

        let investments = deps
            .investments
            .loan_investments(&LoanInvestmentsFilter::for_loan(loan.id))
            .await?;
        let ids = investments.iter().map(|i| i.investor_id).collect();
        let investors = deps.investors.investors(&InvestorsFilter::by_ids(ids)).await?;

        let document = AgreementDocument::from_funding(&loan, &investments, &investors)?;
        let url = deps.documents.generate(&document).await?;
        deps.loans
            .record_draft_agreement(loan.id, &url, (deps.clock)())
            .await?;

        let by_id: HashMap<i64, _> = investors.iter().map(|i| (i.id, i)).collect();
        let mut attempted = 0;
        let mut failures = Vec::new();
        for investment in &investments {
            // from_funding already rejected unknown investors
            let Some(investor) = by_id.get(&investment.investor_id) else {
                continue;
            };
            let mail = AgreementMail::for_investment(investor, investment, &url);
            attempted += 1;
            match deps.notifier.send_agreement(&mail).await {
                Ok(()) => {
                    counter!("agreement_notifications_total", "result" => "sent").increment(1);
                }
                Err(err) => {
                    counter!("agreement_notifications_total", "result" => "failed").increment(1);
                    warn!(stage = "agreement", loan_id = loan.id, error = %err, "agreement notification failed");
                    failures.push(err);
                    if deps.delivery == DeliveryMode::AbortOnFailure {
                        break;
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(AgreementError::Notify {
                attempted,
                failures,
            });
        }
        Ok(AgreementOutcome::Drafted {
            url,
            notified: attempted,
        })
    }
}

/// Notifier used when no mail relay is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_agreement(&self, mail: &AgreementMail) -> Result<(), NotifyError> {
        info!(
            stage = "agreement",
            to = %mail.to,
            amount = mail.amount,
            url = %mail.agreement_url,
            "mail relay not configured; agreement mail logged only"
        );
        Ok(())
    }
}
