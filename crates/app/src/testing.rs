//! Shared fixtures for the service and router tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use loanbook_core::agreement::{AgreementDocument, AgreementMail};
use loanbook_core::ports::{
    DocumentError, DocumentGenerator, InvestorRepository, LoanRepository, Notifier, NotifyError,
};
use loanbook_core::types::{Investor, Loan, LoanStatus, NewInvestor, NewLoan, TermUnit};
use loanbook_storage::Database;
use loanbook_util::DeliveryMode;

use crate::agreement::{AgreementDeps, AgreementQueue, AgreementWorker};
use crate::investors::{AddInvestorInput, InvestmentService, InvestorService};
use crate::loans::{ApproveLoanInput, LoanService, LoanServiceDeps, ProposeLoanInput};

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

/// File-backed database removed when dropped.
pub struct TestDb {
    _dir: TempDir,
    database: Database,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loanbook.db");
        let database = Database::connect(&format!("sqlite://{}", path.display()))
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        Self {
            _dir: dir,
            database,
        }
    }

    pub fn database(&self) -> Database {
        self.database.clone()
    }
}

pub async fn seed_loan(database: &Database, amount: i64, status: LoanStatus) -> Loan {
    database
        .loans()
        .create(NewLoan {
            user_id: 21,
            amount,
            rate: 12.5,
            term: 10,
            term_unit: TermUnit::Weekly,
            status: Some(status),
            created_at: fixed_now(),
        })
        .await
        .expect("seed loan")
}

pub async fn seed_investor(database: &Database, email: &str) -> Investor {
    database
        .investors()
        .create(NewInvestor {
            email: email.to_string(),
            created_at: fixed_now(),
        })
        .await
        .expect("seed investor")
}

/// Document generator that records its input and returns a predictable URL.
#[derive(Default)]
pub struct RecordingDocuments {
    calls: Mutex<Vec<AgreementDocument>>,
}

impl RecordingDocuments {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<AgreementDocument> {
        self.calls.lock().expect("documents lock").clone()
    }
}

#[async_trait]
impl DocumentGenerator for RecordingDocuments {
    async fn generate(&self, document: &AgreementDocument) -> Result<String, DocumentError> {
        self.calls
            .lock()
            .expect("documents lock")
            .push(document.clone());
        Ok(format!(
            "https://files.test/agreements/{}.txt",
            document.agreement_no
        ))
    }
}

/// Notifier that records deliveries and fails for selected recipients.
#[derive(Default)]
pub struct RecordingNotifier {
    failing: HashSet<String>,
    attempts: Mutex<Vec<String>>,
    sent: Mutex<Vec<AgreementMail>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(recipients: impl IntoIterator<Item = &'static str>) -> Arc<Self> {
        Arc::new(Self {
            failing: recipients.into_iter().map(str::to_string).collect(),
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().expect("notifier lock").clone()
    }

    pub fn sent(&self) -> Vec<AgreementMail> {
        self.sent.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_agreement(&self, mail: &AgreementMail) -> Result<(), NotifyError> {
        self.attempts
            .lock()
            .expect("notifier lock")
            .push(mail.to.clone());
        if self.failing.contains(&mail.to) {
            return Err(NotifyError {
                recipient: mail.to.clone(),
                source: "relay rejected recipient".into(),
            });
        }
        self.sent.lock().expect("notifier lock").push(mail.clone());
        Ok(())
    }
}

/// Services wired to a fresh database and a running agreement worker.
pub struct Harness {
    db: TestDb,
    pub loans: LoanService,
    pub investors: InvestorService,
    pub investments: InvestmentService,
    documents: Arc<RecordingDocuments>,
    notifier: Arc<RecordingNotifier>,
    worker: JoinHandle<()>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_notifier(RecordingNotifier::new(), DeliveryMode::AbortOnFailure).await
    }

    pub async fn with_notifier(notifier: Arc<RecordingNotifier>, delivery: DeliveryMode) -> Self {
        let db = TestDb::new().await;
        let database = db.database();
        let documents = RecordingDocuments::new();
        let (queue, jobs) = AgreementQueue::channel();

        let worker = AgreementWorker::new(
            AgreementDeps {
                loans: Arc::new(database.loans()),
                investments: Arc::new(database.loan_investments()),
                investors: Arc::new(database.investors()),
                documents: documents.clone(),
                notifier: notifier.clone(),
                delivery,
                clock: Arc::new(fixed_now),
            },
            jobs,
        )
        .spawn();

        Self {
            loans: loan_service(&database, queue),
            investors: InvestorService::new(Arc::new(database.investors()), Arc::new(fixed_now)),
            investments: InvestmentService::new(Arc::new(database.loan_investments())),
            db,
            documents,
            notifier,
            worker,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        fixed_now()
    }

    pub async fn investor(&self, email: &str) -> Investor {
        self.investors
            .add_investor(AddInvestorInput {
                email: email.to_string(),
            })
            .await
            .expect("add investor")
    }

    /// Proposes and approves a loan through the service.
    pub async fn approved_loan(&self, amount: i64) -> Loan {
        let loan = self
            .loans
            .propose_loan(ProposeLoanInput {
                user_id: 21,
                amount,
                rate: 12.5,
                term: 10,
                term_unit: "WEEKLY".into(),
            })
            .await
            .expect("propose");
        self.loans
            .approve_loan(ApproveLoanInput {
                id: loan.id,
                employee_id: 7,
                photo_proof_url: "https://files.test/proof.jpg".into(),
            })
            .await
            .expect("approve")
    }

    pub async fn execute(&self, sql: &str) {
        sqlx::query(sql)
            .execute(self.db.database.pool())
            .await
            .expect("execute");
    }

    /// Closes the agreement queue and waits for the worker to drain it.
    pub async fn settle(self) -> Settled {
        let Self {
            db,
            loans,
            investors,
            investments,
            documents,
            notifier,
            worker,
        } = self;
        drop((loans, investors, investments));
        worker.await.expect("agreement worker");

        let (closed, _) = AgreementQueue::channel();
        let loans = loan_service(&db.database, closed);
        Settled {
            _db: db,
            documents,
            notifier,
            loans,
        }
    }
}

fn loan_service(database: &Database, agreements: AgreementQueue) -> LoanService {
    LoanService::new(LoanServiceDeps {
        loans: Arc::new(database.loans()),
        investments: Arc::new(database.loan_investments()),
        investors: Arc::new(database.investors()),
        agreements,
        clock: Arc::new(fixed_now),
    })
}

/// State left behind once the agreement worker has stopped.
pub struct Settled {
    _db: TestDb,
    pub documents: Arc<RecordingDocuments>,
    pub notifier: Arc<RecordingNotifier>,
    pub loans: LoanService,
}

impl Settled {
    pub async fn loan(&self, id: i64) -> Loan {
        self.loans.loan(id).await.expect("load loan")
    }
}
