mod agreement;
mod documents;
mod investors;
mod loans;
mod problem;
mod router;
mod telemetry;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{info, warn};
use url::Url;

use loanbook_core::ports::Notifier;
use loanbook_mail::MailRelayClient;
use loanbook_storage::Database;
use loanbook_util::{load_env_file, AppConfig};

use crate::agreement::{AgreementDeps, AgreementQueue, AgreementWorker, LogNotifier};
use crate::documents::FileAgreementWriter;
use crate::investors::{InvestmentService, InvestorService};
use crate::loans::{Clock, LoanService, LoanServiceDeps};

const MAIL_RELAY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let clock: Clock = Arc::new(Utc::now);
    let notifier = build_notifier(&config)?;
    let documents = FileAgreementWriter::new(&config.agreement_dir, &config.public_url);
    info!(stage = "app", dir = %documents.dir().display(), delivery = config.delivery_mode.as_str(), "agreement worker configured");

    let (queue, jobs) = AgreementQueue::channel();
    let worker = AgreementWorker::new(
        AgreementDeps {
            loans: Arc::new(database.loans()),
            investments: Arc::new(database.loan_investments()),
            investors: Arc::new(database.investors()),
            documents: Arc::new(documents),
            notifier,
            delivery: config.delivery_mode,
            clock: clock.clone(),
        },
        jobs,
    )
    .spawn();

    let loans = LoanService::new(LoanServiceDeps {
        loans: Arc::new(database.loans()),
        investments: Arc::new(database.loan_investments()),
        investors: Arc::new(database.investors()),
        agreements: queue,
        clock: clock.clone(),
    });
    let investors = InvestorService::new(Arc::new(database.investors()), clock);
    let investments = InvestmentService::new(Arc::new(database.loan_investments()));
    let state = router::AppState::new(metrics, loans, investors, investments);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(stage = "app", "HTTP server stopped; draining agreement jobs");
    worker.await?;
    Ok(())
}

fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>, Box<dyn std::error::Error>> {
    match &config.mail_relay_url {
        Some(raw) => {
            let endpoint = Url::parse(raw)?;
            let http = reqwest::Client::builder()
                .timeout(MAIL_RELAY_TIMEOUT)
                .build()?;
            info!(stage = "app", relay = %endpoint, "mail relay enabled");
            Ok(Arc::new(MailRelayClient::new(
                endpoint,
                config.mail_from.clone(),
                http,
            )))
        }
        None => {
            warn!(stage = "app", "MAIL_RELAY_URL not set; agreement mails will only be logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
