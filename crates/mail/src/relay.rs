use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use loanbook_core::agreement::AgreementMail;
use loanbook_core::ports::{Notifier, NotifyError};

pub const AGREEMENT_SUBJECT: &str = "Your investment agreement (PDF link inside)";

/// Client that hands rendered mail to an HTTP mail relay.
#[derive(Clone)]
pub struct MailRelayClient {
    http: Client,
    endpoint: Url,
    from: String,
}

impl MailRelayClient {
    /// Creates a new relay client posting to `endpoint`.
    pub fn new(endpoint: Url, from: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            endpoint,
            from: from.into(),
        }
    }

    /// Renders and posts the agreement mail for one investor.
    pub async fn send(&self, mail: &AgreementMail) -> Result<(), MailError> {
        let html = render_agreement_mail(mail);
        let message = RelayMessage {
            from: &self.from,
            to: &mail.to,
            subject: AGREEMENT_SUBJECT,
            html: &html,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&message)
            .send()
            .await?;

        ensure_success(response).await
    }
}

#[async_trait]
impl Notifier for MailRelayClient {
    async fn send_agreement(&self, mail: &AgreementMail) -> Result<(), NotifyError> {
        self.send(mail).await.map_err(|err| NotifyError {
            recipient: mail.to.clone(),
            source: Box::new(err),
        })
    }
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Errors produced by the relay client.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), MailError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailError::Status { status, body });
    }
    Ok(())
}

/// Formats an amount with `.` as the thousands separator, e.g. `1.250.000`.
pub fn format_amount(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        grouped.push('-');
    }
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    grouped
}

/// HTML body of the investor agreement mail.
pub fn render_agreement_mail(mail: &AgreementMail) -> String {
    let name = escape(&mail.investor_name);
    let url = escape(&mail.agreement_url);
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <body>\n\
         <p>Hi {name},</p>\n\
         <p>Thank you for your investment of Rp {amount} on {date}. \
         The loan you funded is now fully invested and your agreement letter is ready.</p>\n\
         <p><a href=\"{url}\">Download your agreement letter</a></p>\n\
         <p>If the link does not work, copy this address into your browser:<br>{url}</p>\n\
         </body>\n\
         </html>\n",
        amount = format_amount(mail.amount),
        date = escape(&mail.invest_date),
    )
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
