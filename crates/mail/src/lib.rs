pub mod relay;

pub use relay::{format_amount, render_agreement_mail, MailError, MailRelayClient, AGREEMENT_SUBJECT};
