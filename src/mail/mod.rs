pub mod dry_run;
pub mod outbox;

pub use dry_run::DryRunMailer;
pub use outbox::OutboxMailer;

use serde::Serialize;
use crate::error::Result;

/// A message for the external delivery system: it renders `template` with
/// `context`. `from: None` means the platform's default sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplatedEmail {
    pub recipient_id: i64,
    pub subject: String,
    pub template: String,
    pub context: serde_json::Value,
    pub from: Option<String>,
    pub to: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait Mailer {
    fn send_templated_email(&self, email: &TemplatedEmail) -> Result<()>;
}

impl<M: Mailer + ?Sized> Mailer for &M {
    fn send_templated_email(&self, email: &TemplatedEmail) -> Result<()> {
        (**self).send_templated_email(email)
    }
}
