use tracing::info;
use crate::{
    error::Result,
    mail::{Mailer, TemplatedEmail},
};

/// Logs what would be sent and sends nothing
#[derive(Debug, Default)]
pub struct DryRunMailer;

impl Mailer for DryRunMailer {
    fn send_templated_email(&self, email: &TemplatedEmail) -> Result<()> {
        info!(
            "DRY RUN: would send {} to {} (user {})",
            email.template, email.to, email.recipient_id
        );
        Ok(())
    }
}
