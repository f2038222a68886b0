use chrono::Utc;
use tracing::debug;
use crate::{
    error::{DonationError, Result},
    mail::{Mailer, TemplatedEmail},
    storage::Database,
};

/// Queues emails in the `email_outbox` table for the delivery worker
pub struct OutboxMailer<'a> {
    db: &'a Database,
    default_from: String,
}

impl<'a> OutboxMailer<'a> {
    pub fn new(db: &'a Database, default_from: impl Into<String>) -> Self {
        Self {
            db,
            default_from: default_from.into(),
        }
    }
}

impl Mailer for OutboxMailer<'_> {
    fn send_templated_email(&self, email: &TemplatedEmail) -> Result<()> {
        if email.to.trim().is_empty() {
            return Err(DonationError::Mail(format!(
                "user {} has no email address",
                email.recipient_id
            )));
        }

        let from = email.from.as_deref().unwrap_or(&self.default_from);
        let id = self.db.enqueue_email(
            email.recipient_id,
            &email.to,
            Some(from),
            &email.subject,
            &email.template,
            &email.context,
            Utc::now(),
        )?;

        debug!("Queued {} for {} as outbox #{}", email.template, email.to, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> TemplatedEmail {
        TemplatedEmail {
            recipient_id: 7,
            subject: "Donation".into(),
            template: "donations/email_donation_request.txt".into(),
            context: serde_json::json!({ "user": { "id": 7 } }),
            from: None,
            to: to.into(),
        }
    }

    #[test]
    fn queues_with_default_sender() {
        let db = Database::in_memory().unwrap();
        let mailer = OutboxMailer::new(&db, "donations@example.org");

        mailer.send_templated_email(&email("u@example.org")).unwrap();

        let queued = db.get_outbox(None).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].from_address.as_deref(), Some("donations@example.org"));
        assert_eq!(queued[0].user_id, 7);
    }

    #[test]
    fn refuses_blank_address() {
        let db = Database::in_memory().unwrap();
        let mailer = OutboxMailer::new(&db, "donations@example.org");

        let err = mailer.send_templated_email(&email("  ")).unwrap_err();
        assert!(matches!(err, DonationError::Mail(_)));
        assert!(db.get_outbox(None).unwrap().is_empty());
    }
}
