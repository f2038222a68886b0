use serde_json::json;
use crate::{mail::TemplatedEmail, storage::User};

pub const SUBJECT: &str = "Donation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationEmail {
    /// Thank-you and reminder to a past donor
    Reminder,
    /// Request to a heavy downloader who has not donated
    Request,
}

impl DonationEmail {
    pub fn template(&self) -> &'static str {
        match self {
            DonationEmail::Reminder => "donations/email_donation_reminder.txt",
            DonationEmail::Request => "donations/email_donation_request.txt",
        }
    }

    pub fn for_user(&self, user: &User) -> TemplatedEmail {
        TemplatedEmail {
            recipient_id: user.id,
            subject: SUBJECT.to_string(),
            template: self.template().to_string(),
            context: json!({
                "user": {
                    "id": user.id,
                    "username": user.username,
                    "email": user.email,
                }
            }),
            from: None,
            to: user.email.clone(),
        }
    }
}

impl std::fmt::Display for DonationEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DonationEmail::Reminder => write!(f, "Reminder of donation"),
            DonationEmail::Request => write!(f, "Donation request"),
        }
    }
}
