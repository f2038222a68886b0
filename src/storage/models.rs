use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// The donation-email settings singleton. Edited by operators, read once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationSettings {
    pub minimum_days_since_last_donation: i64,
    pub minimum_days_since_last_donation_email: i64,
    pub downloads_in_period: i64,
    pub never_send_email_to_uploaders: bool,
    /// Window that makes a donor "recent" for solicitations.
    /// `None` falls back to `minimum_days_since_last_donation`.
    pub recent_donation_days: Option<i64>,
}

impl Default for DonationSettings {
    fn default() -> Self {
        Self {
            minimum_days_since_last_donation: 365,
            minimum_days_since_last_donation_email: 90,
            downloads_in_period: 100,
            never_send_email_to_uploaders: true,
            recent_donation_days: None,
        }
    }
}

impl DonationSettings {
    /// Uploaders are left alone when the settings say so
    pub fn exempts(&self, user: &User) -> bool {
        self.never_send_email_to_uploaders && user.is_uploader()
    }
}

/// Partial update of [`DonationSettings`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub minimum_days_since_last_donation: Option<i64>,
    pub minimum_days_since_last_donation_email: Option<i64>,
    pub downloads_in_period: Option<i64>,
    pub never_send_email_to_uploaders: Option<bool>,
    pub recent_donation_days: Option<Option<i64>>,
}

impl SettingsUpdate {
    pub fn apply(&self, settings: &mut DonationSettings) {
        if let Some(days) = self.minimum_days_since_last_donation {
            settings.minimum_days_since_last_donation = days;
        }
        if let Some(days) = self.minimum_days_since_last_donation_email {
            settings.minimum_days_since_last_donation_email = days;
        }
        if let Some(count) = self.downloads_in_period {
            settings.downloads_in_period = count;
        }
        if let Some(flag) = self.never_send_email_to_uploaders {
            settings.never_send_email_to_uploaders = flag;
        }
        if let Some(days) = self.recent_donation_days {
            settings.recent_donation_days = days;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub num_sounds: i64,
    pub last_donation_email_sent: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_uploader(&self) -> bool {
        self.num_sounds > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: i64,
    pub user_id: Option<i64>,
    pub amount: f64,
    pub created: DateTime<Utc>,
}

/// A user and how many downloads they made inside the solicitation window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCount {
    pub user_id: i64,
    pub downloads: i64,
}

/// An email queued for the external delivery system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEmail {
    pub id: i64,
    pub user_id: i64,
    pub to_address: String,
    pub from_address: Option<String>,
    pub subject: String,
    pub template: String,
    pub context: serde_json::Value,
    pub created: DateTime<Utc>,
}
