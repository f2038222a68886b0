use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use crate::{error::Result, storage::Database};

/// Exclusive right to email one user, taken with a compare-and-stamp.
///
/// Confirm after the email has been handed off. Dropping an unconfirmed claim
/// puts the previous `last_donation_email_sent` back.
pub struct EmailClaim<'a> {
    db: &'a Database,
    user_id: i64,
    previous: Option<DateTime<Utc>>,
    stamped_at: DateTime<Utc>,
    confirmed: bool,
}

impl<'a> EmailClaim<'a> {
    /// Returns `None` when another run already emailed the user inside the cooldown
    pub fn acquire(
        db: &'a Database,
        user_id: i64,
        previous: Option<DateTime<Utc>>,
        cooldown_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        if !db.compare_and_stamp(user_id, previous, cooldown_cutoff, now)? {
            debug!("User {} already claimed by another run", user_id);
            return Ok(None);
        }

        Ok(Some(Self {
            db,
            user_id,
            previous,
            stamped_at: now,
            confirmed: false,
        }))
    }

    pub fn confirm(mut self) {
        self.confirmed = true;
    }
}

impl Drop for EmailClaim<'_> {
    fn drop(&mut self) {
        if self.confirmed {
            return;
        }

        match self.db.restore_stamp(self.user_id, self.stamped_at, self.previous) {
            Ok(true) => debug!("Released email claim on user {}", self.user_id),
            Ok(false) => warn!("Email claim on user {} was overwritten before release", self.user_id),
            Err(e) => warn!("Failed to release email claim on user {}: {}", self.user_id, e),
        }
    }
}
