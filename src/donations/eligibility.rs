use chrono::{DateTime, Duration, Utc};
use crate::{
    error::{DonationError, Result},
    storage::{Database, DonationSettings, DownloadCount, User},
};
use tracing::debug;

/// Time boundaries for one run, all derived from the same `now`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    /// Donations at or before this are old enough to remind about
    pub donation: DateTime<Utc>,
    /// Start of the download window and of the re-solicitation cooldown
    pub email: DateTime<Utc>,
    /// Donations after this make a user a recent donor, exempt from solicitation
    pub recent_donor: DateTime<Utc>,
}

impl Cutoffs {
    pub fn compute(now: DateTime<Utc>, settings: &DonationSettings) -> Result<Self> {
        let donation = days_before(now, settings.minimum_days_since_last_donation)?;
        let email = days_before(now, settings.minimum_days_since_last_donation_email)?;
        let recent_donor = match settings.recent_donation_days {
            Some(days) => days_before(now, days)?,
            None => donation,
        };

        Ok(Self { donation, email, recent_donor })
    }
}

fn has_address(user: &User) -> bool {
    !user.email.trim().is_empty()
}

fn days_before(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| DonationError::Config(format!("{} days is out of range", days)))
}

/// Why a candidate did or did not get an email
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    Uploader,
    RecentDonation,
    BelowThreshold,
    NoAddress,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Send => write!(f, "eligible"),
            Decision::Uploader => write!(f, "uploader (exempt)"),
            Decision::RecentDonation => write!(f, "donated recently"),
            Decision::BelowThreshold => write!(f, "not enough downloads"),
            Decision::NoAddress => write!(f, "no email address"),
        }
    }
}

pub struct EligibilityChecker<'a> {
    db: &'a Database,
    settings: &'a DonationSettings,
    cutoffs: Cutoffs,
}

impl<'a> EligibilityChecker<'a> {
    pub fn new(db: &'a Database, settings: &'a DonationSettings, cutoffs: Cutoffs) -> Self {
        Self { db, settings, cutoffs }
    }

    /// A donor is reminded unless they upload (when exempted) or donated
    /// again after the donation cutoff.
    pub fn reminder_decision(&self, user: &User) -> Result<Decision> {
        if !has_address(user) {
            return Ok(Decision::NoAddress);
        }

        if self.settings.exempts(user) {
            debug!("User {} is an uploader", user.id);
            return Ok(Decision::Uploader);
        }

        if self.db.has_donation_after(user.id, self.cutoffs.donation)? {
            debug!("User {} has a donation after {}", user.id, self.cutoffs.donation);
            return Ok(Decision::RecentDonation);
        }

        Ok(Decision::Send)
    }

    /// A heavy downloader is solicited unless they upload (when exempted) or
    /// most of their downloads predate a donation made after the donation cutoff.
    pub fn solicitation_decision(&self, user: &User, count: &DownloadCount) -> Result<Decision> {
        if count.downloads <= self.settings.downloads_in_period {
            return Ok(Decision::BelowThreshold);
        }

        if !has_address(user) {
            return Ok(Decision::NoAddress);
        }

        if self.settings.exempts(user) {
            debug!("User {} is an uploader", user.id);
            return Ok(Decision::Uploader);
        }

        let Some(donation) = self.db.latest_donation_after(user.id, self.cutoffs.donation)? else {
            return Ok(Decision::Send);
        };

        let window_start = donation.created.max(self.cutoffs.email);
        let downloads = self.db.count_downloads_since(user.id, window_start)?;
        debug!(
            "User {} donated at {}, {} downloads since {}",
            user.id, donation.created, downloads, window_start
        );

        if downloads > self.settings.downloads_in_period {
            Ok(Decision::Send)
        } else {
            Ok(Decision::RecentDonation)
        }
    }
}
