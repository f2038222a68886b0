use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use crate::{
    donations::{
        eligibility::{Cutoffs, Decision, EligibilityChecker},
        emails::DonationEmail,
    },
    error::Result,
    mail::Mailer,
    storage::{Database, DonationSettings, EmailClaim, User},
};
use tracing::{debug, info, warn};

/// Counts for a single pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub candidates: usize,
    pub sent: usize,
    pub skipped_uploader: usize,
    pub skipped_recent_donation: usize,
    pub skipped_below_threshold: usize,
    pub skipped_no_address: usize,
    /// Stamped by a concurrent run, or already emailed earlier in this run
    pub skipped_already_emailed: usize,
}

impl PassSummary {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Send => self.sent += 1,
            Decision::Uploader => self.skipped_uploader += 1,
            Decision::RecentDonation => self.skipped_recent_donation += 1,
            Decision::BelowThreshold => self.skipped_below_threshold += 1,
            Decision::NoAddress => self.skipped_no_address += 1,
        }
    }
}

/// Runs the reminder and solicitation passes against one store and mailer.
///
/// Remembers who it emailed so a user gets at most one email per engine.
pub struct NotificationEngine<'a, M: Mailer> {
    db: &'a Database,
    mailer: M,
    dry_run: bool,
    emailed: HashSet<i64>,
}

impl<'a, M: Mailer> NotificationEngine<'a, M> {
    pub fn new(db: &'a Database, mailer: M, dry_run: bool) -> Self {
        Self {
            db,
            mailer,
            dry_run,
            emailed: HashSet::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Remind donors whose last donation is older than the donation cutoff
    pub fn run_reminder_pass(&mut self, now: DateTime<Utc>, settings: &DonationSettings) -> Result<PassSummary> {
        let cutoffs = Cutoffs::compute(now, settings)?;
        info!("Starting reminder pass (donations at or before {})", cutoffs.donation);

        let checker = EligibilityChecker::new(self.db, settings, cutoffs);
        let mut summary = PassSummary::default();

        for user_id in self.db.reminder_candidates(cutoffs.donation)? {
            summary.candidates += 1;
            if self.emailed.contains(&user_id) {
                summary.skipped_already_emailed += 1;
                continue;
            }

            let user = self.db.require_user(user_id)?;
            let decision = checker.reminder_decision(&user)?;
            if decision != Decision::Send {
                log_skip(&user, decision);
                summary.record(decision);
                continue;
            }

            if self.deliver(&user, DonationEmail::Reminder, cutoffs.donation, now)? {
                summary.record(Decision::Send);
            } else {
                summary.skipped_already_emailed += 1;
            }
        }

        info!("Reminder pass finished: {} sent of {} candidates", summary.sent, summary.candidates);
        Ok(summary)
    }

    /// Ask heavy downloaders who have not donated recently to donate
    pub fn run_solicitation_pass(&mut self, now: DateTime<Utc>, settings: &DonationSettings) -> Result<PassSummary> {
        let cutoffs = Cutoffs::compute(now, settings)?;
        info!(
            "Starting solicitation pass (downloads since {}, more than {})",
            cutoffs.email, settings.downloads_in_period
        );

        let checker = EligibilityChecker::new(self.db, settings, cutoffs);
        let mut summary = PassSummary::default();

        for count in self.db.solicitation_candidates(cutoffs.email, cutoffs.recent_donor)? {
            summary.candidates += 1;
            if self.emailed.contains(&count.user_id) {
                summary.skipped_already_emailed += 1;
                continue;
            }

            let user = self.db.require_user(count.user_id)?;
            let decision = checker.solicitation_decision(&user, &count)?;
            if decision != Decision::Send {
                log_skip(&user, decision);
                summary.record(decision);
                continue;
            }

            if self.deliver(&user, DonationEmail::Request, cutoffs.email, now)? {
                summary.record(Decision::Send);
            } else {
                summary.skipped_already_emailed += 1;
            }
        }

        info!("Solicitation pass finished: {} sent of {} candidates", summary.sent, summary.candidates);
        Ok(summary)
    }

    /// Claim the user, hand the email off, then keep the stamp.
    /// Returns `false` when another run got the user first.
    fn deliver(
        &mut self,
        user: &User,
        kind: DonationEmail,
        cooldown_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let email = kind.for_user(user);

        if self.dry_run {
            self.mailer.send_templated_email(&email)?;
            self.emailed.insert(user.id);
            return Ok(true);
        }

        let Some(claim) = EmailClaim::acquire(
            self.db,
            user.id,
            user.last_donation_email_sent,
            cooldown_cutoff,
            now,
        )? else {
            return Ok(false);
        };

        // an error here drops the claim, which restores the old stamp
        self.mailer.send_templated_email(&email)?;
        claim.confirm();
        self.emailed.insert(user.id);

        info!("{} sent to user {}", kind, user.id);
        debug!("Stamped last_donation_email_sent = {} for user {}", now, user.id);
        Ok(true)
    }
}

fn log_skip(user: &User, decision: Decision) {
    if decision == Decision::NoAddress {
        warn!("User {} skipped: {}", user.id, decision);
    } else {
        debug!("User {} skipped: {}", user.id, decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::DonationError, mail::MockMailer};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 6, 0, 0).unwrap()
    }

    fn settings() -> DonationSettings {
        DonationSettings {
            minimum_days_since_last_donation: 30,
            minimum_days_since_last_donation_email: 30,
            downloads_in_period: 5,
            never_send_email_to_uploaders: true,
            recent_donation_days: None,
        }
    }

    #[test]
    fn reminder_sends_once_for_many_old_donations() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("ann", "ann@example.org", 0).unwrap();
        db.insert_donation(Some(id), 5.0, now() - Duration::days(90)).unwrap();
        db.insert_donation(Some(id), 5.0, now() - Duration::days(60)).unwrap();

        let mut mailer = MockMailer::new();
        mailer
            .expect_send_templated_email()
            .withf(move |email| email.recipient_id == id && email.template.ends_with("reminder.txt"))
            .times(1)
            .returning(|_| Ok(()));

        let mut engine = NotificationEngine::new(&db, mailer, false);
        let summary = engine.run_reminder_pass(now(), &settings()).unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(db.require_user(id).unwrap().last_donation_email_sent, Some(now()));
    }

    #[test]
    fn mail_failure_aborts_and_restores_stamp() {
        let db = Database::in_memory().unwrap();
        let first = db.insert_user("ann", "ann@example.org", 0).unwrap();
        let second = db.insert_user("ben", "ben@example.org", 0).unwrap();
        db.insert_donation(Some(first), 5.0, now() - Duration::days(90)).unwrap();
        db.insert_donation(Some(second), 5.0, now() - Duration::days(80)).unwrap();

        let mut mailer = MockMailer::new();
        mailer
            .expect_send_templated_email()
            .times(1)
            .returning(|_| Err(DonationError::Mail("relay down".into())));

        let mut engine = NotificationEngine::new(&db, mailer, false);
        let err = engine.run_reminder_pass(now(), &settings()).unwrap_err();

        assert!(matches!(err, DonationError::Mail(_)));
        assert_eq!(db.require_user(first).unwrap().last_donation_email_sent, None);
        assert_eq!(db.require_user(second).unwrap().last_donation_email_sent, None);
    }

    #[test]
    fn dry_run_does_not_stamp() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("ann", "ann@example.org", 0).unwrap();
        db.insert_donation(Some(id), 5.0, now() - Duration::days(90)).unwrap();

        let mut mailer = MockMailer::new();
        mailer.expect_send_templated_email().times(1).returning(|_| Ok(()));

        let mut engine = NotificationEngine::new(&db, mailer, true);
        assert_eq!(engine.run_reminder_pass(now(), &settings()).unwrap().sent, 1);
        assert_eq!(db.require_user(id).unwrap().last_donation_email_sent, None);
    }

    #[test]
    fn user_reminded_is_not_solicited_in_same_run() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("ann", "ann@example.org", 0).unwrap();
        db.insert_donation(Some(id), 5.0, now() - Duration::days(90)).unwrap();
        for _ in 0..8 {
            db.insert_download(id, now()).unwrap();
        }

        let mut settings = settings();
        // a zero cooldown would let the stamp from the reminder pass through
        settings.minimum_days_since_last_donation_email = 0;

        let mut mailer = MockMailer::new();
        mailer.expect_send_templated_email().times(1).returning(|_| Ok(()));

        let mut engine = NotificationEngine::new(&db, mailer, false);
        assert_eq!(engine.run_reminder_pass(now(), &settings).unwrap().sent, 1);
        let solicitation = engine.run_solicitation_pass(now(), &settings).unwrap();
        assert_eq!(solicitation.candidates, 1);
        assert_eq!(solicitation.sent, 0);
        assert_eq!(solicitation.skipped_already_emailed, 1);
    }

    #[test]
    fn blank_address_is_skipped_without_aborting() {
        let db = Database::in_memory().unwrap();
        let blank = db.insert_user("nomail", "", 0).unwrap();
        let good = db.insert_user("ann", "ann@example.org", 0).unwrap();
        db.insert_donation(Some(blank), 5.0, now() - Duration::days(90)).unwrap();
        db.insert_donation(Some(good), 5.0, now() - Duration::days(80)).unwrap();

        let mut mailer = MockMailer::new();
        mailer
            .expect_send_templated_email()
            .withf(move |email| email.recipient_id == good)
            .times(1)
            .returning(|_| Ok(()));

        let mut engine = NotificationEngine::new(&db, mailer, false);
        let summary = engine.run_reminder_pass(now(), &settings()).unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped_no_address, 1);
        assert_eq!(db.require_user(blank).unwrap().last_donation_email_sent, None);
    }

    #[test]
    fn user_stamped_by_another_run_mid_pass_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("donations.db").to_string_lossy().into_owned();
        let db = Database::new(&path).unwrap();
        let other_run = Database::new(&path).unwrap();

        let first = db.insert_user("ann", "ann@example.org", 0).unwrap();
        let second = db.insert_user("ben", "ben@example.org", 0).unwrap();
        db.insert_donation(Some(first), 5.0, now() - Duration::days(90)).unwrap();
        db.insert_donation(Some(second), 5.0, now() - Duration::days(80)).unwrap();

        let mut mailer = MockMailer::new();
        mailer
            .expect_send_templated_email()
            .withf(move |email| email.recipient_id == first)
            .times(1)
            .returning(move |_| {
                // the overlapping run emails the second donor meanwhile
                other_run.set_last_donation_email_sent(second, Some(now()))?;
                Ok(())
            });

        let mut engine = NotificationEngine::new(&db, mailer, false);
        let summary = engine.run_reminder_pass(now(), &settings()).unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped_already_emailed, 1);
    }
}
