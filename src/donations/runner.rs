use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use crate::{
    donations::engine::{NotificationEngine, PassSummary},
    error::Result,
    mail::Mailer,
    storage::{Database, DonationSettings},
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PassSelection {
    #[default]
    All,
    Reminders,
    Solicitations,
}

impl PassSelection {
    fn reminders(&self) -> bool {
        matches!(self, PassSelection::All | PassSelection::Reminders)
    }

    fn solicitations(&self) -> bool {
        matches!(self, PassSelection::All | PassSelection::Solicitations)
    }
}

/// Loads settings once and runs the selected passes with a single `now`
pub struct NotificationRunner<'a, M: Mailer> {
    db: &'a Database,
    engine: NotificationEngine<'a, M>,
}

impl<'a, M: Mailer> NotificationRunner<'a, M> {
    pub fn new(db: &'a Database, mailer: M, dry_run: bool) -> Self {
        Self {
            db,
            engine: NotificationEngine::new(db, mailer, dry_run),
        }
    }

    pub fn run(&mut self, now: DateTime<Utc>, passes: PassSelection) -> Result<RunSummary> {
        info!("Sending donation emails");
        let settings = self.db.get_or_create_settings()?;

        let reminders = if passes.reminders() {
            Some(self.engine.run_reminder_pass(now, &settings)?)
        } else {
            None
        };

        let solicitations = if passes.solicitations() {
            Some(self.engine.run_solicitation_pass(now, &settings)?)
        } else {
            None
        };

        info!("Finished sending donation emails");

        Ok(RunSummary {
            started_at: now,
            dry_run: self.engine.is_dry_run(),
            settings,
            reminders,
            solicitations,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub settings: DonationSettings,
    pub reminders: Option<PassSummary>,
    pub solicitations: Option<PassSummary>,
}

impl RunSummary {
    pub fn total_sent(&self) -> usize {
        self.reminders.as_ref().map_or(0, |p| p.sent)
            + self.solicitations.as_ref().map_or(0, |p| p.sent)
    }

    /// Print a formatted summary to console
    pub fn print_summary(&self) {
        println!("\n{}", "=== Donation Email Run ===".cyan().bold());
        println!("Run at:        {}", crate::utils::format_timestamp(&self.started_at));
        if self.dry_run {
            println!("{}", "DRY RUN: nothing was stamped or queued".yellow());
        }

        if let Some(pass) = &self.reminders {
            print_pass("Reminders", pass);
        }
        if let Some(pass) = &self.solicitations {
            print_pass("Solicitations", pass);
        }

        println!("\nTotal sent:    {}", self.total_sent().to_string().green());
    }
}

fn print_pass(title: &str, pass: &PassSummary) {
    println!("\n{}", format!("{}:", title).yellow());
    println!("  Candidates:         {}", pass.candidates);
    println!("  Sent:               {}", pass.sent.to_string().green());
    println!("  Uploaders skipped:  {}", pass.skipped_uploader);
    println!("  Recent donors:      {}", pass.skipped_recent_donation);
    println!("  Below threshold:    {}", pass.skipped_below_threshold);
    println!("  No address:         {}", pass.skipped_no_address);
    println!("  Already emailed:    {}", pass.skipped_already_emailed);
}
