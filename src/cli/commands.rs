use clap::{Parser, Subcommand};
use donation_mailer::donations::PassSelection;

#[derive(Parser)]
#[command(name = "donation-mails")]
#[command(about = "Send donation reminder and request emails")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = donation_mailer::config::DEFAULT_CONFIG_PATH)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reminder and solicitation passes
    Run {
        /// Log the emails that would be sent without queueing or stamping anything
        #[arg(long)]
        dry_run: bool,

        /// Which passes to run
        #[arg(short, long, value_enum, default_value_t = PassSelection::All)]
        pass: PassSelection,

        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the donation email settings
    Settings {
        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Change donation email settings
    SettingsSet {
        /// Days after a donation before the donor is reminded
        #[arg(long)]
        minimum_days_since_last_donation: Option<i64>,

        /// Days between two donation emails to the same user
        #[arg(long)]
        minimum_days_since_last_donation_email: Option<i64>,

        /// Downloads in the email window above which a user is asked to donate
        #[arg(long)]
        downloads_in_period: Option<i64>,

        /// Never email users who uploaded sounds
        #[arg(long)]
        never_send_email_to_uploaders: Option<bool>,

        /// Days a donation keeps its donor out of the solicitation pass
        #[arg(long, conflicts_with = "clear_recent_donation_days")]
        recent_donation_days: Option<i64>,

        /// Use the reminder window for recent donors again
        #[arg(long)]
        clear_recent_donation_days: bool,
    },

    /// List queued emails, newest first
    Outbox {
        /// Maximum number of emails to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Initialize database and settings
    Init,
}
