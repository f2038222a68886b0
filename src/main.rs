mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use colored::*;
use donation_mailer::{
    config::{Config, DEFAULT_LOG_FILTER},
    donations::{NotificationRunner, PassSelection},
    error,
    mail::{DryRunMailer, OutboxMailer},
    storage::{self, SettingsUpdate},
    utils,
};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    let config = Config::load(&cli.config);

    let filter = config
        .as_ref()
        .map(|cfg| cfg.logging.filter.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { dry_run, pass, format } => {
            run_job(&config, dry_run || config.mail.dry_run, pass, &format)
        }

        Commands::Settings { format } => show_settings(&config, &format),

        Commands::SettingsSet {
            minimum_days_since_last_donation,
            minimum_days_since_last_donation_email,
            downloads_in_period,
            never_send_email_to_uploaders,
            recent_donation_days,
            clear_recent_donation_days,
        } => {
            let recent_donation_days = if clear_recent_donation_days {
                Some(None)
            } else {
                recent_donation_days.map(Some)
            };
            update_settings(&config, SettingsUpdate {
                minimum_days_since_last_donation,
                minimum_days_since_last_donation_email,
                downloads_in_period,
                never_send_email_to_uploaders,
                recent_donation_days,
            })
        }

        Commands::Outbox { limit, format } => show_outbox(&config, limit, &format),

        Commands::Init => {
            info!("Initializing...");
            initialize(&config)
        }
    };

    if let Err(e) = result {
        error!("{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
}

fn open_database(config: &Config) -> error::Result<storage::Database> {
    storage::Database::with_busy_timeout(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
}

fn run_job(config: &Config, dry_run: bool, pass: PassSelection, format: &str) -> error::Result<()> {
    let db = open_database(config)?;
    let now = chrono::Utc::now();

    let summary = if dry_run {
        NotificationRunner::new(&db, DryRunMailer, true).run(now, pass)?
    } else {
        let mailer = OutboxMailer::new(&db, config.mail.from_address.clone());
        NotificationRunner::new(&db, mailer, false).run(now, pass)?
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print_summary();
    }
    Ok(())
}

fn show_settings(config: &Config, format: &str) -> error::Result<()> {
    let db = open_database(config)?;
    let settings = db.get_or_create_settings()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    println!("{}", "=== Donation Email Settings ===".cyan().bold());
    println!("  Days since last donation:        {}", settings.minimum_days_since_last_donation);
    println!("  Days between donation emails:    {}", settings.minimum_days_since_last_donation_email);
    println!("  Downloads in period:             {}", settings.downloads_in_period);
    println!("  Never email uploaders:           {}", settings.never_send_email_to_uploaders);
    match settings.recent_donation_days {
        Some(days) => println!("  Recent donation window (days):   {}", days),
        None => println!("  Recent donation window (days):   {}", "same as days since last donation".dimmed()),
    }
    Ok(())
}

fn update_settings(config: &Config, update: SettingsUpdate) -> error::Result<()> {
    let db = open_database(config)?;
    let settings = db.update_settings(&update)?;
    info!("Donation email settings updated: {:?}", settings);
    println!("{}", "✓ Settings updated".green());
    show_settings(config, "table")
}

fn show_outbox(config: &Config, limit: usize, format: &str) -> error::Result<()> {
    let db = open_database(config)?;
    let emails = db.get_outbox(Some(limit))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&emails)?);
        return Ok(());
    }

    println!("{}", "=== Queued Donation Emails ===".cyan().bold());
    for (template, count) in db.count_outbox_by_template()? {
        println!("  {:<40} {}", template, count);
    }

    if emails.is_empty() {
        println!("\n{}", "Outbox is empty".yellow());
        return Ok(());
    }

    println!();
    utils::print_table_border(100);
    utils::print_table_row(&["Queued", "User", "To", "Template"], &[24, 8, 30, 38]);
    utils::print_table_border(100);
    for email in &emails {
        utils::print_table_row(
            &[
                &utils::format_timestamp(&email.created),
                &email.user_id.to_string(),
                &email.to_address,
                &email.template,
            ],
            &[24, 8, 30, 38],
        );
    }
    utils::print_table_border(100);
    Ok(())
}

fn initialize(config: &Config) -> error::Result<()> {
    println!("{}", "Initializing donation mailer...".green());
    let db = open_database(config)?;
    let settings = db.get_or_create_settings()?;
    println!("{}", "✓ Database initialized".green());
    println!("{}", "✓ Configuration loaded".green());
    println!("\n{}", "Configuration:".cyan());
    println!("  Database:       {}", config.database.path);
    println!("  Sender:         {}", config.mail.from_address);
    println!("  Dry Run:        {}", config.mail.dry_run);
    println!("  Remind after:   {} days", settings.minimum_days_since_last_donation);

    println!("\n{}", "Ready to use! Try running:".cyan());
    println!("  {} to preview the next run", "donation-mails run --dry-run".yellow());
    println!("  {} to review settings", "donation-mails settings".yellow());
    Ok(())
}
