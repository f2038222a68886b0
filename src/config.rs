use serde::Deserialize;

/// Application configuration. The donation-email policy settings live in the
/// database (see [`crate::storage::DonationSettings`]), not here.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub mail: MailConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    /// Sender used when an email does not name one
    pub from_address: String,
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub filter: String,
}

pub const DEFAULT_CONFIG_PATH: &str = "config/default";
pub const DEFAULT_LOG_FILTER: &str = "donation_mailer=info,info";

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .set_default("database.path", "donations.db")?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("mail.from_address", "donations@localhost")?
            .set_default("mail.dry_run", false)?
            .set_default("logging.filter", DEFAULT_LOG_FILTER)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("DONATIONS").separator("__"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.database.path.trim().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        if !self.mail.from_address.contains('@') {
            anyhow::bail!("Invalid mail.from_address: {}", self.mail.from_address);
        }
        Ok(())
    }
}
