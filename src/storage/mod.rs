pub mod claim;
pub mod db;
pub mod models;

pub use claim::EmailClaim;
pub use db::Database;
pub use models::{DonationSettings, SettingsUpdate, User, Donation, DownloadCount, OutboxEmail};
