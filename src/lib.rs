pub mod donations;
pub mod mail;
pub mod storage;
pub mod config;
pub mod error;
pub mod utils;

pub use error::{Result, DonationError};
pub use config::Config;
