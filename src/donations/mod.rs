pub mod eligibility;
pub mod emails;
pub mod engine;
pub mod runner;

pub use eligibility::{Cutoffs, Decision, EligibilityChecker};
pub use emails::DonationEmail;
pub use engine::{NotificationEngine, PassSummary};
pub use runner::{NotificationRunner, PassSelection, RunSummary};
