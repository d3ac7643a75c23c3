//! cgkeeper daemon
//!
//! Configuration, logging setup and the startup sequence behind the
//! `cgkeeper` binary.

pub mod config;
pub mod logging;
pub mod runner;

pub use config::Config;
pub use logging::init_logging;
pub use runner::{supervise, LaunchPlan};
