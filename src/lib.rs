// Core modules
pub mod api;
pub mod candles;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod session;
pub mod strategy;
pub mod ws;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Error, Result};
pub use models::*;
pub use session::{SessionManager, SubscriptionParams, SubscriptionStatus};
pub use strategy::Strategy;
