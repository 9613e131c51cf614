//! courtside - campus sports venue booking automation
//!
//! A slot-acquisition toolkit for a time-slotted venue reservation platform
//! that protects its order endpoint with an encrypted handshake and
//! short-lived per-slot authorization tokens.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and platform endpoints
//! - [`protocol`] - Order wire codec (encrypted body, signed headers)
//! - [`client`] - HTTP platform client with rate limiting
//! - [`credentials`] - Account session store and keep-alive refresh
//! - [`auth`] - Credential login flow with pluggable captcha solving
//! - [`monitor`] - Slot polling, normalization and aggregation
//! - [`booking`] - Auto-booking decision engine
//! - [`scheduler`] - Precision fire-at scheduler and account failover
//! - [`jobs`] - Durable background job orchestration
//! - [`models`] - Core data structures and types
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use courtside::client::PlatformClient;
//! use courtside::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let client = PlatformClient::new(&config)?;
//!     // client.day_slots(...).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod booking;
pub mod client;
pub mod config;
pub mod credentials;
pub mod jobs;
pub mod models;
pub mod monitor;
pub mod protocol;
pub mod scheduler;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::PlatformClient;
    pub use crate::config::Config;
    pub use crate::credentials::{AccountSession, CredentialStore};
    pub use crate::models::{AvailabilityWindow, Slot, SubmissionOutcome, Target};
    pub use crate::monitor::SlotMonitor;
    pub use crate::utils::error::{ApiError, BookingError, ParseError};
}

// Direct re-exports for convenience
pub use models::{AvailabilityWindow, Slot, SubmissionOutcome, Target};
