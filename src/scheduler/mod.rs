//! Timed firing and account failover
//!
//! Two cooperating pieces live here:
//!
//! - [`precision`] - arms ahead of a fixed wall-clock instant and fires a
//!   tight retry burst through the zero point to win races against other
//!   clients targeting the same release time
//! - [`failover`] - wraps order submission with deterministic account
//!   rotation so a rate-limited account costs one reissue, not the job
//!
//! The split mirrors how bookings actually fail: timing losses are fought
//! by the burst, throttling losses by rotation.

pub mod failover;
pub mod precision;

pub use failover::{CompletionPolicy, FailoverRouter, RouterReport};
pub use precision::{BurstConfig, FireOutcome, FireState, FireTime, PrecisionScheduler};
