//! Session keep-alive refresher
//!
//! Pings the platform's current-user endpoint with each stored session so
//! cookies stay warm server-side. A successful ping pushes the session's
//! expiry forward and persists any rotated cookie; a rejection flags the
//! session invalid without deleting it.

use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::CredentialStore;
use crate::client::PlatformClient;
use crate::utils::error::ApiError;

/// How far a successful ping pushes the expiry forward
const REFRESH_LIFETIME_HOURS: i64 = 1;

/// Result of one keep-alive ping
#[derive(Debug, Clone)]
pub struct KeepAliveOutcome {
    pub username: String,
    pub nickname: String,
    pub success: bool,
    pub message: String,
}

/// Refresh every stored session once
pub async fn refresh_all(
    client: &PlatformClient,
    store: &mut CredentialStore,
) -> Vec<KeepAliveOutcome> {
    let mut outcomes = Vec::new();

    for session in store.snapshots() {
        if !session.has_credentials() {
            continue;
        }

        let outcome = match client.current_user(&session).await {
            Ok(_) => {
                let cookie = session.session_cookie.clone().unwrap_or_default();
                if let Err(e) = store.refresh_cookie(
                    &session.username,
                    cookie,
                    ChronoDuration::hours(REFRESH_LIFETIME_HOURS),
                ) {
                    warn!(account = %session.nickname, error = %e, "Failed to persist refreshed session");
                }
                KeepAliveOutcome {
                    username: session.username.clone(),
                    nickname: session.nickname.clone(),
                    success: true,
                    message: "session refreshed".into(),
                }
            }
            Err(ApiError::AuthExpired) => {
                if let Err(e) = store.invalidate(&session.username) {
                    warn!(account = %session.nickname, error = %e, "Failed to flag session invalid");
                }
                KeepAliveOutcome {
                    username: session.username.clone(),
                    nickname: session.nickname.clone(),
                    success: false,
                    message: "session rejected (401)".into(),
                }
            }
            Err(e) => KeepAliveOutcome {
                username: session.username.clone(),
                nickname: session.nickname.clone(),
                success: false,
                message: format!("ping failed: {e}"),
            },
        };

        if outcome.success {
            info!(account = %outcome.nickname, "Keep-alive ping succeeded");
        } else {
            warn!(account = %outcome.nickname, message = %outcome.message, "Keep-alive ping failed");
        }
        outcomes.push(outcome);
    }

    outcomes
}

/// Background loop refreshing sessions every `interval`.
///
/// Stops when `shutdown` flips to true; transport errors are absorbed and
/// retried at the next tick.
pub async fn run_loop(
    client: &PlatformClient,
    store: &mut CredentialStore,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Keep-alive loop started");

    loop {
        if let Err(e) = store.reload() {
            warn!(error = %e, "Keep-alive could not reload credential store");
        } else {
            let outcomes = refresh_all(client, store).await;
            let ok = outcomes.iter().filter(|o| o.success).count();
            info!(refreshed = ok, total = outcomes.len(), "Keep-alive pass completed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Keep-alive loop stopped");
}
