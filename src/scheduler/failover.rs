//! Account failover router
//!
//! Wraps order submission with multi-account rotation. The platform rate
//! limits per account, so a throttled response costs one rotation and a
//! reissue of the same logical attempt instead of failing the job.
//!
//! Rotation is deterministic round-robin: the cursor resumes from the next
//! account after the one that triggered rotation, never restarting at the
//! head of the list. Outcomes drive an explicit state machine; rate limits
//! rotate, slot-gone bubbles up for a re-poll, anything else is a
//! booking-level failure for that one account.

use futures::future::join_all;
use std::future::Future;
use tracing::{info, warn};

use crate::credentials::AccountSession;
use crate::models::SubmissionOutcome;
use crate::utils::error::{ApiError, BookingError};

/// When is a multi-account job finished?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Done the instant any one account succeeds
    FirstSuccess,

    /// Every account in the target set must individually succeed
    AllAccounts,
}

/// Per-account result of one routing pass
#[derive(Debug, Clone)]
pub struct AccountOutcome {
    pub nickname: String,
    pub outcome: SubmissionOutcome,
}

/// Result of one `submit_with_failover` pass
#[derive(Debug, Clone)]
pub struct RouterReport {
    /// Outcomes in attempt order
    pub outcomes: Vec<AccountOutcome>,

    /// Whether the completion policy is satisfied
    pub completed: bool,

    /// Accounts still owed a success (all-accounts mode); retried on their
    /// own schedule, winners are never replayed
    pub pending: Vec<AccountSession>,

    /// First successful account and order id, when any
    pub winner: Option<(String, String)>,
}

impl RouterReport {
    /// The pass hit a stale-slot signal and the caller should re-poll
    pub fn slot_gone(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.outcome == SubmissionOutcome::SlotGone)
            && self.winner.is_none()
    }
}

/// Multi-account submission router
pub struct FailoverRouter {
    accounts: Vec<AccountSession>,
    policy: CompletionPolicy,
    cursor: usize,
}

impl FailoverRouter {
    /// # Arguments
    ///
    /// * `accounts` - ordered target accounts; must be non-empty
    /// * `policy` - completion policy
    pub fn new(accounts: Vec<AccountSession>, policy: CompletionPolicy) -> Self {
        Self {
            accounts,
            policy,
            cursor: 0,
        }
    }

    pub fn accounts(&self) -> &[AccountSession] {
        &self.accounts
    }

    /// Account the next first-success pass will start from
    pub fn current_account(&self) -> Option<&AccountSession> {
        if self.accounts.is_empty() {
            None
        } else {
            Some(&self.accounts[self.cursor % self.accounts.len()])
        }
    }

    /// Run one logical submission through the configured accounts.
    ///
    /// `attempt` is invoked per account and must fetch its own fresh sign;
    /// the router never caches anything between invocations.
    pub async fn submit_with_failover<F, Fut>(&mut self, attempt: F) -> Result<RouterReport, BookingError>
    where
        F: Fn(AccountSession) -> Fut,
        Fut: Future<Output = Result<SubmissionOutcome, BookingError>>,
    {
        if self.accounts.is_empty() {
            return Err(BookingError::AccountsExhausted);
        }

        match self.policy {
            CompletionPolicy::FirstSuccess => self.first_success(attempt).await,
            CompletionPolicy::AllAccounts => self.all_accounts(attempt).await,
        }
    }

    async fn first_success<F, Fut>(&mut self, attempt: F) -> Result<RouterReport, BookingError>
    where
        F: Fn(AccountSession) -> Fut,
        Fut: Future<Output = Result<SubmissionOutcome, BookingError>>,
    {
        let len = self.accounts.len();
        let mut outcomes = Vec::new();
        let mut winner = None;

        for _ in 0..len {
            let index = self.cursor % len;
            let account = self.accounts[index].clone();
            // The cursor always moves past the account just used, so the
            // next pass resumes after it rather than at the list head.
            self.cursor = (index + 1) % len;

            let outcome = resolve_attempt(attempt(account.clone()).await);
            info!(
                account = %account.nickname,
                outcome = ?outcome,
                "Failover attempt finished"
            );

            match &outcome {
                SubmissionOutcome::Success { order_id } => {
                    winner = Some((account.nickname.clone(), order_id.clone()));
                    outcomes.push(AccountOutcome {
                        nickname: account.nickname,
                        outcome,
                    });
                    break;
                }
                SubmissionOutcome::RateLimited => {
                    warn!(account = %account.nickname, "Rate limited; rotating to next account");
                    outcomes.push(AccountOutcome {
                        nickname: account.nickname,
                        outcome,
                    });
                    continue;
                }
                SubmissionOutcome::SlotGone => {
                    outcomes.push(AccountOutcome {
                        nickname: account.nickname,
                        outcome,
                    });
                    break;
                }
                SubmissionOutcome::AuthExpired | SubmissionOutcome::Fatal(_) => {
                    // Not a throttling signal; do not rotate past it.
                    outcomes.push(AccountOutcome {
                        nickname: account.nickname,
                        outcome,
                    });
                    break;
                }
            }
        }

        let completed = winner.is_some();
        Ok(RouterReport {
            outcomes,
            completed,
            pending: Vec::new(),
            winner,
        })
    }

    /// All-accounts mode runs the target set concurrently: serial attempts
    /// at a fixed release instant would blow the timing budget.
    async fn all_accounts<F, Fut>(&mut self, attempt: F) -> Result<RouterReport, BookingError>
    where
        F: Fn(AccountSession) -> Fut,
        Fut: Future<Output = Result<SubmissionOutcome, BookingError>>,
    {
        let accounts = self.accounts.clone();
        let futures = accounts
            .iter()
            .map(|account| attempt(account.clone()))
            .collect::<Vec<_>>();
        let results = join_all(futures).await;

        let mut outcomes = Vec::new();
        let mut pending = Vec::new();
        let mut winner = None;

        for (account, result) in accounts.into_iter().zip(results) {
            let outcome = resolve_attempt(result);
            match &outcome {
                SubmissionOutcome::Success { order_id } => {
                    if winner.is_none() {
                        winner = Some((account.nickname.clone(), order_id.clone()));
                    }
                }
                _ => {
                    warn!(
                        account = %account.nickname,
                        outcome = ?outcome,
                        "Account still owed a success"
                    );
                    pending.push(account.clone());
                }
            }
            outcomes.push(AccountOutcome {
                nickname: account.nickname,
                outcome,
            });
        }

        Ok(RouterReport {
            completed: pending.is_empty(),
            outcomes,
            pending,
            winner,
        })
    }
}

/// Collapse transport-level errors into outcomes the state machine handles
fn resolve_attempt(result: Result<SubmissionOutcome, BookingError>) -> SubmissionOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(BookingError::Api(ApiError::RateLimited)) => SubmissionOutcome::RateLimited,
        Err(BookingError::Api(ApiError::AuthExpired)) => SubmissionOutcome::AuthExpired,
        Err(BookingError::SlotGone(_)) => SubmissionOutcome::SlotGone,
        Err(e) => SubmissionOutcome::Fatal(e.to_string()),
    }
}
