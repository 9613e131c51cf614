//! Auto-booking decision engine
//!
//! Given aggregated availability and a preference policy, decides whether
//! and what to book, then drives the protocol codec and the failover router
//! to submit it.
//!
//! The engine never caches a sign: every submission attempt re-fetches the
//! day's slots first, because sign validity is time-boxed server-side and a
//! stale token is indistinguishable from a lost slot.

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveTime};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::PlatformClient;
use crate::config::Config;
use crate::credentials::AccountSession;
use crate::models::{AvailabilityWindow, Slot, SubmissionOutcome, Target};
use crate::monitor::SlotSource;
use crate::protocol::{decode_response, OrderCodec, OrderPayload, OutcomeClassifier};
use crate::scheduler::failover::{CompletionPolicy, FailoverRouter, RouterReport};
use crate::utils::error::BookingError;

/// Preference policy steering the decision engine
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Start hours in priority order; empty accepts any hour
    pub preferred_hours: Vec<u8>,

    /// Acceptable day offsets from today; empty accepts any date
    pub preferred_days: Vec<u8>,

    /// Whether the monitor may submit orders at all
    pub auto_book: bool,

    /// All-accounts completion instead of first-success
    pub require_all_accounts: bool,

    /// All-accounts mode: how far (hours) an adjacent slot may sit from
    /// the first success
    pub max_adjacent_offset_hours: u8,

    /// Submission attempts per decision before giving the cycle up
    pub max_attempts: u32,

    /// Delay between submission attempts
    pub retry_delay_ms: u64,
}

impl BookingPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preferred_hours: config.monitor.preferred_hours.clone(),
            preferred_days: config.monitor.preferred_days.clone(),
            auto_book: config.monitor.auto_book,
            require_all_accounts: false,
            max_adjacent_offset_hours: config.failover.max_adjacent_offset_hours,
            max_attempts: 3,
            retry_delay_ms: 800,
        }
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        if self.require_all_accounts {
            CompletionPolicy::AllAccounts
        } else {
            CompletionPolicy::FirstSuccess
        }
    }

    /// Rank available windows: preferred hours first (in listed order),
    /// then deeper remaining capacity. Windows outside the preferred day
    /// offsets are dropped entirely.
    pub fn rank_windows(&self, windows: &[AvailabilityWindow]) -> Vec<AvailabilityWindow> {
        let today = Local::now().date_naive();

        let mut candidates: Vec<AvailabilityWindow> = windows
            .iter()
            .filter(|w| w.is_available())
            .filter(|w| {
                if self.preferred_days.is_empty() {
                    return true;
                }
                let offset = (w.date - today).num_days();
                offset >= 0 && self.preferred_days.contains(&(offset as u8))
            })
            .filter(|w| {
                self.preferred_hours.is_empty() || self.preferred_hours.contains(&w.start_hour())
            })
            .cloned()
            .collect();

        candidates.sort_by_key(|w| {
            let hour_rank = self
                .preferred_hours
                .iter()
                .position(|h| *h == w.start_hour())
                .unwrap_or(usize::MAX);
            (hour_rank, std::cmp::Reverse(w.total_remain))
        });
        candidates
    }
}

/// Submits one slot for one account; implemented by the platform client
/// stack and by test fakes
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit(
        &self,
        account: &AccountSession,
        slot: &Slot,
        target: &Target,
    ) -> Result<SubmissionOutcome, BookingError>;
}

/// Production submitter: encode with a fresh key, post, classify
pub struct PlatformSubmitter {
    client: Arc<PlatformClient>,
    codec: OrderCodec,
    classifier: OutcomeClassifier,
    return_url: String,
    server_error_threshold: u32,
    consecutive_server_errors: AtomicU32,
}

impl PlatformSubmitter {
    pub fn new(client: Arc<PlatformClient>, config: &Config) -> Result<Self, BookingError> {
        Ok(Self {
            client,
            codec: OrderCodec::new(&config.platform.rsa_public_key)?,
            classifier: OutcomeClassifier::new(&config.failover),
            return_url: config.platform.return_url.clone(),
            server_error_threshold: config.failover.server_error_threshold.max(1),
            consecutive_server_errors: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl OrderSubmitter for PlatformSubmitter {
    async fn submit(
        &self,
        account: &AccountSession,
        slot: &Slot,
        target: &Target,
    ) -> Result<SubmissionOutcome, BookingError> {
        let payload = OrderPayload::for_slot(slot, target, &self.return_url)?;
        let encoded = self.codec.encode(&payload)?;

        let (status, body) = self.client.submit_order(&encoded, account).await?;

        if let Some(outcome) = self.classifier.classify_status(status) {
            return Ok(outcome);
        }
        if status >= 500 {
            // Repeated transport-level server faults behave like throttling
            // in practice; rotate once the threshold is crossed.
            let streak = self.consecutive_server_errors.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= self.server_error_threshold {
                return Ok(SubmissionOutcome::RateLimited);
            }
            return Ok(SubmissionOutcome::Fatal(format!("server error {status}")));
        }
        self.consecutive_server_errors.store(0, Ordering::SeqCst);

        let response = decode_response(&body)?;
        let outcome = self.classifier.classify(&response);

        // The encrypted confirm endpoint sometimes rejects orders the
        // legacy simple-submit path still accepts.
        if matches!(outcome, SubmissionOutcome::Fatal(_)) {
            if let Some(order_id) = &slot.order_id {
                debug!(order_id = %order_id, "Confirm rejected; trying simple-submit fallback");
                if let Ok(value) = self.client.submit_simple(order_id, account).await {
                    let code_ok = matches!(value.get("code").and_then(|c| c.as_i64()), Some(0))
                        || matches!(value.get("code").and_then(|c| c.as_str()), Some("0"));
                    if code_ok {
                        let id = value
                            .get("orderId")
                            .or_else(|| value.get("data"))
                            .and_then(|v| v.as_str())
                            .unwrap_or(order_id)
                            .to_string();
                        return Ok(SubmissionOutcome::Success { order_id: id });
                    }
                }
            }
        }

        Ok(outcome)
    }
}

/// Result of one booking decision cycle
#[derive(Debug, Clone)]
pub struct BookingReport {
    pub window: AvailabilityWindow,
    pub router: RouterReport,
    pub attempts: u32,
}

impl BookingReport {
    pub fn succeeded(&self) -> bool {
        self.router.winner.is_some()
    }

    pub fn completed(&self) -> bool {
        self.router.completed
    }
}

/// Orchestrates decision, sign refresh and failover submission
pub struct BookingEngine<S: SlotSource, O: OrderSubmitter> {
    source: S,
    submitter: O,
    policy: BookingPolicy,
    target: Target,
}

impl<S: SlotSource, O: OrderSubmitter> BookingEngine<S, O> {
    pub fn new(source: S, submitter: O, policy: BookingPolicy, target: Target) -> Self {
        Self {
            source,
            submitter,
            policy,
            target,
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn submitter(&self) -> &O {
        &self.submitter
    }

    /// Evaluate aggregated windows and book the best candidate.
    ///
    /// Returns `None` when the policy yields no candidate (nothing to do
    /// this cycle). The router is borrowed so its rotation cursor persists
    /// across cycles.
    pub async fn evaluate_and_book(
        &self,
        router: &mut FailoverRouter,
        windows: &[AvailabilityWindow],
    ) -> Option<Result<BookingReport, BookingError>> {
        if !self.policy.auto_book {
            return None;
        }

        let candidates = self.policy.rank_windows(windows);
        let window = candidates.first()?.clone();
        info!(
            window = %format!("{} {}", window.date, window.start.format("%H:%M")),
            candidates = candidates.len(),
            "Booking candidate selected"
        );

        Some(self.book_window(router, &window).await)
    }

    /// Book one specific window, retrying with refreshed slot data.
    ///
    /// In all-accounts mode a partial failure is retried with only the
    /// accounts still owed a success; winners are never replayed.
    pub async fn book_window(
        &self,
        router: &mut FailoverRouter,
        window: &AvailabilityWindow,
    ) -> Result<BookingReport, BookingError> {
        let mut merged = RouterReport {
            outcomes: Vec::new(),
            completed: false,
            pending: Vec::new(),
            winner: None,
        };
        let mut retry_router: Option<FailoverRouter> = None;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts_used = 0;

        for attempt in 1..=max_attempts {
            attempts_used = attempt;
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(self.policy.retry_delay_ms)).await;
            }

            // Later passes in all-accounts mode may take a timewise-adjacent
            // slot; the first pass always targets the exact window.
            let allow_adjacent = attempt > 1 && self.policy.require_all_accounts;
            let active = match retry_router.as_mut() {
                Some(r) => r,
                None => &mut *router,
            };
            let report = active
                .submit_with_failover(|account| {
                    self.attempt_for_account(account, window, allow_adjacent)
                })
                .await?;

            let slot_gone = report.slot_gone();
            merged.outcomes.extend(report.outcomes.clone());
            merged.completed = report.completed;
            merged.pending = report.pending.clone();
            if merged.winner.is_none() {
                merged.winner = report.winner.clone();
            }

            if merged.completed {
                info!(attempt, "Booking completed");
                break;
            }
            if slot_gone {
                warn!(attempt, "Slot gone mid-booking; cycle over");
                break;
            }

            if self.policy.require_all_accounts && !report.pending.is_empty() {
                retry_router = Some(FailoverRouter::new(
                    report.pending,
                    CompletionPolicy::AllAccounts,
                ));
            }

            if attempt < max_attempts {
                warn!(attempt, "Booking pass incomplete; refreshing and retrying");
            }
        }

        Ok(BookingReport {
            window: window.clone(),
            router: merged,
            attempts: attempts_used,
        })
    }

    /// One attempt for one account: refresh the day, pick a concrete slot
    /// with a fresh sign, submit.
    async fn attempt_for_account(
        &self,
        account: AccountSession,
        window: &AvailabilityWindow,
        allow_adjacent: bool,
    ) -> Result<SubmissionOutcome, BookingError> {
        let slots = self
            .source
            .day_slots(&self.target, window.date, None)
            .await?;

        let slot = pick_slot_for_window(&slots, window).or_else(|| {
            if allow_adjacent {
                pick_adjacent_slot(&slots, window.start, self.policy.max_adjacent_offset_hours)
            } else {
                None
            }
        });

        let Some(slot) = slot else {
            return Ok(SubmissionOutcome::SlotGone);
        };

        debug!(
            account = %account.nickname,
            slot = %slot.schedule_time(),
            sub_site = %slot.sub_site_id,
            "Submitting with freshly fetched sign"
        );
        self.submitter.submit(&account, &slot, &self.target).await
    }
}

/// The concrete slot to order inside a window: bookable, deepest capacity
pub fn pick_slot_for_window(slots: &[Slot], window: &AvailabilityWindow) -> Option<Slot> {
    slots
        .iter()
        .filter(|s| s.date == window.date && s.start == window.start && s.end == window.end)
        .filter(|s| s.is_bookable())
        .max_by_key(|s| s.remain.unwrap_or(0))
        .cloned()
}

/// Nearest bookable slot within `offset_hours` of `anchor`
pub fn pick_adjacent_slot(slots: &[Slot], anchor: NaiveTime, offset_hours: u8) -> Option<Slot> {
    use chrono::Timelike;
    let anchor_hour = anchor.hour() as i32;

    slots
        .iter()
        .filter(|s| s.is_bookable())
        .filter(|s| (s.start.hour() as i32 - anchor_hour).abs() <= offset_hours as i32)
        .min_by_key(|s| (s.start.hour() as i32 - anchor_hour).abs())
        .cloned()
}

/// Compute the date a schedule-fired booking targets
pub fn offset_date(offset_days: i64) -> NaiveDate {
    Local::now().date_naive() + chrono::Duration::days(offset_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::aggregate;

    fn slot(date: NaiveDate, hour: u32, sub_site: &str, remain: u32, sign: bool) -> Slot {
        Slot {
            date,
            start: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt((hour + 1) % 24, 0, 0).unwrap(),
            slot_id: format!("{sub_site}-{hour}"),
            sub_site_id: sub_site.to_string(),
            sub_site_name: sub_site.to_string(),
            sign: sign.then(|| format!("sign-{sub_site}-{hour}")),
            remain: Some(remain),
            price: Some(40.0),
            available: remain > 0,
            order_id: None,
        }
    }

    fn policy(hours: Vec<u8>) -> BookingPolicy {
        BookingPolicy {
            preferred_hours: hours,
            preferred_days: Vec::new(),
            auto_book: true,
            require_all_accounts: false,
            max_adjacent_offset_hours: 1,
            max_attempts: 3,
            retry_delay_ms: 1,
        }
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    #[test]
    fn test_rank_prefers_listed_hours_in_order() {
        let slots = vec![
            slot(today(), 18, "a", 1, true),
            slot(today(), 19, "a", 5, true),
            slot(today(), 20, "a", 2, true),
        ];
        let windows = aggregate(&slots);

        let ranked = policy(vec![20, 19]).rank_windows(&windows);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].start_hour(), 20);
        assert_eq!(ranked[1].start_hour(), 19);
    }

    #[test]
    fn test_rank_breaks_ties_by_capacity() {
        let slots = vec![
            slot(today(), 18, "a", 1, true),
            slot(today(), 18, "b", 1, true),
            slot(today() + chrono::Duration::days(1), 18, "a", 5, true),
        ];
        let windows = aggregate(&slots);

        let ranked = policy(vec![18]).rank_windows(&windows);
        assert_eq!(ranked.len(), 2);
        // The deeper window (remain 5) outranks the shallower same-hour one
        assert_eq!(ranked[0].total_remain, 5);
    }

    #[test]
    fn test_rank_filters_preferred_days() {
        let slots = vec![
            slot(today(), 18, "a", 1, true),
            slot(today() + chrono::Duration::days(3), 18, "a", 9, true),
        ];
        let windows = aggregate(&slots);

        let mut p = policy(vec![18]);
        p.preferred_days = vec![0, 1];
        let ranked = p.rank_windows(&windows);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].date, today());
    }

    #[test]
    fn test_rank_skips_unavailable_windows() {
        let slots = vec![slot(today(), 18, "a", 0, true)];
        let windows = aggregate(&slots);
        assert!(policy(vec![18]).rank_windows(&windows).is_empty());
    }

    #[test]
    fn test_pick_slot_prefers_deepest_sub_site() {
        let date = today();
        let slots = vec![
            slot(date, 18, "shallow", 1, true),
            slot(date, 18, "deep", 4, true),
            slot(date, 18, "signless", 9, false),
        ];
        let windows = aggregate(&slots);
        let window = windows
            .iter()
            .find(|w| w.start_hour() == 18)
            .unwrap();

        let picked = pick_slot_for_window(&slots, window).unwrap();
        assert_eq!(picked.sub_site_id, "deep");
    }

    #[test]
    fn test_pick_adjacent_respects_offset() {
        let date = today();
        let slots = vec![slot(date, 20, "a", 1, true)];
        let anchor = NaiveTime::from_hms_opt(18, 0, 0).unwrap();

        assert!(pick_adjacent_slot(&slots, anchor, 1).is_none());
        assert!(pick_adjacent_slot(&slots, anchor, 2).is_some());
    }

    #[test]
    fn test_completion_policy_mapping() {
        let mut p = policy(vec![18]);
        assert_eq!(p.completion_policy(), CompletionPolicy::FirstSuccess);
        p.require_all_accounts = true;
        assert_eq!(p.completion_policy(), CompletionPolicy::AllAccounts);
    }
}
