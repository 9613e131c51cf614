//! Precision fire-at scheduler
//!
//! Slots are released at a fixed wall-clock instant and are gone within
//! seconds. This scheduler arms a short lead ahead of the instant, runs a
//! warm-up probe (login check, sign pre-fetch) so the real attempts pay no
//! avoidable latency, then fires a bounded burst of attempts straddling the
//! boundary.
//!
//! State machine: `Pending -> Armed -> Firing -> {Succeeded, Exhausted}`.
//! Once firing starts the burst is deliberately not cancellable; this close
//! to the deadline there is nothing useful to abort into.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::models::SubmissionOutcome;
use crate::utils::error::BookingError;

/// Daily wall-clock fire time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FireTime {
    pub fn new(hour: u8, minute: u8, second: u8) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    /// Next occurrence of this time: today if still ahead, else tomorrow
    pub fn next_occurrence(&self, now: DateTime<Local>) -> DateTime<Local> {
        let time = NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
            .unwrap_or(NaiveTime::MIN);
        let today = now.date_naive().and_time(time);
        let candidate = today
            .and_local_timezone(Local)
            .earliest()
            .unwrap_or_else(|| now + ChronoDuration::days(1));

        if candidate > now {
            candidate
        } else {
            candidate + ChronoDuration::days(1)
        }
    }
}

impl std::fmt::Display for FireTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

impl From<&ScheduleConfig> for FireTime {
    fn from(config: &ScheduleConfig) -> Self {
        Self::new(config.hour, config.minute, config.second)
    }
}

/// Firing burst tuning
///
/// The attempt spacing stays below the order request timeout so attempts
/// overlap the server's processing window instead of queueing behind it,
/// and the attempt cap keeps the burst from turning into a connection
/// storm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BurstConfig {
    /// First attempt fires this many milliseconds before the instant
    pub pre_fire_ms: u64,

    /// Delay between attempts in milliseconds
    pub attempt_interval_ms: u64,

    /// Hard cap on attempts
    pub max_attempts: u32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            pre_fire_ms: 300,
            attempt_interval_ms: 350,
            max_attempts: 8,
        }
    }
}

impl From<&ScheduleConfig> for BurstConfig {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            pre_fire_ms: config.pre_fire_ms,
            attempt_interval_ms: config.attempt_interval_ms,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FireState {
    /// Waiting; no action
    Pending,
    /// Inside the warm-up lead; warm-up probe has been issued
    Armed,
    /// Attempt burst in progress
    Firing,
    /// An attempt returned success; no further attempts
    Succeeded,
    /// All attempts used without success
    Exhausted,
}

/// Record of one burst attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub at: DateTime<Local>,
    pub outcome: String,
}

/// Result of one armed-and-fired cycle
#[derive(Debug, Clone)]
pub struct FireOutcome {
    pub state: FireState,
    pub attempts: Vec<AttemptRecord>,
    pub order_id: Option<String>,
    pub fired_at: DateTime<Local>,
}

impl FireOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == FireState::Succeeded
    }
}

/// Fires a burst of submission attempts around a target instant
pub struct PrecisionScheduler {
    fire_time: FireTime,
    warmup_lead: Duration,
    burst: BurstConfig,
    state: FireState,
}

impl PrecisionScheduler {
    pub fn new(fire_time: FireTime, warmup_lead: Duration, burst: BurstConfig) -> Self {
        Self {
            fire_time,
            warmup_lead,
            burst,
            state: FireState::Pending,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            FireTime::from(config),
            Duration::from_secs(config.warmup_secs),
            BurstConfig::from(config),
        )
    }

    pub fn state(&self) -> FireState {
        self.state
    }

    pub fn fire_time(&self) -> FireTime {
        self.fire_time
    }

    /// Sleep until `target`, coarsely at first and precisely at the end.
    ///
    /// Long sleeps tick every 2 s so a stale wall clock cannot drift the
    /// wake-up far; the last five seconds tick at 100 ms; the final stretch
    /// is a single exact sleep.
    pub async fn sleep_until(target: DateTime<Local>) {
        loop {
            let now = Local::now();
            let remaining = target - now;
            let Ok(remaining) = remaining.to_std() else {
                return; // already past
            };

            if remaining > Duration::from_secs(5) {
                tokio::time::sleep(Duration::from_secs(2)).await;
            } else if remaining > Duration::from_millis(120) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            } else {
                tokio::time::sleep(remaining).await;
                return;
            }
        }
    }

    /// Arm for the next occurrence of the fire time and run the full cycle.
    ///
    /// `warmup` runs once at the head of the lead window; its failure is
    /// logged but does not abort the cycle (a cold fire beats no fire).
    /// `attempt` is called per burst attempt and must fetch its own fresh
    /// sign; a sign obtained during warm-up is assumed stale by fire time.
    pub async fn run<W, WF, A, AF>(&mut self, mut warmup: W, mut attempt: A) -> FireOutcome
    where
        W: FnMut() -> WF,
        WF: Future<Output = Result<(), BookingError>>,
        A: FnMut(u32) -> AF,
        AF: Future<Output = Result<SubmissionOutcome, BookingError>>,
    {
        let fire_at = self.fire_time.next_occurrence(Local::now());
        let arm_at = fire_at
            - ChronoDuration::from_std(self.warmup_lead).unwrap_or_else(|_| ChronoDuration::seconds(35));

        info!(fire_at = %fire_at, arm_at = %arm_at, "Scheduler pending");
        self.state = FireState::Pending;
        Self::sleep_until(arm_at).await;

        self.state = FireState::Armed;
        info!("Scheduler armed; running warm-up");
        if let Err(e) = warmup().await {
            warn!(error = %e, "Warm-up failed; firing cold");
        }

        let first_attempt_at = fire_at - ChronoDuration::milliseconds(self.burst.pre_fire_ms as i64);
        Self::sleep_until(first_attempt_at).await;

        self.state = FireState::Firing;
        let mut attempts = Vec::new();
        let mut order_id = None;

        for index in 0..self.burst.max_attempts {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.burst.attempt_interval_ms)).await;
            }

            let at = Local::now();
            match attempt(index).await {
                Ok(SubmissionOutcome::Success { order_id: id }) => {
                    info!(attempt = index + 1, order_id = %id, "Burst attempt succeeded");
                    attempts.push(AttemptRecord {
                        at,
                        outcome: format!("success: {id}"),
                    });
                    order_id = Some(id);
                    self.state = FireState::Succeeded;
                    break;
                }
                Ok(outcome) => {
                    attempts.push(AttemptRecord {
                        at,
                        outcome: format!("{outcome:?}"),
                    });
                }
                Err(e) => {
                    attempts.push(AttemptRecord {
                        at,
                        outcome: format!("error: {e}"),
                    });
                    if e.is_fatal() {
                        warn!(error = %e, "Fatal error mid-burst; stopping");
                        break;
                    }
                }
            }
        }

        if self.state != FireState::Succeeded {
            self.state = FireState::Exhausted;
        }

        FireOutcome {
            state: self.state,
            attempts,
            order_id,
            fired_at: fire_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_next_occurrence_today_and_tomorrow() {
        let now = Local::now();
        let ahead = now + ChronoDuration::minutes(10);
        let fire = FireTime::new(ahead.hour() as u8, ahead.minute() as u8, 0);
        let next = fire.next_occurrence(now);
        assert!(next > now);
        assert!(next - now <= ChronoDuration::minutes(10));

        let behind = now - ChronoDuration::minutes(10);
        let fire = FireTime::new(behind.hour() as u8, behind.minute() as u8, 0);
        let next = fire.next_occurrence(now);
        assert!(next > now);
        assert!(next - now > ChronoDuration::hours(23));
    }

    #[test]
    fn test_fire_time_display() {
        assert_eq!(FireTime::new(12, 0, 0).to_string(), "12:00:00");
        assert_eq!(FireTime::new(8, 5, 30).to_string(), "08:05:30");
    }

    fn imminent_scheduler(burst: BurstConfig) -> PrecisionScheduler {
        // Fire roughly 1.2s from now with a 1s warm-up lead
        let at = Local::now() + ChronoDuration::milliseconds(1200);
        PrecisionScheduler::new(
            FireTime::new(at.hour() as u8, at.minute() as u8, at.second() as u8),
            Duration::from_secs(1),
            burst,
        )
    }

    #[tokio::test]
    async fn test_run_succeeds_and_stops_early() {
        let mut scheduler = imminent_scheduler(BurstConfig {
            pre_fire_ms: 200,
            attempt_interval_ms: 20,
            max_attempts: 5,
        });

        let warmups = Arc::new(AtomicU32::new(0));
        let warmups_clone = warmups.clone();

        let outcome = scheduler
            .run(
                move || {
                    let warmups = warmups_clone.clone();
                    async move {
                        warmups.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                |index| async move {
                    if index < 2 {
                        Ok(SubmissionOutcome::SlotGone)
                    } else {
                        Ok(SubmissionOutcome::Success {
                            order_id: "ORD-1".into(),
                        })
                    }
                },
            )
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.order_id.as_deref(), Some("ORD-1"));
        // Two failures then success; attempts stop immediately after
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(warmups.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), FireState::Succeeded);
    }

    #[tokio::test]
    async fn test_run_exhausts_attempt_budget() {
        let mut scheduler = imminent_scheduler(BurstConfig {
            pre_fire_ms: 200,
            attempt_interval_ms: 10,
            max_attempts: 3,
        });

        let outcome = scheduler
            .run(
                || async { Ok(()) },
                |_| async { Ok(SubmissionOutcome::SlotGone) },
            )
            .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(scheduler.state(), FireState::Exhausted);
    }

    #[tokio::test]
    async fn test_run_warmup_precedes_fire_and_burst_straddles_instant() {
        let mut scheduler = imminent_scheduler(BurstConfig {
            pre_fire_ms: 300,
            attempt_interval_ms: 50,
            max_attempts: 4,
        });
        let fire_at = scheduler.fire_time().next_occurrence(Local::now());

        let warmup_at = Arc::new(std::sync::Mutex::new(None));
        let warmup_at_clone = warmup_at.clone();

        let outcome = scheduler
            .run(
                move || {
                    let warmup_at = warmup_at_clone.clone();
                    async move {
                        *warmup_at.lock().unwrap() = Some(Local::now());
                        Ok(())
                    }
                },
                |_| async { Ok(SubmissionOutcome::SlotGone) },
            )
            .await;

        let warmup_at = warmup_at.lock().unwrap().expect("warm-up ran");
        assert!(warmup_at < fire_at, "warm-up must precede the fire instant");

        // First attempt lands inside the pre-fire window; last lands after
        let first = outcome.attempts.first().unwrap().at;
        let last = outcome.attempts.last().unwrap().at;
        assert!(first >= fire_at - ChronoDuration::milliseconds(400));
        assert!(first <= fire_at + ChronoDuration::milliseconds(200));
        assert!(last > first);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_burst() {
        let mut scheduler = imminent_scheduler(BurstConfig {
            pre_fire_ms: 100,
            attempt_interval_ms: 10,
            max_attempts: 8,
        });

        let outcome = scheduler
            .run(
                || async { Ok(()) },
                |_| async { Err(BookingError::Config("key rotated".into())) },
            )
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(scheduler.state(), FireState::Exhausted);
    }
}
