//! Precision scheduler timing scenarios
//!
//! These run against the real clock with a near-future fire instant, so
//! each test costs a couple of wall-clock seconds. What they pin down is
//! ordering: warm-up strictly before the instant, the first burst attempt
//! inside the pre-fire window, sign fetches fresh per attempt.

mod common;

use chrono::{Duration as ChronoDuration, Local, Timelike};
use common::test_account;
use courtside::models::SubmissionOutcome;
use courtside::scheduler::{
    BurstConfig, CompletionPolicy, FailoverRouter, FireState, FireTime, PrecisionScheduler,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn imminent(lead_ms: i64, warmup_secs: u64, burst: BurstConfig) -> (PrecisionScheduler, chrono::DateTime<Local>) {
    let at = Local::now() + ChronoDuration::milliseconds(lead_ms);
    let scheduler = PrecisionScheduler::new(
        FireTime::new(at.hour() as u8, at.minute() as u8, at.second() as u8),
        Duration::from_secs(warmup_secs),
        burst,
    );
    let fire_at = scheduler.fire_time().next_occurrence(Local::now());
    (scheduler, fire_at)
}

#[tokio::test]
async fn warmup_fires_before_deadline_and_attempts_straddle_it() {
    let (mut scheduler, fire_at) = imminent(
        2200,
        2,
        BurstConfig {
            pre_fire_ms: 300,
            attempt_interval_ms: 80,
            max_attempts: 6,
        },
    );

    let warmup_time = Arc::new(Mutex::new(None));
    let attempt_times = Arc::new(Mutex::new(Vec::new()));

    let warmup_clone = warmup_time.clone();
    let attempts_clone = attempt_times.clone();

    let outcome = scheduler
        .run(
            move || {
                let warmup = warmup_clone.clone();
                async move {
                    *warmup.lock().unwrap() = Some(Local::now());
                    Ok(())
                }
            },
            move |_| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.lock().unwrap().push(Local::now());
                    Ok(SubmissionOutcome::SlotGone)
                }
            },
        )
        .await;

    // Warm-up happened inside the lead window, strictly before the instant
    let warmup_at = warmup_time.lock().unwrap().expect("warm-up ran");
    assert!(warmup_at < fire_at);
    assert!(fire_at - warmup_at <= ChronoDuration::seconds(3));

    // First attempt within the pre-fire window; burst continues past zero
    let attempts = attempt_times.lock().unwrap();
    assert_eq!(attempts.len(), 6);
    assert!(attempts[0] >= fire_at - ChronoDuration::milliseconds(400));
    assert!(attempts[0] <= fire_at + ChronoDuration::milliseconds(250));
    assert!(*attempts.last().unwrap() > fire_at);

    assert_eq!(outcome.state, FireState::Exhausted);
}

#[tokio::test]
async fn burst_with_failover_rotates_on_rate_limit() {
    // The burst drives the failover router: account A is throttled, B wins,
    // all within the same firing window.
    let (mut scheduler, _) = imminent(
        1500,
        1,
        BurstConfig {
            pre_fire_ms: 200,
            attempt_interval_ms: 30,
            max_attempts: 4,
        },
    );

    let router = tokio::sync::Mutex::new(FailoverRouter::new(
        vec![test_account("A"), test_account("B")],
        CompletionPolicy::FirstSuccess,
    ));
    let sign_counter = AtomicU32::new(0);

    let router_ref = &router;
    let counter_ref = &sign_counter;

    let outcome = scheduler
        .run(
            || async { Ok(()) },
            |_| async move {
                let mut router = router_ref.lock().await;
                let report = router
                    .submit_with_failover(|account| async move {
                        // Every attempt simulates fetching a fresh sign
                        let sign = counter_ref.fetch_add(1, Ordering::SeqCst);
                        if account.nickname == "A" {
                            Ok(SubmissionOutcome::RateLimited)
                        } else {
                            Ok(SubmissionOutcome::Success {
                                order_id: format!("ORD-{sign}"),
                            })
                        }
                    })
                    .await?;

                match report.winner {
                    Some((_, order_id)) => Ok(SubmissionOutcome::Success { order_id }),
                    None => Ok(SubmissionOutcome::SlotGone),
                }
            },
        )
        .await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts.len(), 1);
    // A was tried and rotated past before B succeeded
    assert!(sign_counter.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn exhausted_burst_reports_every_attempt() {
    let (mut scheduler, _) = imminent(
        1200,
        1,
        BurstConfig {
            pre_fire_ms: 100,
            attempt_interval_ms: 20,
            max_attempts: 3,
        },
    );

    let calls = AtomicU32::new(0);
    let calls_ref = &calls;

    let outcome = scheduler
        .run(
            || async { Ok(()) },
            |_| async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Ok(SubmissionOutcome::SlotGone)
            },
        )
        .await;

    assert_eq!(outcome.state, FireState::Exhausted);
    assert!(!outcome.succeeded());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.attempts.len(), 3);
    assert!(outcome.order_id.is_none());
}
