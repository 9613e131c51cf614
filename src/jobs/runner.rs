//! Per-process job entry points
//!
//! Every background job process lands here via the hidden `job` subcommand.
//! One process runs exactly one job's loop for its whole lifetime:
//! poll-and-decide for monitors, arm-and-fire for schedules, ping-and-sleep
//! for keep-alive.
//!
//! Each loop is a single cooperative task. Stop is a SIGTERM handled at the
//! next loop boundary; the precision scheduler's firing burst is the one
//! deliberate exception and runs to completion.

use anyhow::{bail, Context, Result};
use chrono::{Local, Timelike, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{BackgroundJob, JobManager, JobSpec, JobStatus, MonitorJobSpec, ScheduleJobSpec};
use crate::booking::{offset_date, BookingEngine, BookingPolicy, PlatformSubmitter};
use crate::client::PlatformClient;
use crate::config::Config;
use crate::credentials::{keepalive, CredentialStore};
use crate::models::{aggregate, SubmissionOutcome};
use crate::monitor::{SessionSource, SlotMonitor};
use crate::scheduler::{FailoverRouter, FireTime, PrecisionScheduler};
use crate::utils::error::BookingError;

/// Entry point for a spawned job process
pub async fn run_job(job_id: &str, config: &Config) -> Result<()> {
    let mut manager = JobManager::open(config.store.jobs_dir())
        .with_context(|| "cannot open job table")?;
    let job = manager
        .get(job_id)
        .cloned()
        .with_context(|| format!("job {job_id} not found in job table"))?;

    info!(job_id, kind = job.kind().as_str(), name = %job.name, "Job process starting");

    let result = match job.spec.clone() {
        JobSpec::Monitor(spec) => run_monitor(&mut manager, &job, spec, config).await,
        JobSpec::Schedule(spec) => run_schedule(&mut manager, &job, spec, config).await,
        JobSpec::KeepAlive(spec) => run_keep_alive(config, spec.interval_secs).await,
    };

    match &result {
        Ok(()) => info!(job_id, "Job process exiting cleanly"),
        Err(e) => {
            error!(job_id, error = %e, "Job process failed");
            let _ = manager.update_state(job_id, |job| {
                job.status = JobStatus::Failed;
                job.stopped_at = Some(Utc::now());
                job.error_message = Some(e.to_string());
            });
        }
    }
    result
}

/// Watch for SIGTERM/SIGINT and flip a flag the loops can select on
fn shutdown_channel() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}

fn open_accounts(
    config: &Config,
    nicknames: &[String],
) -> Result<(CredentialStore, Vec<crate::credentials::AccountSession>)> {
    let store = CredentialStore::open(
        config.store.credentials_path(),
        config.store.passphrase().as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let accounts = store.select(nicknames);
    if accounts.is_empty() {
        bail!("no usable accounts for this job; run `courtside login` or keep-alive first");
    }
    Ok((store, accounts))
}

async fn run_monitor(
    manager: &mut JobManager,
    job: &BackgroundJob,
    spec: MonitorJobSpec,
    config: &Config,
) -> Result<()> {
    let mut shutdown = shutdown_channel()?;
    let (_store, accounts) = open_accounts(config, &spec.accounts)?;
    let client = Arc::new(PlatformClient::new(config).map_err(BookingError::Api)?);

    let source = SessionSource {
        client: client.clone(),
        account: accounts[0].clone(),
    };
    let mut monitor = SlotMonitor::new(source, spec.target.clone());

    let policy = BookingPolicy {
        preferred_hours: spec.preferred_hours.clone(),
        preferred_days: spec.preferred_days.clone(),
        auto_book: spec.auto_book,
        require_all_accounts: spec.require_all_accounts,
        max_adjacent_offset_hours: config.failover.max_adjacent_offset_hours,
        max_attempts: 3,
        retry_delay_ms: 800,
    };
    let completion = policy.completion_policy();
    let submitter = PlatformSubmitter::new(client.clone(), config)?;
    let engine = BookingEngine::new(
        SessionSource {
            client,
            account: accounts[0].clone(),
        },
        submitter,
        policy,
        spec.target.clone(),
    );
    let mut router = FailoverRouter::new(accounts, completion);

    let started = Instant::now();
    let interval = Duration::from_secs(spec.interval_secs);
    info!(
        target = %spec.target.label(),
        interval_secs = spec.interval_secs,
        auto_book = spec.auto_book,
        "Monitor loop starting"
    );

    loop {
        // The orchestrator communicates through the persisted record:
        // stop demotes the status, pause flips the flag.
        manager.reload().ok();
        let record = manager.get(&job.job_id).cloned();
        let paused = match &record {
            Some(r) if matches!(r.status, JobStatus::Stopped | JobStatus::Completed) => {
                info!("Job record stopped; exiting loop");
                return Ok(());
            }
            Some(r) => r.paused,
            None => {
                warn!("Job record deleted; exiting loop");
                return Ok(());
            }
        };

        if spec.max_runtime_secs > 0 && started.elapsed().as_secs() >= spec.max_runtime_secs {
            info!("Max runtime reached; completing job");
            manager.update_state(&job.job_id, |job| {
                job.status = JobStatus::Completed;
                job.stopped_at = Some(Utc::now());
            })?;
            return Ok(());
        }

        let hour = Local::now().hour() as u8;
        if let Some((start, end)) = spec.operating_window {
            if hour >= end {
                info!("Operating window closed; completing job");
                manager.update_state(&job.job_id, |job| {
                    job.status = JobStatus::Completed;
                    job.stopped_at = Some(Utc::now());
                })?;
                return Ok(());
            }
            if hour < start || paused {
                if sleep_or_shutdown(interval, &mut shutdown).await {
                    return stop_record(manager, &job.job_id);
                }
                continue;
            }
        } else if paused {
            if sleep_or_shutdown(interval, &mut shutdown).await {
                return stop_record(manager, &job.job_id);
            }
            continue;
        }

        // One poll tick: fetch, aggregate, persist the snapshot.
        let windows = match poll_windows(&mut monitor, &spec).await {
            Ok(windows) => {
                manager.update_state(&job.job_id, |job| {
                    job.state.last_check = Some(Utc::now());
                    job.state.found_windows =
                        windows.iter().filter(|w| w.is_available()).cloned().collect();
                    job.state.last_error = None;
                })?;
                windows
            }
            Err(e) if e.is_fatal() => {
                // Configuration problems are not retried; fail the job.
                return Err(e.into());
            }
            Err(e) => {
                // Transport and parse hiccups cost one cycle, nothing more.
                warn!(error = %e, "Poll tick failed");
                manager.update_state(&job.job_id, |job| {
                    job.state.last_check = Some(Utc::now());
                    job.state.last_error = Some(e.to_string());
                })?;
                if sleep_or_shutdown(interval, &mut shutdown).await {
                    return stop_record(manager, &job.job_id);
                }
                continue;
            }
        };

        let available = windows.iter().filter(|w| w.is_available()).count();
        if available > 0 {
            info!(windows = available, "Availability found");
        }

        if let Some(result) = engine.evaluate_and_book(&mut router, &windows).await {
            match result {
                Ok(report) => {
                    let succeeded = report.succeeded();
                    let completed = report.completed();
                    manager.update_state(&job.job_id, |job| {
                        job.state.booking_attempts += report.attempts;
                        if succeeded {
                            job.state.successful_bookings += 1;
                        }
                        if completed {
                            job.status = JobStatus::Completed;
                            job.stopped_at = Some(Utc::now());
                        }
                    })?;
                    if completed {
                        info!("Booking complete; monitor job done");
                        return Ok(());
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Booking attempt failed");
                    manager.update_state(&job.job_id, |job| {
                        job.state.booking_attempts += 1;
                        job.state.last_error = Some(e.to_string());
                    })?;
                }
            }
        }

        if sleep_or_shutdown(interval, &mut shutdown).await {
            return stop_record(manager, &job.job_id);
        }
    }
}

async fn poll_windows(
    monitor: &mut SlotMonitor<SessionSource>,
    spec: &MonitorJobSpec,
) -> Result<Vec<crate::models::AvailabilityWindow>, BookingError> {
    match spec.date {
        Some(date) => monitor.poll_once(date, None).await,
        None => {
            use futures::TryStreamExt;
            let per_date: Vec<_> = monitor.scan_all_dates().try_collect().await?;
            Ok(per_date.into_iter().flat_map(|(_, w)| w).collect())
        }
    }
}

/// Returns true when shutdown was requested during the sleep
async fn sleep_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

fn stop_record(manager: &mut JobManager, job_id: &str) -> Result<()> {
    info!("Shutdown requested; stopping at loop boundary");
    manager.update_state(job_id, |job| {
        job.status = JobStatus::Stopped;
        job.stopped_at = Some(Utc::now());
    })?;
    Ok(())
}

async fn run_schedule(
    manager: &mut JobManager,
    job: &BackgroundJob,
    spec: ScheduleJobSpec,
    config: &Config,
) -> Result<()> {
    let (_store, accounts) = open_accounts(config, &spec.accounts)?;
    let client = Arc::new(PlatformClient::new(config).map_err(BookingError::Api)?);

    let policy = BookingPolicy {
        preferred_hours: spec.start_hours.clone(),
        preferred_days: Vec::new(),
        auto_book: true,
        require_all_accounts: spec.require_all_accounts,
        max_adjacent_offset_hours: config.failover.max_adjacent_offset_hours,
        max_attempts: 1,
        retry_delay_ms: 0,
    };
    let completion = policy.completion_policy();
    let submitter = PlatformSubmitter::new(client.clone(), config)?;
    let source = SessionSource {
        client: client.clone(),
        account: accounts[0].clone(),
    };
    let engine = BookingEngine::new(source, submitter, policy, spec.target.clone());
    // The router sits behind a mutex because each burst attempt borrows it
    // from inside the scheduler's attempt closure.
    let router = tokio::sync::Mutex::new(FailoverRouter::new(accounts.clone(), completion));
    let primary = accounts[0].clone();

    let mut scheduler = PrecisionScheduler::new(
        FireTime::new(spec.hour, spec.minute, spec.second),
        Duration::from_secs(config.schedule.warmup_secs),
        (&config.schedule).into(),
    );

    loop {
        let target_date = offset_date(spec.date_offset_days);
        info!(
            fire_at = %scheduler.fire_time(),
            target_date = %target_date,
            target = %spec.target.label(),
            "Schedule job armed"
        );

        let engine_ref = &engine;
        let router_ref = &router;
        let client_ref = &client;
        let target_ref = &spec.target;
        let primary_ref = &primary;

        let outcome = scheduler
            .run(
                // Warm-up: authenticate and pre-touch the day so the burst
                // pays no first-request latency. Its sign is NOT reused.
                || async move {
                    client_ref
                        .current_user(primary_ref)
                        .await
                        .map_err(BookingError::Api)?;
                    let _ = client_ref
                        .day_slots(target_ref, target_date, None, primary_ref)
                        .await?;
                    Ok(())
                },
                |_index| async move {
                    // Fresh slots and a fresh sign on every attempt.
                    let slots = client_ref
                        .day_slots(target_ref, target_date, None, primary_ref)
                        .await?;
                    let windows = aggregate(&slots);

                    let mut router = router_ref.lock().await;
                    match engine_ref.evaluate_and_book(&mut router, &windows).await {
                        Some(Ok(report)) if report.succeeded() => {
                            let (_, order_id) = report.router.winner.expect("succeeded");
                            Ok(SubmissionOutcome::Success { order_id })
                        }
                        Some(Ok(_)) => Ok(SubmissionOutcome::SlotGone),
                        Some(Err(e)) => Err(e),
                        None => Ok(SubmissionOutcome::SlotGone),
                    }
                },
            )
            .await;

        let succeeded = outcome.succeeded();
        manager.update_state(&job.job_id, |job| {
            job.state.booking_attempts += outcome.attempts.len() as u32;
            job.state.last_check = Some(Utc::now());
            if succeeded {
                job.state.successful_bookings += 1;
            }
            if !spec.recurring {
                job.status = if succeeded {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                job.stopped_at = Some(Utc::now());
                if !succeeded {
                    job.error_message = Some("firing burst exhausted without success".into());
                }
            }
        })?;

        if !spec.recurring {
            return if succeeded {
                Ok(())
            } else {
                bail!("firing burst exhausted without success")
            };
        }
        info!(succeeded, "Recurring schedule fired; re-arming for tomorrow");
    }
}

async fn run_keep_alive(config: &Config, interval_secs: u64) -> Result<()> {
    let mut shutdown = shutdown_channel()?;
    let client = PlatformClient::new(config).map_err(BookingError::Api)?;
    let mut store = CredentialStore::open(
        config.store.credentials_path(),
        config.store.passphrase().as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    keepalive::run_loop(
        &client,
        &mut store,
        Duration::from_secs(interval_secs.max(60)),
        &mut shutdown,
    )
    .await;
    Ok(())
}
