use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courtside::auth::{LoginFlow, PromptSolver};
use courtside::booking::{offset_date, BookingEngine, BookingPolicy, PlatformSubmitter};
use courtside::client::PlatformClient;
use courtside::config::Config;
use courtside::credentials::{keepalive, CredentialStore};
use courtside::jobs::{
    runner, JobManager, JobSpec, KeepAliveJobSpec, MonitorJobSpec, ScheduleJobSpec,
};
use courtside::models::Target;
use courtside::monitor::{SessionSource, SlotMonitor};
use courtside::scheduler::FailoverRouter;
use courtside::utils::error::BookingError;

#[derive(Parser)]
#[command(
    name = "courtside",
    version,
    about = "Campus sports venue slot monitor and auto-booking engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Log an account in and store its session
    Login {
        /// Nickname for the stored account
        #[arg(short, long)]
        nickname: String,

        /// Platform username (email)
        #[arg(short, long)]
        username: String,

        /// Password; prompted on stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Manage stored accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Query slot availability for a target
    Slots {
        /// Preset index selecting venue + field type
        #[arg(short = 'p', long)]
        preset: Option<u16>,

        /// Venue id (with --field-type-id, overrides --preset)
        #[arg(long)]
        venue_id: Option<String>,

        /// Field type id
        #[arg(long)]
        field_type_id: Option<String>,

        /// Date to query (YYYY-MM-DD); defaults to scanning all dates
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Include full (zero-remain) windows
        #[arg(long, default_value = "false")]
        include_full: bool,
    },

    /// Book a slot immediately
    Book {
        /// Preset index selecting venue + field type
        #[arg(short = 'p', long)]
        preset: Option<u16>,

        #[arg(long)]
        venue_id: Option<String>,

        #[arg(long)]
        field_type_id: Option<String>,

        /// Date to book (YYYY-MM-DD); defaults to 7 days out
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Start hour to book
        #[arg(long)]
        hour: u8,

        /// Accounts to book with (nicknames); empty means all
        #[arg(short, long)]
        accounts: Vec<String>,

        /// Require every listed account to succeed
        #[arg(long, default_value = "false")]
        all_accounts: bool,
    },

    /// Manage background jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Internal job runner (spawned by the orchestrator)
    #[command(hide = true)]
    Job {
        #[arg(long)]
        job_id: String,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List stored accounts
    List,

    /// Remove a stored account
    Remove { identifier: String },

    /// Refresh every stored session once
    KeepAlive,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Create a monitor job watching a target
    CreateMonitor {
        /// Job name
        #[arg(short, long)]
        name: String,

        #[arg(short = 'p', long)]
        preset: Option<u16>,

        #[arg(long)]
        venue_id: Option<String>,

        #[arg(long)]
        field_type_id: Option<String>,

        /// Fixed date to watch (YYYY-MM-DD); omitted scans all dates
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Book automatically when a preferred window appears
        #[arg(long, default_value = "false")]
        auto_book: bool,

        /// Preferred start hours, priority order (e.g. 18,19,20)
        #[arg(long, value_delimiter = ',')]
        hours: Vec<u8>,

        /// Acceptable day offsets from today (e.g. 0,1,7)
        #[arg(long, value_delimiter = ',')]
        days: Vec<u8>,

        /// Accounts to book with (nicknames)
        #[arg(short, long)]
        accounts: Vec<String>,

        /// Require every listed account to succeed
        #[arg(long, default_value = "false")]
        all_accounts: bool,
    },

    /// Create a schedule job firing at a fixed time
    CreateSchedule {
        #[arg(short, long)]
        name: String,

        #[arg(short = 'p', long)]
        preset: Option<u16>,

        #[arg(long)]
        venue_id: Option<String>,

        #[arg(long)]
        field_type_id: Option<String>,

        /// Fire hour (local wall clock)
        #[arg(long)]
        hour: Option<u8>,

        /// Fire minute
        #[arg(long)]
        minute: Option<u8>,

        /// Fire second
        #[arg(long)]
        second: Option<u8>,

        /// Days ahead the booking targets
        #[arg(long)]
        date_offset: Option<i64>,

        /// Candidate start hours, priority order
        #[arg(long, value_delimiter = ',')]
        start_hours: Vec<u8>,

        #[arg(short, long)]
        accounts: Vec<String>,

        #[arg(long, default_value = "false")]
        all_accounts: bool,

        /// Fire daily instead of once
        #[arg(long, default_value = "false")]
        recurring: bool,
    },

    /// Create a session keep-alive job
    CreateKeepalive {
        #[arg(short, long, default_value = "keep-alive")]
        name: String,

        /// Refresh interval in seconds
        #[arg(short, long, default_value = "900")]
        interval: u64,
    },

    /// List jobs
    List,

    /// Stop a running job
    Stop { job_id: String },

    /// Pause a monitor job
    Pause { job_id: String },

    /// Resume a paused monitor job
    Resume { job_id: String },

    /// Delete a job record
    Delete { job_id: String },

    /// Show a job's captured log
    Logs {
        job_id: String,

        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Verify recorded pids and relaunch dead jobs
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = Config::from_env()?;

    match cli.command {
        Commands::Login {
            nickname,
            username,
            password,
        } => login(&config, nickname, username, password).await,
        Commands::Accounts { command } => accounts(&config, command).await,
        Commands::Slots {
            preset,
            venue_id,
            field_type_id,
            date,
            include_full,
        } => {
            let target = resolve_target(&config, preset, venue_id, field_type_id)?;
            slots(&config, target, date, include_full).await
        }
        Commands::Book {
            preset,
            venue_id,
            field_type_id,
            date,
            hour,
            accounts,
            all_accounts,
        } => {
            let target = resolve_target(&config, preset, venue_id, field_type_id)?;
            book(&config, target, date, hour, accounts, all_accounts).await
        }
        Commands::Jobs { command } => jobs(&config, command),
        Commands::Job { job_id } => runner::run_job(&job_id, &config).await,
    }
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("courtside=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("courtside=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

/// Resolve a preset index or explicit id pair into a target
fn resolve_target(
    config: &Config,
    preset: Option<u16>,
    venue_id: Option<String>,
    field_type_id: Option<String>,
) -> Result<Target> {
    if let (Some(venue_id), Some(field_type_id)) = (venue_id.clone(), field_type_id.clone()) {
        return Ok(Target::new(venue_id, field_type_id));
    }
    if let Some(index) = preset {
        let preset = config
            .preset(index)
            .with_context(|| format!("no preset with index {index}"))?;
        return Ok(Target::from_preset(preset));
    }
    bail!("specify --preset or both --venue-id and --field-type-id");
}

fn open_store(config: &Config) -> Result<CredentialStore> {
    CredentialStore::open(
        config.store.credentials_path(),
        config.store.passphrase().as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))
}

async fn login(
    config: &Config,
    nickname: String,
    username: String,
    password: Option<String>,
) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => {
            println!("Password for {username}:");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };

    let flow = LoginFlow::new(config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let solver = PromptSolver::default();
    let mut session = flow
        .login(&nickname, &username, &password, &solver)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    session.password = None; // never persisted unless the user opts in

    let mut store = open_store(config)?;
    store.upsert(session).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Stored session for {nickname}");
    Ok(())
}

async fn accounts(config: &Config, command: AccountCommands) -> Result<()> {
    let mut store = open_store(config)?;

    match command {
        AccountCommands::List => {
            if store.is_empty() {
                println!("No stored accounts");
                return Ok(());
            }
            println!("{:<16} {:<28} {:<8} {}", "Nickname", "Username", "Valid", "Expires");
            for account in store.snapshots() {
                println!(
                    "{:<16} {:<28} {:<8} {}",
                    account.nickname,
                    account.username,
                    if account.valid { "yes" } else { "no" },
                    account
                        .expires_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        AccountCommands::Remove { identifier } => {
            if store.remove(&identifier).map_err(|e| anyhow::anyhow!("{e}"))? {
                println!("Removed {identifier}");
            } else {
                println!("No account matching {identifier}");
            }
        }
        AccountCommands::KeepAlive => {
            let client = PlatformClient::new(config).map_err(BookingError::Api)?;
            let outcomes = keepalive::refresh_all(&client, &mut store).await;
            for outcome in &outcomes {
                println!(
                    "{:<16} {}",
                    outcome.nickname,
                    if outcome.success {
                        "refreshed"
                    } else {
                        outcome.message.as_str()
                    }
                );
            }
            let ok = outcomes.iter().filter(|o| o.success).count();
            println!("{ok}/{} sessions refreshed", outcomes.len());
        }
    }
    Ok(())
}

async fn slots(
    config: &Config,
    target: Target,
    date: Option<NaiveDate>,
    include_full: bool,
) -> Result<()> {
    use futures::TryStreamExt;

    let store = open_store(config)?;
    let account = store
        .usable()
        .into_iter()
        .next()
        .context("no usable account; run `courtside login` first")?;

    let client = Arc::new(PlatformClient::new(config).map_err(BookingError::Api)?);
    let monitor = SlotMonitor::new(
        SessionSource {
            client,
            account,
        },
        target.clone(),
    );

    println!("{}", target.label());
    println!(
        "{:<12} {:<13} {:>6} {:>10} {:>6} {:>12}",
        "Date", "Time", "Sites", "Available", "Left", "Price"
    );

    let mut printed = 0usize;
    let mut print_windows = |date: NaiveDate, windows: &[courtside::AvailabilityWindow]| {
        for window in windows {
            if !include_full && !window.is_available() {
                continue;
            }
            let price = match (window.min_price, window.max_price) {
                (Some(min), Some(max)) if (max - min).abs() > f64::EPSILON => {
                    format!("{min:.2}-{max:.2}")
                }
                (Some(min), _) => format!("{min:.2}"),
                _ => "-".to_string(),
            };
            println!(
                "{:<12} {:<13} {:>6} {:>10} {:>6} {:>12}",
                date,
                format!(
                    "{}-{}",
                    window.start.format("%H:%M"),
                    window.end.format("%H:%M")
                ),
                window.site_count,
                window.available_count,
                window.total_remain,
                price,
            );
            printed += 1;
        }
    };

    match date {
        Some(date) => {
            let slots = monitor
                .fetch_day(date, None)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            print_windows(date, &courtside::models::aggregate(&slots));
        }
        None => {
            let per_date: Vec<_> = monitor
                .scan_all_dates()
                .try_collect()
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for (date, windows) in &per_date {
                print_windows(*date, windows);
            }
        }
    }

    if printed == 0 {
        println!("(no available windows)");
    }
    Ok(())
}

async fn book(
    config: &Config,
    target: Target,
    date: Option<NaiveDate>,
    hour: u8,
    account_names: Vec<String>,
    all_accounts: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let accounts = store.select(&account_names);
    if accounts.is_empty() {
        bail!("no usable accounts; run `courtside login` first");
    }

    let date = date.unwrap_or_else(|| offset_date(config.schedule.date_offset_days));
    let client = Arc::new(PlatformClient::new(config).map_err(BookingError::Api)?);

    let policy = BookingPolicy {
        preferred_hours: vec![hour],
        preferred_days: Vec::new(),
        auto_book: true,
        require_all_accounts: all_accounts,
        max_adjacent_offset_hours: config.failover.max_adjacent_offset_hours,
        max_attempts: 3,
        retry_delay_ms: 800,
    };
    let completion = policy.completion_policy();
    let submitter =
        PlatformSubmitter::new(client.clone(), config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let engine = BookingEngine::new(
        SessionSource {
            client: client.clone(),
            account: accounts[0].clone(),
        },
        submitter,
        policy,
        target.clone(),
    );
    let primary = accounts[0].clone();
    let mut router = FailoverRouter::new(accounts, completion);

    println!("Booking {} on {date} at {hour:02}:00", target.label());

    let slots = client
        .day_slots(&target, date, None, &primary)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let windows = courtside::models::aggregate(&slots);

    match engine.evaluate_and_book(&mut router, &windows).await {
        Some(Ok(report)) => {
            for outcome in &report.router.outcomes {
                println!("  {}: {:?}", outcome.nickname, outcome.outcome);
            }
            if report.completed() {
                println!("Booking completed");
                Ok(())
            } else if report.succeeded() {
                println!("Partial success; some accounts still pending");
                Ok(())
            } else {
                bail!("booking failed");
            }
        }
        Some(Err(e)) => bail!("booking failed: {e}"),
        None => bail!("no bookable window at {hour:02}:00 on {date}"),
    }
}

fn jobs(config: &Config, command: JobCommands) -> Result<()> {
    let mut manager = JobManager::open(config.store.jobs_dir())?;

    match command {
        JobCommands::CreateMonitor {
            name,
            preset,
            venue_id,
            field_type_id,
            date,
            interval,
            auto_book,
            hours,
            days,
            accounts,
            all_accounts,
        } => {
            let target = resolve_target(config, preset, venue_id, field_type_id)?;
            let spec = JobSpec::Monitor(MonitorJobSpec {
                target,
                date,
                interval_secs: interval.unwrap_or(config.monitor.interval_secs),
                auto_book,
                preferred_hours: if hours.is_empty() {
                    config.monitor.preferred_hours.clone()
                } else {
                    hours
                },
                preferred_days: days,
                accounts,
                require_all_accounts: all_accounts,
                operating_window: Some((
                    config.monitor.operating_start_hour,
                    config.monitor.operating_end_hour,
                )),
                max_runtime_secs: config.monitor.max_runtime_secs,
            });
            let job_id = manager.create(name, spec, true)?;
            println!("Monitor job {job_id} created and started");
        }
        JobCommands::CreateSchedule {
            name,
            preset,
            venue_id,
            field_type_id,
            hour,
            minute,
            second,
            date_offset,
            start_hours,
            accounts,
            all_accounts,
            recurring,
        } => {
            let target = resolve_target(config, preset, venue_id, field_type_id)?;
            let spec = JobSpec::Schedule(ScheduleJobSpec {
                target,
                hour: hour.unwrap_or(config.schedule.hour),
                minute: minute.unwrap_or(config.schedule.minute),
                second: second.unwrap_or(config.schedule.second),
                date_offset_days: date_offset.unwrap_or(config.schedule.date_offset_days),
                start_hours: if start_hours.is_empty() {
                    config.schedule.start_hours.clone()
                } else {
                    start_hours
                },
                accounts,
                require_all_accounts: all_accounts,
                recurring,
            });
            let job_id = manager.create(name, spec, true)?;
            println!("Schedule job {job_id} created and started");
        }
        JobCommands::CreateKeepalive { name, interval } => {
            let spec = JobSpec::KeepAlive(KeepAliveJobSpec {
                interval_secs: interval,
            });
            let job_id = manager.create(name, spec, true)?;
            println!("Keep-alive job {job_id} created and started");
        }
        JobCommands::List => {
            manager.cleanup_dead()?;
            let jobs = manager.list();
            if jobs.is_empty() {
                println!("No jobs");
                return Ok(());
            }
            println!(
                "{:<5} {:<20} {:<10} {:<10} {:<8} {:<17} {}",
                "ID", "Name", "Kind", "Status", "PID", "Created", "Last error"
            );
            for job in jobs {
                println!(
                    "{:<5} {:<20} {:<10} {:<10} {:<8} {:<17} {}",
                    job.job_id,
                    job.name,
                    job.kind().as_str(),
                    job.status.as_str(),
                    job.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    job.created_at.format("%m-%d %H:%M"),
                    job.error_message.as_deref().unwrap_or("-"),
                );
            }
        }
        JobCommands::Stop { job_id } => {
            manager.stop(&job_id)?;
            println!("Job {job_id} stopped");
        }
        JobCommands::Pause { job_id } => {
            manager.pause(&job_id)?;
            println!("Job {job_id} paused");
        }
        JobCommands::Resume { job_id } => {
            manager.resume(&job_id)?;
            println!("Job {job_id} resumed");
        }
        JobCommands::Delete { job_id } => {
            manager.delete(&job_id)?;
            println!("Job {job_id} deleted");
        }
        JobCommands::Logs { job_id, lines } => {
            for line in manager.logs(&job_id, lines)? {
                println!("{line}");
            }
        }
        JobCommands::Recover => {
            let recovered = manager.recover()?;
            let cleaned = manager.cleanup_dead()?;
            println!("Recovered {} job(s), demoted {cleaned}", recovered.len());
        }
    }
    Ok(())
}
