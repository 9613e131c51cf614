//! Durable background job orchestration
//!
//! Monitor and schedule logic runs as isolated OS processes: one process
//! per job, spawned from the current executable's hidden `job` subcommand,
//! stdout captured to a per-job log file. The job table is a single JSON
//! document persisted atomically, so jobs survive orchestrator restarts and
//! a crashed process is relaunched from its persisted spec.
//!
//! Process isolation is the fault-containment boundary here; a wedged or
//! leaking monitor cannot corrupt its siblings.

pub mod runner;

use chrono::{DateTime, NaiveDate, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{AvailabilityWindow, Target};

/// Job orchestration errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("job {0} is not a monitor job and cannot be paused")]
    NotPausable(String),

    #[error("failed to spawn job process: {0}")]
    Spawn(String),

    #[error("job table I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job table is corrupt: {0}")]
    Corrupt(String),

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Job kind, derived from the spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Monitor,
    Schedule,
    KeepAlive,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Schedule => "schedule",
            Self::KeepAlive => "keep_alive",
        }
    }
}

/// Declarative monitor job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorJobSpec {
    pub target: Target,

    /// Fixed date to watch; `None` scans every date on sale
    pub date: Option<NaiveDate>,

    pub interval_secs: u64,
    pub auto_book: bool,
    pub preferred_hours: Vec<u8>,
    pub preferred_days: Vec<u8>,

    /// Account nicknames to book with; empty means all usable accounts
    pub accounts: Vec<String>,
    pub require_all_accounts: bool,

    /// Active polling window (start hour, end hour)
    pub operating_window: Option<(u8, u8)>,

    /// Hard runtime cap in seconds (0 = unlimited)
    #[serde(default)]
    pub max_runtime_secs: u64,
}

/// Declarative schedule job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobSpec {
    pub target: Target,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,

    /// How many days ahead the fired booking targets
    pub date_offset_days: i64,

    /// Candidate start hours in priority order
    pub start_hours: Vec<u8>,

    pub accounts: Vec<String>,
    pub require_all_accounts: bool,

    /// Fire daily instead of once
    #[serde(default)]
    pub recurring: bool,
}

/// Keep-alive job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveJobSpec {
    pub interval_secs: u64,
}

/// A job's declarative configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Monitor(MonitorJobSpec),
    Schedule(ScheduleJobSpec),
    KeepAlive(KeepAliveJobSpec),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Monitor(_) => JobKind::Monitor,
            Self::Schedule(_) => JobKind::Schedule,
            Self::KeepAlive(_) => JobKind::KeepAlive,
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            Self::Monitor(spec) => {
                if spec.interval_secs == 0 {
                    return Err(JobError::InvalidSpec("interval must be positive".into()));
                }
                if let Some((start, end)) = spec.operating_window {
                    if start >= end || end > 24 {
                        return Err(JobError::InvalidSpec(format!(
                            "invalid operating window {start}-{end}"
                        )));
                    }
                }
            }
            Self::Schedule(spec) => {
                if spec.hour > 23 || spec.minute > 59 || spec.second > 59 {
                    return Err(JobError::InvalidSpec(format!(
                        "invalid fire time {:02}:{:02}:{:02}",
                        spec.hour, spec.minute, spec.second
                    )));
                }
                if spec.start_hours.is_empty() {
                    return Err(JobError::InvalidSpec("no candidate start hours".into()));
                }
            }
            Self::KeepAlive(spec) => {
                if spec.interval_secs == 0 {
                    return Err(JobError::InvalidSpec("interval must be positive".into()));
                }
            }
        }
        Ok(())
    }
}

/// Mutable runtime state a job process persists as it works.
///
/// An explicit value object with a persist-on-mutation contract; there is
/// no implicit shared state between the orchestrator and job processes
/// beyond this record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    pub last_check: Option<DateTime<Utc>>,
    pub found_windows: Vec<AvailabilityWindow>,
    pub booking_attempts: u32,
    pub successful_bookings: u32,
    pub last_error: Option<String>,
}

/// The durable record of one background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub job_id: String,
    pub name: String,
    pub spec: JobSpec,
    pub status: JobStatus,

    /// Cooperative pause flag; the monitor loop re-reads it each tick
    #[serde(default)]
    pub paused: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub pid: Option<i32>,
    pub error_message: Option<String>,
    pub log_path: PathBuf,

    #[serde(default)]
    pub state: JobState,
}

impl BackgroundJob {
    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }
}

/// Spawns the OS process for a job; swapped for a fake in tests
pub trait JobLauncher: Send + Sync {
    fn launch(&self, job: &BackgroundJob) -> Result<i32, JobError>;
}

/// Re-executes the current binary with the hidden `job` subcommand,
/// redirecting stdout and stderr to the job's log file
pub struct ProcessLauncher;

impl JobLauncher for ProcessLauncher {
    fn launch(&self, job: &BackgroundJob) -> Result<i32, JobError> {
        let exe = std::env::current_exe()
            .map_err(|e| JobError::Spawn(format!("cannot resolve current executable: {e}")))?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&job.log_path)?;
        let log_err = log.try_clone()?;

        let child = std::process::Command::new(exe)
            .arg("job")
            .arg("--job-id")
            .arg(&job.job_id)
            .stdout(std::process::Stdio::from(log))
            .stderr(std::process::Stdio::from(log_err))
            .spawn()
            .map_err(|e| JobError::Spawn(e.to_string()))?;

        Ok(child.id() as i32)
    }
}

/// Is the recorded pid a live process?
fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Orchestrates background jobs: persistence, spawn, signal, recovery
pub struct JobManager {
    data_dir: PathBuf,
    jobs_file: PathBuf,
    jobs: BTreeMap<String, BackgroundJob>,
    launcher: Box<dyn JobLauncher>,
}

impl JobManager {
    /// Open the job table under `data_dir`, creating it if absent
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, JobError> {
        Self::with_launcher(data_dir, Box::new(ProcessLauncher))
    }

    /// Open with a custom launcher (tests)
    pub fn with_launcher(
        data_dir: impl Into<PathBuf>,
        launcher: Box<dyn JobLauncher>,
    ) -> Result<Self, JobError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let mut manager = Self {
            jobs_file: data_dir.join("jobs.json"),
            data_dir,
            jobs: BTreeMap::new(),
            launcher,
        };
        manager.reload()?;
        Ok(manager)
    }

    /// Re-read the job table from disk
    pub fn reload(&mut self) -> Result<(), JobError> {
        if !self.jobs_file.exists() {
            self.jobs.clear();
            return Ok(());
        }
        let text = std::fs::read_to_string(&self.jobs_file)?;
        self.jobs = serde_json::from_str(&text).map_err(|e| JobError::Corrupt(e.to_string()))?;
        Ok(())
    }

    /// Persist atomically: temp file then rename
    fn persist(&self) -> Result<(), JobError> {
        let text = serde_json::to_string_pretty(&self.jobs)
            .map_err(|e| JobError::Corrupt(e.to_string()))?;
        let tmp = self.jobs_file.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.jobs_file)?;
        Ok(())
    }

    /// Small decimal ids, max existing + 1
    fn next_job_id(&self) -> String {
        let max = self
            .jobs
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max();
        match max {
            Some(n) => (n + 1).to_string(),
            None => "0".to_string(),
        }
    }

    /// Validate a spec, persist the job and (optionally) launch it
    pub fn create(
        &mut self,
        name: impl Into<String>,
        spec: JobSpec,
        auto_start: bool,
    ) -> Result<String, JobError> {
        spec.validate()?;

        let job_id = self.next_job_id();
        let job = BackgroundJob {
            log_path: self.data_dir.join(format!("{job_id}.log")),
            job_id: job_id.clone(),
            name: name.into(),
            spec,
            status: JobStatus::Pending,
            paused: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            pid: None,
            error_message: None,
            state: JobState::default(),
        };
        self.jobs.insert(job_id.clone(), job);
        self.persist()?;
        info!(job_id = %job_id, "Job created");

        if auto_start {
            self.start(&job_id)?;
        }
        Ok(job_id)
    }

    /// Launch a job's process
    pub fn start(&mut self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if job.status == JobStatus::Running && job.pid.map(pid_alive).unwrap_or(false) {
            return Err(JobError::AlreadyRunning(job_id.to_string()));
        }

        match self.launcher.launch(job) {
            Ok(pid) => {
                let job = self.jobs.get_mut(job_id).expect("checked above");
                job.pid = Some(pid);
                job.status = JobStatus::Running;
                job.paused = false;
                job.started_at = Some(Utc::now());
                job.stopped_at = None;
                job.error_message = None;
                self.persist()?;
                info!(job_id, pid, "Job started");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let job = self.jobs.get_mut(job_id).expect("checked above");
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
                job.stopped_at = Some(Utc::now());
                self.persist()?;
                Err(e)
            }
        }
    }

    /// Stop a job: SIGTERM, a grace period, then SIGKILL
    pub fn stop(&mut self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if let Some(pid) = job.pid {
            let pid = Pid::from_raw(pid);
            if kill(pid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(std::time::Duration::from_secs(2));
                if kill(pid, None).is_ok() {
                    warn!(job_id, "Graceful stop timed out; sending SIGKILL");
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
        }

        let job = self.jobs.get_mut(job_id).expect("checked above");
        job.status = JobStatus::Stopped;
        job.stopped_at = Some(Utc::now());
        self.persist()?;
        info!(job_id, "Job stopped");
        Ok(())
    }

    /// Pause a monitor job's poll loop without destroying its state
    pub fn pause(&mut self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.kind() != JobKind::Monitor {
            return Err(JobError::NotPausable(job_id.to_string()));
        }
        job.paused = true;
        job.status = JobStatus::Paused;
        self.persist()?;
        info!(job_id, "Job paused");
        Ok(())
    }

    /// Resume a paused monitor job
    pub fn resume(&mut self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.kind() != JobKind::Monitor {
            return Err(JobError::NotPausable(job_id.to_string()));
        }
        job.paused = false;
        if job.status == JobStatus::Paused {
            job.status = JobStatus::Running;
        }
        self.persist()?;
        info!(job_id, "Job resumed");
        Ok(())
    }

    /// Remove a job record, stopping its process first if needed
    pub fn delete(&mut self, job_id: &str) -> Result<(), JobError> {
        let running = self
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?
            .status
            == JobStatus::Running;
        if running {
            self.stop(job_id)?;
        }
        self.jobs.remove(job_id);
        self.persist()?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<&BackgroundJob> {
        self.jobs.get(job_id)
    }

    /// Jobs newest-first
    pub fn list(&self) -> Vec<&BackgroundJob> {
        let mut jobs: Vec<_> = self.jobs.values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Tail of a job's captured log
    pub fn logs(&self, job_id: &str, lines: usize) -> Result<Vec<String>, JobError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if !job.log_path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&job.log_path)?;
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| s.to_string()).collect())
    }

    /// Demote running jobs whose process has died
    pub fn cleanup_dead(&mut self) -> Result<usize, JobError> {
        let mut cleaned = 0;
        for job in self.jobs.values_mut() {
            if job.status == JobStatus::Running {
                let alive = job.pid.map(pid_alive).unwrap_or(false);
                if !alive {
                    job.status = JobStatus::Failed;
                    job.stopped_at = Some(Utc::now());
                    job.error_message = Some("process exited unexpectedly".into());
                    cleaned += 1;
                }
            }
        }
        if cleaned > 0 {
            self.persist()?;
        }
        Ok(cleaned)
    }

    /// Startup recovery: relaunch every job recorded as running whose
    /// process is gone. Live processes are left alone. Returns the ids of
    /// relaunched jobs.
    pub fn recover(&mut self) -> Result<Vec<String>, JobError> {
        let candidates: Vec<String> = self
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Running && !job.pid.map(pid_alive).unwrap_or(false)
            })
            .map(|job| job.job_id.clone())
            .collect();

        let mut recovered = Vec::new();
        for job_id in candidates {
            let log_path = self.jobs[&job_id].log_path.clone();
            append_log_line(
                &log_path,
                &format!(
                    "[{}] orchestrator: process dead, relaunching from persisted spec",
                    Utc::now().format("%Y-%m-%d %H:%M:%S")
                ),
            );

            match self.start(&job_id) {
                Ok(()) => {
                    info!(job_id = %job_id, "Recovered dead job");
                    recovered.push(job_id);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to recover job");
                    // start() already demoted the record to failed
                }
            }
        }
        Ok(recovered)
    }

    /// Apply a mutation to a job's runtime state and persist it.
    ///
    /// Job processes call this against their own record; the table is
    /// reloaded first so concurrent orchestrator edits are not clobbered.
    pub fn update_state<F>(&mut self, job_id: &str, mutate: F) -> Result<(), JobError>
    where
        F: FnOnce(&mut BackgroundJob),
    {
        self.reload()?;
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        mutate(job);
        self.persist()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn append_log_line(path: &Path, line: &str) {
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}
