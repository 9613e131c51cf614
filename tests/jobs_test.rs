//! Orchestrator durability scenarios
//!
//! The launcher is faked so no real processes spawn; everything else runs
//! through the public JobManager API against a real job table on disk.

mod common;

use common::test_target;
use courtside::jobs::{
    BackgroundJob, JobError, JobKind, JobLauncher, JobManager, JobSpec, JobStatus, MonitorJobSpec,
    ScheduleJobSpec,
};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct FakeLauncher {
    launches: Arc<AtomicU32>,
    next_pid: Arc<AtomicI32>,
}

impl FakeLauncher {
    fn new(pid: i32) -> (Self, Arc<AtomicU32>, Arc<AtomicI32>) {
        let launches = Arc::new(AtomicU32::new(0));
        let next_pid = Arc::new(AtomicI32::new(pid));
        (
            Self {
                launches: launches.clone(),
                next_pid: next_pid.clone(),
            },
            launches,
            next_pid,
        )
    }
}

impl JobLauncher for FakeLauncher {
    fn launch(&self, _job: &BackgroundJob) -> Result<i32, JobError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_pid.load(Ordering::SeqCst))
    }
}

fn live_pid() -> i32 {
    std::process::id() as i32
}

// Far above any realistic pid_max
const DEAD_PID: i32 = 0x3FFF_FF00;

fn monitor_spec() -> JobSpec {
    JobSpec::Monitor(MonitorJobSpec {
        target: test_target(),
        date: None,
        interval_secs: 120,
        auto_book: true,
        preferred_hours: vec![18, 19],
        preferred_days: vec![0, 7],
        accounts: vec!["alice".into()],
        require_all_accounts: false,
        operating_window: Some((7, 23)),
        max_runtime_secs: 0,
    })
}

fn schedule_spec() -> JobSpec {
    JobSpec::Schedule(ScheduleJobSpec {
        target: test_target(),
        hour: 12,
        minute: 0,
        second: 0,
        date_offset_days: 7,
        start_hours: vec![18],
        accounts: Vec::new(),
        require_all_accounts: true,
        recurring: false,
    })
}

#[test]
fn orchestrator_restart_relaunches_dead_running_job() {
    let dir = TempDir::new().unwrap();

    // First orchestrator lifetime: create and "run" a monitor job whose
    // process then dies (dead pid on record).
    {
        let (launcher, _, _) = FakeLauncher::new(DEAD_PID);
        let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();
        let id = manager.create("gym watch", monitor_spec(), true).unwrap();
        assert_eq!(manager.get(&id).unwrap().status, JobStatus::Running);
    }

    // Second lifetime: recovery must notice the dead pid, relaunch from the
    // persisted spec and note it in the job's log.
    let (launcher, launches, next_pid) = FakeLauncher::new(0);
    next_pid.store(live_pid(), Ordering::SeqCst);
    let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();

    let recovered = manager.recover().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    let job = manager.get(&recovered[0]).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.pid, Some(live_pid()));
    assert_eq!(job.kind(), JobKind::Monitor);

    let log = manager.logs(&recovered[0], 20).unwrap();
    assert!(
        log.iter().any(|l| l.contains("relaunching")),
        "recovery note missing from job log: {log:?}"
    );
}

#[test]
fn restart_leaves_live_jobs_untouched() {
    let dir = TempDir::new().unwrap();
    let id;
    {
        let (launcher, _, _) = FakeLauncher::new(live_pid());
        let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();
        id = manager.create("gym watch", monitor_spec(), true).unwrap();
    }

    let (launcher, launches, _) = FakeLauncher::new(live_pid());
    let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();
    let recovered = manager.recover().unwrap();

    assert!(recovered.is_empty());
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get(&id).unwrap().status, JobStatus::Running);
}

#[test]
fn job_spec_round_trips_through_the_table() {
    let dir = TempDir::new().unwrap();
    let (launcher, _, _) = FakeLauncher::new(live_pid());
    let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();
    let id = manager.create("noon rush", schedule_spec(), false).unwrap();

    let (launcher2, _, _) = FakeLauncher::new(live_pid());
    let reopened = JobManager::with_launcher(dir.path(), Box::new(launcher2)).unwrap();
    let job = reopened.get(&id).unwrap();

    assert_eq!(job.kind(), JobKind::Schedule);
    match &job.spec {
        JobSpec::Schedule(spec) => {
            assert_eq!(spec.hour, 12);
            assert_eq!(spec.date_offset_days, 7);
            assert!(spec.require_all_accounts);
            assert_eq!(spec.start_hours, vec![18]);
        }
        other => panic!("wrong spec kind: {other:?}"),
    }
}

#[test]
fn pause_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let (launcher, _, _) = FakeLauncher::new(live_pid());
    let mut manager = JobManager::with_launcher(dir.path(), Box::new(launcher)).unwrap();
    let id = manager.create("gym watch", monitor_spec(), true).unwrap();
    manager.pause(&id).unwrap();

    let (launcher2, _, _) = FakeLauncher::new(live_pid());
    let reopened = JobManager::with_launcher(dir.path(), Box::new(launcher2)).unwrap();
    let job = reopened.get(&id).unwrap();
    assert!(job.paused);
    assert_eq!(job.status, JobStatus::Paused);
}

#[test]
fn failed_job_record_and_log_survive_for_inspection() {
    struct BrokenLauncher;
    impl JobLauncher for BrokenLauncher {
        fn launch(&self, _job: &BackgroundJob) -> Result<i32, JobError> {
            Err(JobError::Spawn("binary missing".into()))
        }
    }

    let dir = TempDir::new().unwrap();
    let mut manager = JobManager::with_launcher(dir.path(), Box::new(BrokenLauncher)).unwrap();
    assert!(manager.create("doomed", monitor_spec(), true).is_err());

    // The record is queryable after failure; nothing is silently dropped
    let jobs = manager.list();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("binary missing"));
}
