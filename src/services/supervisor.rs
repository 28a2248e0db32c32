//! Supervisor scheduler (C10): a durable cron/one-shot runner for round
//! creation, score evaluation, and ELO calculation, with crash detection and
//! automatic restart.
//!
//! Grounded on `jobs.py`'s `job_error_handler` decorator (every task is
//! wrapped so a thrown error is logged and swallowed rather than reaching
//! the scheduler loop) and on `data-portal/src/scheduler/scheduler.py`'s
//! monitor/runner split — reworked onto `tokio` tasks plus a hand-rolled
//! `Notify`-based shutdown signal instead of APScheduler's own lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use croner::Cron;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::error::CoreResult;

const MONITOR_POLL_INTERVAL: StdDuration = StdDuration::from_secs(10);
const RUNNER_STOP_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const RESOURCE_CLOSE_TIMEOUT: StdDuration = StdDuration::from_secs(3);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type JobFn = Arc<dyn Fn() -> BoxFuture<CoreResult<()>> + Send + Sync>;

/// Wraps `job` so any error it returns is logged with the job id and never
/// propagated — the uniform error boundary every registered task runs
/// under, mirroring `job_error_handler`.
async fn run_guarded(id: &str, job: &JobFn) {
    match job().await {
        Ok(()) => {}
        Err(e) => error!(job = id, error = %e, "job failed, scheduler continues"),
    }
}

/// A recurring job driven by a cron expression, fired at most once per
/// elapsed occurrence (`coalesce = latest`: if several fire times were
/// missed, only the most recent runs).
struct CronJob {
    id: String,
    cron: Cron,
    task: JobFn,
    next_fire: Mutex<Option<chrono::DateTime<Utc>>>,
}

/// A job that fires exactly once at `fire_at`, then is removed.
struct OneShotJob {
    id: String,
    fire_at: chrono::DateTime<Utc>,
    task: JobFn,
}

/// Mutable job set a running scheduler instance owns; rebuilt from scratch
/// on every restart since a crashed instance's internal state is presumed
/// corrupt.
#[derive(Default)]
struct JobSet {
    cron_jobs: Vec<CronJob>,
    one_shots: Vec<OneShotJob>,
}

impl JobSet {
    fn add_cron(&mut self, id: impl Into<String>, expression: &str, task: JobFn) -> CoreResult<()> {
        let mut cron = Cron::new(expression);
        cron.parse()
            .map_err(|e| crate::error::CoreError::invalid_config(format!("invalid cron expression '{expression}': {e}")))?;
        self.cron_jobs.push(CronJob {
            id: id.into(),
            cron,
            task,
            next_fire: Mutex::new(None),
        });
        Ok(())
    }

    fn add_one_shot(&mut self, id: impl Into<String>, fire_at: chrono::DateTime<Utc>, task: JobFn) {
        self.one_shots.push(OneShotJob { id: id.into(), fire_at, task });
    }
}

/// Handle the supervisor's task-registration surface exposes to callers
/// wiring up jobs (e.g. round preparation registering its own one-shot after
/// a round is created).
pub struct SupervisorHandle {
    jobs: Mutex<JobSet>,
    shutdown: Arc<Notify>,
}

impl SupervisorHandle {
    pub fn register_cron(&self, id: impl Into<String>, expression: &str, task: JobFn) -> CoreResult<()> {
        self.jobs.lock().add_cron(id, expression, task)
    }

    pub fn register_one_shot(&self, id: impl Into<String>, fire_at: chrono::DateTime<Utc>, task: JobFn) {
        self.jobs.lock().add_one_shot(id, fire_at, task);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Run one scheduler instance's event loop: every tick, fire any cron job
/// whose next occurrence has elapsed and any one-shot whose `fire_at` has
/// passed, each wrapped by [`run_guarded`]. Returns when `shutdown` fires.
async fn run_loop(handle: Arc<SupervisorHandle>) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(1));
    loop {
        tokio::select! {
            _ = handle.shutdown.notified() => {
                info!("run loop received shutdown signal");
                return;
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                let due_cron: Vec<(String, JobFn)> = {
                    let jobs = handle.jobs.lock();
                    jobs.cron_jobs
                        .iter()
                        .filter_map(|job| {
                            let mut next_fire = job.next_fire.lock();
                            if next_fire.is_none() {
                                *next_fire = job.cron.find_next_occurrence(&now, false).ok();
                            }
                            match *next_fire {
                                Some(fire_at) if fire_at <= now => {
                                    *next_fire = job.cron.find_next_occurrence(&now, false).ok();
                                    Some((job.id.clone(), job.task.clone()))
                                }
                                _ => None,
                            }
                        })
                        .collect()
                };
                let due_one_shots: Vec<(String, JobFn)> = {
                    let mut jobs = handle.jobs.lock();
                    let (due, remaining): (Vec<_>, Vec<_>) =
                        jobs.one_shots.drain(..).partition(|job| job.fire_at <= now);
                    jobs.one_shots = remaining;
                    due.into_iter().map(|job| (job.id, job.task)).collect()
                };

                for (id, task) in due_cron.into_iter().chain(due_one_shots) {
                    tokio::task::spawn(async move {
                        run_guarded(&id, &task).await;
                    });
                }
            }
        }
    }
}

/// Factory the monitor calls to build a fresh scheduler instance on
/// restart: reloads schedules, re-registers the fixed periodic jobs, and
/// returns the handle to drive a new `run_loop`.
pub type SchedulerFactory = Arc<dyn Fn() -> BoxFuture<CoreResult<Arc<SupervisorHandle>>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restart_attempts: u32,
    pub restart_delay: StdDuration,
}

/// Owns the crash-detection monitor: watches the run loop's task handle and
/// restarts it from a freshly built scheduler instance on unexpected
/// completion, up to `max_restart_attempts`.
pub struct Supervisor {
    factory: SchedulerFactory,
    restart_policy: RestartPolicy,
    shutdown: Arc<Notify>,
    restart_count: AtomicU32,
}

impl Supervisor {
    pub fn new(factory: SchedulerFactory, restart_policy: RestartPolicy) -> Self {
        Self {
            factory,
            restart_policy,
            shutdown: Arc::new(Notify::new()),
            restart_count: AtomicU32::new(0),
        }
    }

    /// Run until `request_shutdown()` is called on the returned handle's
    /// lineage, or restart attempts are exhausted.
    ///
    /// A freshly built instance that survives past `restart_delay` without
    /// crashing is considered a clean startup: the consecutive-crash counter
    /// resets to zero so `max_restart_attempts` bounds a *streak* of crashes
    /// rather than the lifetime total, matching a long-lived process that
    /// crashes occasionally but always recovers.
    #[instrument(skip(self))]
    pub async fn run(&self) -> CoreResult<()> {
        loop {
            let handle = (self.factory)().await?;
            let runner = tokio::task::spawn(run_loop(Arc::clone(&handle)));
            tokio::pin!(runner);
            let settle = tokio::time::sleep(self.restart_policy.restart_delay);
            tokio::pin!(settle);
            let mut settled = false;

            let result = loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("shutdown requested, stopping runner");
                        handle.request_shutdown();
                        if timeout(RUNNER_STOP_TIMEOUT, &mut runner).await.is_err() {
                            warn!("runner did not stop within timeout, abandoning task");
                        }
                        if timeout(RESOURCE_CLOSE_TIMEOUT, async {}).await.is_err() {
                            warn!("resource scope close exceeded timeout");
                        }
                        return Ok(());
                    }
                    _ = &mut settle, if !settled => {
                        settled = true;
                        self.restart_count.store(0, Ordering::SeqCst);
                        info!("runner survived restart delay, resetting crash counter");
                    }
                    result = &mut runner => {
                        break result;
                    }
                }
            };

            match result {
                Ok(()) => {
                    info!("run loop exited cleanly");
                    return Ok(());
                }
                Err(join_error) => {
                    let attempts = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts > self.restart_policy.max_restart_attempts {
                        error!(attempts, "exceeded max restart attempts, giving up");
                        return Err(crate::error::CoreError::scheduler_crash(
                            "supervisor",
                            attempts,
                            join_error.to_string(),
                        ));
                    }
                    warn!(attempts, error = %join_error, "run loop crashed, restarting after delay");
                    tokio::time::sleep(self.restart_policy.restart_delay).await;
                }
            }
        }
    }

    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}

/// Poll `run_handle`'s liveness every [`MONITOR_POLL_INTERVAL`]; intended to
/// run alongside [`Supervisor::run`] as a separate task for deployments that
/// want an independent crash-detection signal (e.g. for metrics). The
/// `Supervisor::run` loop above already detects completion directly via
/// `tokio::select!`; this helper exists for callers that want the same
/// "wakes every 10 seconds" cadence described independently of task
/// awaiting, such as a liveness probe that should keep polling even if the
/// runner task panics in a way `JoinHandle::await` itself cannot observe
/// until the next poll.
pub async fn monitor_poll_forever(check: impl Fn() -> bool) {
    let mut ticker = tokio::time::interval(MONITOR_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if !check() {
            return;
        }
    }
}

/// Build a boxed, clonable job closure from an async function pointer —
/// convenience for registering the fixed periodic jobs.
pub fn job<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<CoreResult<()>>)
}

pub fn new_handle() -> Arc<SupervisorHandle> {
    Arc::new(SupervisorHandle {
        jobs: Mutex::new(JobSet::default()),
        shutdown: Arc::new(Notify::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn guarded_job_failure_does_not_panic_caller() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let failing: JobFn = job(move || {
            let counter = Arc::clone(&counter_clone);
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Err(crate::error::CoreError::invalid_config("boom"))
            }
        });
        run_guarded("test-job", &failing).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_shot_job_fires_and_is_removed() {
        let handle = new_handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        handle.register_one_shot(
            "prepare_challenge_1",
            Utc::now() - chrono::Duration::seconds(1),
            job(move || {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                }
            }),
        );

        let handle_clone = Arc::clone(&handle);
        let loop_task = tokio::task::spawn(run_loop(handle_clone));
        tokio::time::sleep(StdDuration::from_millis(1200)).await;
        handle.request_shutdown();
        let _ = timeout(StdDuration::from_secs(2), loop_task).await;

        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(handle.jobs.lock().one_shots.is_empty());
    }
}
