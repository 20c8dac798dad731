//! Rate-limited job admission.
//!
//! The runner admits at most `per_interval` jobs per `interval` window and
//! runs at most `concurrency` concurrently. What happens to excess
//! submissions depends on the spill policy: `Queue` buffers them for later
//! windows, `Drop` rejects them immediately and hands them to the spill
//! hook so the submitter can fail them fast.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What to do with a submission that cannot be admitted right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpillPolicy {
    /// Reject the job immediately.
    #[default]
    Drop,
    /// Buffer the job for a later admission window.
    Queue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Length of one admission window.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Jobs admitted per window.
    #[serde(default = "default_per_interval")]
    pub per_interval: usize,

    /// Jobs running concurrently, across windows.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Start the tick loop on the first submission.
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    #[serde(default)]
    pub spill: SpillPolicy,
}

const fn default_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_per_interval() -> usize {
    10
}

const fn default_concurrency() -> usize {
    10
}

const fn default_autostart() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            per_interval: default_per_interval(),
            concurrency: default_concurrency(),
            autostart: default_autostart(),
            spill: SpillPolicy::default(),
        }
    }
}

/// Outcome of [`RateLimitedRunner::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Accepted,
    Dropped,
}

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Produces the future that runs one job.
pub type JobExec<J> = Arc<dyn Fn(J) -> JobFuture + Send + Sync>;

/// Receives jobs the runner refused to admit.
pub type SpillHook<J> = Arc<dyn Fn(J) + Send + Sync>;

struct LimiterState<J> {
    waiting: VecDeque<J>,
    window_start: Instant,
    admitted_in_window: usize,
    active: usize,
    running: bool,
    tick_token: Option<CancellationToken>,
}

struct RunnerInner<J> {
    config: RunnerConfig,
    exec: JobExec<J>,
    spill_hook: Option<SpillHook<J>>,
    state: Mutex<LimiterState<J>>,
    /// Notified whenever a job settles or the waiting buffer drains.
    idle: Notify,
    shut_down: AtomicBool,
    /// Kept outside the lock so flag reads never contend with admission.
    active_count: AtomicUsize,
}

/// A rate-limited job runner. Cloning shares the limiter.
pub struct RateLimitedRunner<J> {
    inner: Arc<RunnerInner<J>>,
}

impl<J> Clone for RateLimitedRunner<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<J: Send + 'static> RateLimitedRunner<J> {
    #[must_use]
    pub fn new(config: RunnerConfig, exec: JobExec<J>, spill_hook: Option<SpillHook<J>>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                config,
                exec,
                spill_hook,
                state: Mutex::new(LimiterState {
                    waiting: VecDeque::new(),
                    window_start: Instant::now(),
                    admitted_in_window: 0,
                    active: 0,
                    running: false,
                    tick_token: None,
                }),
                idle: Notify::new(),
                shut_down: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Submits one job. Admission is decided synchronously; accepted jobs
    /// run on spawned tasks.
    pub fn submit(&self, job: J) -> Submitted {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            self.inner.spill(job);
            return Submitted::Dropped;
        }
        if !self.running() {
            if self.inner.config.autostart {
                self.start();
            } else {
                self.inner.spill(job);
                return Submitted::Dropped;
            }
        }

        let admitted = {
            let mut state = self.inner.lock();
            state.refresh_window(self.inner.config.interval);
            if state.admits(&self.inner.config) {
                state.admitted_in_window += 1;
                state.active += 1;
                Some(job)
            } else if self.inner.config.spill == SpillPolicy::Queue {
                state.waiting.push_back(job);
                None
            } else {
                drop(state);
                self.inner.spill(job);
                return Submitted::Dropped;
            }
        };
        if let Some(job) = admitted {
            self.inner.launch(job);
        }
        Submitted::Accepted
    }

    /// Starts the tick loop. Idempotent.
    pub fn start(&self) {
        let token = {
            let mut state = self.inner.lock();
            if state.running {
                return;
            }
            state.running = true;
            let token = CancellationToken::new();
            state.tick_token = Some(token.clone());
            token
        };

        let inner = self.inner.clone();
        let interval = inner.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => inner.drain_waiting(),
                }
            }
            debug!("runner tick loop stopped");
        });
    }

    /// Stops admission and waits for active jobs to settle. Buffered jobs
    /// are spilled.
    pub async fn stop(&self) {
        let (token, spilled) = {
            let mut state = self.inner.lock();
            state.running = false;
            (state.tick_token.take(), state.waiting.drain(..).collect::<Vec<_>>())
        };
        if let Some(token) = token {
            token.cancel();
        }
        for job in spilled {
            self.inner.spill(job);
        }

        loop {
            let idle = self.inner.idle.notified();
            if self.inner.active_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stops and refuses all further submissions.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    /// Buffered plus active jobs.
    #[must_use]
    pub fn pressure(&self) -> usize {
        let state = self.inner.lock();
        state.waiting.len() + state.active
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.inner.lock().running
    }

    /// Whether any job is currently executing.
    #[must_use]
    pub fn working(&self) -> bool {
        self.inner.active_count.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl<J> LimiterState<J> {
    fn refresh_window(&mut self, interval: Duration) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= interval {
            let windows = elapsed.as_nanos() / interval.as_nanos().max(1);
            self.window_start += interval * u32::try_from(windows).unwrap_or(u32::MAX);
            self.admitted_in_window = 0;
        }
    }

    fn admits(&self, config: &RunnerConfig) -> bool {
        self.admitted_in_window < config.per_interval && self.active < config.concurrency
    }
}

impl<J: Send + 'static> RunnerInner<J> {
    fn lock(&self) -> MutexGuard<'_, LimiterState<J>> {
        relock(self.state.lock())
    }

    fn spill(&self, job: J) {
        debug!("job spilled");
        if let Some(hook) = &self.spill_hook {
            hook(job);
        }
    }

    fn launch(self: &Arc<Self>, job: J) {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        let fut = (self.exec)(job);
        let inner = self.clone();
        tokio::spawn(async move {
            fut.await;
            inner.finish();
        });
    }

    fn finish(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.refresh_window(self.config.interval);
            if state.running && state.admits(&self.config) {
                if let Some(job) = state.waiting.pop_front() {
                    state.admitted_in_window += 1;
                    state.active += 1;
                    Some(job)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
        if let Some(job) = next {
            self.launch(job);
        }
    }

    fn drain_waiting(self: &Arc<Self>) {
        let mut launch = Vec::new();
        {
            let mut state = self.lock();
            state.refresh_window(self.config.interval);
            while state.running && state.admits(&self.config) {
                let Some(job) = state.waiting.pop_front() else { break };
                state.admitted_in_window += 1;
                state.active += 1;
                launch.push(job);
            }
        }
        for job in launch {
            self.launch(job);
        }
    }
}
