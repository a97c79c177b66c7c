//! Client liveness monitor.
//!
//! `ProcessMonitor` polls the process table on a tokio current-thread
//! runtime that lives on its own OS thread, so the blocking control flow of
//! the orchestrator never has to yield to it. Each check runs on the
//! blocking pool. Callbacks fire once per liveness transition, each on the
//! blocking pool, so a slow callback never delays the next check. Finished
//! callbacks are reaped every tick; a failing one is logged and the loop
//! carries on.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::process::ProcessTable;

/// Called with the new liveness state on every transition
pub type LivenessCallback = Arc<dyn Fn(bool) -> anyhow::Result<()> + Send + Sync>;

struct Running {
    shutdown: Arc<Notify>,
    thread: JoinHandle<()>,
}

pub struct ProcessMonitor {
    name: String,
    interval: Duration,
    initial_alive: bool,
    processes: Arc<dyn ProcessTable>,
    callbacks: Vec<LivenessCallback>,
    running: Option<Running>,
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("callbacks", &self.callbacks.len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl ProcessMonitor {
    pub fn new(name: impl Into<String>, interval: Duration, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            name: name.into(),
            interval,
            initial_alive: false,
            processes,
            callbacks: Vec::new(),
            running: None,
        }
    }

    /// Liveness assumed before the first check
    ///
    /// The first check only fires callbacks if it disagrees with this.
    pub fn with_initial_state(mut self, alive: bool) -> Self {
        self.initial_alive = alive;
        self
    }

    pub fn on_transition<F>(&mut self, callback: F)
    where
        F: Fn(bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start polling in the background
    ///
    /// Starting a monitor that is already running is an error.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if self.running.is_some() {
            return Err(ProcessError::MonitorRunning);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(ProcessError::MonitorStart)?;

        let shutdown = Arc::new(Notify::new());
        let poller = Poller {
            name: self.name.clone(),
            interval: self.interval,
            last_alive: self.initial_alive,
            processes: Arc::clone(&self.processes),
            callbacks: self.callbacks.clone(),
            shutdown: Arc::clone(&shutdown),
        };

        let thread = std::thread::Builder::new()
            .name(format!("monitor-{}", self.name))
            .spawn(move || runtime.block_on(poller.run()))
            .map_err(ProcessError::MonitorStart)?;

        debug!(name = %self.name, interval_ms = self.interval.as_millis() as u64, "monitor started");
        self.running = Some(Running { shutdown, thread });
        Ok(())
    }

    /// Stop polling and wait for the loop to exit
    ///
    /// Callbacks already fired are allowed to finish. Stopping a monitor
    /// that is not running does nothing.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.notify_one();
        if running.thread.join().is_err() {
            warn!(name = %self.name, "monitor thread panicked");
        }
        debug!(name = %self.name, "monitor stopped");
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    name: String,
    interval: Duration,
    last_alive: bool,
    processes: Arc<dyn ProcessTable>,
    callbacks: Vec<LivenessCallback>,
    shutdown: Arc<Notify>,
}

impl Poller {
    async fn run(mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();
        let shutdown = Arc::clone(&self.shutdown);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    reap_finished(&self.name, &mut in_flight);
                    let alive = self.check().await;
                    if alive != self.last_alive {
                        info!(name = %self.name, alive, "client liveness changed");
                        self.last_alive = alive;
                        for callback in &self.callbacks {
                            let callback = Arc::clone(callback);
                            in_flight.spawn_blocking(move || callback(alive));
                        }
                    }
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            log_callback_result(&self.name, result);
        }
    }

    async fn check(&self) -> bool {
        let processes = Arc::clone(&self.processes);
        let name = self.name.clone();
        match tokio::task::spawn_blocking(move || processes.is_process_alive(&name)).await {
            Ok(alive) => alive,
            Err(err) => {
                warn!(name = %self.name, error = %err, "liveness check did not complete");
                false
            }
        }
    }
}

/// Collect callbacks that already returned, without waiting on the rest
fn reap_finished(name: &str, in_flight: &mut JoinSet<anyhow::Result<()>>) -> usize {
    let mut reaped = 0;
    while let Some(result) = in_flight.try_join_next() {
        log_callback_result(name, result);
        reaped += 1;
    }
    reaped
}

fn log_callback_result(name: &str, result: Result<anyhow::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(name = %name, error = %err, "liveness callback failed"),
        Err(err) => warn!(name = %name, error = %err, "liveness callback panicked"),
    }
}
