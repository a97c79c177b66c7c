//! Run orchestration.
//!
//! One `tgprof launch` is a straight line through a small state machine:
//!
//! ```text
//! ResolveTag ─┬─> NoSwitch ──────────────> Launch ─> WaitForLiveness ─> Done
//!             └─> Prepare ─> ActivateTarget ─> Launch ─> WaitForLiveness
//!                   ─> Monitoring ─> Teardown ─> RestoreDefault ─> Done
//! ```
//!
//! Any stage may fail into `Error`. From `ActivateTarget` on, a
//! `RestoreGuard` is armed; if the run leaves that window by any route
//! other than a successful `RestoreDefault`, dropping the guard closes the
//! client and puts the default profile back.

use anyhow::{Context, Result};
use chrono::TimeDelta;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::error::{ConfigError, ProcessError};
use crate::monitor::ProcessMonitor;
use crate::process::ProcessTable;
use crate::swap::{SwapEngine, SwapOutcome};
use crate::tags::{find_tag_dir, is_tag_active};

/// Upper bound on how long the monitoring wait sleeps between looks
const WAIT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveTag,
    NoSwitch,
    Prepare,
    ActivateTarget,
    Launch,
    WaitForLiveness,
    Monitoring,
    Teardown,
    RestoreDefault,
    Done,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveTag => "resolve-tag",
            Stage::NoSwitch => "no-switch",
            Stage::Prepare => "prepare",
            Stage::ActivateTarget => "activate-target",
            Stage::Launch => "launch",
            Stage::WaitForLiveness => "wait-for-liveness",
            Stage::Monitoring => "monitoring",
            Stage::Teardown => "teardown",
            Stage::RestoreDefault => "restore-default",
            Stage::Done => "done",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Timing knobs for starting and watching the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPolicy {
    /// Liveness checks before giving up on startup (also bounds waiting for a
    /// terminated client to go away)
    pub attempts: u32,
    /// Pause between two of those checks
    pub interval: Duration,
    /// Monitor poll interval while the client runs
    pub poll_interval: Duration,
    /// Pause between closing the client and restoring the default profile
    pub restore_delay: Duration,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            restore_delay: Duration::from_secs(1),
        }
    }
}

/// How a successful run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The default profile was launched and left running
    Launched { tag: String },
    /// A profile was switched in, used, and switched back out
    Completed { tag: String, session: Duration },
}

/// Puts the default profile back unless disarmed
///
/// Armed before the first rename of a run. On drop while armed it closes
/// the client, waits for it to let go of the profile and restores the
/// default.
pub struct RestoreGuard {
    engine: SwapEngine,
    processes: Arc<dyn ProcessTable>,
    client: String,
    delay: Duration,
    armed: bool,
}

impl RestoreGuard {
    pub fn arm(
        engine: SwapEngine,
        processes: Arc<dyn ProcessTable>,
        client: impl Into<String>,
        delay: Duration,
    ) -> Self {
        debug!("restore guard armed");
        Self {
            engine,
            processes,
            client: client.into(),
            delay,
            armed: true,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn disarm(mut self) {
        self.armed = false;
        debug!("restore guard disarmed");
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("run ended abnormally, restoring the default profile");

        match self.processes.terminate_process(&self.client) {
            Ok(true) => info!(client = %self.client, "closed client before restore"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "could not close client before restore"),
        }
        std::thread::sleep(self.delay);

        match self.engine.restore() {
            Ok(_) => info!("default profile restored"),
            Err(err) => error!(
                user_facing = true,
                error = %err,
                "failed to restore the default profile; check the installation with `tgprof doctor`"
            ),
        }
    }
}

pub struct Orchestrator {
    store: ConfigStore,
    engine: SwapEngine,
    processes: Arc<dyn ProcessTable>,
    policy: LaunchPolicy,
    interrupted: Arc<AtomicBool>,
    stage: Stage,
}

impl Orchestrator {
    pub fn new(store: ConfigStore, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            engine: SwapEngine::new(store.clone()),
            store,
            processes,
            policy: LaunchPolicy::default(),
            interrupted: Arc::new(AtomicBool::new(false)),
            stage: Stage::ResolveTag,
        }
    }

    pub fn with_engine(mut self, engine: SwapEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_policy(mut self, policy: LaunchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Flag that ends monitoring early when set
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Route SIGINT and SIGTERM to the interrupt flag
    #[cfg(unix)]
    pub fn register_interrupts(&self) -> std::io::Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.interrupted))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn register_interrupts(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Check that the configuration can carry a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let config = self.store.configs();
        let root = self.store.install_dir();

        if config.path.is_empty() {
            return Err(ConfigError::Invalid(
                "Client path is not set. Run `tgprof detect` or `tgprof settings`.".to_string(),
            ));
        }
        if !root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "Client path {} is not a directory. Fix it with `tgprof settings`.",
                root.display()
            )));
        }
        let exe = root.join(&config.client);
        if config.client.is_empty() || !exe.is_file() {
            return Err(ConfigError::Invalid(format!(
                "Client executable {} not found. Fix it with `tgprof settings`.",
                exe.display()
            )));
        }
        if config.default.is_empty() {
            return Err(ConfigError::Invalid(
                "No default tag set. Run `tgprof default <TAG>`.".to_string(),
            ));
        }
        if find_tag_dir(&root, &config.default).is_none() {
            return Err(ConfigError::Invalid(format!(
                "No profile under {} carries the default tag '{}'.",
                root.display(),
                config.default
            )));
        }
        Ok(())
    }

    /// Perform one run for the tag stored as the active tag
    pub fn run(&mut self) -> Result<RunOutcome> {
        let result = self.run_stages();
        match &result {
            Ok(outcome) => debug!(?outcome, "run finished"),
            Err(err) => {
                error!(stage = %self.stage, error = %format!("{err:#}"), "run failed");
                self.enter(Stage::Error);
            }
        }
        result
    }

    fn run_stages(&mut self) -> Result<RunOutcome> {
        self.enter(Stage::ResolveTag);
        self.validate()?;

        let requested = self.store.active_tag();
        let (tag, fell_back) = self.engine.resolve_tag(&requested);
        if fell_back {
            warn!(
                user_facing = true,
                requested = %requested,
                default = %tag,
                "Tag '{}' is not registered, launching the default profile",
                requested
            );
        }
        if tag == self.store.default_tag() {
            return self.run_without_switch(tag);
        }

        self.enter(Stage::Prepare);
        self.close_running_client()?;

        self.enter(Stage::ActivateTarget);
        let guard = RestoreGuard::arm(
            self.engine.clone(),
            Arc::clone(&self.processes),
            self.store.client(),
            self.policy.restore_delay,
        );
        let activation = self
            .engine
            .activate(&tag)
            .with_context(|| format!("Failed to activate profile '{}'", tag))?;
        if activation.outcome == SwapOutcome::AlreadyActive {
            warn!(tag = %tag, "profile was already in the active slot");
        }

        self.enter(Stage::Launch);
        self.launch()?;

        self.enter(Stage::WaitForLiveness);
        self.wait_for_liveness()?;

        self.enter(Stage::Monitoring);
        let session = self.monitor()?;

        self.enter(Stage::Teardown);
        if self.interrupted() {
            info!("interrupted, closing the client");
            self.close_running_client()?;
            std::thread::sleep(self.policy.restore_delay);
        }

        self.enter(Stage::RestoreDefault);
        self.engine
            .restore()
            .context("Failed to restore the default profile")?;
        guard.disarm();
        self.store.set_run_complete(true);

        self.enter(Stage::Done);
        info!(tag = %tag, duration = %format_session(session), "session finished");
        Ok(RunOutcome::Completed { tag, session })
    }

    fn run_without_switch(&mut self, tag: String) -> Result<RunOutcome> {
        self.enter(Stage::NoSwitch);

        let root = self.store.install_dir();
        if !is_tag_active(&root, &tag) {
            self.close_running_client()?;
        }
        self.engine
            .restore()
            .context("Failed to activate the default profile")?;

        self.enter(Stage::Launch);
        self.launch()?;

        self.enter(Stage::WaitForLiveness);
        self.wait_for_liveness()?;

        self.store.set_run_complete(true);
        self.enter(Stage::Done);
        info!(tag = %tag, "launched default profile");
        Ok(RunOutcome::Launched { tag })
    }

    /// Terminate a running client and wait until it is gone
    fn close_running_client(&self) -> Result<(), ProcessError> {
        let client = self.store.client();
        if !self.processes.is_process_alive(&client) {
            return Ok(());
        }

        info!(client = %client, "client is running, closing it");
        self.processes.terminate_process(&client)?;

        for _ in 0..self.policy.attempts {
            if !self.processes.is_process_alive(&client) {
                self.store.set_process_alive(false);
                return Ok(());
            }
            std::thread::sleep(self.policy.interval);
        }
        Err(ProcessError::Terminate {
            name: client,
            reason: "still running after SIGTERM".to_string(),
        })
    }

    fn launch(&self) -> Result<u32, ProcessError> {
        let root = self.store.install_dir();
        let exe = root.join(self.store.client());
        self.processes.spawn_detached(&exe, &root)
    }

    fn wait_for_liveness(&self) -> Result<(), ProcessError> {
        let client = self.store.client();
        for attempt in 1..=self.policy.attempts {
            if self.processes.is_process_alive(&client) {
                debug!(attempt, "client is up");
                self.store.set_process_alive(true);
                return Ok(());
            }
            std::thread::sleep(self.policy.interval);
        }
        Err(ProcessError::StartupTimeout {
            name: client,
            attempts: self.policy.attempts,
        })
    }

    /// Block until the client exits or the run is interrupted
    fn monitor(&self) -> Result<Duration, ProcessError> {
        let started = Instant::now();
        let mut monitor = ProcessMonitor::new(
            self.store.client(),
            self.policy.poll_interval,
            Arc::clone(&self.processes),
        )
        .with_initial_state(true);

        let store = self.store.clone();
        monitor.on_transition(move |alive| {
            store.set_process_alive(alive);
            Ok(())
        });
        monitor.start()?;

        let tick = WAIT_TICK.min(self.policy.poll_interval);
        while self.store.process_alive() && !self.interrupted() {
            std::thread::sleep(tick);
        }
        monitor.stop();

        Ok(started.elapsed())
    }
}

/// Format a session length as `{h}h {m}m {s}s`
pub fn format_session(elapsed: Duration) -> String {
    let Ok(delta) = TimeDelta::from_std(elapsed) else {
        return format!("{}s", elapsed.as_secs());
    };
    format!(
        "{}h {}m {}s",
        delta.num_hours(),
        delta.num_minutes() % 60,
        delta.num_seconds() % 60
    )
}
