//! Multi-stage launch of the primary runtime and the debug tool.
//!
//! Each stage is gated on a signal from the previous one:
//! primary prints "server started" -> side channel opened and installation directory known ->
//! debug tool spawned -> debug tool prints "server started" -> transport connected ->
//! attach acknowledged. The orchestrator performs the I/O of every stage, this module keeps the
//! phase and the spawned processes.

pub mod process;

use crate::config::LaunchConfig;
use crate::launch::process::{ManagedProcess, Notifier, ProcessSignal, ProcessSpec, Role};
use crate::repl::ConsoleKind;
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Phase {
    #[strum(serialize = "pre-launch")]
    PreLaunch,
    /// Primary runtime is up.
    #[strum(serialize = "repl-started")]
    ReplStarted,
    /// Debug tool process spawned.
    #[strum(serialize = "debugger-attached")]
    DebuggerAttached,
    /// Debug tool is up and the transport is connected to it.
    #[strum(serialize = "repl-ready")]
    ReplReady,
    #[strum(serialize = "launch-complete")]
    LaunchComplete,
}

impl Phase {
    /// Move forward to `to`. Return false (and keep the current phase) on attempt to go back.
    pub fn advance(&mut self, to: Phase) -> bool {
        if to <= *self {
            return false;
        }
        debug!(target: "launch", "phase {} -> {to}", *self);
        *self = to;
        true
    }
}

/// What a process signal means for the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do.
    Ignore,
    /// Primary runtime is ready, open the side channel and spawn the debug tool.
    PrimaryStarted,
    /// Debug tool is ready, connect the transport.
    DebugToolStarted,
    /// Debug tool reports that it is attached.
    Attached,
    /// Process exit before the launch is complete, launch is lost.
    EarlyExit(Role, Option<i32>),
    /// Process exit after a complete launch.
    Exited(Role, Option<i32>),
}

/// Transition function of the launch state machine.
pub fn step(phase: Phase, signal: &ProcessSignal) -> Step {
    match signal {
        ProcessSignal::Output {
            role,
            stream: ConsoleKind::Stdout,
            line,
        } => {
            if line.contains(process::SERVER_STARTED) {
                match (role, phase) {
                    (Role::Primary, Phase::PreLaunch) => return Step::PrimaryStarted,
                    (Role::DebugTool, Phase::DebuggerAttached) => return Step::DebugToolStarted,
                    _ => {}
                }
            }
            if line.contains(process::ATTACHED) && phase == Phase::ReplReady {
                return Step::Attached;
            }
            Step::Ignore
        }
        ProcessSignal::Output { .. } => Step::Ignore,
        ProcessSignal::Exited { role, code } if phase < Phase::LaunchComplete => {
            Step::EarlyExit(*role, *code)
        }
        ProcessSignal::Exited { role, code } => Step::Exited(*role, *code),
    }
}

/// Launch in progress (or done), owns spawned processes.
pub struct Launch {
    phase: Phase,
    config: LaunchConfig,
    notifier: Notifier,
    primary: Option<ManagedProcess>,
    debug_tool: Option<ManagedProcess>,
    workdir: Option<TempDir>,
    deadline: Option<Instant>,
}

impl Launch {
    pub fn new(config: LaunchConfig, notifier: Notifier) -> Self {
        let deadline = config.launch_timeout().map(|t| Instant::now() + t);
        Self {
            phase: Phase::PreLaunch,
            config,
            notifier,
            primary: None,
            debug_tool: None,
            workdir: None,
            deadline,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, to: Phase) -> bool {
        self.phase.advance(to)
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::LaunchComplete
    }

    /// Time left until the launch times out, `None` if there is no timeout.
    pub fn time_left(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Spawn primary runtime with remote debugging enabled.
    pub fn spawn_primary(&mut self) -> anyhow::Result<()> {
        let cfg = self
            .config
            .primary
            .as_ref()
            .ok_or_else(|| anyhow!("launch: missing arguments.primary"))?;

        let mut spec = ProcessSpec::from_config(cfg, self.config.cwd.as_deref())
            .with_env(&self.config.debug_flag_var, self.config.debug_flag());
        if let Some(home) = home::home_dir() {
            spec = spec.with_env("HOME", home.to_string_lossy());
        }

        self.primary = Some(ManagedProcess::spawn(
            Role::Primary,
            &spec,
            self.notifier.clone(),
        )?);
        Ok(())
    }

    /// Copy bootstrap project descriptor from the installation directory into a fresh temporary
    /// directory and spawn the debug tool there.
    pub fn spawn_debug_tool(&mut self, install_dir: &Path) -> anyhow::Result<()> {
        let cfg = self
            .config
            .debug_tool
            .as_ref()
            .ok_or_else(|| anyhow!("launch: missing arguments.debugTool"))?;

        let descriptor = install_dir.join(&self.config.bootstrap_descriptor);
        let file_name = descriptor
            .file_name()
            .ok_or_else(|| anyhow!("bad bootstrap descriptor {}", descriptor.display()))?;
        let workdir = tempfile::Builder::new()
            .prefix("replstalker-")
            .tempdir()
            .context("create debug tool directory")?;
        fs::copy(&descriptor, workdir.path().join(file_name))
            .with_context(|| format!("copy bootstrap descriptor {}", descriptor.display()))?;
        info!(target: "launch", "debug tool directory: {}", workdir.path().display());

        let spec = ProcessSpec::from_config(cfg, Some(workdir.path()));
        self.debug_tool = Some(ManagedProcess::spawn(
            Role::DebugTool,
            &spec,
            self.notifier.clone(),
        )?);
        self.workdir = Some(workdir);
        Ok(())
    }

    /// Force kill every spawned process.
    pub fn kill_all(&mut self) {
        for process in [self.debug_tool.take(), self.primary.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = process.kill() {
                warn!(target: "launch", "kill {} process: {e:#}", process.role());
            }
        }
    }
}

impl Drop for Launch {
    fn drop(&mut self) {
        self.kill_all();
    }
}
