use crate::config::ProcessConfig;
use crate::error::Error;
use crate::repl::ConsoleKind;
use anyhow::Context;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use strum_macros::{Display, IntoStaticStr};

/// Printed by an evaluation server once it accepts connections.
pub const SERVER_STARTED: &str = "server started";
/// Printed by the debug tool once it is attached to the primary process.
pub const ATTACHED: &str = "attached to process";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Role {
    #[strum(serialize = "primary")]
    Primary,
    #[strum(serialize = "debug-tool")]
    DebugTool,
}

/// Something happened to a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSignal {
    Output {
        role: Role,
        stream: ConsoleKind,
        line: String,
    },
    Exited {
        role: Role,
        code: Option<i32>,
    },
}

pub type Notifier = Arc<dyn Fn(ProcessSignal) + Send + Sync>;

/// Everything needed to start a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn from_config(cfg: &ProcessConfig, cwd: Option<&Path>) -> Self {
        Self {
            program: cfg.command.clone(),
            args: cfg.args.clone(),
            cwd: cwd.map(Path::to_path_buf),
            env: cfg
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }
}

/// Child process with watcher threads attached.
#[derive(Debug)]
pub struct ManagedProcess {
    role: Role,
    pid: Pid,
    /// Set once the child is reaped, its pid may belong to another process after that.
    exited: Arc<AtomicBool>,
}

impl ManagedProcess {
    /// Spawn a process. Every output line and the exit are reported through `notifier`.
    pub fn spawn(role: Role, spec: &ProcessSpec, notifier: Notifier) -> anyhow::Result<Self> {
        let program = if !Path::new(&spec.program).exists() {
            which::which(&spec.program)
                .with_context(|| format!("{role} executable `{}` not found", spec.program))?
                .to_string_lossy()
                .to_string()
        } else {
            spec.program.clone()
        };

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {role} process `{program}`"))?;
        let pid = Pid::from_raw(child.id() as i32);
        info!(target: "launch", "{role} process started: {program} (pid {pid})");

        let readers = [
            child
                .stdout
                .take()
                .map(|out| forward_lines(role, ConsoleKind::Stdout, out, notifier.clone())),
            child
                .stderr
                .take()
                .map(|err| forward_lines(role, ConsoleKind::Stderr, err, notifier.clone())),
        ];

        let exited = Arc::new(AtomicBool::new(false));
        let reaped = exited.clone();
        thread::Builder::new()
            .name(format!("{role}-wait"))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(target: "launch", "wait for {role} process: {e}");
                        None
                    }
                };
                reaped.store(true, Ordering::SeqCst);
                // report the tail of output before the exit
                for reader in readers.into_iter().flatten() {
                    let _ = reader.join();
                }
                debug!(target: "launch", "{role} process exited with {code:?}");
                notifier(ProcessSignal::Exited { role, code });
            })?;

        Ok(Self { role, pid, exited })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Force kill process. No-op for an already reaped process.
    pub fn kill(&self) -> Result<(), Error> {
        if self.has_exited() {
            debug!(target: "launch", "{} process already exited", self.role);
            return Ok(());
        }
        debug!(target: "launch", "kill {} process (pid {})", self.role, self.pid);
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::IO(e.into())),
        }
    }
}

fn forward_lines(
    role: Role,
    stream: ConsoleKind,
    source: impl Read + Send + 'static,
    notifier: Notifier,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = String::new();
        loop {
            buf.clear();
            match reader.read_line(&mut buf) {
                Ok(0) => break,
                Ok(_) => notifier(ProcessSignal::Output {
                    role,
                    stream,
                    line: buf.clone(),
                }),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn collect() -> (Notifier, mpsc::Receiver<ProcessSignal>) {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let notifier: Notifier = Arc::new(move |signal| {
            let _ = tx.lock().unwrap().send(signal);
        });
        (notifier, rx)
    }

    #[test]
    fn test_output_then_exit() {
        let (notifier, rx) = collect();
        let spec = ProcessSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo \"$GREETING started\"; echo oops >&2; exit 3".to_string(),
            ],
            ..Default::default()
        }
        .with_env("GREETING", "server");
        ManagedProcess::spawn(Role::Primary, &spec, notifier).unwrap();

        let mut signals = vec![];
        loop {
            let signal = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            let exited = matches!(signal, ProcessSignal::Exited { .. });
            signals.push(signal);
            if exited {
                break;
            }
        }

        assert!(signals.contains(&ProcessSignal::Output {
            role: Role::Primary,
            stream: ConsoleKind::Stdout,
            line: "server started\n".to_string(),
        }));
        assert!(signals.contains(&ProcessSignal::Output {
            role: Role::Primary,
            stream: ConsoleKind::Stderr,
            line: "oops\n".to_string(),
        }));
        assert_eq!(
            signals.last(),
            Some(&ProcessSignal::Exited {
                role: Role::Primary,
                code: Some(3),
            })
        );
    }

    #[test]
    fn test_kill() {
        let (notifier, rx) = collect();
        let spec = ProcessSpec {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..Default::default()
        };
        let process = ManagedProcess::spawn(Role::DebugTool, &spec, notifier).unwrap();
        process.kill().unwrap();
        let signal = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            signal,
            ProcessSignal::Exited {
                role: Role::DebugTool,
                code: None,
            }
        );
        // pid of a reaped process is not signalled again
        assert!(process.has_exited());
        process.kill().unwrap();
    }

    #[test]
    fn test_exited_process_is_not_killed() {
        let (notifier, rx) = collect();
        let spec = ProcessSpec {
            program: "true".to_string(),
            ..Default::default()
        };
        let process = ManagedProcess::spawn(Role::Primary, &spec, notifier).unwrap();
        let signal = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            signal,
            ProcessSignal::Exited {
                role: Role::Primary,
                code: Some(0),
            }
        );
        assert!(process.has_exited());
        assert!(process.kill().is_ok());
    }

    #[test]
    fn test_missing_executable() {
        let (notifier, _rx) = collect();
        let spec = ProcessSpec {
            program: "definitely-not-a-real-binary-xyz".to_string(),
            ..Default::default()
        };
        assert!(ManagedProcess::spawn(Role::Primary, &spec, notifier).is_err());
    }
}
