use crate::runtime::pidfile::PidFile;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

const DEFAULT_START_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_INTERRUPT_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_TERMINATE_WAIT: Duration = Duration::from_secs(10);
const EXIT_POLL: Duration = Duration::from_millis(250);

/// Lifecycle operations the controller performs on the measurement supervisor.
pub trait SupervisorControl: Send + Sync {
    fn is_running(&self) -> bool;

    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Escalating stop; returns once the process is gone.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    fn reload(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub pidfile: PathBuf,
    pub command: Vec<String>,
    pub output: PathBuf,
    pub start_grace: Duration,
    pub interrupt_wait: Duration,
    pub terminate_wait: Duration,
}

impl ProcessSettings {
    pub fn new(pidfile: PathBuf, command: Vec<String>, output: PathBuf) -> Self {
        Self {
            pidfile,
            command,
            output,
            start_grace: DEFAULT_START_GRACE,
            interrupt_wait: DEFAULT_INTERRUPT_WAIT,
            terminate_wait: DEFAULT_TERMINATE_WAIT,
        }
    }
}

/// Controls the supervisor through its PID file and POSIX signals.
pub struct ProcessControl {
    settings: ProcessSettings,
    pidfile: PidFile,
    child: Mutex<Option<Child>>,
}

impl ProcessControl {
    pub fn new(settings: ProcessSettings) -> Self {
        let pidfile = PidFile::new(&settings.pidfile);
        Self {
            settings,
            pidfile,
            child: Mutex::new(None),
        }
    }

    fn recorded_pid(&self) -> Option<Pid> {
        match self.pidfile.read() {
            Ok(pid) => pid.map(Pid::from_raw),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "cannot read supervisor PID file");
                None
            }
        }
    }

    /// Collects the exit status of a supervisor spawned by this controller.
    fn reap_child(&self) {
        let mut slot = lock(&self.child);
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(status = %status, "supervisor process exited");
                    *slot = None;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "cannot poll supervisor process");
                    *slot = None;
                }
            }
        }
    }

    fn alive(&self, pid: Pid) -> bool {
        self.reap_child();
        match kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    async fn spawn(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let Some((program, args)) = self.settings.command.split_first() else {
            bail!("supervisor command is empty");
        };

        if let Some(parent) = self
            .settings
            .output
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let output = File::create(&self.settings.output)
            .with_context(|| format!("failed to open {}", self.settings.output.display()))?;
        let errors = output
            .try_clone()
            .context("failed to duplicate supervisor output handle")?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(errors)
            .spawn()
            .with_context(|| format!("failed to start supervisor `{program}`"))?;
        tracing::info!(pid = ?child.id(), command = ?self.settings.command, "supervisor started");
        *lock(&self.child) = Some(child);

        // The supervisor writes its PID file shortly after starting.
        sleep(self.settings.start_grace).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(pid) = self.recorded_pid() else {
            return Ok(());
        };

        let steps = [
            (Signal::SIGINT, Some(self.settings.interrupt_wait)),
            (Signal::SIGTERM, Some(self.settings.terminate_wait)),
            (Signal::SIGKILL, None),
        ];

        for (signal, wait) in steps {
            if !self.alive(pid) {
                return Ok(());
            }
            tracing::info!(pid = %pid, signal = %signal, "signalling supervisor to stop");
            match kill(pid, signal) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(()),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to send {signal} to {pid}"))
                }
            }

            match wait {
                Some(wait) => {
                    if self.wait_exit(pid, wait).await {
                        return Ok(());
                    }
                    tracing::warn!(pid = %pid, signal = %signal, waited = ?wait, "supervisor still running");
                }
                None => {
                    self.wait_exit(pid, self.settings.terminate_wait).await;
                }
            }
        }

        Ok(())
    }

    async fn wait_exit(&self, pid: Pid, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }
}

impl SupervisorControl for ProcessControl {
    fn is_running(&self) -> bool {
        self.recorded_pid().is_some_and(|pid| self.alive(pid))
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        self.spawn().boxed()
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        self.shutdown().boxed()
    }

    fn reload(&self) -> Result<()> {
        let Some(pid) = self.recorded_pid().filter(|pid| self.alive(*pid)) else {
            tracing::debug!("supervisor not running; nothing to reload");
            return Ok(());
        };
        tracing::info!(pid = %pid, "signalling supervisor to reload configuration");
        kill(pid, Signal::SIGHUP).with_context(|| format!("failed to send SIGHUP to {pid}"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
