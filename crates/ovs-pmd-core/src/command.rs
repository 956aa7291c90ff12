//! Running `ovs-appctl` / `ovs-vsctl` and capturing their text output.
//!
//! Every collector goes through the [`CommandInvoker`] trait so tests can
//! substitute canned output. The system implementation enforces its own
//! deadline: the parsers downstream have no timeout of their own.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CommandError;

/// Default per-command deadline.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Interval between `try_wait` polls while a child is running.
const POLL_STEP: Duration = Duration::from_millis(5);

/// Runs an external diagnostic command and returns its stdout.
pub trait CommandInvoker: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;
}

/// Invoker backed by real child processes.
#[derive(Debug, Clone)]
pub struct SystemCommandInvoker {
    timeout: Duration,
}

impl SystemCommandInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemCommandInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandInvoker for SystemCommandInvoker {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Drain stdout on a helper thread so a chatty command cannot block
        // on a full pipe while we wait for it to exit.
        let mut stdout = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            if let Some(pipe) = stdout.as_mut() {
                pipe.read_to_end(&mut out)?;
            }
            Ok::<_, std::io::Error>(out)
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() >= self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CommandError::Timeout {
                            program: program.to_string(),
                            timeout: self.timeout,
                        });
                    }
                    std::thread::sleep(POLL_STEP);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(CommandError::Io {
                        program: program.to_string(),
                        source,
                    });
                }
            }
        };

        if !status.success() {
            return Err(CommandError::Unavailable {
                program: program.to_string(),
                status: status.code(),
            });
        }

        let out = reader
            .join()
            .map_err(|_| CommandError::Io {
                program: program.to_string(),
                source: std::io::Error::other("stdout reader panicked"),
            })?
            .map_err(|source| CommandError::Io {
                program: program.to_string(),
                source,
            })?;

        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// `ovs-appctl` front end over any invoker.
#[derive(Clone)]
pub struct Appctl {
    invoker: Arc<dyn CommandInvoker>,
    path: String,
}

impl Appctl {
    pub fn new(invoker: Arc<dyn CommandInvoker>, path: impl Into<String>) -> Self {
        Self {
            invoker,
            path: path.into(),
        }
    }

    /// Run `ovs-appctl <command> <args...>` against the default target
    /// (ovs-vswitchd).
    pub fn call(&self, command: &str, args: &[&str]) -> Result<String, CommandError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(command);
        argv.extend_from_slice(args);
        self.invoker.run(&self.path, &argv)
    }

    /// Run `ovs-appctl -t <target> <command>`.
    pub fn call_target(&self, target: &str, command: &str) -> Result<String, CommandError> {
        self.invoker.run(&self.path, &["-t", target, command])
    }

    pub fn invoker(&self) -> &Arc<dyn CommandInvoker> {
        &self.invoker
    }
}
