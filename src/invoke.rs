//! Running external tools, and retrying the ones that talk over the session
//! bus when the bus is not up yet.
//!
//! Every process the crate starts goes through a [`Host`], which keeps the
//! orchestration logic testable against recorded tool output.

use std::{
    fmt, io,
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;

/// Captured result of one process run. `text` is stdout followed by stderr.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub text: String,
}

impl CommandOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            text: text.into(),
        }
    }

    pub fn failed(code: i32, text: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            text: text.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The outside world as seen by a run: processes, the clock and the
/// filesystem's view of sockets.
pub trait Host {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Runs real processes with a pinned `C` locale so text parsers see one format.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        log::debug!("exec: {program} {}", args.join(" "));
        let out = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()?;

        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            code: out.status.code(),
            text,
        })
    }
}

// ─────────────────────────── bus classifier ─────────────────────────── //

/// Revision of [`BUS_ERROR_SIGNATURES`]. Bump when the list changes.
pub const BUS_SIGNATURES_VERSION: u32 = 3;

/// Lower-case phrases that mean the session bus could not be reached or could
/// not activate the service yet. Revision 1 matched any occurrence of "dbus",
/// which also retried JACK errors that merely travel inside a DBus exception.
/// Revision 2 matched every `org.freedesktop.DBus.Error.*` name, including
/// `AccessDenied` and `UnknownMethod`, which no amount of waiting fixes.
pub const BUS_ERROR_SIGNATURES: &[&str] = &[
    "org.freedesktop.dbus.error.serviceunknown",
    "org.freedesktop.dbus.error.noreply",
    "org.freedesktop.dbus.error.spawn.childexited",
    "org.freedesktop.dbus.error.noserver",
    "org.freedesktop.dbus.error.disconnected",
    "org.freedesktop.dbus.error.filenotfound",
    "autolaunch",
    "failed to connect to socket",
    "failed to connect to d-bus",
    "failed to connect to dbus",
    "unable to connect to dbus",
    "could not connect to dbus",
    "dbus_session_bus_address",
    "bus error",
];

/// True when `output` carries a transient bus-unavailable signature.
pub fn is_transient_bus_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    BUS_ERROR_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

// ───────────────────────────── retrying ─────────────────────────────── //

#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub classifier: fn(&str) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            classifier: is_transient_bus_error,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct RetryableCall {
    pub program: String,
    pub args: Vec<String>,
    pub policy: RetryPolicy,
}

impl RetryableCall {
    pub fn new(program: impl Into<String>, args: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            program: program.into(),
            args,
            policy,
        }
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("session bus unavailable after {attempts} attempts: {}", .output.trim())]
    BusUnavailable { attempts: u32, output: String },

    #[error("exited with {}: {}", fmt_code(.code), .output.trim())]
    Exit { code: Option<i32>, output: String },

    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl InvokeError {
    pub fn output(&self) -> &str {
        match self {
            InvokeError::BusUnavailable { output, .. } | InvokeError::Exit { output, .. } => {
                output
            }
            InvokeError::Spawn { .. } => "",
        }
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
}

/// Runs `call`, retrying only while the output looks like a bus that is not
/// ready. Any other failure is returned after the first attempt.
pub fn invoke(host: &dyn Host, call: &RetryableCall) -> Result<CommandOutput, InvokeError> {
    let policy = call.policy;
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let out = host
            .run(&call.program, &call.args)
            .map_err(|source| InvokeError::Spawn {
                program: call.program.clone(),
                source,
            })?;

        if (policy.classifier)(&out.text) {
            if attempt >= max {
                log::warn!("{}: bus still unavailable after {max} attempts", call.describe());
                return Err(InvokeError::BusUnavailable {
                    attempts: attempt,
                    output: out.text,
                });
            }
            log::info!(
                "{}: bus not ready (attempt {attempt}/{max}), retrying in {:?}",
                call.describe(),
                policy.backoff
            );
            host.sleep(policy.backoff);
            attempt += 1;
            continue;
        }

        if out.success() {
            return Ok(out);
        }
        return Err(InvokeError::Exit {
            code: out.code,
            output: out.text,
        });
    }
}
