use jack::{Client, ClientOptions};
use std::{fs, path::Path};

use crate::{
    config::Settings,
    error::{Error, Result},
    invoke::{CommandOutput, Host, InvokeError, RetryableCall, invoke},
    params::{AudioParameters, DeviceIdentity},
    session::ActingContext,
};

const JACK_CONTROL: &str = "jack_control";
const A2J_CONTROL: &str = "a2j_control";
const BRIDGE_PROCESS: &str = "a2jmidid";
const JACK_PROCESSES: [&str; 2] = ["jackd", "jackdbus"];

/// Whether a JACK server owned by the calling user takes client connections
/// right now. Connects as a client and never asks for a server to be started;
/// root sees a different server namespace, so `status` skips this when
/// elevated.
pub fn jack_accepts_clients() -> bool {
    match Client::new("jackplug-status", ClientOptions::NO_START_SERVER) {
        Ok((_client, status)) => {
            log::debug!("JACK answered with {status:?}");
            true
        }
        Err(e) => {
            log::debug!("JACK refused a client: {e}");
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
}

/// `jack_control status` prints `started` or `stopped` after its header.
pub fn parse_jack_status(text: &str) -> ServerState {
    if text.lines().any(|l| l.trim() == "started") {
        ServerState::Running
    } else {
        ServerState::Stopped
    }
}

/// `a2j_control status` reports "Bridging enabled" / "bridge is running".
pub fn parse_bridge_status(text: &str) -> ServerState {
    let lower = text.to_lowercase();
    if lower.contains("bridging enabled") || lower.contains("bridge is running") {
        ServerState::Running
    } else {
        ServerState::Stopped
    }
}

fn already_active(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("already active") || lower.contains("already running")
}

/// Drives JACK and the a2j bridge for one acting user. Holds no state of its
/// own: every decision starts from a fresh status query.
pub struct Lifecycle<'a> {
    host: &'a dyn Host,
    ctx: &'a ActingContext,
    settings: &'a Settings,
}

impl<'a> Lifecycle<'a> {
    pub fn new(host: &'a dyn Host, ctx: &'a ActingContext, settings: &'a Settings) -> Self {
        Self {
            host,
            ctx,
            settings,
        }
    }

    fn control(&self, program: &str, args: &[&str]) -> std::result::Result<CommandOutput, InvokeError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let (program, args) = self.ctx.wrap(program, &args);
        invoke(
            self.host,
            &RetryableCall::new(program, args, self.settings.retry),
        )
    }

    fn jack(&self, args: &[&str]) -> std::result::Result<CommandOutput, InvokeError> {
        self.control(JACK_CONTROL, args)
    }

    /// Signals go straight to the processes; no bus involved. A missing
    /// process is not an error.
    fn pkill(&self, signal: Option<&str>, process: &str) {
        let mut args: Vec<String> = signal.map(|s| s.to_string()).into_iter().collect();
        args.extend(["-u".to_string(), self.ctx.user.name.clone(), "-x".to_string(), process.to_string()]);
        match self.host.run("pkill", &args) {
            Ok(out) if out.success() => log::debug!("signalled {process}"),
            Ok(_) => log::debug!("no {process} to signal"),
            Err(e) => log::debug!("pkill {process}: {e}"),
        }
    }

    fn process_running(&self, process: &str) -> bool {
        let args = [
            "-u".to_string(),
            self.ctx.user.name.clone(),
            "-x".to_string(),
            process.to_string(),
        ];
        matches!(self.host.run("pgrep", &args), Ok(out) if out.success())
    }

    pub fn jack_state(&self) -> ServerState {
        match self.jack(&["status"]) {
            Ok(out) => parse_jack_status(&out.text),
            // jack_control exits non-zero with "stopped" on some versions
            Err(InvokeError::Exit { output, .. }) => parse_jack_status(&output),
            Err(e) => {
                log::warn!("could not query JACK status, assuming stopped: {e}");
                ServerState::Stopped
            }
        }
    }

    pub fn bridge_state(&self) -> ServerState {
        match self.control(A2J_CONTROL, &["status"]) {
            Ok(out) => parse_bridge_status(&out.text),
            Err(e) => {
                log::debug!("a2j status unavailable: {e}");
                ServerState::Stopped
            }
        }
    }

    /// Stop (if running), apply driver parameters, start and verify.
    ///
    /// JACK does not take driver, device, rate or period changes live, so a
    /// running server always goes through the full cycle. Parameter failures
    /// are warnings; only start and verify fail the run.
    pub fn ensure_configured(&self, params: &AudioParameters, device: &DeviceIdentity) -> Result<()> {
        if self.jack_state() == ServerState::Running {
            log::info!("JACK is running, stopping it to apply new settings");
            if let Err(e) = self.jack(&["stop"]) {
                log::warn!("jack_control stop failed: {e}");
            }
        }

        let rate = params.sample_rate.to_string();
        let nperiods = params.periods.to_string();
        let period = params.buffer_frames.to_string();
        let steps: [&[&str]; 5] = [
            &["ds", "alsa"],
            &["dps", "device", device.device_path.as_str()],
            &["dps", "rate", rate.as_str()],
            &["dps", "nperiods", nperiods.as_str()],
            &["dps", "period", period.as_str()],
        ];
        for step in steps {
            if let Err(e) = self.jack(step) {
                log::warn!("jack_control {} failed: {e}", step.join(" "));
            }
        }

        log::info!("starting JACK on {device}: {params}");
        if let Err(e) = self.jack(&["start"]) {
            log::error!("jack_control start failed: {e}");
            return Err(Error::StartFailed(e));
        }

        match self.jack(&["status"]) {
            Ok(out) if parse_jack_status(&out.text) == ServerState::Running => {
                log::info!("JACK is running on {device}");
                Ok(())
            }
            Ok(out) => Err(Error::VerifyFailed(out.text.trim().to_string())),
            Err(e) => Err(Error::VerifyFailed(e.to_string())),
        }
    }

    /// Bring the a2j bridge in line with `enabled`. A disabled bridge is
    /// killed by signal so the session bus is never woken for it.
    pub fn ensure_bridge(&self, enabled: bool) -> std::result::Result<(), InvokeError> {
        if !enabled {
            if self.process_running(BRIDGE_PROCESS) {
                log::info!("a2j bridge disabled, stopping {BRIDGE_PROCESS}");
                self.pkill(None, BRIDGE_PROCESS);
            }
            return Ok(());
        }

        if self.bridge_state() == ServerState::Running {
            log::debug!("a2j bridge already active");
            return Ok(());
        }
        if let Err(e) = self.control(A2J_CONTROL, &["ehw"]) {
            log::warn!("a2j_control ehw failed: {e}");
        }
        match self.control(A2J_CONTROL, &["start"]) {
            Ok(_) => {
                log::info!("a2j bridge started");
                Ok(())
            }
            Err(e) if already_active(e.output()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop everything this user runs for audio and clear JACK's leftovers.
    pub fn shutdown_all(&self) -> Result<()> {
        self.pkill(None, BRIDGE_PROCESS);

        match self.jack(&["stop"]) {
            Ok(_) => log::info!("JACK stopped"),
            Err(e) => log::warn!("jack_control stop failed, will force: {e}"),
        }

        self.host.sleep(self.settings.grace);
        for process in JACK_PROCESSES.into_iter().chain([BRIDGE_PROCESS]) {
            if self.process_running(process) {
                log::warn!("{process} survived stop, killing");
                self.pkill(Some("-KILL"), process);
            }
        }

        self.remove_artifacts();

        let survivors: Vec<&str> = JACK_PROCESSES
            .into_iter()
            .filter(|p| self.process_running(p))
            .collect();
        if survivors.is_empty() {
            Ok(())
        } else {
            Err(Error::ShutdownFailed(survivors.join(", ")))
        }
    }

    fn remove_artifacts(&self) {
        let uid = self.ctx.user.uid;
        let prefixes = [
            format!("jack_sem.{uid}_"),
            format!("jack-{uid}"),
            format!("jack_db-{uid}"),
        ];
        remove_matching(&self.settings.shm_dir, &prefixes);
        remove_matching(&self.settings.tmp_dir, &prefixes[1..2]);
    }

    /// Full stop, a pause for sockets and shared memory to go away, then up
    /// again with the given settings.
    pub fn restart(&self, params: &AudioParameters, device: &DeviceIdentity) -> Result<()> {
        self.shutdown_all()?;
        self.host.sleep(self.settings.settle);
        self.ensure_configured(params, device)?;
        if let Err(e) = self.ensure_bridge(params.midi_bridge) {
            log::warn!("a2j bridge: {e}");
        }
        Ok(())
    }
}

/// `name` starts with `prefix` and, when the prefix ends in the uid, does not
/// continue with more digits: `jack-1000` and `jack-1000-0` belong to uid
/// 1000, `jack-10001` does not.
fn is_scoped_match(name: &str, prefix: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };
    let ends_in_uid = prefix.as_bytes().last().is_some_and(u8::is_ascii_digit);
    !ends_in_uid || !rest.as_bytes().first().is_some_and(u8::is_ascii_digit)
}

/// Best effort: entries already gone, or owned by someone else, are skipped.
fn remove_matching(dir: &Path, prefixes: &[String]) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !prefixes.iter().any(|p| is_scoped_match(&name, p)) {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(e) => log::debug!("could not remove {}: {e}", path.display()),
        }
    }
}
