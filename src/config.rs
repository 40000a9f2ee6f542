//! Configuration layering: built-in defaults < system file < user file <
//! environment.
//!
//! Two file dialects exist. The current one spells every field out
//! (`JACK_RATE=48000`, `AUDIO_DEVICE=hw:M4,0`, ...); the legacy one carries a
//! single `JACK_SETTING` preset number. A file containing any current key is
//! read as current and its `JACK_SETTING` is ignored.
//!
//! Malformed values never fail resolution. They are reported through
//! [`EffectiveConfig::warnings`] and the run continues with what is usable.

use regex::Regex;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use crate::{
    invoke::RetryPolicy,
    params::{self, AudioParameters, DeviceIdentity},
};

pub const SYSTEM_CONFIG: &str = "/etc/jackplug/jackplug.conf";
/// Relative to the acting user's home directory.
pub const USER_CONFIG: &str = ".config/jackplug/jackplug.conf";
pub const TRIGGER_FLAG: &str = "/run/jackplug/device-pending";

pub const KEY_DEVICE: &str = "AUDIO_DEVICE";
pub const KEY_PATTERN: &str = "DEVICE_PATTERN";
pub const KEY_RATE: &str = "JACK_RATE";
pub const KEY_PERIOD: &str = "JACK_PERIOD";
pub const KEY_NPERIODS: &str = "JACK_NPERIODS";
pub const KEY_BRIDGE: &str = "A2J_ENABLE";
pub const KEY_DBUS_TIMEOUT: &str = "DBUS_TIMEOUT";
pub const KEY_LEGACY: &str = "JACK_SETTING";

pub const CURRENT_KEYS: [&str; 7] = [
    KEY_DEVICE,
    KEY_PATTERN,
    KEY_RATE,
    KEY_PERIOD,
    KEY_NPERIODS,
    KEY_BRIDGE,
    KEY_DBUS_TIMEOUT,
];

const DEFAULT_RATE: u32 = 48000;
const DEFAULT_PERIOD: u32 = 256;
const DEFAULT_NPERIODS: u32 = 3;
const DEFAULT_DBUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a field's effective value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Default,
    System,
    User,
    Environment,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Default => "default",
            Layer::System => "system config",
            Layer::User => "user config",
            Layer::Environment => "environment",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub layer: Layer,
}

impl<T> Sourced<T> {
    fn default_value(value: T) -> Self {
        Self {
            value,
            layer: Layer::Default,
        }
    }
}

/// The fields one source contributes; `None` falls through to lower layers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub sample_rate: Option<u32>,
    pub buffer_frames: Option<u32>,
    pub periods: Option<u32>,
    pub midi_bridge: Option<bool>,
    pub device: Option<DeviceIdentity>,
    pub device_pattern: Option<String>,
    pub dbus_timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Current,
    Legacy,
    Empty,
}

/// The merged configuration of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveConfig {
    pub sample_rate: Sourced<u32>,
    pub buffer_frames: Sourced<u32>,
    pub periods: Sourced<u32>,
    pub midi_bridge: Sourced<bool>,
    pub device: Option<Sourced<DeviceIdentity>>,
    pub device_pattern: Option<Sourced<String>>,
    pub dbus_timeout: Sourced<Duration>,
    pub warnings: Vec<String>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            sample_rate: Sourced::default_value(DEFAULT_RATE),
            buffer_frames: Sourced::default_value(DEFAULT_PERIOD),
            periods: Sourced::default_value(DEFAULT_NPERIODS),
            midi_bridge: Sourced::default_value(false),
            device: None,
            device_pattern: None,
            dbus_timeout: Sourced::default_value(DEFAULT_DBUS_TIMEOUT),
            warnings: Vec::new(),
        }
    }
}

fn overlay<T: Clone>(slot: &mut Sourced<T>, value: &Option<T>, layer: Layer) {
    if let Some(v) = value {
        *slot = Sourced {
            value: v.clone(),
            layer,
        };
    }
}

fn overlay_opt<T: Clone>(slot: &mut Option<Sourced<T>>, value: &Option<T>, layer: Layer) {
    if let Some(v) = value {
        *slot = Some(Sourced {
            value: v.clone(),
            layer,
        });
    }
}

impl EffectiveConfig {
    fn apply(&mut self, layer: Layer, part: &ConfigLayer) {
        overlay(&mut self.sample_rate, &part.sample_rate, layer);
        overlay(&mut self.buffer_frames, &part.buffer_frames, layer);
        overlay(&mut self.periods, &part.periods, layer);
        overlay(&mut self.midi_bridge, &part.midi_bridge, layer);
        overlay(&mut self.dbus_timeout, &part.dbus_timeout, layer);
        overlay_opt(&mut self.device, &part.device, layer);
        overlay_opt(&mut self.device_pattern, &part.device_pattern, layer);
    }

    pub fn params(&self) -> AudioParameters {
        AudioParameters {
            sample_rate: self.sample_rate.value,
            buffer_frames: self.buffer_frames.value,
            periods: self.periods.value,
            midi_bridge: self.midi_bridge.value,
        }
    }

    /// One line per field, naming the layer that supplied it.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![
            format!("rate      = {} ({})", self.sample_rate.value, self.sample_rate.layer),
            format!("period    = {} ({})", self.buffer_frames.value, self.buffer_frames.layer),
            format!("nperiods  = {} ({})", self.periods.value, self.periods.layer),
            format!("a2j       = {} ({})", self.midi_bridge.value, self.midi_bridge.layer),
            format!("dbus wait = {:?} ({})", self.dbus_timeout.value, self.dbus_timeout.layer),
        ];
        if let Some(d) = &self.device {
            lines.push(format!("device    = {} ({})", d.value, d.layer));
        }
        if let Some(p) = &self.device_pattern {
            lines.push(format!("pattern   = {} ({})", p.value, p.layer));
        }
        lines
    }

    fn check_values(&mut self) {
        let checks = [
            params::check_rate(self.sample_rate.value),
            params::check_buffer(self.buffer_frames.value),
            params::check_periods(self.periods.value),
        ];
        self.warnings.extend(checks.into_iter().flatten());
    }
}

// ───────────────────────────── parsing ───────────────────────────────── //

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$").expect("valid regex")
});

/// Splits shell-style `KEY=value` text into pairs, in file order.
pub fn parse_pairs(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| ASSIGNMENT.captures(l))
        .map(|c| (c[1].to_string(), unquote(&c[2])))
        .collect()
}

fn unquote(raw: &str) -> String {
    for q in ['"', '\''] {
        if let Some(inner) = raw.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner.to_string();
        }
    }
    // trailing comment on an unquoted value
    match raw.find(" #") {
        Some(i) => raw[..i].trim_end().to_string(),
        None => raw.to_string(),
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn classify(pairs: &[(String, String)]) -> Dialect {
    if CURRENT_KEYS.iter().any(|k| lookup(pairs, k).is_some()) {
        Dialect::Current
    } else if lookup(pairs, KEY_LEGACY).is_some() {
        Dialect::Legacy
    } else {
        Dialect::Empty
    }
}

/// Rate / period / periods bundle of a legacy preset number.
pub fn legacy_preset(setting: u32) -> Option<(u32, u32, u32)> {
    match setting {
        1 => Some((48000, 256, 2)),
        2 => Some((48000, 512, 2)),
        3 => Some((48000, 1024, 3)),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

struct Reader<'a> {
    pairs: &'a [(String, String)],
    origin: &'a str,
    warnings: &'a mut Vec<String>,
}

impl Reader<'_> {
    fn number(&mut self, key: &str) -> Option<u32> {
        let raw = lookup(self.pairs, key)?;
        if raw.is_empty() {
            return None;
        }
        match raw.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                self.warnings
                    .push(format!("{}: ignoring {key}={raw:?}, not a number", self.origin));
                None
            }
        }
    }

    fn flag(&mut self, key: &str) -> Option<bool> {
        let raw = lookup(self.pairs, key)?;
        let parsed = parse_bool(raw);
        if parsed.is_none() && !raw.is_empty() {
            self.warnings
                .push(format!("{}: ignoring {key}={raw:?}, not a boolean", self.origin));
        }
        parsed
    }

    fn text(&self, key: &str) -> Option<String> {
        lookup(self.pairs, key)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn current(&mut self) -> ConfigLayer {
        let device = self.text(KEY_DEVICE).and_then(|raw| {
            let parsed = DeviceIdentity::parse(&raw);
            if parsed.is_none() {
                self.warnings
                    .push(format!("{}: ignoring {KEY_DEVICE}={raw:?}", self.origin));
            }
            parsed
        });
        ConfigLayer {
            sample_rate: self.number(KEY_RATE),
            buffer_frames: self.number(KEY_PERIOD),
            periods: self.number(KEY_NPERIODS),
            midi_bridge: self.flag(KEY_BRIDGE),
            device,
            device_pattern: self.text(KEY_PATTERN),
            dbus_timeout: self.number(KEY_DBUS_TIMEOUT).map(|s| Duration::from_secs(s.into())),
        }
    }

    fn legacy(&mut self) -> ConfigLayer {
        let setting = self.number(KEY_LEGACY);
        match setting.and_then(legacy_preset) {
            Some((rate, period, nperiods)) => ConfigLayer {
                sample_rate: Some(rate),
                buffer_frames: Some(period),
                periods: Some(nperiods),
                ..ConfigLayer::default()
            },
            None => {
                if let Some(s) = setting {
                    self.warnings
                        .push(format!("{}: unknown {KEY_LEGACY}={s}", self.origin));
                }
                ConfigLayer::default()
            }
        }
    }
}

/// Reads one config file's pairs into a layer, honouring the dialect split.
pub fn file_layer(pairs: &[(String, String)], origin: &str, warnings: &mut Vec<String>) -> ConfigLayer {
    let mut reader = Reader {
        pairs,
        origin,
        warnings,
    };
    match classify(pairs) {
        Dialect::Current => reader.current(),
        Dialect::Legacy => reader.legacy(),
        Dialect::Empty => ConfigLayer::default(),
    }
}

/// Environment layer. `JACK_SETTING` is only honoured without `JACK_RATE`, and
/// explicit variables override the preset's fields.
pub fn env_layer(vars: &[(String, String)], warnings: &mut Vec<String>) -> ConfigLayer {
    let mut reader = Reader {
        pairs: vars,
        origin: "environment",
        warnings,
    };
    let explicit = reader.current();
    if lookup(vars, KEY_RATE).is_some() || lookup(vars, KEY_LEGACY).is_none() {
        return explicit;
    }
    let preset = reader.legacy();
    ConfigLayer {
        sample_rate: explicit.sample_rate.or(preset.sample_rate),
        buffer_frames: explicit.buffer_frames.or(preset.buffer_frames),
        periods: explicit.periods.or(preset.periods),
        ..explicit
    }
}

/// Reads a config file; a missing or unreadable file is an absent layer.
pub fn load_file(path: &Path, warnings: &mut Vec<String>) -> Option<ConfigLayer> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let pairs = parse_pairs(&text);
            log::debug!("{}: {:?} dialect", path.display(), classify(&pairs));
            Some(file_layer(&pairs, &path.display().to_string(), warnings))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("{} not present", path.display());
            None
        }
        Err(e) => {
            warnings.push(format!("{}: unreadable ({e}), skipped", path.display()));
            None
        }
    }
}

/// Inputs to one resolution. The environment is passed in rather than read
/// so resolution stays a pure function of its sources.
#[derive(Clone, Debug, Default)]
pub struct ConfigSources {
    pub system: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ConfigSources {
    /// Keeps only variables this crate reads.
    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = vars
            .into_iter()
            .filter(|(k, _)| k == KEY_LEGACY || CURRENT_KEYS.contains(&k.as_str()))
            .collect();
        self
    }
}

pub fn resolve(sources: &ConfigSources) -> EffectiveConfig {
    let mut cfg = EffectiveConfig::default();
    let mut warnings = Vec::new();

    if let Some(layer) = sources.system.as_deref().and_then(|p| load_file(p, &mut warnings)) {
        cfg.apply(Layer::System, &layer);
    }
    if let Some(layer) = sources.user.as_deref().and_then(|p| load_file(p, &mut warnings)) {
        cfg.apply(Layer::User, &layer);
    }
    let env = env_layer(&sources.env, &mut warnings);
    cfg.apply(Layer::Environment, &env);

    cfg.warnings = warnings;
    cfg.check_values();
    cfg
}

// ─────────────────────────── tool settings ───────────────────────────── //

/// Paths and timings of the tool itself. Production values by default.
#[derive(Clone, Debug)]
pub struct Settings {
    pub system_config: PathBuf,
    pub user_config: PathBuf,
    pub trigger_flag: PathBuf,
    pub shm_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub retry: RetryPolicy,
    /// Between `jack_control stop` and force-killing survivors.
    pub grace: Duration,
    /// Between shutdown and start on restart.
    pub settle: Duration,
    pub login_wait: Duration,
    pub login_poll: Duration,
    pub bus_poll: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_config: PathBuf::from(SYSTEM_CONFIG),
            user_config: PathBuf::from(USER_CONFIG),
            trigger_flag: PathBuf::from(TRIGGER_FLAG),
            shm_dir: PathBuf::from("/dev/shm"),
            tmp_dir: PathBuf::from("/tmp"),
            retry: RetryPolicy::default(),
            grace: Duration::from_secs(2),
            settle: Duration::from_secs(2),
            login_wait: Duration::from_secs(120),
            login_poll: Duration::from_secs(5),
            bus_poll: Duration::from_secs(1),
        }
    }
}

impl Settings {
    pub fn sources_for(&self, home: Option<&Path>) -> ConfigSources {
        ConfigSources {
            system: Some(self.system_config.clone()),
            user: home.map(|h| h.join(&self.user_config)),
            env: Vec::new(),
        }
    }
}
