//! Audio parameters handed to the JACK ALSA driver and the device identity
//! they are applied to.

use std::fmt;

/// Sample rates the ALSA driver is expected to accept. Others are passed
/// through with a warning.
pub const KNOWN_RATES: [u32; 7] = [22050, 44100, 48000, 88200, 96000, 176400, 192000];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioParameters {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub periods: u32,
    pub midi_bridge: bool,
}

impl AudioParameters {
    /// Round-trip latency of one buffer cycle in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return f64::INFINITY;
        }
        // multiply first so common settings come out exact (256*3 @ 48k = 16.0)
        (self.buffer_frames as f64 * self.periods as f64 * 1000.0) / self.sample_rate as f64
    }
}

impl fmt::Display for AudioParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} frames x {} periods ({:.1} ms), a2j {}",
            self.sample_rate,
            self.buffer_frames,
            self.periods,
            self.latency_ms(),
            if self.midi_bridge { "on" } else { "off" }
        )
    }
}

pub fn check_rate(rate: u32) -> Option<String> {
    (!KNOWN_RATES.contains(&rate)).then(|| format!("unusual sample rate {rate} Hz"))
}

pub fn check_buffer(frames: u32) -> Option<String> {
    (frames == 0 || !frames.is_power_of_two())
        .then(|| format!("buffer size {frames} is not a power of two"))
}

pub fn check_periods(periods: u32) -> Option<String> {
    (periods < 2).then(|| format!("periods count {periods} is below 2"))
}

/// An ALSA card as JACK addresses it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub card_id: String,
    pub device_path: String,
    pub match_pattern: Option<String>,
}

impl DeviceIdentity {
    pub fn new(card_id: impl Into<String>, subdevice: u32) -> Self {
        let card_id = card_id.into();
        Self {
            device_path: format!("hw:{card_id},{subdevice}"),
            card_id,
            match_pattern: None,
        }
    }

    /// Parses a configured device string: `hw:M4,0`, `hw:M4` or a bare `M4`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let body = raw.strip_prefix("hw:").unwrap_or(raw);
        let (card, sub) = match body.split_once(',') {
            Some((card, sub)) => (card.trim(), sub.trim().parse().ok()?),
            None => (body.trim(), 0),
        };
        if card.is_empty() {
            return None;
        }
        Some(Self::new(card, sub))
    }

    pub fn with_pattern(mut self, pattern: Option<String>) -> Self {
        self.match_pattern = pattern;
        self
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_path)
    }
}
