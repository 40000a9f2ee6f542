//! Starts, stops and reconfigures the JACK audio server as USB audio
//! interfaces come and go.
//!
//! A run is short-lived: resolve configuration, look at the sound cards,
//! query JACK, and drive it into the wanted state through `jack_control`,
//! retrying while the session bus is not ready.

pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod invoke;
pub mod jack_boot;
pub mod monitor;
pub mod params;
pub mod session;
pub mod trigger;

pub use error::{Error, Result};
