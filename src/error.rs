//! Fatal conditions of a run.
//!
//! Anything that reaches `main` as an [`Error`] ends the run with exit code 1.
//! Per-step tool failures that the orchestrator tolerates never become an
//! `Error`; they are logged as warnings where they happen.

use std::time::Duration;
use thiserror::Error;

use crate::invoke::InvokeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no external audio interface found, connect a device and try again")]
    NoDevice,

    #[error("no user logged in after waiting {0:?}")]
    NoUserSession(Duration),

    #[error("no logged-in user to run JACK for")]
    NoActingUser,

    #[error("JACK failed to start: {0}")]
    StartFailed(#[source] InvokeError),

    #[error("JACK did not report running after start (status: {0})")]
    VerifyFailed(String),

    #[error("JACK processes survived shutdown: {0}")]
    ShutdownFailed(String),

    #[error("could not determine user session: {0}")]
    Session(String),

    #[error("hardware listing failed: {0}")]
    Listing(#[source] InvokeError),

    #[error("trigger flag: {0}")]
    Trigger(#[from] std::io::Error),
}

impl Error {
    /// Short stable label for log lines.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::NoDevice => "no_device",
            Error::NoUserSession(_) => "no_user_session",
            Error::NoActingUser => "no_acting_user",
            Error::StartFailed(_) => "start_failed",
            Error::VerifyFailed(_) => "verify_failed",
            Error::ShutdownFailed(_) => "shutdown_failed",
            Error::Session(_) => "session",
            Error::Listing(_) => "listing",
            Error::Trigger(_) => "trigger",
        }
    }
}
