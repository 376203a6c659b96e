//! Session error taxonomy.
//!
//! Only [`SessionError::InvalidConfig`] and [`SessionError::LaunchFailed`]
//! abort a session. Everything else is scoped to one extension, one rule,
//! one tab, or one poll tick and is logged where it happens.

use thiserror::Error;

/// Errors that can occur while driving a supervised browsing session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The launch request was malformed. Fails fast, before any engine work.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The engine process or its browsing context could not be brought up.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// A navigation did not commit.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// A debugging-protocol call failed. Always treated as best-effort.
    #[error("protocol call failed: {0}")]
    Protocol(String),

    /// One extension could not be provisioned. Never fatal to the launch.
    #[error("extension provisioning failed for {name}: {reason}")]
    Provisioning { name: String, reason: String },

    /// A user-supplied block pattern did not compile.
    #[error("bad block pattern {pattern:?}: {reason}")]
    Rule { pattern: String, reason: String },

    /// A download could not be persisted.
    #[error("download failed: {0}")]
    Download(String),

    /// A control-plane poll tick failed; the loop keeps running.
    #[error("remote check failed: {0}")]
    RemoteCheck(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<chromiumoxide::error::CdpError> for SessionError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::RemoteCheck(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
