//! Supervised, isolated browsing sessions.
//!
//! The crate drives an external browser engine over its debugging protocol
//! to run remotely supervised sessions: a hardened launch profile, request
//! interception with block rules and a 403 interstitial, an injected
//! protection bundle (field masking, WebRTC neutralization, fingerprint
//! spoofing, autofill), managed downloads, storage-state capture and
//! control-plane polling for forced termination and plan validity.
//!
//! [`orchestrator::SessionSupervisor`] is the entry point; everything else
//! is a component it wires together.

pub mod config;
pub mod control;
pub mod download;
pub mod error;
pub mod events;
pub mod extensions;
pub mod guard;
pub mod inject;
pub mod intercept;
pub mod launch;
pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod rules;

pub use {
    config::{LaunchRequest, SessionConfig},
    error::{Result, SessionError},
    orchestrator::{SessionResult, SessionSupervisor},
    recorder::StorageStateSnapshot,
    registry::ActiveSessionRegistry,
};
