//! Shared error type and the host-shell seam used by the session core.

pub mod error;
pub mod logging;
pub mod shell;

pub use {
    error::{Error, Result},
    shell::{HostShell, NullShell, PlanBlock},
};
