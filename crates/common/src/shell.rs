//! Narrow seam to the desktop shell hosting the session core.
//!
//! The shell owns windows, dialogs, and the renderer; the session core only
//! pushes lifecycle notifications through this trait and asks for a save
//! location when a download runs in prompt mode. Every call is advisory: a
//! shell that has already torn down its window simply ignores them.

use std::path::PathBuf;

use {async_trait::async_trait, serde::Serialize};

/// Payload for a plan-enforcement block pushed to the shell UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanBlock {
    pub reason: String,
    pub message: String,
    pub plan_status: String,
}

/// Outbound interface to the host shell.
#[async_trait]
pub trait HostShell: Send + Sync {
    /// A session finished its lifecycle (any exit path).
    fn session_closed(&self, session_id: &str);

    /// The control plane invalidated the user's plan mid-session.
    fn plan_blocked(&self, block: PlanBlock);

    /// The control-plane token stopped being accepted.
    fn session_expired(&self);

    /// Ask the user where to save a download. `Ok(None)` means the user
    /// cancelled; `Err` means the shell could not show a dialog at all.
    async fn prompt_save_path(&self, suggested: &str) -> crate::Result<Option<PathBuf>>;
}

/// Shell that swallows every notification. Used when the core runs without
/// an attached UI and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullShell;

#[async_trait]
impl HostShell for NullShell {
    fn session_closed(&self, _session_id: &str) {}

    fn plan_blocked(&self, _block: PlanBlock) {}

    fn session_expired(&self) {}

    async fn prompt_save_path(&self, _suggested: &str) -> crate::Result<Option<PathBuf>> {
        Err(crate::Error::message("no shell attached"))
    }
}
