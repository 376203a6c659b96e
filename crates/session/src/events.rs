//! Terminal session events.
//!
//! Every component that can end a session pushes one of these onto the
//! session's event channel; the orchestrator consumes the first one and
//! funnels it into the single finalization path.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {tokio::sync::mpsc, veil_common::PlanBlock};

/// A reason for the session to stop running.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The primary page was closed by the user.
    PageClosed,
    /// The engine process went away.
    EngineDisconnected,
    /// The control plane requested a remote close.
    ForceClose,
    /// The control plane invalidated the plan.
    PlanBlocked(PlanBlock),
    /// The control-plane token stopped being accepted.
    SessionExpired,
    /// The host shell asked for termination (by id or terminate-all).
    HostRequested,
}

impl SessionEvent {
    /// Short tag used as the capture reason and in logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PageClosed => "page-close",
            Self::EngineDisconnected => "disconnect",
            Self::ForceClose => "force-close",
            Self::PlanBlocked(_) => "plan-expired",
            Self::SessionExpired => "session-expired",
            Self::HostRequested => "host-close",
        }
    }
}

/// Guards finalization so racing terminal triggers run it at most once.
/// The first caller wins; later callers observe `false` and no-op.
#[derive(Debug, Default)]
pub struct FinalizeGuard(AtomicBool);

impl FinalizeGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once across all callers.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Sending half of a session's event channel. All terminal triggers share
/// one [`FinalizeGuard`], so whichever component fires first wins and every
/// later trigger is suppressed at the source.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
    guard: Arc<FinalizeGuard>,
}

impl EventSender {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                guard: Arc::new(FinalizeGuard::new()),
            },
            rx,
        )
    }

    /// Deliver a terminal event unless one was already sent for this
    /// session. Returns whether this call was the winner.
    pub async fn send(&self, event: SessionEvent) -> bool {
        if !self.guard.begin() {
            return false;
        }
        let _ = self.tx.send(event).await;
        true
    }
}
