//! Control-plane client and the two remote-authority polling loops.
//!
//! Both loops only start when the launch request carried a bearer token.
//! A failed poll tick is swallowed and the loop keeps going; the loops stop
//! on their own trigger or when the session's shutdown signal flips.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde::Deserialize,
    tokio::sync::watch,
    tracing::{debug, info, warn},
};

use veil_common::PlanBlock;

use crate::{
    error::{Result, SessionError},
    events::{EventSender, SessionEvent},
};

/// Force-close checks run on this cadence.
pub const FORCE_CLOSE_INTERVAL: Duration = Duration::from_secs(10);
/// Plan-validity checks run on this cadence.
pub const PLAN_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// One earlier plan check runs shortly after launch.
pub const PLAN_CHECK_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Verdict of one plan-status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    Valid,
    Block(PlanBlock),
    Unauthorized,
}

/// The remote authority queried for forced termination and plan validity.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn should_force_close(&self, session_id: &str) -> Result<bool>;

    async fn plan_status(&self) -> Result<PlanStatus>;

    /// Clear this session's active record server-side. Best-effort.
    async fn clear_active_session(&self, session_id: &str) -> Result<()>;
}

/// Bearer-token authenticated client against the control-plane API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ForceCloseBody {
    #[serde(default)]
    should_close: bool,
}

#[derive(Debug, Deserialize)]
struct PlanStatusBody {
    #[serde(default)]
    should_block: bool,
    #[serde(default)]
    block_reason: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    plan_status: String,
}

impl HttpControlPlane {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn should_force_close(&self, session_id: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.url(&format!("/profiles/{session_id}/check-force-close")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SessionError::RemoteCheck(format!(
                "check-force-close returned {}",
                response.status()
            )));
        }
        let body: ForceCloseBody = response.json().await?;
        Ok(body.should_close)
    }

    async fn plan_status(&self) -> Result<PlanStatus> {
        let response = self
            .client
            .get(self.url("/user/plan-status"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(PlanStatus::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(SessionError::RemoteCheck(format!(
                "plan-status returned {}",
                response.status()
            )));
        }
        let body: PlanStatusBody = response.json().await?;
        if body.should_block {
            return Ok(PlanStatus::Block(PlanBlock {
                reason: body.block_reason,
                message: body.message,
                plan_status: body.plan_status,
            }));
        }
        Ok(PlanStatus::Valid)
    }

    async fn clear_active_session(&self, session_id: &str) -> Result<()> {
        self.client
            .delete(self.url("/profiles/active-sessions"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "profile_id": session_id }))
            .send()
            .await?;
        Ok(())
    }
}

/// Spawn both polling loops. Each loop sends at most one terminal event
/// and exits; flipping `shutdown` stops them without an event.
pub fn spawn_pollers(
    control: Arc<dyn ControlPlane>,
    session_id: String,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(force_close_loop(
        Arc::clone(&control),
        session_id,
        events.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(plan_check_loop(control, events, shutdown));
}

async fn force_close_loop(
    control: Arc<dyn ControlPlane>,
    session_id: String,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(session_id, "force-close monitoring started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(FORCE_CLOSE_INTERVAL) => {},
            _ = shutdown.changed() => return,
        }
        match control.should_force_close(&session_id).await {
            Ok(true) => {
                info!(session_id, "remote force-close requested");
                events.send(SessionEvent::ForceClose).await;
                return;
            },
            Ok(false) => {},
            Err(e) => debug!(session_id, error = %e, "force-close check failed"),
        }
    }
}

async fn plan_check_loop(
    control: Arc<dyn ControlPlane>,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("plan-validity monitoring started");
    let mut delay = PLAN_CHECK_INITIAL_DELAY;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown.changed() => return,
        }
        delay = PLAN_CHECK_INTERVAL;
        match control.plan_status().await {
            Ok(PlanStatus::Valid) => {},
            Ok(PlanStatus::Block(block)) => {
                warn!(reason = %block.reason, "plan invalidated, closing session");
                events.send(SessionEvent::PlanBlocked(block)).await;
                return;
            },
            Ok(PlanStatus::Unauthorized) => {
                warn!("control-plane token rejected, session expired");
                events.send(SessionEvent::SessionExpired).await;
                return;
            },
            Err(e) => debug!(error = %e, "plan check failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FakeControl {
        force_close: bool,
        plan: PlanStatus,
        force_calls: AtomicUsize,
        plan_calls: AtomicUsize,
    }

    impl FakeControl {
        fn new(force_close: bool, plan: PlanStatus) -> Arc<Self> {
            Arc::new(Self {
                force_close,
                plan,
                force_calls: AtomicUsize::new(0),
                plan_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControl {
        async fn should_force_close(&self, _session_id: &str) -> Result<bool> {
            self.force_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.force_close)
        }

        async fn plan_status(&self) -> Result<PlanStatus> {
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plan.clone())
        }

        async fn clear_active_session(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_trigger_sends_exactly_one_event() {
        let control = FakeControl::new(true, PlanStatus::Valid);
        let (tx, mut rx) = EventSender::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(force_close_loop(
            control.clone() as Arc<dyn ControlPlane>,
            "s1".into(),
            tx,
            shutdown_rx,
        ));

        tokio::time::advance(FORCE_CLOSE_INTERVAL).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ForceClose);

        // The loop exited after its trigger; later ticks produce nothing.
        tokio::time::advance(FORCE_CLOSE_INTERVAL * 3).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(control.force_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_block_fires_on_early_check() {
        let block = PlanBlock {
            reason: "expired".into(),
            message: "renew".into(),
            plan_status: "expired".into(),
        };
        let control = FakeControl::new(false, PlanStatus::Block(block.clone()));
        let (tx, mut rx) = EventSender::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(plan_check_loop(
            control as Arc<dyn ControlPlane>,
            tx,
            shutdown_rx,
        ));

        tokio::time::advance(PLAN_CHECK_INITIAL_DELAY).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::PlanBlocked(block));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_maps_to_session_expired() {
        let control = FakeControl::new(false, PlanStatus::Unauthorized);
        let (tx, mut rx) = EventSender::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(plan_check_loop(
            control as Arc<dyn ControlPlane>,
            tx,
            shutdown_rx,
        ));

        tokio::time::advance(PLAN_CHECK_INITIAL_DELAY).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::SessionExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_keep_the_loop_polling() {
        struct Flaky {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ControlPlane for Flaky {
            async fn should_force_close(&self, _session_id: &str) -> Result<bool> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    return Err(SessionError::RemoteCheck("boom".into()));
                }
                Ok(true)
            }

            async fn plan_status(&self) -> Result<PlanStatus> {
                Ok(PlanStatus::Valid)
            }

            async fn clear_active_session(&self, _session_id: &str) -> Result<()> {
                Ok(())
            }
        }

        let control = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = EventSender::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(force_close_loop(
            control as Arc<dyn ControlPlane>,
            "s1".into(),
            tx,
            shutdown_rx,
        ));

        for _ in 0..3 {
            tokio::time::advance(FORCE_CLOSE_INTERVAL).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ForceClose);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loops_without_events() {
        let control = FakeControl::new(true, PlanStatus::Unauthorized);
        let (tx, mut rx) = EventSender::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_pollers(
            control as Arc<dyn ControlPlane>,
            "s1".into(),
            tx,
            shutdown_rx,
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::advance(PLAN_CHECK_INTERVAL * 2).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
