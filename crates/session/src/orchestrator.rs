//! Session lifecycle orchestration.
//!
//! One `run` call owns a session end to end: resolve the request, provision
//! extensions, bring the engine up, prepare every page, start the watchers
//! and pollers, then park on the event channel until the first terminal
//! event and walk the single finalization path. The returned result carries
//! the last good storage snapshot when the save strategy allows it.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chromiumoxide::{
        Browser, Page,
        cdp::browser_protocol::{
            network::CookieParam, page::AddScriptToEvaluateOnNewDocumentParams,
            storage::SetCookiesParams, target::CreateTargetParams,
        },
    },
    futures::StreamExt,
    serde::Serialize,
    tokio::sync::{Mutex, watch},
    tracing::{debug, info, warn},
};

use veil_common::HostShell;

use crate::{
    config::{LaunchRequest, SessionConfig},
    control::{self, ControlPlane, HttpControlPlane},
    download::DownloadManager,
    error::{Result, SessionError},
    events::{EventSender, SessionEvent},
    extensions,
    guard::{self, PageInitializer},
    inject,
    intercept::{self, InterceptRules},
    launch::{self, LaunchedEngine},
    recorder::{self, SessionRecorder, StorageStateSnapshot},
    registry::{ActiveSessionRegistry, SessionHandle},
};

/// Outcome of one session, resolved when the session has fully closed.
#[derive(Debug, Serialize)]
pub struct SessionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_data: Option<StorageStateSnapshot>,
}

impl SessionResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            session_data: None,
        }
    }

    fn closed(session_data: Option<StorageStateSnapshot>) -> Self {
        Self {
            success: true,
            error: None,
            session_data,
        }
    }
}

/// Everything needed to bring one page under session policy. Applied to the
/// launch tabs and to every page that appears later.
struct PagePolicy {
    config: SessionConfig,
    rules: Arc<InterceptRules>,
    bundle: String,
    restore: Option<String>,
    autofill: Option<String>,
}

#[async_trait]
impl PageInitializer for PagePolicy {
    async fn prepare(&self, page: &Page) {
        launch::apply_user_agent(page, &self.config).await;

        add_init_script(page, &self.bundle).await;
        if let Some(restore) = &self.restore {
            add_init_script(page, restore).await;
        }
        if let Some(autofill) = &self.autofill {
            add_init_script(page, autofill).await;
            // The page may already be past document-ready.
            let _ = page.evaluate(autofill.clone()).await;
        }
        // Late pages have loaded without the init script; run it directly.
        let _ = page.evaluate(self.bundle.clone()).await;

        if let Err(e) =
            intercept::install(page, Arc::clone(&self.rules), self.config.proxy.clone()).await
        {
            warn!(error = %e, "request interception unavailable on page");
        }
    }
}

async fn add_init_script(page: &Page, source: &str) {
    let built = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(source.to_string())
        .build();
    match built {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "init script params failed to build"),
    }
}

/// Drives sessions for a host shell. Cheap to clone per call site via the
/// shared registry; the shell is the only outward dependency.
pub struct SessionSupervisor {
    registry: ActiveSessionRegistry,
    shell: Arc<dyn HostShell>,
}

impl SessionSupervisor {
    #[must_use]
    pub fn new(registry: ActiveSessionRegistry, shell: Arc<dyn HostShell>) -> Self {
        Self { registry, shell }
    }

    #[must_use]
    pub fn registry(&self) -> &ActiveSessionRegistry {
        &self.registry
    }

    /// Run one session to completion. Resolves when the session has closed,
    /// or immediately with a failure result when it could not start.
    pub async fn run(&self, request: LaunchRequest) -> SessionResult {
        let config = match SessionConfig::resolve(request) {
            Ok(config) => config,
            Err(e) => return SessionResult::failure(e.to_string()),
        };
        info!(id = %config.id, tabs = config.urls.len(), "starting session");

        let client = reqwest::Client::new();
        let extension_dirs =
            extensions::provision_all(&client, &extensions::extensions_root(), &config.extensions)
                .await;

        let LaunchedEngine {
            browser,
            mut handler,
            profile_dir,
        } = match launch::launch_engine(&config, &extension_dirs).await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(id = %config.id, error = %e, "session launch failed");
                return SessionResult::failure(e.to_string());
            },
        };

        let (events_tx, mut events_rx) = EventSender::channel(8);
        let session_handle = SessionHandle::new(events_tx.clone());
        let nonce = session_handle.nonce();
        if let Some(previous) = self.registry.insert(&config.id, session_handle) {
            info!(id = %config.id, "displacing running session with the same id");
            previous.terminate().await;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let disconnect_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = handler.next().await {
                if item.is_err() {
                    break;
                }
            }
            disconnect_tx.send(SessionEvent::EngineDisconnected).await;
        });

        let browser = Arc::new(Mutex::new(browser));
        let recorder = Arc::new(SessionRecorder::new(
            config.save_strategy,
            config.stored_state.as_ref(),
        ));

        {
            let engine = browser.lock().await;
            launch::install_cookies(&engine, &config).await;
            if let Some(snapshot) = recorder.last_good() {
                restore_cookies(&engine, &snapshot).await;
            }
        }

        let policy = Arc::new(PagePolicy {
            bundle: inject::build_bundle(&config),
            restore: recorder.last_good().as_ref().and_then(recorder::restore_script),
            autofill: inject::cdp_autofill_script(&config),
            rules: Arc::new(InterceptRules::from_config(&config)),
            config: config.clone(),
        });

        let downloads = Arc::new(DownloadManager::new(
            config.download_mode,
            profile_dir.join("downloads"),
            config.download_path.clone(),
            Arc::clone(&self.shell),
        ));
        {
            let engine = browser.lock().await;
            if let Err(e) = downloads.install(&engine).await {
                warn!(error = %e, "download handling unavailable");
            }
        }

        if let Err(e) = guard::install(&browser, config.debug).await {
            warn!(error = %e, "target supervision unavailable");
        }

        let (primary_target, initial_targets) =
            match open_tabs(&browser, &config, Arc::clone(&policy)).await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(id = %config.id, error = %e, "could not open session tabs");
                    self.teardown_engine(&browser).await;
                    launch::cleanup_profile(&profile_dir);
                    self.registry.remove_if(&config.id, nonce);
                    return SessionResult::failure(e.to_string());
                },
            };

        guard::spawn_page_watch(
            Arc::clone(&browser),
            primary_target,
            initial_targets,
            Arc::clone(&policy) as Arc<dyn PageInitializer>,
            config.debug,
            events_tx.clone(),
            shutdown_rx.clone(),
        );

        let control_plane: Option<Arc<dyn ControlPlane>> = if config.has_control_plane() {
            Some(Arc::new(HttpControlPlane::new(
                config.api_base_url.clone(),
                config.token.clone().unwrap_or_default(),
            )))
        } else {
            None
        };
        if let Some(control_plane) = &control_plane {
            control::spawn_pollers(
                Arc::clone(control_plane),
                config.id.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            );
        }

        info!(id = %config.id, "session running");
        let event = events_rx
            .recv()
            .await
            .unwrap_or(SessionEvent::EngineDisconnected);
        let _ = shutdown_tx.send(true);

        let reason = event.reason();
        info!(id = %config.id, reason, "closing session");
        {
            let engine = browser.lock().await;
            recorder.capture(&engine, reason).await;
        }

        match &event {
            SessionEvent::ForceClose => {
                if let Some(control_plane) = &control_plane
                    && let Err(e) = control_plane.clear_active_session(&config.id).await
                {
                    warn!(id = %config.id, error = %e, "active-session clear failed");
                }
            },
            SessionEvent::PlanBlocked(block) => self.shell.plan_blocked(block.clone()),
            SessionEvent::SessionExpired => self.shell.session_expired(),
            _ => {},
        }

        // One more capture before the engine goes away, in case pages
        // mutated storage after the triggering event.
        {
            let engine = browser.lock().await;
            recorder.capture(&engine, "final-check").await;
        }

        self.teardown_engine(&browser).await;
        launch::cleanup_profile(&profile_dir);
        self.registry.remove_if(&config.id, nonce);
        self.shell.session_closed(&config.id);

        SessionResult::closed(recorder.last_good())
    }

    async fn teardown_engine(&self, browser: &Arc<Mutex<Browser>>) {
        let mut engine = browser.lock().await;
        if let Err(e) = engine.close().await {
            debug!(error = %e, "engine close failed");
        }
        let _ = engine.wait().await;
    }
}

/// Open one tab per configured URL. The first is the primary; its
/// navigation failure renders the local error page, secondary failures are
/// only logged.
async fn open_tabs(
    browser: &Arc<Mutex<Browser>>,
    config: &SessionConfig,
    policy: Arc<PagePolicy>,
) -> Result<(String, Vec<String>)> {
    let primary = {
        let engine = browser.lock().await;
        let existing = engine.pages().await.unwrap_or_default();
        match existing.into_iter().next() {
            Some(page) => page,
            None => {
                let params = CreateTargetParams::builder()
                    .url("about:blank")
                    .build()
                    .map_err(SessionError::Protocol)?;
                engine
                    .new_page(params)
                    .await
                    .map_err(|e| SessionError::LaunchFailed(e.to_string()))?
            },
        }
    };

    policy.prepare(&primary).await;
    let primary_target = primary.target_id().inner().clone();
    let mut targets = vec![primary_target.clone()];

    let primary_url = config.primary_url();
    if let Err(e) = primary.goto(primary_url).await {
        let fault = SessionError::Navigation(e.to_string());
        warn!(url = primary_url, error = %fault, "primary navigation failed");
        let _ = primary
            .set_content(launch::error_page_html(primary_url, &fault.to_string()))
            .await;
    }

    for url in config.urls.iter().skip(1) {
        let created = {
            let engine = browser.lock().await;
            let params = match CreateTargetParams::builder().url("about:blank").build() {
                Ok(params) => params,
                Err(e) => {
                    warn!(url, error = %e, "tab params failed to build");
                    continue;
                },
            };
            engine.new_page(params).await
        };
        match created {
            Ok(page) => {
                policy.prepare(&page).await;
                targets.push(page.target_id().inner().clone());
                if let Err(e) = page.goto(url.as_str()).await {
                    let fault = SessionError::Navigation(e.to_string());
                    warn!(url, error = %fault, "secondary tab navigation failed");
                }
            },
            Err(e) => warn!(url, error = %e, "secondary tab open failed"),
        }
    }

    Ok((primary_target, targets))
}

/// Re-install cookies from a restored snapshot. Entries that no longer
/// round-trip into protocol cookies are dropped.
async fn restore_cookies(browser: &Browser, snapshot: &StorageStateSnapshot) {
    let cookies: Vec<CookieParam> = snapshot
        .cookies
        .iter()
        .filter_map(|c| serde_json::from_value(c.clone()).ok())
        .collect();
    if cookies.is_empty() {
        return;
    }
    let count = cookies.len();
    let built = SetCookiesParams::builder().cookies(cookies).build();
    match built {
        Ok(params) => match browser.execute(params).await {
            Ok(_) => debug!(count, "restored session cookies"),
            Err(e) => warn!(error = %e, "cookie restore failed"),
        },
        Err(e) => warn!(error = %e, "cookie restore params failed to build"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, veil_common::NullShell};

    #[tokio::test]
    async fn invalid_request_fails_without_registering() {
        let supervisor =
            SessionSupervisor::new(ActiveSessionRegistry::new(), Arc::new(NullShell));
        let result = supervisor.run(LaunchRequest::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("start_url"));
        assert!(supervisor.registry().ids().is_empty());
    }

    #[test]
    fn failure_result_serializes_without_snapshot() {
        let result = SessionResult::failure("launch failed: boom");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "launch failed: boom");
        assert!(value.get("session_data").is_none());
    }

    #[test]
    fn closed_result_carries_snapshot_only_when_present() {
        let with = SessionResult::closed(Some(StorageStateSnapshot::default()));
        let value = serde_json::to_value(&with).unwrap();
        assert_eq!(value["success"], true);
        assert!(value.get("session_data").is_some());

        let without = SessionResult::closed(None);
        let value = serde_json::to_value(&without).unwrap();
        assert!(value.get("session_data").is_none());
    }
}
