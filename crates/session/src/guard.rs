//! Target supervision.
//!
//! Two concerns: close engine surfaces the user must not reach (devtools,
//! internal pages) as soon as they appear, and watch the page population so
//! late-opened tabs get the session treatment and a vanished primary tab
//! ends the session. Discovery events are unreliable for pages opened via
//! `window.open`, so a short poll over the page list backs them up.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    chromiumoxide::{
        Browser, Page,
        cdp::browser_protocol::target::{
            CloseTargetParams, EventTargetCreated, SetDiscoverTargetsParams, TargetId,
        },
    },
    futures::StreamExt,
    tokio::sync::{Mutex, watch},
    tracing::{debug, info, warn},
};

use crate::{
    error::Result,
    events::{EventSender, SessionEvent},
};

/// Cadence of the backup page-list poll.
pub const PAGE_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// How long a blank popup gets to commit its real destination before it is
/// wired up anyway.
const POPUP_SETTLE_TIMEOUT: Duration = Duration::from_millis(1500);
const POPUP_SETTLE_STEP: Duration = Duration::from_millis(100);

/// Hook invoked once for every page that joins the session after launch.
#[async_trait]
pub trait PageInitializer: Send + Sync {
    async fn prepare(&self, page: &Page);
}

/// Whether a freshly created target must be closed instead of shown.
/// Debug sessions keep internal surfaces reachable.
#[must_use]
pub fn is_forbidden_target(kind: &str, url: &str, debug: bool) -> bool {
    if kind == "devtools" {
        return !debug;
    }
    if kind != "page" {
        return false;
    }
    is_forbidden_url(url, debug)
}

/// Forbidden-scheme set for page URLs. Also checked from the page poll:
/// an in-tab navigation to one of these surfaces emits no creation event.
#[must_use]
pub fn is_forbidden_url(url: &str, debug: bool) -> bool {
    if debug {
        return false;
    }
    if url.starts_with("chrome://") {
        // The native downloads view stays open for browser-mode downloads.
        return !url.starts_with("chrome://downloads");
    }
    url.starts_with("devtools://")
        || url.starts_with("edge://")
        || url.starts_with("chrome-extension://")
}

/// Enable target discovery and spawn the closer for forbidden surfaces.
pub async fn install(browser: &Arc<Mutex<Browser>>, debug: bool) -> Result<()> {
    let params = SetDiscoverTargetsParams::builder()
        .discover(true)
        .build()
        .map_err(crate::error::SessionError::Protocol)?;
    let engine = browser.lock().await;
    engine.execute(params).await?;
    let mut created = engine.event_listener::<EventTargetCreated>().await?;
    drop(engine);

    let browser = Arc::clone(browser);
    tokio::spawn(async move {
        while let Some(event) = created.next().await {
            let info = &event.target_info;
            if !is_forbidden_target(info.r#type.as_str(), &info.url, debug) {
                continue;
            }
            info!(url = %info.url, "closing forbidden target");
            close_target(&browser, info.target_id.clone()).await;
        }
    });

    Ok(())
}

async fn close_target(browser: &Arc<Mutex<Browser>>, target_id: TargetId) {
    let built = CloseTargetParams::builder().target_id(target_id).build();
    match built {
        Ok(params) => {
            let _ = browser.lock().await.execute(params).await;
        },
        Err(e) => warn!(error = %e, "close-target params failed to build"),
    }
}

/// Spawn the page watcher. Pages with a forbidden URL are closed; pages not
/// in `initial` get prepared exactly once through `init`; when the primary
/// page disappears a [`SessionEvent::PageClosed`] is sent and the watcher
/// stops.
pub fn spawn_page_watch(
    browser: Arc<Mutex<Browser>>,
    primary_target: String,
    initial: Vec<String>,
    init: Arc<dyn PageInitializer>,
    debug: bool,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = initial.into_iter().collect();
        seen.insert(primary_target.clone());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PAGE_POLL_INTERVAL) => {},
                _ = shutdown.changed() => return,
            }

            let pages = browser.lock().await.pages().await.unwrap_or_default();
            let mut primary_alive = false;
            for page in pages {
                let url = page.url().await.ok().flatten().unwrap_or_default();
                if is_forbidden_url(&url, debug) {
                    info!(url, "closing forbidden page");
                    close_target(&browser, page.target_id().clone()).await;
                    continue;
                }

                let id = page.target_id().inner().clone();
                if id == primary_target {
                    primary_alive = true;
                }
                if seen.insert(id) {
                    debug!("preparing late-opened page");
                    await_popup_commit(&page).await;
                    init.prepare(&page).await;
                }
            }

            if !primary_alive {
                info!("primary page closed");
                events.send(SessionEvent::PageClosed).await;
                return;
            }
        }
    });
}

/// Popups open as a blank placeholder first; give the real navigation a
/// bounded moment to commit so the page is wired with its final URL.
async fn await_popup_commit(page: &Page) {
    let mut waited = Duration::ZERO;
    while waited < POPUP_SETTLE_TIMEOUT {
        match page.url().await {
            Ok(Some(url)) if url != "about:blank" && !url.is_empty() => return,
            Ok(_) => {},
            Err(_) => return,
        }
        tokio::time::sleep(POPUP_SETTLE_STEP).await;
        waited += POPUP_SETTLE_STEP;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn devtools_and_internal_pages_are_forbidden() {
        assert!(is_forbidden_target(
            "page",
            "devtools://devtools/bundled/inspector.html",
            false
        ));
        assert!(is_forbidden_target("page", "chrome://settings", false));
        assert!(is_forbidden_target("page", "chrome://flags", false));
        assert!(is_forbidden_target("page", "chrome://newtab/", false));
        assert!(is_forbidden_target("page", "edge://flags", false));
        assert!(is_forbidden_target(
            "page",
            "chrome-extension://abcdef/popup.html",
            false
        ));
    }

    #[test]
    fn downloads_view_and_normal_pages_are_allowed() {
        assert!(!is_forbidden_target("page", "https://example.com", false));
        assert!(!is_forbidden_target("page", "about:blank", false));
        assert!(!is_forbidden_target("page", "chrome://downloads/", false));
    }

    #[test]
    fn devtools_panel_targets_are_forbidden_by_type() {
        assert!(is_forbidden_target(
            "devtools",
            "devtools://devtools/bundled/devtools_app.html",
            false
        ));
        assert!(!is_forbidden_target(
            "devtools",
            "devtools://devtools/bundled/devtools_app.html",
            true
        ));
    }

    #[test]
    fn non_page_targets_are_ignored() {
        assert!(!is_forbidden_target("browser", "chrome://settings", false));
        assert!(!is_forbidden_target(
            "background_page",
            "chrome://extensions",
            false
        ));
        assert!(!is_forbidden_target("service_worker", "devtools://x", false));
    }

    #[test]
    fn debug_sessions_keep_internal_surfaces() {
        assert!(!is_forbidden_target("page", "chrome://settings", true));
        assert!(!is_forbidden_target(
            "page",
            "devtools://devtools/bundled/inspector.html",
            true
        ));
    }

    // The poll checks URLs directly because an in-tab navigation to an
    // internal surface never emits a creation event.
    #[test]
    fn in_tab_navigations_to_internal_surfaces_are_forbidden() {
        assert!(is_forbidden_url("chrome://settings", false));
        assert!(is_forbidden_url("devtools://devtools/inspector.html", false));
        assert!(is_forbidden_url("edge://settings", false));
        assert!(is_forbidden_url("chrome-extension://abcdef/page.html", false));
        assert!(!is_forbidden_url("chrome://downloads/", false));
        assert!(!is_forbidden_url("https://example.com", false));
        assert!(!is_forbidden_url("chrome://settings", true));
    }
}
