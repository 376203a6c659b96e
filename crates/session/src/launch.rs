//! Engine bring-up and first-navigation plumbing.
//!
//! Builds the hardened launch configuration (hidden profile directory,
//! anti-WebRTC and anti-automation flags, proxy wiring, unpacked
//! extensions), starts the engine, and provides the page-level preparation
//! used right after launch: user-agent override, cookie installation and
//! the local error page for a failed primary navigation.

use std::{path::PathBuf, time::Duration};

use {
    chromiumoxide::{
        Browser, BrowserConfig, Handler, Page,
        cdp::browser_protocol::{
            emulation,
            network::{CookieParam, CookieSameSite, TimeSinceEpoch},
            storage::SetCookiesParams,
        },
    },
    rand::Rng,
    tracing::{debug, info, warn},
};

use crate::{
    config::{CookieInput, SessionConfig},
    error::{Result, SessionError},
};

const ENGINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine major version presented in the user agent and client hints. Both
/// derive from this one constant so they cannot drift apart.
pub const CHROME_MAJOR_VERSION: &str = "143";

/// Desktop user agent for the host platform, presented when the request
/// supplies none.
#[must_use]
pub fn default_user_agent() -> String {
    let os = if cfg!(target_os = "macos") {
        "Macintosh; Intel Mac OS X 10_15_7"
    } else if cfg!(target_os = "linux") {
        "X11; Linux x86_64"
    } else {
        "Windows NT 10.0; Win64; x64"
    };
    format!(
        "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/{CHROME_MAJOR_VERSION}.0.0.0 Safari/537.36"
    )
}

fn effective_user_agent(config: &SessionConfig) -> String {
    config
        .custom_user_agent
        .clone()
        .unwrap_or_else(default_user_agent)
}

/// A running engine with its event handler and the profile dir to reclaim.
pub struct LaunchedEngine {
    pub browser: Browser,
    pub handler: Handler,
    pub profile_dir: PathBuf,
}

/// Fresh hidden profile directory with a random leaf, so concurrent
/// sessions never share engine state.
#[must_use]
pub fn session_profile_dir() -> PathBuf {
    let mut rng = rand::rng();
    let leaf = format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>());
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("veil")
        .join("profiles")
        .join(leaf)
}

/// Engine flags for one session. WebRTC is pinned to proxied routes so the
/// real address never surfaces through ICE candidates.
#[must_use]
pub fn chrome_args(config: &SessionConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-blink-features=AutomationControlled",
        "--webrtc-ip-handling-policy=disable_non_proxied_udp",
        "--force-webrtc-ip-handling-policy",
        "--enforce-webrtc-ip-permission-check",
        "--disable-background-networking",
        "--disable-breakpad",
        "--disable-sync",
        "--lang=en-US",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    if let Some(proxy) = &config.proxy {
        args.push(format!("--proxy-server={}", proxy.server()));
    }
    if config.app_mode {
        args.push(format!("--app={}", config.primary_url()));
    } else {
        args.push("--start-maximized".to_string());
    }
    args
}

/// Start the engine for a session. Fatal on failure; the caller turns the
/// error into a launch-failed result.
pub async fn launch_engine(
    config: &SessionConfig,
    extension_dirs: &[PathBuf],
) -> Result<LaunchedEngine> {
    let profile_dir = session_profile_dir();
    std::fs::create_dir_all(&profile_dir)
        .map_err(|e| SessionError::LaunchFailed(e.to_string()))?;

    let mut builder = BrowserConfig::builder()
        .with_head()
        .user_data_dir(&profile_dir)
        .request_timeout(ENGINE_REQUEST_TIMEOUT)
        .args(chrome_args(config));
    for dir in extension_dirs {
        builder = builder.extension(dir.to_string_lossy().to_string());
    }
    let engine_config = builder.build().map_err(SessionError::LaunchFailed)?;

    info!(profile = %profile_dir.display(), "launching engine");
    let (browser, handler) = Browser::launch(engine_config)
        .await
        .map_err(|e| SessionError::LaunchFailed(e.to_string()))?;

    Ok(LaunchedEngine {
        browser,
        handler,
        profile_dir,
    })
}

/// Override the user agent and client-hint metadata on one page. Runs as
/// defense in depth next to the injected navigator overrides; failures are
/// logged and ignored.
pub async fn apply_user_agent(page: &Page, config: &SessionConfig) {
    let mut builder = emulation::SetUserAgentOverrideParams::builder()
        .user_agent(effective_user_agent(config))
        .platform(crate::inject::SPOOF_PLATFORM);
    if let Some(metadata) = client_hint_metadata() {
        builder = builder.user_agent_metadata(metadata);
    }
    match builder.build() {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "user-agent params failed to build"),
    }
}

/// Client-hint platform triple (name, version, architecture) for the host.
fn client_hint_platform() -> (&'static str, &'static str, &'static str) {
    if cfg!(target_os = "macos") {
        ("macOS", "13.0.0", "arm")
    } else if cfg!(target_os = "linux") {
        ("Linux", "6.5.0", "x86")
    } else {
        ("Windows", "10.0.0", "x86")
    }
}

fn client_hint_metadata() -> Option<emulation::UserAgentMetadata> {
    let chromium = emulation::UserAgentBrandVersion::builder()
        .brand("Chromium")
        .version(CHROME_MAJOR_VERSION)
        .build()
        .ok()?;
    let chrome = emulation::UserAgentBrandVersion::builder()
        .brand("Google Chrome")
        .version(CHROME_MAJOR_VERSION)
        .build()
        .ok()?;
    let (platform, platform_version, architecture) = client_hint_platform();
    emulation::UserAgentMetadata::builder()
        .brand(chromium)
        .brand(chrome)
        .platform(platform)
        .platform_version(platform_version)
        .architecture(architecture)
        .model("")
        .mobile(false)
        .build()
        .ok()
}

/// Translate loose cookie-export entries into protocol cookies. Entries
/// without a usable name or domain are dropped.
#[must_use]
pub fn cookie_params(inputs: &[CookieInput]) -> Vec<CookieParam> {
    inputs
        .iter()
        .filter_map(|input| {
            let domain = input.domain.as_deref()?.trim();
            if input.name.is_empty() || domain.is_empty() {
                return None;
            }
            let value = match &input.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            let mut builder = CookieParam::builder()
                .name(input.name.clone())
                .value(value)
                .domain(domain.to_string())
                .path(input.path.clone().unwrap_or_else(|| "/".to_string()))
                .secure(input.secure.unwrap_or(false))
                .http_only(input.http_only.unwrap_or(false));

            if let Some(same_site) = input.same_site.as_deref().and_then(parse_same_site) {
                builder = builder.same_site(same_site);
            }
            // Session cookies carry no expiry even when the export has one.
            if input.session != Some(true)
                && let Some(expires) = input.expiration_date.or(input.expires)
            {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }

            builder.build().ok()
        })
        .collect()
}

fn parse_same_site(value: &str) -> Option<CookieSameSite> {
    match value.to_lowercase().as_str() {
        "strict" => Some(CookieSameSite::Strict),
        "lax" => Some(CookieSameSite::Lax),
        "none" | "no_restriction" => Some(CookieSameSite::None),
        _ => None,
    }
}

/// Install the request's custom cookies before the first navigation.
/// Best-effort: a rejected batch is logged, the session continues.
pub async fn install_cookies(browser: &Browser, config: &SessionConfig) {
    let cookies = cookie_params(&config.custom_cookies);
    if cookies.is_empty() {
        return;
    }
    let count = cookies.len();
    let built = SetCookiesParams::builder().cookies(cookies).build();
    match built {
        Ok(params) => match browser.execute(params).await {
            Ok(_) => debug!(count, "installed custom cookies"),
            Err(e) => warn!(error = %e, "custom cookie install failed"),
        },
        Err(e) => warn!(error = %e, "cookie params failed to build"),
    }
}

/// Why a navigation failed, for the error page copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationFault {
    Aborted,
    TimedOut,
    Other,
}

#[must_use]
pub fn classify_navigation_error(error: &str) -> NavigationFault {
    let lower = error.to_lowercase();
    if lower.contains("abort") {
        NavigationFault::Aborted
    } else if lower.contains("timeout") || lower.contains("timed out") {
        NavigationFault::TimedOut
    } else {
        NavigationFault::Other
    }
}

/// Local page rendered when the primary navigation fails.
#[must_use]
pub fn error_page_html(url: &str, error: &str) -> String {
    let message = match classify_navigation_error(error) {
        NavigationFault::Aborted => "The page load was interrupted before it finished.",
        NavigationFault::TimedOut => "The site took too long to respond.",
        NavigationFault::Other => "The page could not be loaded.",
    };
    let safe_url = url.replace('<', "&lt;").replace('>', "&gt;");
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Page unavailable</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #1a1a2e; color: #eee;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  .card {{ text-align: center; max-width: 40em; padding: 2em; }}
  h1 {{ color: #e94560; }}
  code {{ background: #16213e; padding: .2em .5em; border-radius: 4px; word-break: break-all; }}
</style></head>
<body><div class="card">
<h1>Page unavailable</h1>
<p>{message}</p>
<p><code>{safe_url}</code></p>
<p>Check the address or try again once the connection recovers.</p>
</div></body>
</html>"#
    )
}

/// Remove the session's profile directory. Best-effort teardown.
pub fn cleanup_profile(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!(dir = %dir.display(), error = %e, "profile cleanup failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::config::LaunchRequest, serde_json::json};

    fn config_for(url: &str) -> SessionConfig {
        SessionConfig::resolve(LaunchRequest {
            start_url: Some(url.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn webrtc_flags_always_present() {
        let args = chrome_args(&config_for("https://a.example"));
        assert!(args.iter().any(|a| a.contains("disable_non_proxied_udp")));
        assert!(args.contains(&"--force-webrtc-ip-handling-policy".to_string()));
    }

    #[test]
    fn proxy_and_app_mode_flags() {
        let mut config = config_for("https://a.example");
        config.proxy = Some(crate::config::ProxyDescriptor {
            protocol: "socks5".into(),
            host: "10.0.0.2".into(),
            port: 1080,
            username: None,
            password: None,
        });
        config.app_mode = true;
        let args = chrome_args(&config);
        assert!(args.contains(&"--proxy-server=socks5://10.0.0.2:1080".to_string()));
        assert!(args.contains(&"--app=https://a.example".to_string()));
        assert!(!args.contains(&"--start-maximized".to_string()));
    }

    #[test]
    fn profile_dirs_are_unique() {
        assert_ne!(session_profile_dir(), session_profile_dir());
    }

    #[test]
    fn custom_user_agent_wins_over_default() {
        let mut config = config_for("https://a.example");
        config.custom_user_agent = Some("TestAgent/1.0".into());
        assert_eq!(effective_user_agent(&config), "TestAgent/1.0");

        config.custom_user_agent = None;
        assert_eq!(effective_user_agent(&config), default_user_agent());
    }

    #[test]
    fn default_user_agent_tracks_host_platform() {
        let ua = default_user_agent();
        if cfg!(target_os = "macos") {
            assert!(ua.contains("Macintosh"));
        } else if cfg!(target_os = "linux") {
            assert!(ua.contains("Linux"));
        } else {
            assert!(ua.contains("Windows NT"));
        }
        assert!(ua.contains(&format!("Chrome/{CHROME_MAJOR_VERSION}.0.0.0")));
    }

    #[test]
    fn client_hints_share_the_ua_version_and_platform() {
        let metadata = serde_json::to_value(client_hint_metadata().unwrap()).unwrap();
        for brand in metadata["brands"].as_array().unwrap() {
            assert_eq!(brand["version"], CHROME_MAJOR_VERSION);
        }
        let (platform, _, _) = client_hint_platform();
        assert_eq!(metadata["platform"], platform);
    }

    #[test]
    fn cookie_translation_drops_unusable_entries() {
        let inputs: Vec<CookieInput> = serde_json::from_value(json!([
            { "name": "sid", "value": "abc", "domain": ".example.com",
              "httpOnly": true, "sameSite": "lax", "expirationDate": 1900000000.0 },
            { "name": "tmp", "value": "x", "domain": "example.com", "session": true,
              "expirationDate": 1900000000.0 },
            { "name": "orphan", "value": "x" },
            { "name": "", "value": "x", "domain": "example.com" }
        ]))
        .unwrap();
        let cookies = cookie_params(&inputs);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "sid");
        assert!(cookies[0].expires.is_some());
        // Session cookie keeps no expiry.
        assert!(cookies[1].expires.is_none());
    }

    #[test]
    fn non_string_cookie_values_are_serialized() {
        let inputs: Vec<CookieInput> = serde_json::from_value(json!([
            { "name": "n", "value": 42, "domain": "example.com" }
        ]))
        .unwrap();
        assert_eq!(cookie_params(&inputs)[0].value, "42");
    }

    #[test]
    fn navigation_errors_classify_by_message() {
        assert_eq!(
            classify_navigation_error("net::ERR_ABORTED"),
            NavigationFault::Aborted
        );
        assert_eq!(
            classify_navigation_error("request timed out"),
            NavigationFault::TimedOut
        );
        assert_eq!(
            classify_navigation_error("net::ERR_NAME_NOT_RESOLVED"),
            NavigationFault::Other
        );
    }

    #[test]
    fn error_page_names_url_and_reason() {
        let html = error_page_html("https://slow.example", "navigation timeout");
        assert!(html.contains("https://slow.example"));
        assert!(html.contains("too long"));
    }
}
