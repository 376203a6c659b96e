//! Network-level request interception.
//!
//! Every page gets the Fetch domain enabled and each paused request is
//! classified through one ordered decision path: control-service
//! passthrough, internal-scheme block, silent ad/tracker drop, user URL
//! block, then the link policy with its 403 interstitial and the
//! auth-provider bypass. Proxy authentication challenges are answered from
//! the session's proxy credentials. All protocol calls here are
//! best-effort.

use std::sync::Arc;

use {
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    chromiumoxide::{
        Page,
        cdp::browser_protocol::{
            fetch::{
                AuthChallengeResponse, AuthChallengeResponseResponse, AuthChallengeSource,
                ContinueRequestParams, ContinueWithAuthParams, EnableParams, EventAuthRequired,
                EventRequestPaused, FailRequestParams, FulfillRequestParams, HeaderEntry,
                RequestId,
            },
            network::ErrorReason,
        },
    },
    futures::StreamExt,
    tracing::{debug, warn},
    url::Host,
};

use crate::{
    config::{ProxyDescriptor, SessionConfig},
    error::Result,
    rules::{self, BlockRule},
};

/// Port of the in-app local control service. The engine's private-network
/// policy would block pages from reaching it, so its requests are forwarded
/// through a direct fetch instead.
pub const CONTROL_PORT: u16 = 3992;

/// Internal engine schemes no page may request outside debug sessions.
const DISALLOWED_SCHEMES: &[&str] =
    &["chrome://", "devtools://", "edge://", "chrome-extension://"];

/// What to do with one paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Ad/tracker traffic: abort without any visible artifact.
    DropSilently,
    /// Internal scheme or user URL block: abort the load.
    Abort,
    /// Link policy hit: serve the 403 interstitial instead.
    Interstitial,
    /// Control-service target: fetch directly and fulfill, bypassing the
    /// private-network block.
    DirectFetch,
}

/// Compiled rule set shared by every page of a session.
pub struct InterceptRules {
    url_blocks: Vec<BlockRule>,
    link_policy: Vec<BlockRule>,
    debug: bool,
}

impl InterceptRules {
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            url_blocks: rules::compile_all(&config.url_blocks, "url-block"),
            link_policy: rules::compile_all(&config.blocked_links, "link-policy"),
            debug: config.debug,
        }
    }

    /// Classify a request URL. Order matters: the passthrough, scheme block
    /// and silent ad drop run before any user rule, and the auth whitelist
    /// trumps the link policy.
    #[must_use]
    pub fn decide(&self, url: &str) -> Verdict {
        if is_control_service(url) {
            return Verdict::DirectFetch;
        }
        if !self.debug && DISALLOWED_SCHEMES.iter().any(|s| url.starts_with(s)) {
            return Verdict::Abort;
        }
        if rules::is_ad_or_tracker(url) {
            return Verdict::DropSilently;
        }
        if self.url_blocks.iter().any(|r| r.matches(url)) {
            return Verdict::Abort;
        }
        if self.link_policy.iter().any(|r| r.matches(url)) {
            if rules::is_auth_whitelisted(url) {
                return Verdict::Allow;
            }
            return Verdict::Interstitial;
        }
        Verdict::Allow
    }
}

/// A loopback request to the control port, regardless of proxy settings.
fn is_control_service(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    if parsed.port_or_known_default() != Some(CONTROL_PORT) {
        return false;
    }
    match parsed.host() {
        Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// The page shown in place of a link-policy blocked navigation.
#[must_use]
pub fn interstitial_html(url: &str) -> String {
    let safe_url = url.replace('<', "&lt;").replace('>', "&gt;");
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Access restricted</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #1a1a2e; color: #eee;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  .card {{ text-align: center; max-width: 40em; padding: 2em; }}
  h1 {{ color: #e94560; }}
  code {{ background: #16213e; padding: .2em .5em; border-radius: 4px; word-break: break-all; }}
</style></head>
<body><div class="card">
<h1>403</h1>
<p>This destination is not available in the current session.</p>
<p><code>{safe_url}</code></p>
</div></body>
</html>"#
    )
}

/// Enable interception on one page and spawn its event loops.
pub async fn install(
    page: &Page,
    rules: Arc<InterceptRules>,
    proxy: Option<ProxyDescriptor>,
) -> Result<()> {
    let has_proxy_auth = proxy
        .as_ref()
        .is_some_and(|p| p.username.is_some() && p.password.is_some());

    let params = EnableParams::builder()
        .handle_auth_requests(has_proxy_auth)
        .build();
    page.execute(params).await?;

    let mut paused = page.event_listener::<EventRequestPaused>().await?;
    let request_page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            handle_paused(&request_page, &rules, &event).await;
        }
    });

    if has_proxy_auth && let Some(proxy) = proxy {
        let mut challenges = page.event_listener::<EventAuthRequired>().await?;
        let auth_page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = challenges.next().await {
                handle_auth(&auth_page, &proxy, &event).await;
            }
        });
    }

    Ok(())
}

async fn handle_paused(page: &Page, rules: &InterceptRules, event: &EventRequestPaused) {
    let url = &event.request.url;
    match rules.decide(url) {
        Verdict::Allow => continue_request(page, event.request_id.clone()).await,
        Verdict::DropSilently => {
            fail_request(page, event.request_id.clone(), ErrorReason::BlockedByClient).await;
        },
        Verdict::Abort => {
            debug!(url, "blocked by url rule");
            fail_request(page, event.request_id.clone(), ErrorReason::Aborted).await;
        },
        Verdict::Interstitial => {
            debug!(url, "serving link-policy interstitial");
            serve_interstitial(page, event.request_id.clone(), url).await;
        },
        Verdict::DirectFetch => direct_fetch(page, event).await,
    }
}

async fn continue_request(page: &Page, request_id: RequestId) {
    match ContinueRequestParams::builder().request_id(request_id).build() {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "continue params failed to build"),
    }
}

async fn fail_request(page: &Page, request_id: RequestId, reason: ErrorReason) {
    let built = FailRequestParams::builder()
        .request_id(request_id)
        .error_reason(reason)
        .build();
    match built {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "fail params failed to build"),
    }
}

async fn serve_interstitial(page: &Page, request_id: RequestId, url: &str) {
    let body = BASE64.encode(interstitial_html(url));
    let built = FulfillRequestParams::builder()
        .request_id(request_id)
        .response_code(403)
        .response_header(HeaderEntry {
            name: "Content-Type".into(),
            value: "text/html; charset=utf-8".into(),
        })
        .body(body)
        .build();
    match built {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "interstitial params failed to build"),
    }
}

/// Headers the direct fetch must not forward; the client recomputes them.
const HOP_BY_HOP: &[&str] = &["host", "connection", "content-length"];

/// Forward a control-service request off-proxy, method and body included,
/// and fulfill the paused request with the result. Fetch failures fall
/// back to a plain continue so the engine can handle them itself.
async fn direct_fetch(page: &Page, event: &EventRequestPaused) {
    let method = match reqwest::Method::from_bytes(event.request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            continue_request(page, event.request_id.clone()).await;
            return;
        },
    };
    let client = match reqwest::Client::builder().no_proxy().build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "control-service client build failed");
            continue_request(page, event.request_id.clone()).await;
            return;
        },
    };
    let headers = event.request.headers.inner();
    // CDP delivers the body as base64-encoded entries; reassemble it.
    let body = event.request.post_data_entries.as_ref().map(|entries| {
        entries
            .iter()
            .filter_map(|entry| entry.bytes.as_ref())
            .filter_map(|bytes| BASE64.decode(bytes).ok())
            .flatten()
            .collect::<Vec<u8>>()
    });
    let body = body.as_deref();

    let response = match send_direct(&client, &method, &event.request.url, headers, body).await {
        Ok(r) => Ok(r),
        // The local service may only listen on the hostname form.
        Err(e) if e.is_connect() && event.request.url.contains("127.0.0.1") => {
            let retry_url = event.request.url.replace("127.0.0.1", "localhost");
            debug!(url = %retry_url, "control service refused, retrying via localhost");
            send_direct(&client, &method, &retry_url, headers, body).await
        },
        Err(e) => Err(e),
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            debug!(url = %event.request.url, error = %e, "control-service fetch failed");
            continue_request(page, event.request_id.clone()).await;
            return;
        },
    };

    let status = response.status().as_u16() as i64;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let Ok(bytes) = response.bytes().await else {
        continue_request(page, event.request_id.clone()).await;
        return;
    };

    // Private-network checks would block the response without these.
    let headers = vec![
        HeaderEntry {
            name: "Content-Type".into(),
            value: content_type,
        },
        HeaderEntry {
            name: "Access-Control-Allow-Origin".into(),
            value: "*".into(),
        },
        HeaderEntry {
            name: "Access-Control-Allow-Methods".into(),
            value: "GET, POST, PUT, DELETE, OPTIONS".into(),
        },
        HeaderEntry {
            name: "Access-Control-Allow-Headers".into(),
            value: "*".into(),
        },
    ];

    let built = FulfillRequestParams::builder()
        .request_id(event.request_id.clone())
        .response_code(status)
        .response_headers(headers)
        .body(BASE64.encode(&bytes))
        .build();
    match built {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "control-service fulfill params failed to build"),
    }
}

async fn send_direct(
    client: &reqwest::Client,
    method: &reqwest::Method,
    url: &str,
    headers: &serde_json::Value,
    body: Option<&[u8]>,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let mut request = client.request(method.clone(), url);
    if let Some(map) = headers.as_object() {
        for (name, value) in map {
            if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let Some(value) = value.as_str() {
                request = request.header(name.as_str(), value);
            }
        }
    }
    if let Some(body) = body {
        request = request.body(body.to_vec());
    }
    request.send().await
}

async fn handle_auth(page: &Page, proxy: &ProxyDescriptor, event: &EventAuthRequired) {
    let is_proxy_challenge = matches!(event.auth_challenge.source, Some(AuthChallengeSource::Proxy));

    let response = if is_proxy_challenge
        && let (Some(user), Some(pass)) = (&proxy.username, &proxy.password)
    {
        AuthChallengeResponse::builder()
            .response(AuthChallengeResponseResponse::ProvideCredentials)
            .username(user.clone())
            .password(pass.clone())
            .build()
    } else {
        AuthChallengeResponse::builder()
            .response(AuthChallengeResponseResponse::Default)
            .build()
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "auth response failed to build");
            return;
        },
    };

    let built = ContinueWithAuthParams::builder()
        .request_id(event.request_id.clone())
        .auth_challenge_response(response)
        .build();
    match built {
        Ok(params) => {
            let _ = page.execute(params).await;
        },
        Err(e) => warn!(error = %e, "continue-with-auth params failed to build"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn rules(url_blocks: &[&str], link_policy: &[&str], debug: bool) -> InterceptRules {
        InterceptRules {
            url_blocks: rules::compile_all(
                &url_blocks.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                "url-block",
            ),
            link_policy: rules::compile_all(
                &link_policy.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                "link-policy",
            ),
            debug,
        }
    }

    #[test]
    fn ad_hosts_are_dropped_silently() {
        let r = rules(&[], &[], false);
        assert_eq!(
            r.decide("https://googleads.g.doubleclick.net/pagead/x"),
            Verdict::DropSilently
        );
    }

    #[test]
    fn url_blocks_abort_and_wildcards_apply() {
        let r = rules(&["*.badsite.com"], &[], false);
        assert_eq!(r.decide("https://ads.badsite.com/x"), Verdict::Abort);
        assert_eq!(r.decide("https://tracker.badsite.com"), Verdict::Abort);
        assert_eq!(r.decide("https://badsite.com.safe.net"), Verdict::Allow);
    }

    #[test]
    fn internal_schemes_abort_unless_debugging() {
        let r = rules(&[], &[], false);
        assert_eq!(r.decide("chrome://settings/"), Verdict::Abort);
        assert_eq!(
            r.decide("devtools://devtools/bundled/inspector.html"),
            Verdict::Abort
        );
        assert_eq!(r.decide("edge://flags/"), Verdict::Abort);
        assert_eq!(
            r.decide("chrome-extension://abcdef/page.html"),
            Verdict::Abort
        );

        let debugging = rules(&[], &[], true);
        assert_eq!(debugging.decide("chrome://settings/"), Verdict::Allow);
    }

    #[test]
    fn link_policy_serves_interstitial_except_auth_providers() {
        let r = rules(&[], &["accounts.google.com", "news.example"], false);
        assert_eq!(
            r.decide("https://news.example/story"),
            Verdict::Interstitial
        );
        // A blocked pattern that covers an auth provider still lets the
        // sign-in flow through.
        assert_eq!(
            r.decide("https://accounts.google.com/o/oauth2/v2/auth"),
            Verdict::Allow
        );
    }

    #[test]
    fn control_service_requests_always_use_direct_fetch() {
        let r = rules(&[], &[], false);
        assert_eq!(
            r.decide("http://127.0.0.1:3992/api/status"),
            Verdict::DirectFetch
        );
        assert_eq!(r.decide("http://localhost:3992/poll"), Verdict::DirectFetch);
        // Other loopback ports are ordinary traffic.
        assert_eq!(r.decide("http://127.0.0.1:8080/"), Verdict::Allow);
        assert_eq!(r.decide("http://localhost:3000/api"), Verdict::Allow);
        assert_eq!(r.decide("https://example.com"), Verdict::Allow);
    }

    #[test]
    fn interstitial_names_the_blocked_url() {
        let html = interstitial_html("https://news.example/story?id=1");
        assert!(html.contains("403"));
        assert!(html.contains("https://news.example/story?id=1"));
    }

    #[test]
    fn interstitial_escapes_markup_in_urls() {
        let html = interstitial_html("https://x.example/<script>");
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

}
