//! Launch-request resolution into an immutable [`SessionConfig`].
//!
//! The web panel sends a loosely-shaped JSON object: list fields arrive as
//! arrays or newline-separated strings, most fields are optional, and only
//! the target URL is mandatory. Everything is normalized exactly once here;
//! downstream code only ever sees the typed config.

use std::collections::BTreeMap;

use {
    serde::Deserialize,
    serde_json::Value,
};

use crate::error::{Result, SessionError};

/// Session id used when the request carries none. Only one anonymous
/// session can be live at a time because ids key the active registry.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Opened when the request's URL list is present but yields no usable
/// entry, so a session with a blank target still starts somewhere neutral.
pub const DEFAULT_START_PAGE: &str = "https://www.google.com";

const DEFAULT_LOGIN_SELECTOR: &str =
    r#"input[type="email"], input[name*="user"], input[name*="login"]"#;
const DEFAULT_PASSWORD_SELECTOR: &str = r#"input[type="password"]"#;

/// When to persist storage state back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    Always,
    Never,
}

/// How triggered downloads are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Save into a resolved directory without asking.
    Auto,
    /// Ask the host shell for a destination.
    App,
    /// Leave downloads to the engine's own UI; no handler installed.
    Browser,
}

/// Upstream proxy for the whole browsing context. Never mutated after
/// construction; translated 1:1 into engine flags and auth answers.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDescriptor {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyDescriptor {
    /// Value for the engine's `--proxy-server` flag.
    #[must_use]
    pub fn server(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// A third-party extension package to provision before launch.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionSpec {
    pub name: String,
    pub url: String,
}

/// Per-page element rule: hide or remove elements on matching URLs.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ElementRule {
    pub url_pattern: String,
    pub element_selector: String,
    /// `"remove"` deletes the node, anything else hides it.
    #[serde(default)]
    pub action: String,
}

/// A cookie as exported by common cookie-editor extensions. Field names are
/// kept loose on purpose; normalization happens when the cookie is installed.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieInput {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: Option<bool>,
    #[serde(default, rename = "sameSite")]
    pub same_site: Option<String>,
    #[serde(default, rename = "expirationDate")]
    pub expiration_date: Option<f64>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub session: Option<bool>,
}

/// The untyped launch request as it arrives from the host shell.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub proxy_data: Option<ProxyDescriptor>,
    /// Previously captured storage state, as raw JSON or a JSON string.
    #[serde(default)]
    pub session_data: Option<Value>,
    #[serde(default)]
    pub is_autofill_enabled: bool,
    #[serde(default)]
    pub login_selector: Option<String>,
    #[serde(default)]
    pub password_selector: Option<String>,
    /// Newline-separated string or array of patterns.
    #[serde(default)]
    pub url_blocks: Option<Value>,
    #[serde(default)]
    pub blocked_links: Option<Value>,
    #[serde(default)]
    pub ublock_rules: Option<Value>,
    #[serde(default)]
    pub selected_scripts_content: Vec<String>,
    #[serde(default)]
    pub selected_element_rules_content: Vec<ElementRule>,
    #[serde(default)]
    pub custom_cookies: Vec<CookieInput>,
    #[serde(default)]
    pub custom_localstorage: BTreeMap<String, Value>,
    #[serde(default)]
    pub custom_script: Option<String>,
    #[serde(default)]
    pub custom_user_agent: Option<String>,
    #[serde(default)]
    pub extensions: Vec<ExtensionSpec>,
    #[serde(default)]
    pub app_mode: bool,
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub save_strategy: Option<SaveStrategy>,
    #[serde(default)]
    pub download_mode: Option<DownloadMode>,
    #[serde(default)]
    pub download_path: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Fully-resolved, immutable configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub urls: Vec<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<ProxyDescriptor>,
    pub stored_state: Option<Value>,
    pub autofill: bool,
    pub login_selector: String,
    pub password_selector: String,
    pub url_blocks: Vec<String>,
    pub blocked_links: Vec<String>,
    pub ublock_rules: Vec<String>,
    pub user_scripts: Vec<String>,
    pub element_rules: Vec<ElementRule>,
    pub custom_cookies: Vec<CookieInput>,
    pub custom_localstorage: BTreeMap<String, Value>,
    pub custom_script: Option<String>,
    pub custom_user_agent: Option<String>,
    pub extensions: Vec<ExtensionSpec>,
    pub app_mode: bool,
    pub debug: bool,
    pub save_strategy: SaveStrategy,
    pub download_mode: DownloadMode,
    pub download_path: Option<String>,
    pub token: Option<String>,
    pub api_base_url: String,
}

impl SessionConfig {
    /// Validate and normalize a raw launch request. Pure transform: the only
    /// failure mode is a missing target URL field.
    pub fn resolve(request: LaunchRequest) -> Result<Self> {
        let Some(raw) = request.start_url.as_deref() else {
            return Err(SessionError::InvalidConfig("start_url is required".into()));
        };
        let mut urls: Vec<String> = split_lines(raw)
            .into_iter()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .collect();
        if urls.is_empty() {
            urls.push(DEFAULT_START_PAGE.to_string());
        }

        let id = request
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());

        Ok(Self {
            id,
            urls,
            login: none_if_empty(request.login),
            password: none_if_empty(request.password),
            proxy: request.proxy_data,
            stored_state: request.session_data.map(unwrap_session_blob),
            autofill: request.is_autofill_enabled,
            login_selector: request
                .login_selector
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOGIN_SELECTOR.to_string()),
            password_selector: request
                .password_selector
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PASSWORD_SELECTOR.to_string()),
            url_blocks: normalize_list(request.url_blocks.as_ref()),
            blocked_links: normalize_list(request.blocked_links.as_ref()),
            ublock_rules: normalize_list(request.ublock_rules.as_ref()),
            user_scripts: request
                .selected_scripts_content
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
            element_rules: request.selected_element_rules_content,
            custom_cookies: request.custom_cookies,
            custom_localstorage: request.custom_localstorage,
            custom_script: none_if_empty(request.custom_script),
            custom_user_agent: none_if_empty(request.custom_user_agent),
            extensions: request.extensions,
            app_mode: request.app_mode,
            debug: request.is_debug,
            save_strategy: request.save_strategy.unwrap_or(SaveStrategy::Always),
            download_mode: request.download_mode.unwrap_or(DownloadMode::Auto),
            download_path: none_if_empty(request.download_path),
            token: none_if_empty(request.token),
            api_base_url: request.api_base_url.unwrap_or_default(),
        })
    }

    /// The first target URL. `resolve` guarantees at least one entry.
    #[must_use]
    pub fn primary_url(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }

    /// Whether the control-plane pollers should run at all.
    #[must_use]
    pub fn has_control_plane(&self) -> bool {
        self.token.is_some()
    }
}

/// Accept both `["a", "b"]` and `"a\nb"` shapes for list fields.
fn normalize_list(input: Option<&Value>) -> Vec<String> {
    match input {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => split_lines(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(_) => Vec::new(),
    }
}

fn split_lines(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Stored sessions sometimes arrive double-wrapped (`{"session_data": {...}}`)
/// or as a JSON string. Unwrap to the bare storage-state object.
fn unwrap_session_blob(value: Value) -> Value {
    let value = match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::Null),
        other => other,
    };
    match value {
        Value::Object(mut map) => match map.remove("session_data") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}
