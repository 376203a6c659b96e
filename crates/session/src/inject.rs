//! Protective/automation script bundle installed on every page and frame.
//!
//! One composite init script carries field masking, WebRTC neutralization,
//! fingerprint spoofing, inspector-key suppression, bounded autofill,
//! element rules, the user's custom script + localStorage seed, and
//! cosmetic hiding rules. It is registered to run before any page script so
//! the overrides are in place before the originals can be observed.
//! Ordering inside the bundle matters: CSS first, then JS enforcement, then
//! constructor overrides.

use serde_json::json;

use crate::config::SessionConfig;

/// Canonical fingerprint profile presented to every page.
pub const SPOOF_PLATFORM: &str = "Win32";
pub const SPOOF_VENDOR: &str = "Google Inc.";
pub const SPOOF_HARDWARE_CONCURRENCY: u32 = 8;
pub const SPOOF_DEVICE_MEMORY: u32 = 8;
pub const SPOOF_MAX_TOUCH_POINTS: u32 = 0;

/// Autofill gives up after this many attempts so a page without a login
/// form never accumulates timers.
const AUTOFILL_MAX_ATTEMPTS: u32 = 30;

/// One cosmetic hiding rule, uBlock-style: `domain##selector` scopes the
/// selector to a domain, a bare selector applies everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmeticRule {
    pub domain: String,
    pub selector: String,
}

/// Parse the compact cosmetic rule syntax. Comment lines (`!`) and blanks
/// are dropped.
#[must_use]
pub fn parse_cosmetic_rules(rules: &[String]) -> Vec<CosmeticRule> {
    rules
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && !r.starts_with('!'))
        .map(|r| match r.split_once("##") {
            Some((domain, selector)) => CosmeticRule {
                domain: domain.trim().to_string(),
                selector: selector.trim().to_string(),
            },
            None => CosmeticRule {
                domain: String::new(),
                selector: r.to_string(),
            },
        })
        .filter(|r| !r.selector.is_empty())
        .collect()
}

/// Build the composite init script for a session.
#[must_use]
pub fn build_bundle(config: &SessionConfig) -> String {
    let cosmetic = parse_cosmetic_rules(&config.ublock_rules);
    let params = json!({
        "rules": cosmetic.iter().map(|r| json!({
            "domain": r.domain,
            "selector": r.selector,
        })).collect::<Vec<_>>(),
        "user": config.login,
        "pass": config.password,
        "selUser": config.login_selector,
        "selPass": config.password_selector,
        "isAutofill": config.autofill && config.login.is_some() && config.password.is_some(),
        "isDebug": config.debug,
        "maxAttempts": AUTOFILL_MAX_ATTEMPTS,
        "localStorageSeed": config.custom_localstorage,
        "elementRules": config.element_rules,
    });

    let mut bundle = format!(
        "(() => {{\nconst params = {params};\n\
         const {{ rules, user, pass, selUser, selPass, isAutofill, isDebug, maxAttempts, localStorageSeed, elementRules }} = params;\n"
    );

    bundle.push_str(MASKING_CSS_JS);
    bundle.push_str(ENFORCEMENT_JS);
    bundle.push_str(WEBRTC_JS);
    bundle.push_str(navigator_spoof_js().as_str());
    bundle.push_str(KEY_SUPPRESS_JS);
    bundle.push_str(AUTOFILL_JS);
    bundle.push_str(ELEMENT_RULES_JS);
    bundle.push_str(LOCALSTORAGE_SEED_JS);
    if let Some(script) = &config.custom_script {
        bundle.push_str(&wrap_user_script(script, 0));
    }
    for (i, script) in config.user_scripts.iter().enumerate() {
        bundle.push_str(&wrap_user_script(script, i + 1));
    }
    bundle.push_str(COSMETIC_JS);
    bundle.push_str("})();\n");
    bundle
}

/// Guarded wrapper so one broken user script cannot abort the bundle.
fn wrap_user_script(script: &str, index: usize) -> String {
    format!(
        "try {{\n{script}\n}} catch (e) {{ console.error('[veil-script #{index}]', e); }}\n"
    )
}

/// Navigator property overrides as a standalone snippet, shared between the
/// page bundle and the lower-level protocol injection.
#[must_use]
pub fn navigator_spoof_js() -> String {
    format!(
        r#"
try {{
  const spoof = (obj, prop, value) => {{
    try {{
      Object.defineProperty(obj, prop, {{ get: () => value, set: () => {{}}, configurable: false, enumerable: true }});
    }} catch (e) {{}}
  }};
  spoof(navigator, 'platform', '{SPOOF_PLATFORM}');
  spoof(navigator, 'vendor', '{SPOOF_VENDOR}');
  spoof(navigator, 'hardwareConcurrency', {SPOOF_HARDWARE_CONCURRENCY});
  spoof(navigator, 'deviceMemory', {SPOOF_DEVICE_MEMORY});
  spoof(navigator, 'maxTouchPoints', {SPOOF_MAX_TOUCH_POINTS});
}} catch (e) {{}}
"#
    )
}

/// Second autofill variant delivered over the protocol with broader
/// heuristics, for pages where the bundle has not run at document-ready.
#[must_use]
pub fn cdp_autofill_script(config: &SessionConfig) -> Option<String> {
    if !config.autofill {
        return None;
    }
    let (Some(login), Some(password)) = (&config.login, &config.password) else {
        return None;
    };
    let credentials = json!({
        "email": login,
        "password": password,
        "selEmail": broad_login_selector(config),
        "selPass": config.password_selector,
        "maxAttempts": AUTOFILL_MAX_ATTEMPTS,
    });
    Some(format!(
        "(() => {{\nconst credentials = {credentials};\n{CDP_AUTOFILL_JS}}})();\n"
    ))
}

fn broad_login_selector(config: &SessionConfig) -> String {
    if config.login_selector.contains("identifier") {
        return config.login_selector.clone();
    }
    format!(
        "{}, input[type=\"text\"][name*=\"user\" i], input[type=\"text\"][name*=\"login\" i], \
         input[name*=\"identifier\" i], input[id*=\"user\" i], input[id*=\"email\" i]",
        config.login_selector
    )
}

const MASKING_CSS_JS: &str = r#"
try {
  const INJECT_ID = 'veil-field-mask';
  if (!document.getElementById(INJECT_ID)) {
    const style = document.createElement('style');
    style.id = INJECT_ID;
    style.innerHTML = `
      input[type="password"],
      input[data-veil-protected="true"],
      input[name*="pass" i] {
        filter: blur(5px) !important;
        -webkit-text-security: disc !important;
        color: transparent !important;
      }
      input[type="email"],
      input[data-veil-email-protected="true"],
      input[name*="email" i],
      input[name*="mail" i],
      input[name*="user" i]:not([type="password"]),
      input[id*="email" i],
      input[autocomplete="email"],
      input[autocomplete="username"] {
        filter: blur(5px) !important;
        color: transparent !important;
        text-shadow: 0 0 8px rgba(255,255,255,0.5) !important;
      }
      input::-ms-reveal, input::-ms-clear { display: none !important; }
    `;
    (document.head || document.documentElement).appendChild(style);
  }
} catch (e) {}
"#;

const ENFORCEMENT_JS: &str = r#"
if (!isDebug) {
  const applyMarker = (root = document) => {
    const inputs = root.querySelectorAll ? root.querySelectorAll('input') : [];
    inputs.forEach(el => {
      try {
        const name = (el.name || '').toLowerCase();
        const id = (el.id || '').toLowerCase();
        const type = el.type || '';
        const autocomplete = (el.getAttribute('autocomplete') || '').toLowerCase();
        const isPass = type === 'password' || name.includes('pass') || id.includes('pass');
        if (isPass) {
          el.setAttribute('data-veil-protected', 'true');
          el.style.setProperty('filter', 'blur(5px)', 'important');
          if (type !== 'password') el.type = 'password';
        }
        const isEmail = type === 'email' ||
          name.includes('email') || name.includes('mail') || name.includes('user') ||
          id.includes('email') || id.includes('mail') ||
          autocomplete === 'email' || autocomplete === 'username';
        if (isEmail && type !== 'password') {
          el.setAttribute('data-veil-email-protected', 'true');
          el.style.setProperty('filter', 'blur(5px)', 'important');
          el.style.setProperty('color', 'transparent', 'important');
        }
      } catch (e) {}
    });
  };
  applyMarker();
  new MutationObserver(() => applyMarker()).observe(document.documentElement, { childList: true, subtree: true });
  setInterval(() => applyMarker(), 1000);
}
"#;

const WEBRTC_JS: &str = r#"
try {
  const inertPeerConnection = function() {
    return {
      createOffer: () => Promise.reject(new Error('WebRTC disabled')),
      createAnswer: () => Promise.reject(new Error('WebRTC disabled')),
      setLocalDescription: () => Promise.resolve(),
      setRemoteDescription: () => Promise.resolve(),
      addIceCandidate: () => Promise.resolve(),
      getConfiguration: () => ({}),
      close: () => {},
      addEventListener: () => {},
      removeEventListener: () => {},
      dispatchEvent: () => false,
      createDataChannel: () => ({ close: () => {} }),
      onicecandidate: null,
      localDescription: null,
      remoteDescription: null,
      signalingState: 'closed',
      iceConnectionState: 'closed',
      connectionState: 'closed',
      iceGatheringState: 'complete'
    };
  };
  const lock = (name, value) => {
    try { Object.defineProperty(window, name, { value, writable: false, configurable: false }); } catch (e) {}
  };
  lock('RTCPeerConnection', inertPeerConnection);
  lock('webkitRTCPeerConnection', inertPeerConnection);
  lock('mozRTCPeerConnection', inertPeerConnection);
  lock('RTCDataChannel', function() { return {}; });
  lock('RTCSessionDescription', function() { return {}; });
  lock('RTCIceCandidate', function() { return {}; });
  if (navigator.mediaDevices) {
    const deny = (name, impl) => {
      try { Object.defineProperty(navigator.mediaDevices, name, { value: impl, writable: false, configurable: false }); } catch (e) {}
    };
    deny('getUserMedia', () => Promise.reject(new Error('Media access denied')));
    deny('enumerateDevices', () => Promise.resolve([]));
    deny('getDisplayMedia', () => Promise.reject(new Error('Screen capture denied')));
  }
  if (navigator.getUserMedia) {
    navigator.getUserMedia = function() { arguments[arguments.length - 1](new Error('Media access denied')); };
  }
} catch (e) {}
"#;

const KEY_SUPPRESS_JS: &str = r#"
if (!isDebug) {
  window.addEventListener('keydown', (e) => {
    const isInspect = (e.key === 'F12') ||
      (e.ctrlKey && e.shiftKey && (e.key === 'I' || e.key === 'J' || e.key === 'C')) ||
      (e.ctrlKey && (e.key === 'u' || e.key === 'U'));
    if (isInspect) { e.preventDefault(); e.stopPropagation(); }
  }, true);
}
"#;

const AUTOFILL_JS: &str = r#"
if (isAutofill && user && pass) {
  let filled = false;
  let attempts = 0;
  const setNative = (el, value) => {
    const setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value').set;
    setter.call(el, value);
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
  };
  const timer = setInterval(() => {
    attempts += 1;
    if (filled || attempts > maxAttempts) { clearInterval(timer); return; }
    const elUser = document.querySelector(selUser);
    const elPass = document.querySelector(selPass);
    if (elUser && elUser.value !== user) setNative(elUser, user);
    if (elPass && elPass.value === '') {
      setNative(elPass, pass);
      setTimeout(() => {
        elPass.dispatchEvent(new KeyboardEvent('keydown', { key: 'Enter', keyCode: 13, bubbles: true }));
      }, 500);
      filled = true;
      clearInterval(timer);
    }
  }, 2000);
}
"#;

const ELEMENT_RULES_JS: &str = r#"
if (elementRules.length) {
  const matchUrl = (pattern, url) => {
    if (pattern === '*') return true;
    const p = pattern.toLowerCase();
    const u = url.toLowerCase();
    if (p.startsWith('*') && p.endsWith('*')) return u.includes(p.slice(1, -1));
    if (p.startsWith('*')) return u.endsWith(p.slice(1));
    if (p.endsWith('*')) return u.startsWith(p.slice(0, -1));
    return u.includes(p);
  };
  const applyRules = () => {
    const currentUrl = window.location.href;
    elementRules.forEach(rule => {
      if (!matchUrl(rule.url_pattern, currentUrl)) return;
      try {
        document.querySelectorAll(rule.element_selector).forEach(el => {
          if (rule.action === 'remove') el.remove();
          else el.style.cssText = 'display: none !important; visibility: hidden !important;';
        });
      } catch (e) {}
    });
  };
  if (document.readyState === 'loading') document.addEventListener('DOMContentLoaded', applyRules);
  else applyRules();
  new MutationObserver(applyRules).observe(document, { childList: true, subtree: true });
  // Fallback for pages that re-render removed elements outside observed mutations.
  let sweeps = 0;
  const sweep = setInterval(() => { applyRules(); if (++sweeps >= 120) clearInterval(sweep); }, 1000);
}
"#;

const LOCALSTORAGE_SEED_JS: &str = r#"
for (const [key, value] of Object.entries(localStorageSeed || {})) {
  try {
    localStorage.setItem(key, typeof value === 'string' ? value : JSON.stringify(value));
  } catch (e) {}
}
"#;

const COSMETIC_JS: &str = r#"
if (rules.length && !document.getElementById('veil-cosmetic-styles')) {
  const currentHost = window.location.hostname;
  const active = rules.filter(r => !r.domain || currentHost.includes(r.domain)).map(r => r.selector);
  if (active.length) {
    const style = document.createElement('style');
    style.id = 'veil-cosmetic-styles';
    style.innerHTML = `${active.join(', ')} { display: none !important; }`;
    (document.head || document.documentElement).appendChild(style);
  }
}
"#;

const CDP_AUTOFILL_JS: &str = r#"
let filled = false;
let attempts = 0;
function simulateTyping(element, value) {
  element.focus();
  const setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value').set;
  setter.call(element, value);
  element.dispatchEvent(new Event('focus', { bubbles: true }));
  element.dispatchEvent(new Event('input', { bubbles: true, composed: true }));
  element.dispatchEvent(new Event('change', { bubbles: true }));
  element.dispatchEvent(new KeyboardEvent('keydown', { bubbles: true }));
  element.dispatchEvent(new KeyboardEvent('keyup', { bubbles: true }));
}
function tryAutofill() {
  if (filled || attempts >= credentials.maxAttempts) return;
  attempts += 1;
  const emailField = document.querySelector(credentials.selEmail);
  const passField = document.querySelector(credentials.selPass);
  if (emailField && !emailField.value && credentials.email) simulateTyping(emailField, credentials.email);
  if (passField && !passField.value && credentials.password) {
    simulateTyping(passField, credentials.password);
    filled = true;
  }
}
if (document.readyState === 'loading') {
  document.addEventListener('DOMContentLoaded', () => setTimeout(tryAutofill, 500));
} else {
  setTimeout(tryAutofill, 500);
}
const observer = new MutationObserver(() => { if (!filled) setTimeout(tryAutofill, 300); });
observer.observe(document.documentElement, { childList: true, subtree: true });
const interval = setInterval(() => {
  if (filled || attempts >= credentials.maxAttempts) {
    clearInterval(interval);
    observer.disconnect();
  } else {
    tryAutofill();
  }
}, 1000);
setTimeout(() => { clearInterval(interval); observer.disconnect(); }, 30000);
"#;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::config::{LaunchRequest, SessionConfig},
    };

    fn config(mutate: impl FnOnce(&mut LaunchRequest)) -> SessionConfig {
        let mut request = LaunchRequest {
            start_url: Some("https://example.com".into()),
            ..Default::default()
        };
        mutate(&mut request);
        SessionConfig::resolve(request).unwrap()
    }

    #[test]
    fn cosmetic_rules_parse_domain_and_bare_forms() {
        let rules = parse_cosmetic_rules(&[
            "example.com##.banner".into(),
            ".ad-slot".into(),
            "! a comment".into(),
            "   ".into(),
        ]);
        assert_eq!(
            rules,
            vec![
                CosmeticRule {
                    domain: "example.com".into(),
                    selector: ".banner".into()
                },
                CosmeticRule {
                    domain: String::new(),
                    selector: ".ad-slot".into()
                },
            ]
        );
    }

    #[test]
    fn bundle_masks_fields_before_enforcement() {
        let bundle = build_bundle(&config(|_| {}));
        let css_at = bundle.find("veil-field-mask").unwrap();
        let enforce_at = bundle.find("applyMarker").unwrap();
        let webrtc_at = bundle.find("RTCPeerConnection").unwrap();
        assert!(css_at < enforce_at);
        assert!(enforce_at < webrtc_at);
    }

    #[test]
    fn bundle_always_neutralizes_webrtc_and_spoofs_navigator() {
        let bundle = build_bundle(&config(|r| r.is_debug = true));
        assert!(bundle.contains("WebRTC disabled"));
        assert!(bundle.contains("hardwareConcurrency"));
        assert!(bundle.contains(SPOOF_PLATFORM));
    }

    #[test]
    fn autofill_requires_flag_and_both_credentials() {
        let without = build_bundle(&config(|r| {
            r.is_autofill_enabled = true;
            r.login = Some("user@example.com".into());
        }));
        assert!(without.contains(r#""isAutofill":false"#));

        let with = build_bundle(&config(|r| {
            r.is_autofill_enabled = true;
            r.login = Some("user@example.com".into());
            r.password = Some("hunter2".into());
        }));
        assert!(with.contains(r#""isAutofill":true"#));
    }

    #[test]
    fn custom_script_is_wrapped_in_guard() {
        let bundle = build_bundle(&config(|r| {
            r.custom_script = Some("document.title = 'x';".into());
        }));
        assert!(bundle.contains("document.title = 'x';"));
        assert!(bundle.contains("[veil-script #0]"));
    }

    #[test]
    fn cdp_autofill_variant_is_gated_and_broadened() {
        assert!(cdp_autofill_script(&config(|_| {})).is_none());
        let script = cdp_autofill_script(&config(|r| {
            r.is_autofill_enabled = true;
            r.login = Some("user@example.com".into());
            r.password = Some("hunter2".into());
        }))
        .unwrap();
        assert!(script.contains("identifier"));
        assert!(script.contains("maxAttempts"));
    }

    #[test]
    fn localstorage_seed_is_embedded() {
        let bundle = build_bundle(&config(|r| {
            r.custom_localstorage
                .insert("feature".into(), serde_json::json!("on"));
        }));
        assert!(bundle.contains(r#""feature":"on""#));
        assert!(bundle.contains("localStorage.setItem"));
    }
}
