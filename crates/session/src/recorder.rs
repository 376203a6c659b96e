//! Opportunistic storage-state snapshots.
//!
//! The recorder keeps the last known-good capture of cookies + per-origin
//! localStorage. A capture that fails or comes back empty never replaces a
//! previous good snapshot, so the caller always gets the best state seen
//! during the session.

use std::sync::Mutex;

use {
    chromiumoxide::Browser,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    config::SaveStrategy,
    error::{Result, SessionError},
};

/// One origin's localStorage entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    #[serde(rename = "localStorage", default)]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

/// Serializable capture of cookies and per-origin storage, sufficient to
/// restore a session. Cookies stay opaque JSON so engine-side fields
/// survive a round trip untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStateSnapshot {
    #[serde(default)]
    pub cookies: Vec<Value>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

impl StorageStateSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }
}

/// Holds the last-good snapshot for one session.
pub struct SessionRecorder {
    strategy: SaveStrategy,
    last_good: Mutex<Option<StorageStateSnapshot>>,
}

impl SessionRecorder {
    /// `seed` is the storage state the session was launched with; it counts
    /// as the initial last-good snapshot when non-empty.
    #[must_use]
    pub fn new(strategy: SaveStrategy, seed: Option<&Value>) -> Self {
        let seed = seed
            .and_then(|v| serde_json::from_value::<StorageStateSnapshot>(v.clone()).ok())
            .filter(|s| !s.is_empty());
        Self {
            strategy,
            last_good: Mutex::new(seed),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> SaveStrategy {
        self.strategy
    }

    /// Offer a fresh capture. Returns whether it was retained.
    pub fn offer(&self, snapshot: StorageStateSnapshot) -> bool {
        if self.strategy == SaveStrategy::Never || snapshot.is_empty() {
            return false;
        }
        if let Ok(mut guard) = self.last_good.lock() {
            *guard = Some(snapshot);
            return true;
        }
        false
    }

    /// The retained snapshot, if any. `never` strategy always yields `None`.
    #[must_use]
    pub fn last_good(&self) -> Option<StorageStateSnapshot> {
        if self.strategy == SaveStrategy::Never {
            return None;
        }
        self.last_good.lock().ok().and_then(|g| g.clone())
    }

    /// Read the engine's current storage state and retain it if non-empty.
    /// Best-effort: a failed read leaves the previous snapshot in place.
    pub async fn capture(&self, browser: &Browser, reason: &str) {
        if self.strategy == SaveStrategy::Never {
            return;
        }
        match capture_storage_state(browser).await {
            Ok(snapshot) => {
                let cookies = snapshot.cookies.len();
                let origins = snapshot.origins.len();
                if self.offer(snapshot) {
                    debug!(reason, cookies, origins, "captured session state");
                } else {
                    debug!(reason, "capture was empty, keeping previous snapshot");
                }
            },
            Err(e) => {
                warn!(reason, error = %e, "session capture failed");
            },
        }
    }
}

/// Init script that re-seeds localStorage for origins present in a restored
/// snapshot. Runs on every document; only the matching origin's entries are
/// applied, and existing keys are left alone.
#[must_use]
pub fn restore_script(snapshot: &StorageStateSnapshot) -> Option<String> {
    if snapshot.origins.is_empty() {
        return None;
    }
    let origins = serde_json::to_string(&snapshot.origins).ok()?;
    Some(format!(
        r#"(() => {{
  const origins = {origins};
  const current = window.location.origin;
  for (const entry of origins) {{
    if (entry.origin !== current) continue;
    for (const item of entry.localStorage || []) {{
      try {{
        if (localStorage.getItem(item.name) === null) localStorage.setItem(item.name, item.value);
      }} catch (e) {{}}
    }}
  }}
}})();
"#
    ))
}

const READ_LOCAL_STORAGE_JS: &str = r#"
(() => {
  const out = [];
  try {
    for (let i = 0; i < localStorage.length; i++) {
      const name = localStorage.key(i);
      out.push({ name, value: localStorage.getItem(name) });
    }
  } catch (e) {}
  return out;
})()
"#;

/// Read all cookies plus every open page's localStorage.
pub async fn capture_storage_state(browser: &Browser) -> Result<StorageStateSnapshot> {
    use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;

    let response = browser
        .execute(GetCookiesParams::default())
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    let cookies = response
        .result
        .cookies
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();

    let mut origins: Vec<OriginStorage> = Vec::new();
    let pages = browser.pages().await.unwrap_or_default();
    for page in pages {
        let Ok(Some(url)) = page.url().await else {
            continue;
        };
        let Ok(parsed) = url::Url::parse(&url) else {
            continue;
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            continue;
        }
        let origin = parsed.origin().ascii_serialization();
        if origins.iter().any(|o| o.origin == origin) {
            continue;
        }
        let entries: Vec<StorageEntry> = match page.evaluate(READ_LOCAL_STORAGE_JS).await {
            Ok(value) => value.into_value().unwrap_or_default(),
            Err(_) => continue,
        };
        if !entries.is_empty() {
            origins.push(OriginStorage {
                origin,
                local_storage: entries,
            });
        }
    }

    Ok(StorageStateSnapshot { cookies, origins })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    fn snapshot_with_cookie() -> StorageStateSnapshot {
        StorageStateSnapshot {
            cookies: vec![json!({"name": "sid", "value": "1"})],
            origins: Vec::new(),
        }
    }

    #[test]
    fn empty_capture_never_clobbers_last_good() {
        let recorder = SessionRecorder::new(SaveStrategy::Always, None);
        assert!(recorder.offer(snapshot_with_cookie()));
        assert!(!recorder.offer(StorageStateSnapshot::default()));
        assert_eq!(recorder.last_good().unwrap().cookies.len(), 1);
    }

    #[test]
    fn repeated_empty_captures_are_idempotent() {
        let recorder = SessionRecorder::new(SaveStrategy::Always, None);
        recorder.offer(snapshot_with_cookie());
        for _ in 0..3 {
            recorder.offer(StorageStateSnapshot::default());
        }
        assert!(recorder.last_good().is_some());
    }

    #[test]
    fn never_strategy_is_a_noop() {
        let recorder = SessionRecorder::new(SaveStrategy::Never, None);
        assert!(!recorder.offer(snapshot_with_cookie()));
        assert!(recorder.last_good().is_none());
    }

    #[test]
    fn seed_counts_as_initial_snapshot() {
        let seed = json!({
            "cookies": [{"name": "sid", "value": "1"}],
            "origins": [{"origin": "https://a.example", "localStorage": [{"name": "k", "value": "v"}]}]
        });
        let recorder = SessionRecorder::new(SaveStrategy::Always, Some(&seed));
        let snapshot = recorder.last_good().unwrap();
        assert_eq!(snapshot.cookies.len(), 1);
        assert_eq!(snapshot.origins[0].local_storage[0].name, "k");
    }

    #[test]
    fn empty_seed_is_ignored() {
        let seed = json!({"cookies": [], "origins": []});
        let recorder = SessionRecorder::new(SaveStrategy::Always, Some(&seed));
        assert!(recorder.last_good().is_none());
    }

    #[test]
    fn restore_script_scopes_entries_to_their_origin() {
        let snapshot = StorageStateSnapshot {
            cookies: Vec::new(),
            origins: vec![OriginStorage {
                origin: "https://a.example".into(),
                local_storage: vec![StorageEntry {
                    name: "token".into(),
                    value: "abc".into(),
                }],
            }],
        };
        let script = restore_script(&snapshot).unwrap();
        assert!(script.contains("https://a.example"));
        assert!(script.contains("token"));
        assert!(script.contains("window.location.origin"));

        assert!(restore_script(&StorageStateSnapshot::default()).is_none());
    }

    #[test]
    fn newer_non_empty_capture_replaces() {
        let recorder = SessionRecorder::new(SaveStrategy::Always, None);
        recorder.offer(snapshot_with_cookie());
        let richer = StorageStateSnapshot {
            cookies: vec![json!({"name": "sid"}), json!({"name": "theme"})],
            origins: Vec::new(),
        };
        recorder.offer(richer);
        assert_eq!(recorder.last_good().unwrap().cookies.len(), 2);
    }
}
