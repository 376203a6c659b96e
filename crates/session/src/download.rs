//! Per-mode download persistence.
//!
//! `browser` mode installs nothing: the engine's own download UI takes
//! over. `auto` and `app` modes stage downloads under the session profile
//! dir (named by guid) and move completed files to their destination.
//! Every save or cancel is best-effort; an I/O failure is logged and the
//! session keeps running.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    chromiumoxide::{
        Browser,
        cdp::browser_protocol::browser::{
            DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
            SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
        },
    },
    futures::StreamExt,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use veil_common::HostShell;

use crate::{
    config::DownloadMode,
    error::{Result, SessionError},
};

/// Resolve the directory `auto` mode saves into: the configured path when
/// present, otherwise the system downloads directory.
#[must_use]
pub fn resolve_download_dir(configured: Option<&str>) -> PathBuf {
    if let Some(path) = configured {
        return PathBuf::from(path);
    }
    default_download_dir()
}

/// System default downloads directory, with a home-relative fallback for
/// stripped-down environments.
#[must_use]
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// First free path for `filename` in `dir`, appending ` (1)`, ` (2)` and
/// so on before the extension. Never picks an existing path.
#[must_use]
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (filename.to_string(), String::new()),
    };

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({counter}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Handles download events for one session.
pub struct DownloadManager {
    mode: DownloadMode,
    staging_dir: PathBuf,
    configured_dir: Option<String>,
    shell: Arc<dyn HostShell>,
    /// guid → suggested filename, filled by will-begin events.
    pending: Mutex<HashMap<String, String>>,
}

impl DownloadManager {
    #[must_use]
    pub fn new(
        mode: DownloadMode,
        staging_dir: PathBuf,
        configured_dir: Option<String>,
        shell: Arc<dyn HostShell>,
    ) -> Self {
        Self {
            mode,
            staging_dir,
            configured_dir,
            shell,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wire download handling onto the engine. In `browser` mode this is a
    /// no-op so downloads fall through to native handling.
    pub async fn install(self: &Arc<Self>, browser: &Browser) -> Result<()> {
        if self.mode == DownloadMode::Browser {
            debug!("download mode is browser, leaving downloads to the engine");
            return Ok(());
        }

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| SessionError::Download(e.to_string()))?;

        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .download_path(self.staging_dir.to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(SessionError::Protocol)?;
        browser
            .execute(params)
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let mut begins = browser.event_listener::<EventDownloadWillBegin>().await?;
        let begin_manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = begins.next().await {
                begin_manager.on_will_begin(&event).await;
            }
        });

        let mut progress = browser.event_listener::<EventDownloadProgress>().await?;
        let progress_manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = progress.next().await {
                progress_manager.on_progress(&event).await;
            }
        });

        Ok(())
    }

    async fn on_will_begin(&self, event: &EventDownloadWillBegin) {
        debug!(
            guid = %event.guid,
            filename = %event.suggested_filename,
            "download starting"
        );
        self.pending
            .lock()
            .await
            .insert(event.guid.clone(), event.suggested_filename.clone());
    }

    async fn on_progress(&self, event: &EventDownloadProgress) {
        let finished = matches!(
            event.state,
            DownloadProgressState::Completed | DownloadProgressState::Canceled
        );
        if !finished {
            return;
        }

        let Some(filename) = self.pending.lock().await.remove(&event.guid) else {
            return;
        };
        let staged = self.staging_dir.join(&event.guid);

        if matches!(event.state, DownloadProgressState::Canceled) {
            let _ = std::fs::remove_file(&staged);
            return;
        }

        if let Err(e) = self.persist(&staged, &filename).await {
            warn!(filename, error = %e, "failed to persist download");
            let _ = std::fs::remove_file(&staged);
        }
    }

    async fn persist(&self, staged: &Path, filename: &str) -> Result<()> {
        let destination = match self.mode {
            DownloadMode::Browser => return Ok(()),
            DownloadMode::Auto => Some(self.auto_destination(filename)),
            DownloadMode::App => match self.shell.prompt_save_path(filename).await {
                Ok(Some(path)) => Some(path),
                Ok(None) => {
                    info!(filename, "download cancelled by user");
                    None
                },
                Err(e) => {
                    // Shell unreachable: fall back to the auto default path.
                    warn!(filename, error = %e, "save dialog unavailable, using default dir");
                    Some(unique_path(&default_download_dir(), filename))
                },
            },
        };

        let Some(destination) = destination else {
            let _ = std::fs::remove_file(staged);
            return Ok(());
        };

        move_file(staged, &destination)?;
        info!(path = %destination.display(), "download saved");
        Ok(())
    }

    fn auto_destination(&self, filename: &str) -> PathBuf {
        let dir = resolve_download_dir(self.configured_dir.as_deref());
        if !dir.exists()
            && let Err(e) = std::fs::create_dir_all(&dir)
        {
            warn!(dir = %dir.display(), error = %e, "cannot create download dir, using default");
            let fallback = default_download_dir();
            let _ = std::fs::create_dir_all(&fallback);
            return unique_path(&fallback, filename);
        }
        unique_path(&dir, filename)
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SessionError::Download(e.to_string()))?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Rename fails across filesystems; copy + remove instead.
        Err(_) => {
            std::fs::copy(from, to).map_err(|e| SessionError::Download(e.to_string()))?;
            std::fs::remove_file(from).map_err(|e| SessionError::Download(e.to_string()))?;
            Ok(())
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn collision_naming_appends_counters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"one").unwrap();
        let second = unique_path(dir.path(), "report.pdf");
        assert_eq!(second, dir.path().join("report (1).pdf"));
        std::fs::write(&second, b"two").unwrap();
        let third = unique_path(dir.path(), "report.pdf");
        assert_eq!(third, dir.path().join("report (2).pdf"));
    }

    #[test]
    fn first_save_keeps_original_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            unique_path(dir.path(), "report.pdf"),
            dir.path().join("report.pdf")
        );
    }

    #[test]
    fn extensionless_and_dotfile_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "README"),
            dir.path().join("README (1)")
        );
        std::fs::write(dir.path().join(".env"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), ".env"), dir.path().join(".env (1)"));
    }

    #[test]
    fn configured_dir_wins_over_default() {
        assert_eq!(
            resolve_download_dir(Some("/tmp/veil-downloads")),
            PathBuf::from("/tmp/veil-downloads")
        );
        assert_eq!(resolve_download_dir(None), default_download_dir());
    }

    #[test]
    fn move_file_copies_across_targets() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("nested/b.bin");
        std::fs::write(&from, b"payload").unwrap();
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
    }
}
