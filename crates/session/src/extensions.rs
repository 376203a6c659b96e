//! Extension package provisioning.
//!
//! Each requested extension is materialized as an unpacked directory the
//! engine can load. Provisioning is idempotent: a directory that already
//! holds a manifest is reused without touching the network. One failed
//! extension never aborts the launch; it is logged and skipped.

use std::{
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use {
    tracing::{debug, info, warn},
    zip::ZipArchive,
};

use crate::{
    config::ExtensionSpec,
    error::{Result, SessionError},
};

/// Root directory that provisioned extensions live under.
#[must_use]
pub fn extensions_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("veil")
        .join("extensions")
}

/// Collapse an extension name into a safe directory leaf.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "extension".to_string()
    } else {
        cleaned
    }
}

/// Provision every requested extension under `root`, returning the manifest
/// directories that are ready to load. Failures are isolated per extension.
pub async fn provision_all(
    client: &reqwest::Client,
    root: &Path,
    specs: &[ExtensionSpec],
) -> Vec<PathBuf> {
    let mut ready = Vec::new();
    for spec in specs {
        match provision(client, root, spec).await {
            Ok(dir) => {
                info!(name = %spec.name, dir = %dir.display(), "extension ready");
                ready.push(dir);
            },
            Err(e) => warn!(name = %spec.name, error = %e, "skipping extension"),
        }
    }
    ready
}

async fn provision(
    client: &reqwest::Client,
    root: &Path,
    spec: &ExtensionSpec,
) -> Result<PathBuf> {
    let dir = root.join(sanitize_name(&spec.name));

    if let Some(manifest_dir) = locate_manifest_dir(&dir) {
        debug!(name = %spec.name, "reusing provisioned extension");
        return Ok(manifest_dir);
    }

    let bytes = download(client, spec).await?;
    std::fs::create_dir_all(&dir).map_err(|e| SessionError::Provisioning {
        name: spec.name.clone(),
        reason: e.to_string(),
    })?;
    extract_archive(&bytes, &dir).map_err(|e| SessionError::Provisioning {
        name: spec.name.clone(),
        reason: e.to_string(),
    })?;

    locate_manifest_dir(&dir).ok_or_else(|| SessionError::Provisioning {
        name: spec.name.clone(),
        reason: "archive contains no manifest.json".into(),
    })
}

async fn download(client: &reqwest::Client, spec: &ExtensionSpec) -> Result<Vec<u8>> {
    let response = client
        .get(&spec.url)
        .send()
        .await
        .map_err(|e| SessionError::Provisioning {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(SessionError::Provisioning {
            name: spec.name.clone(),
            reason: format!("download returned {}", response.status()),
        });
    }
    let bytes = response.bytes().await.map_err(|e| SessionError::Provisioning {
        name: spec.name.clone(),
        reason: e.to_string(),
    })?;
    Ok(bytes.to_vec())
}

/// Unpack a zip archive into `dest`. Entries that would escape the
/// destination are dropped.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> std::io::Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        std::fs::write(&target, contents)?;
    }
    Ok(())
}

/// Find the directory holding `manifest.json`: the root itself or, for
/// archives with a single top-level folder, that folder.
#[must_use]
pub fn locate_manifest_dir(dir: &Path) -> Option<PathBuf> {
    if dir.join("manifest.json").is_file() {
        return Some(dir.to_path_buf());
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("manifest.json").is_file() {
            return Some(path);
        }
    }
    None
}
