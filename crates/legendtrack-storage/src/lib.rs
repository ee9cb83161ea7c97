//! Atomic file writes and the JSON export projection of a tracker snapshot.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use legendtrack_core::Snapshot;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "legendtrack-storage";

pub const TOPICS_FILE: &str = "topics.json";
pub const PROJECTS_FILE: &str = "projects.json";

/// Destination paths for the two exported collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTargets {
    pub topics: PathBuf,
    pub projects: PathBuf,
}

impl ExportTargets {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            topics: dir.join(TOPICS_FILE),
            projects: dir.join(PROJECTS_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub topics: usize,
    pub projects: usize,
    pub topics_sha256: String,
    pub projects_sha256: String,
}

impl ExportSummary {
    pub fn records(&self) -> usize {
        self.topics + self.projects
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Pretty JSON with two-space indentation and no trailing newline.
pub fn to_pretty_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).context("serializing export json")
}

fn temp_sibling(path: &Path, len: usize) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(".{name}.{}.{len}.tmp", Uuid::new_v4()))
}

/// Replace `path` with `bytes` via a temp file and rename, creating parent directories.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = temp_sibling(path, bytes.len());

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Blocking counterpart of [`write_atomic`] for callers already on a blocking thread.
pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = temp_sibling(path, bytes.len());
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

/// Write both collections of `snapshot` as pretty JSON, overwriting whatever is there.
pub async fn write_snapshot(
    snapshot: &Snapshot,
    targets: &ExportTargets,
) -> anyhow::Result<ExportSummary> {
    let span = info_span!("export_write", topics = %targets.topics.display());
    async {
        let topics_json = to_pretty_json(&snapshot.topics)?;
        let projects_json = to_pretty_json(&snapshot.projects)?;

        write_atomic(&targets.topics, &topics_json).await?;
        write_atomic(&targets.projects, &projects_json).await?;

        let summary = ExportSummary {
            topics: snapshot.topics.len(),
            projects: snapshot.projects.len(),
            topics_sha256: sha256_hex(&topics_json),
            projects_sha256: sha256_hex(&projects_json),
        };
        debug!(
            topics = summary.topics,
            projects = summary.projects,
            topics_sha256 = %summary.topics_sha256,
            "export files written"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

/// Read an exported artifact back as a JSON array.
pub async fn read_export(path: &Path) -> anyhow::Result<Vec<Value>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

async fn modified_at(path: &Path) -> anyhow::Result<SystemTime> {
    let meta = fs::metadata(path)
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?;
    meta.modified()
        .with_context(|| format!("reading modification time of {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    Stale,
    Fresh,
}

impl Freshness {
    pub fn needs_export(self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

/// Compare the workbook's modification time against both exported artifacts.
pub async fn export_freshness(
    workbook: &Path,
    targets: &ExportTargets,
) -> anyhow::Result<Freshness> {
    for target in [&targets.topics, &targets.projects] {
        if !fs::try_exists(target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
        {
            return Ok(Freshness::Missing);
        }
    }
    let workbook_time = modified_at(workbook).await?;
    let topics_time = modified_at(&targets.topics).await?;
    let projects_time = modified_at(&targets.projects).await?;
    if workbook_time > topics_time || workbook_time > projects_time {
        Ok(Freshness::Stale)
    } else {
        Ok(Freshness::Fresh)
    }
}
