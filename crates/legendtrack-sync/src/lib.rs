//! Keeps the JSON projection in step with the tracker workbook: configuration, exporters,
//! the coalescing export coordinator, change sources and reader notifications.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use legendtrack_storage::{export_freshness, write_snapshot, ExportSummary, ExportTargets, Freshness};
use legendtrack_workbook::{load_snapshot, WorkbookError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "legendtrack-sync";

pub const DEFAULT_TRACKER_PATH: &str = "sample-data/LegendTrack_Cpp_Tracker.sample.xlsx";
pub const DEFAULT_DATA_DIR: &str = "public/data";
pub const DEFAULT_PORT: u16 = 4179;
pub const DEFAULT_CONFIG_FILE: &str = "legendtrack.yaml";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("export command `{command}` failed with {status}")]
    ExportFailed { command: String, status: String },
    #[error(transparent)]
    Workbook(#[from] WorkbookError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    #[default]
    Auto,
    Notify,
    Poll,
}

impl FromStr for WatchMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "notify" => Ok(WatchMode::Notify),
            "poll" => Ok(WatchMode::Poll),
            other => Err(SyncError::Config(format!(
                "unknown watch mode `{other}` (expected auto, notify or poll)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub tracker_path: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
    pub watch_mode: WatchMode,
    pub poll_interval: Duration,
    pub notify_debounce: Duration,
    /// Program and arguments of an external export step; `None` exports in-process.
    pub export_command: Option<Vec<String>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tracker_path: PathBuf::from(DEFAULT_TRACKER_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            port: DEFAULT_PORT,
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(2000),
            notify_debounce: Duration::from_millis(250),
            export_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    tracker_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    port: Option<u16>,
    watch_mode: Option<WatchMode>,
    poll_interval_ms: Option<u64>,
    notify_debounce_ms: Option<u64>,
    export_command: Option<String>,
}

impl SyncConfig {
    /// Defaults, then `legendtrack.yaml` (or `LEGENDTRACK_CONFIG`), then the environment
    /// after `.env.local` and `.env` have been loaded.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_env_with_file(None)
    }

    /// Like [`SyncConfig::from_env`], with an explicit config file taking precedence.
    pub fn from_env_with_file(file: Option<&Path>) -> Result<Self, SyncError> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::dotenv();

        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LEGENDTRACK_CONFIG").map(PathBuf::from).ok())
            .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()));
        Self::load(file.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn load(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let mut config = Self::default();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed: ConfigFile = serde_yaml::from_str(&text)
                .map_err(|err| SyncError::Config(format!("{}: {err}", path.display())))?;
            config.apply_file(parsed)?;
        }

        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = env("TRACKER_PATH") {
            config.tracker_path = PathBuf::from(v);
        }
        if let Some(v) = env("LEGENDTRACK_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("API_PORT") {
            config.port = parse_number("API_PORT", &v)?;
        }
        if let Some(v) = env("LEGENDTRACK_WATCH_MODE") {
            config.watch_mode = v.parse()?;
        }
        if let Some(v) = env("LEGENDTRACK_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_number("LEGENDTRACK_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = env("LEGENDTRACK_NOTIFY_DEBOUNCE_MS") {
            config.notify_debounce =
                Duration::from_millis(parse_number("LEGENDTRACK_NOTIFY_DEBOUNCE_MS", &v)?);
        }
        if let Some(v) = env("LEGENDTRACK_EXPORT_CMD") {
            config.export_command = Some(split_command(&v)?);
        }
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) -> Result<(), SyncError> {
        if let Some(v) = file.tracker_path {
            self.tracker_path = v;
        }
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.watch_mode {
            self.watch_mode = v;
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.notify_debounce_ms {
            self.notify_debounce = Duration::from_millis(v);
        }
        if let Some(v) = file.export_command {
            self.export_command = Some(split_command(&v)?);
        }
        Ok(())
    }

    pub fn export_targets(&self) -> ExportTargets {
        ExportTargets::in_dir(&self.data_dir)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, SyncError> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{key} must be a number, got `{value}`")))
}

fn split_command(raw: &str) -> Result<Vec<String>, SyncError> {
    match shlex::split(raw) {
        Some(parts) if !parts.is_empty() => Ok(parts),
        _ => Err(SyncError::Config(format!("cannot parse export command `{raw}`"))),
    }
}

// Exporters

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Written(ExportSummary),
    /// An external command ran successfully; its output is opaque.
    External,
}

#[async_trait]
pub trait Exporter: Send + Sync {
    fn describe(&self) -> String;

    async fn export(&self) -> Result<ExportOutcome, SyncError>;
}

/// Snapshot Builder + Export Writer in the current process.
#[derive(Debug, Clone)]
pub struct WorkbookExporter {
    tracker_path: PathBuf,
    targets: ExportTargets,
}

impl WorkbookExporter {
    pub fn new(tracker_path: impl Into<PathBuf>, targets: ExportTargets) -> Self {
        Self {
            tracker_path: tracker_path.into(),
            targets,
        }
    }
}

#[async_trait]
impl Exporter for WorkbookExporter {
    fn describe(&self) -> String {
        format!("workbook {}", self.tracker_path.display())
    }

    async fn export(&self) -> Result<ExportOutcome, SyncError> {
        let path = self.tracker_path.clone();
        let snapshot = tokio::task::spawn_blocking(move || load_snapshot(&path))
            .await
            .context("snapshot task panicked")??;
        let summary = write_snapshot(&snapshot, &self.targets).await?;
        Ok(ExportOutcome::Written(summary))
    }
}

/// Runs an external export command; a non-zero exit is reported as `ExportFailed`.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
}

impl CommandExporter {
    pub fn new(command: &[String]) -> Result<Self, SyncError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SyncError::Config("export command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Exporter for CommandExporter {
    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn export(&self) -> Result<ExportOutcome, SyncError> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .with_context(|| format!("spawning export command `{}`", self.describe()))?;
        if status.success() {
            Ok(ExportOutcome::External)
        } else {
            Err(SyncError::ExportFailed {
                command: self.describe(),
                status: status.to_string(),
            })
        }
    }
}

pub fn exporter_for(config: &SyncConfig) -> Result<Arc<dyn Exporter>, SyncError> {
    Ok(match &config.export_command {
        Some(command) => Arc::new(CommandExporter::new(command)?),
        None => Arc::new(WorkbookExporter::new(
            config.tracker_path.clone(),
            config.export_targets(),
        )),
    })
}

// Notifications

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    TopicsUpdated,
}

impl SyncEvent {
    pub fn name(self) -> &'static str {
        match self {
            SyncEvent::TopicsUpdated => "topics-updated",
        }
    }
}

/// Fans change signals out to every subscribed reader, collapsing bursts that arrive
/// within the debounce window into a single event.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    signals: mpsc::UnboundedSender<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChangeNotifier {
    /// Must be called inside a Tokio runtime.
    pub fn new(debounce: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        let (signals, mut rx) = mpsc::unbounded_channel::<()>();
        let fanout = events.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                let receivers = fanout.send(SyncEvent::TopicsUpdated).unwrap_or(0);
                debug!(receivers, "change notification sent");
            }
        });
        Self { signals, events }
    }

    pub fn signal(&self) {
        let _ = self.signals.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

// Export coordination

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Idle,
    Exporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorState {
    pub phase: ExportPhase,
    pub pending_rerun: bool,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRequest {
    Started,
    Coalesced,
}

struct CoordinatorInner {
    exporter: Arc<dyn Exporter>,
    notifier: ChangeNotifier,
    state: watch::Sender<CoordinatorState>,
}

/// Serializes exports: at most one runs at a time, and any number of requests made while
/// one is running collapse into a single follow-up run.
#[derive(Clone)]
pub struct ExportCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ExportCoordinator {
    pub fn new(exporter: Arc<dyn Exporter>, notifier: ChangeNotifier) -> Self {
        let (state, _) = watch::channel(CoordinatorState {
            phase: ExportPhase::Idle,
            pending_rerun: false,
            completed: 0,
            failed: 0,
        });
        Self {
            inner: Arc::new(CoordinatorInner {
                exporter,
                notifier,
                state,
            }),
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    /// Start an export if idle, otherwise mark a rerun. Must be called inside a Tokio runtime.
    pub fn request(&self) -> ExportRequest {
        let mut started = false;
        self.inner.state.send_if_modified(|state| match state.phase {
            ExportPhase::Idle => {
                state.phase = ExportPhase::Exporting;
                started = true;
                true
            }
            ExportPhase::Exporting => !std::mem::replace(&mut state.pending_rerun, true),
        });

        if started {
            let this = self.clone();
            tokio::spawn(async move { this.run_cycles().await });
            ExportRequest::Started
        } else {
            debug!("export in flight; rerun queued");
            ExportRequest::Coalesced
        }
    }

    /// Resolves once no export is running or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| s.phase == ExportPhase::Idle).await;
    }

    async fn run_cycles(self) {
        loop {
            let span = info_span!("export_cycle", exporter = %self.inner.exporter.describe());
            // Run in its own task so a panicking exporter still ends the cycle.
            let exporter = Arc::clone(&self.inner.exporter);
            let result = tokio::spawn(async move { exporter.export().await }.instrument(span))
                .await
                .unwrap_or_else(|err| Err(anyhow::anyhow!("export task failed: {err}").into()));
            let ok = match &result {
                Ok(ExportOutcome::Written(summary)) => {
                    info!(
                        topics = summary.topics,
                        projects = summary.projects,
                        "export complete"
                    );
                    true
                }
                Ok(ExportOutcome::External) => {
                    info!("export command complete");
                    true
                }
                Err(err) => {
                    error!(error = %err, "export failed; JSON projection may be stale");
                    false
                }
            };
            if ok {
                self.inner.notifier.signal();
            }

            let mut rerun = false;
            self.inner.state.send_modify(|state| {
                if ok {
                    state.completed += 1;
                } else {
                    state.failed += 1;
                }
                if state.pending_rerun {
                    state.pending_rerun = false;
                    rerun = true;
                } else {
                    state.phase = ExportPhase::Idle;
                }
            });
            if !rerun {
                break;
            }
        }
    }
}

// Change detection

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

/// "Wait for the next change" to the watched workbook.
#[async_trait]
pub trait ChangeSource: Send {
    fn kind(&self) -> &'static str;

    /// `None` once the source can no longer report changes.
    async fn next_change(&mut self) -> Option<ChangeEvent>;
}

/// Filesystem notifications; watches the parent directory so atomic-replace saves are seen.
pub struct NotifyChangeSource {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn event_touches(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    is_content_change(&event.kind)
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

impl NotifyChangeSource {
    pub fn new(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?
            .to_os_string();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let target = path.to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if event_touches(&event, &file_name) => {
                let _ = tx.send(ChangeEvent {
                    path: target.clone(),
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "filesystem watcher error"),
        })
        .context("creating filesystem watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }
}

#[async_trait]
impl ChangeSource for NotifyChangeSource {
    fn kind(&self) -> &'static str {
        "notify"
    }

    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Re-stats the workbook on a fixed interval and reports modification-time changes.
pub struct PollingChangeSource {
    path: PathBuf,
    interval: Interval,
    last_seen: Option<SystemTime>,
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

impl PollingChangeSource {
    pub async fn new(path: impl Into<PathBuf>, every: Duration) -> Self {
        let path = path.into();
        let last_seen = modified_time(&path).await;
        let every = every.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            path,
            interval,
            last_seen,
        }
    }
}

#[async_trait]
impl ChangeSource for PollingChangeSource {
    fn kind(&self) -> &'static str {
        "poll"
    }

    async fn next_change(&mut self) -> Option<ChangeEvent> {
        loop {
            self.interval.tick().await;
            // A failed stat (file locked or mid-save) is retried on the next tick.
            let Some(current) = modified_time(&self.path).await else {
                continue;
            };
            if self.last_seen != Some(current) {
                self.last_seen = Some(current);
                return Some(ChangeEvent {
                    path: self.path.clone(),
                });
            }
        }
    }
}

pub async fn change_source(
    path: &Path,
    mode: WatchMode,
    poll_interval: Duration,
) -> Result<Box<dyn ChangeSource>> {
    match mode {
        WatchMode::Poll => Ok(Box::new(PollingChangeSource::new(path, poll_interval).await)),
        WatchMode::Notify => Ok(Box::new(NotifyChangeSource::new(path)?)),
        WatchMode::Auto => match NotifyChangeSource::new(path) {
            Ok(source) => Ok(Box::new(source)),
            Err(err) => {
                warn!(error = %err, "filesystem notifications unavailable; polling instead");
                Ok(Box::new(PollingChangeSource::new(path, poll_interval).await))
            }
        },
    }
}

/// Initial export, then one export request per observed change until the source closes.
pub async fn watch_and_export(mut source: Box<dyn ChangeSource>, coordinator: ExportCoordinator) {
    coordinator.request();
    while let Some(change) = source.next_change().await {
        info!(
            path = %change.path.display(),
            source = source.kind(),
            "tracker changed; re-exporting"
        );
        coordinator.request();
    }
    warn!(source = source.kind(), "change source closed; watcher stopped");
}

// Runtime wiring

/// Everything a long-running process needs: configuration, the shared coordinator and
/// its notifier.
#[derive(Clone)]
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub coordinator: ExportCoordinator,
}

impl SyncRuntime {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let notifier = ChangeNotifier::new(config.notify_debounce);
        let coordinator = ExportCoordinator::new(exporter_for(&config)?, notifier);
        Ok(Self {
            config,
            coordinator,
        })
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        self.coordinator.notifier()
    }

    pub async fn spawn_watcher(&self) -> Result<JoinHandle<()>> {
        let source = change_source(
            &self.config.tracker_path,
            self.config.watch_mode,
            self.config.poll_interval,
        )
        .await?;
        info!(
            path = %self.config.tracker_path.display(),
            source = source.kind(),
            "watching tracker"
        );
        let coordinator = self.coordinator.clone();
        Ok(tokio::spawn(watch_and_export(source, coordinator)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    WorkbookMissing,
    UpToDate,
    Exported(Freshness, ExportOutcome),
}

/// Export only when the JSON projection is missing or older than the workbook.
pub async fn ensure_fresh(config: &SyncConfig) -> Result<EnsureOutcome, SyncError> {
    if !tokio::fs::try_exists(&config.tracker_path)
        .await
        .with_context(|| format!("checking {}", config.tracker_path.display()))?
    {
        warn!(
            path = %config.tracker_path.display(),
            "tracker workbook not found; set TRACKER_PATH before syncing data"
        );
        return Ok(EnsureOutcome::WorkbookMissing);
    }
    let freshness = export_freshness(&config.tracker_path, &config.export_targets()).await?;
    if !freshness.needs_export() {
        info!("exported JSON already reflects the workbook; skipping export");
        return Ok(EnsureOutcome::UpToDate);
    }
    info!(?freshness, "exported JSON out of date; running export");
    let outcome = exporter_for(config)?.export().await?;
    Ok(EnsureOutcome::Exported(freshness, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use legendtrack_workbook::{Sheet, Workbook};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Semaphore;

    struct GatedExporter {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedExporter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Exporter for GatedExporter {
        fn describe(&self) -> String {
            "gated".into()
        }

        async fn export(&self) -> Result<ExportOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.expect("gate open").forget();
            if self.fail {
                Err(SyncError::ExportFailed {
                    command: "gated".into(),
                    status: "exit status: 1".into(),
                })
            } else {
                Ok(ExportOutcome::External)
            }
        }
    }

    fn write_tracker(dir: &Path) -> PathBuf {
        let path = dir.join("tracker.xlsx");
        Workbook::new(vec![Sheet::from_records(
            "Topics",
            &["ID", "Status"],
            &[vec!["E1-A-2", ""], vec!["E1-A-1", "Mastered"]],
        )])
        .save(&path)
        .expect("save tracker");
        path
    }

    #[tokio::test]
    async fn burst_during_export_runs_exactly_one_more() {
        let exporter = GatedExporter::new(false);
        let coordinator =
            ExportCoordinator::new(exporter.clone(), ChangeNotifier::new(Duration::from_millis(5)));

        assert_eq!(coordinator.request(), ExportRequest::Started);
        for _ in 0..3 {
            assert_eq!(coordinator.request(), ExportRequest::Coalesced);
        }
        assert!(coordinator.state().pending_rerun);

        exporter.gate.add_permits(10);
        coordinator.wait_idle().await;

        assert_eq!(exporter.calls(), 2);
        let state = coordinator.state();
        assert_eq!(state.phase, ExportPhase::Idle);
        assert!(!state.pending_rerun);
        assert_eq!(state.completed, 2);
    }

    #[tokio::test]
    async fn idle_coordinator_starts_a_fresh_cycle() {
        let exporter = GatedExporter::new(false);
        exporter.gate.add_permits(10);
        let coordinator =
            ExportCoordinator::new(exporter.clone(), ChangeNotifier::new(Duration::from_millis(5)));

        assert_eq!(coordinator.request(), ExportRequest::Started);
        coordinator.wait_idle().await;
        assert_eq!(coordinator.request(), ExportRequest::Started);
        coordinator.wait_idle().await;
        assert_eq!(exporter.calls(), 2);
    }

    struct PanickingExporter;

    #[async_trait]
    impl Exporter for PanickingExporter {
        fn describe(&self) -> String {
            "panicking".into()
        }

        async fn export(&self) -> Result<ExportOutcome, SyncError> {
            panic!("exporter blew up");
        }
    }

    #[tokio::test]
    async fn panicking_export_counts_as_failure_and_frees_the_coordinator() {
        let coordinator = ExportCoordinator::new(
            Arc::new(PanickingExporter),
            ChangeNotifier::new(Duration::from_millis(5)),
        );

        assert_eq!(coordinator.request(), ExportRequest::Started);
        tokio::time::timeout(Duration::from_secs(5), coordinator.wait_idle())
            .await
            .expect("coordinator returns to idle");
        let state = coordinator.state();
        assert_eq!(state.phase, ExportPhase::Idle);
        assert_eq!(state.failed, 1);

        assert_eq!(coordinator.request(), ExportRequest::Started);
        coordinator.wait_idle().await;
        assert_eq!(coordinator.state().failed, 2);
    }

    #[tokio::test]
    async fn failed_export_returns_to_idle_without_notifying() {
        let exporter = GatedExporter::new(true);
        exporter.gate.add_permits(10);
        let notifier = ChangeNotifier::new(Duration::from_millis(5));
        let mut events = notifier.subscribe();
        let coordinator = ExportCoordinator::new(exporter.clone(), notifier);

        coordinator.request();
        coordinator.wait_idle().await;
        assert_eq!(coordinator.state().failed, 1);
        assert_eq!(coordinator.state().completed, 0);
        let next = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(next.is_err(), "no notification after a failed export");
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_debounces_bursts_into_one_event() {
        let notifier = ChangeNotifier::new(Duration::from_millis(250));
        let mut events = notifier.subscribe();

        notifier.signal();
        notifier.signal();
        notifier.signal();

        assert_eq!(events.recv().await.unwrap(), SyncEvent::TopicsUpdated);
        let second = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert!(second.is_err());

        notifier.signal();
        assert_eq!(events.recv().await.unwrap().name(), "topics-updated");
    }

    #[tokio::test]
    async fn workbook_exporter_writes_both_files() {
        let dir = tempdir().unwrap();
        let tracker = write_tracker(dir.path());
        let targets = ExportTargets::in_dir(dir.path().join("public/data"));
        let exporter = WorkbookExporter::new(&tracker, targets.clone());

        let outcome = exporter.export().await.expect("export");
        let ExportOutcome::Written(summary) = outcome else {
            panic!("expected in-process export");
        };
        assert_eq!((summary.topics, summary.projects), (2, 0));
        let topics = legendtrack_storage::read_export(&targets.topics).await.unwrap();
        assert_eq!(topics[0]["id"], "E1-A-1");
        assert_eq!(topics[0]["status"], "Mastered");
        assert_eq!(std::fs::read_to_string(&targets.projects).unwrap(), "[]");
    }

    #[tokio::test]
    async fn workbook_exporter_reports_missing_workbook() {
        let dir = tempdir().unwrap();
        let exporter = WorkbookExporter::new(dir.path().join("missing.xlsx"), ExportTargets::in_dir(dir.path()));
        let err = exporter.export().await.unwrap_err();
        assert!(matches!(err, SyncError::Workbook(WorkbookError::WorkbookNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exporter_maps_exit_status() {
        let ok = CommandExporter::new(&["sh".into(), "-c".into(), "exit 0".into()]).unwrap();
        assert_eq!(ok.export().await.unwrap(), ExportOutcome::External);

        let failing = CommandExporter::new(&["sh".into(), "-c".into(), "exit 3".into()]).unwrap();
        let err = failing.export().await.unwrap_err();
        assert!(matches!(err, SyncError::ExportFailed { .. }));
        assert!(err.to_string().contains("sh -c exit 3"));
    }

    #[tokio::test]
    async fn polling_source_reports_modification() {
        let dir = tempdir().unwrap();
        let tracker = write_tracker(dir.path());
        let mut source = PollingChangeSource::new(&tracker, Duration::from_millis(20)).await;

        let later = SystemTime::now() + Duration::from_secs(30);
        std::fs::File::options()
            .write(true)
            .open(&tracker)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), source.next_change())
            .await
            .expect("change observed")
            .expect("source open");
        assert_eq!(change.path, tracker);

        let quiet = tokio::time::timeout(Duration::from_millis(150), source.next_change()).await;
        assert!(quiet.is_err(), "unchanged file reports nothing");
    }

    #[tokio::test]
    async fn watch_loop_exports_initially_and_on_change() {
        let dir = tempdir().unwrap();
        let tracker = write_tracker(dir.path());
        let config = SyncConfig {
            tracker_path: tracker.clone(),
            data_dir: dir.path().join("data"),
            watch_mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(20),
            notify_debounce: Duration::from_millis(5),
            ..SyncConfig::default()
        };
        let runtime = SyncRuntime::new(config.clone()).unwrap();
        let mut events = runtime.notifier().subscribe();
        let handle = runtime.spawn_watcher().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("initial export notifies")
            .unwrap();
        assert!(config.export_targets().topics.exists());

        let update = legendtrack_core::TopicUpdate {
            status: Some("Stable".into()),
            ..Default::default()
        };
        legendtrack_workbook::apply_update(&tracker, "E1-A-2", &update).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&tracker)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("change export notifies")
            .unwrap();
        runtime.coordinator.wait_idle().await;
        let exported = std::fs::read_to_string(config.export_targets().topics).unwrap();
        assert!(exported.contains("\"status\": \"Stable\""));
        handle.abort();
    }

    #[test]
    fn config_layers_file_then_env() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("legendtrack.yaml");
        std::fs::write(
            &file,
            "tracker_path: /books/tracker.xlsx\nport: 5000\nwatch_mode: poll\nexport_command: \"npm run 'export:data'\"\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> =
            HashMap::from([("API_PORT", "6001"), ("LEGENDTRACK_DATA_DIR", "out"), ("TRACKER_PATH", " ")]);

        let config = SyncConfig::load(Some(&file), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.tracker_path, PathBuf::from("/books/tracker.xlsx"));
        assert_eq!(config.port, 6001);
        assert_eq!(config.data_dir, PathBuf::from("out"));
        assert_eq!(config.watch_mode, WatchMode::Poll);
        assert_eq!(
            config.export_command,
            Some(vec!["npm".to_string(), "run".to_string(), "export:data".to_string()])
        );
        assert_eq!(config.export_targets().projects, PathBuf::from("out/projects.json"));
    }

    #[test]
    fn config_defaults_and_bad_values() {
        let config = SyncConfig::load(None, |_| None).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.port, 4179);

        let err = SyncConfig::load(None, |k| (k == "API_PORT").then(|| "http".to_string())).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!("sometimes".parse::<WatchMode>().is_err());
        assert_eq!(" Notify ".parse::<WatchMode>().unwrap(), WatchMode::Notify);
    }

    #[test]
    fn notify_events_are_filtered_to_the_workbook() {
        use notify::event::{AccessKind, CreateKind, ModifyKind};

        let name = std::ffi::OsStr::new("tracker.xlsx");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/d/tracker.xlsx"));
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/d/tracker.xlsx"));
        let other = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/d/~$tracker.xlsx"));
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/d/tracker.xlsx"));
        assert!(event_touches(&modify, name));
        assert!(event_touches(&create, name));
        assert!(!event_touches(&other, name));
        assert!(!event_touches(&access, name));
    }

    #[tokio::test]
    async fn ensure_skips_when_fresh_and_tolerates_missing_workbook() {
        let dir = tempdir().unwrap();
        let missing = SyncConfig {
            tracker_path: dir.path().join("none.xlsx"),
            data_dir: dir.path().join("data"),
            ..SyncConfig::default()
        };
        assert_eq!(ensure_fresh(&missing).await.unwrap(), EnsureOutcome::WorkbookMissing);

        let config = SyncConfig {
            tracker_path: write_tracker(dir.path()),
            ..missing
        };
        let first = ensure_fresh(&config).await.unwrap();
        assert!(matches!(first, EnsureOutcome::Exported(Freshness::Missing, _)));
        assert_eq!(ensure_fresh(&config).await.unwrap(), EnsureOutcome::UpToDate);
    }
}
