//! Where packages come from and how their changes are observed.

use async_trait::async_trait;
use exthost_core::{AppDirs, ExtensionsConfig};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::package::{ExtensionId, ManifestError, PackageDescriptor, MANIFEST_FILE_NAME};

/// Change notification from a package source.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageEvent {
    Installed(PackageDescriptor),
    Updated(PackageDescriptor),
    Uninstalling(PackageDescriptor),
    StatusChanged(PackageDescriptor),
}

impl PackageEvent {
    pub fn descriptor(&self) -> &PackageDescriptor {
        match self {
            PackageEvent::Installed(d)
            | PackageEvent::Updated(d)
            | PackageEvent::Uninstalling(d)
            | PackageEvent::StatusChanged(d) => d,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read packages directory {path}: {source}")]
    Scan {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("failed to create packages directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
    #[error("package scan did not complete: {0}")]
    Task(String),
}

/// Stream of package events. Dropping it stops the underlying watcher.
pub struct PackageSubscription {
    events: mpsc::UnboundedReceiver<PackageEvent>,
    task: Option<JoinHandle<()>>,
}

impl PackageSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<PackageEvent>) -> Self {
        Self { events, task: None }
    }

    pub fn with_task(events: mpsc::UnboundedReceiver<PackageEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    pub async fn next(&mut self) -> Option<PackageEvent> {
        self.events.recv().await
    }
}

impl Drop for PackageSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Lists installed packages and reports changes to them.
#[async_trait]
pub trait PackageSource: Send + Sync {
    async fn list_packages(&self) -> Result<Vec<PackageDescriptor>, SourceError>;

    /// Starts observing changes. Changes made after this returns are reported
    /// even if they land before the first event is read.
    async fn subscribe(&self) -> Result<PackageSubscription, SourceError>;
}

type Snapshot = BTreeMap<ExtensionId, PackageDescriptor>;

/// Packages laid out as directories holding an `extension.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryPackageSource {
    root: PathBuf,
    contract: String,
    debounce: Duration,
}

impl DirectoryPackageSource {
    pub fn new(root: impl Into<PathBuf>, contract: impl Into<String>, debounce: Duration) -> Self {
        Self {
            root: root.into(),
            contract: contract.into(),
            debounce,
        }
    }

    pub fn from_config(config: &ExtensionsConfig, dirs: &AppDirs) -> Self {
        Self::new(
            config.packages_dir(dirs),
            config.contract.clone(),
            config.debounce(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PackageSource for DirectoryPackageSource {
    async fn list_packages(&self) -> Result<Vec<PackageDescriptor>, SourceError> {
        rescan(self.root.clone(), self.contract.clone()).await
    }

    async fn subscribe(&self) -> Result<PackageSubscription, SourceError> {
        std::fs::create_dir_all(&self.root).map_err(|source| SourceError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_relevant(&event) => {
                    let _ = raw_tx.send(());
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "Package watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|source| SourceError::Watch {
            path: self.root.clone(),
            source,
        })?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|source| SourceError::Watch {
                path: self.root.clone(),
                source,
            })?;
        // Baseline taken after the watcher is live, so nothing falls in between.
        let baseline = index(&rescan(self.root.clone(), self.contract.clone()).await?);
        tracing::info!(
            root = %self.root.display(),
            packages = baseline.len(),
            "Watching packages directory"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watch_loop(WatchState {
            _watcher: watcher,
            raw: raw_rx,
            tx,
            root: self.root.clone(),
            contract: self.contract.clone(),
            debounce: self.debounce,
            snapshot: baseline,
        }));
        Ok(PackageSubscription::with_task(rx, task))
    }
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

struct WatchState {
    _watcher: RecommendedWatcher,
    raw: mpsc::UnboundedReceiver<()>,
    tx: mpsc::UnboundedSender<PackageEvent>,
    root: PathBuf,
    contract: String,
    debounce: Duration,
    /// Last scan seen by this subscription.
    snapshot: Snapshot,
}

async fn watch_loop(mut state: WatchState) {
    while state.raw.recv().await.is_some() {
        // Wait for a quiet period so a package copy in progress is scanned once.
        loop {
            match tokio::time::timeout(state.debounce, state.raw.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let packages = match rescan(state.root.clone(), state.contract.clone()).await {
            Ok(packages) => packages,
            Err(err) => {
                tracing::warn!(error = %err, "Package rescan failed");
                continue;
            }
        };
        let next = index(&packages);
        let events = diff_snapshots(&state.snapshot, &next);
        state.snapshot = next;
        tracing::debug!(changes = events.len(), "Packages directory rescanned");
        for event in events {
            if state.tx.send(event).is_err() {
                return;
            }
        }
    }
}

async fn rescan(root: PathBuf, contract: String) -> Result<Vec<PackageDescriptor>, SourceError> {
    tokio::task::spawn_blocking(move || scan_packages(&root, &contract))
        .await
        .map_err(|err| SourceError::Task(err.to_string()))?
}

fn index(packages: &[PackageDescriptor]) -> Snapshot {
    packages
        .iter()
        .map(|descriptor| (descriptor.extension_id(), descriptor.clone()))
        .collect()
}

/// Scans the immediate subdirectories of `root` for package manifests.
///
/// Malformed manifests and manifests for other contracts are logged and skipped.
pub fn scan_packages(root: &Path, contract: &str) -> Result<Vec<PackageDescriptor>, SourceError> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "Packages directory does not exist");
        return Ok(Vec::new());
    }

    let mut found = Snapshot::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(SourceError::Scan {
                    path: root.to_path_buf(),
                    source: err,
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping unreadable package entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() || !entry.path().join(MANIFEST_FILE_NAME).is_file() {
            continue;
        }

        match PackageDescriptor::load(entry.path(), contract) {
            Ok(descriptor) => {
                let id = descriptor.extension_id();
                if let Some(existing) = found.get(&id) {
                    tracing::warn!(
                        extension_id = %id,
                        kept = %existing.root.display(),
                        skipped = %descriptor.root.display(),
                        "Duplicate extension id"
                    );
                    continue;
                }
                found.insert(id, descriptor);
            }
            Err(err @ ManifestError::ContractMismatch { .. }) => {
                tracing::warn!(error = %err, "Skipping package for another contract");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed package");
            }
        }
    }
    Ok(found.into_values().collect())
}

/// Package events that turn `old` into `new`.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<PackageEvent> {
    let mut events = Vec::new();
    for (id, previous) in old {
        if !new.contains_key(id) {
            events.push(PackageEvent::Uninstalling(previous.clone().into_removed()));
        }
    }
    for (id, current) in new {
        match old.get(id) {
            None => events.push(PackageEvent::Installed(current.clone())),
            Some(previous) if previous.fingerprint != current.fingerprint => {
                events.push(PackageEvent::Updated(current.clone()))
            }
            Some(previous) if previous.status != current.status => {
                events.push(PackageEvent::StatusChanged(current.clone()))
            }
            Some(_) => {}
        }
    }
    events
}

/// In-process package source fed by the embedding application.
#[derive(Default)]
pub struct MemoryPackageSource {
    packages: Mutex<Snapshot>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PackageEvent>>>,
}

impl MemoryPackageSource {
    pub fn new(packages: impl IntoIterator<Item = PackageDescriptor>) -> Self {
        let source = Self::default();
        *source.packages.lock() = packages
            .into_iter()
            .map(|descriptor| (descriptor.extension_id(), descriptor))
            .collect();
        source
    }

    /// Applies `event` to the listed packages and forwards it to subscribers.
    pub fn publish(&self, event: PackageEvent) {
        {
            let mut packages = self.packages.lock();
            let descriptor = event.descriptor();
            match &event {
                PackageEvent::Uninstalling(_) => {
                    packages.remove(&descriptor.extension_id());
                }
                _ => {
                    packages.insert(descriptor.extension_id(), descriptor.clone());
                }
            }
        }
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl PackageSource for MemoryPackageSource {
    async fn list_packages(&self) -> Result<Vec<PackageDescriptor>, SourceError> {
        Ok(self.packages.lock().values().cloned().collect())
    }

    async fn subscribe(&self) -> Result<PackageSubscription, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(PackageSubscription::new(rx))
    }
}
