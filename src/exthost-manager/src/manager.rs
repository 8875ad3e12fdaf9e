//! The authoritative collection of extensions.

use exthost_core::{AppDirs, Config};
use exthost_ipc::{ConnectionOptions, Connector, LocalSocketConnector, ProgressCallback, WorkRequest};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::events::{ExtensionEvent, ExtensionInfo, ExtensionStatus};
use crate::extension::Extension;
use crate::outcome::{InvokeFailure, InvokeOutcome};
use crate::package::{ExtensionId, PackageDescriptor};
use crate::source::{DirectoryPackageSource, PackageEvent, PackageSource, SourceError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub connection: ConnectionOptions,
    /// Follow package source notifications after startup.
    pub watch: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            connection: ConnectionOptions::from(&config.ipc),
            watch: config.extensions.watch,
        }
    }
}

/// Discovers packages and keeps one [`Extension`] per id.
///
/// Only the manager mutates the collection; observers read snapshots and
/// subscribe to [`ExtensionEvent`]s.
pub struct ExtensionManager {
    source: Arc<dyn PackageSource>,
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
    extensions: RwLock<BTreeMap<ExtensionId, Arc<Extension>>>,
    /// Serializes package notifications so lookups and inserts stay consistent.
    routing: AsyncMutex<()>,
    events: broadcast::Sender<ExtensionEvent>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExtensionManager {
    pub fn new(
        source: Arc<dyn PackageSource>,
        connector: Arc<dyn Connector>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            source,
            connector,
            options,
            extensions: RwLock::new(BTreeMap::new()),
            routing: AsyncMutex::new(()),
            events,
            watch_task: Mutex::new(None),
        })
    }

    /// Manager over the configured packages directory, reaching hosts over local sockets.
    pub fn from_config(config: &Config, dirs: &AppDirs) -> Arc<Self> {
        Self::new(
            Arc::new(DirectoryPackageSource::from_config(&config.extensions, dirs)),
            Arc::new(LocalSocketConnector::from_config(&config.ipc, dirs)),
            ManagerOptions::from(config),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the collection, ordered by id.
    pub fn extensions(&self) -> Vec<Arc<Extension>> {
        self.extensions.read().values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<ExtensionInfo> {
        self.extensions().iter().map(|ext| ext.info()).collect()
    }

    pub fn get(&self, id: &ExtensionId) -> Option<Arc<Extension>> {
        self.extensions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.extensions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.read().is_empty()
    }

    pub async fn discover(&self) -> Result<Vec<PackageDescriptor>, SourceError> {
        self.source.list_packages().await
    }

    /// Discovers packages and loads each of them; returns how many were found.
    pub async fn load_installed(&self) -> Result<usize, SourceError> {
        let packages = self.discover().await?;
        let count = packages.len();
        for descriptor in packages {
            self.on_package_installed(descriptor).await;
        }
        tracing::info!(packages = count, "Discovered extension packages");
        Ok(count)
    }

    /// Loads installed packages and, when watching, follows source notifications.
    ///
    /// The subscription is taken before discovery so no change is lost in
    /// between. While watching, a failed discovery is logged and the watcher
    /// still starts.
    pub async fn start(self: &Arc<Self>) -> Result<usize, SourceError> {
        if !self.options.watch {
            return self.load_installed().await;
        }

        let mut subscription = self.source.subscribe().await?;
        let count = match self.load_installed().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "Initial package discovery failed, watching anyway");
                0
            }
        };
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle(event).await;
            }
            tracing::debug!("Package notifications ended");
        });
        if let Some(previous) = self.watch_task.lock().replace(task) {
            previous.abort();
        }
        Ok(count)
    }

    /// Stops following notifications and unloads every extension.
    pub async fn shutdown(&self) {
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        let _routing = self.routing.lock().await;
        for extension in self.extensions() {
            extension.unload().await;
        }
        tracing::info!("Extension manager shut down");
    }

    pub async fn handle(&self, event: PackageEvent) {
        match event {
            PackageEvent::Installed(descriptor) => self.on_package_installed(descriptor).await,
            PackageEvent::Updated(descriptor) => self.on_package_updated(descriptor).await,
            PackageEvent::Uninstalling(descriptor) => {
                self.on_package_uninstalling(descriptor).await
            }
            PackageEvent::StatusChanged(descriptor) => {
                self.on_package_status_changed(descriptor).await
            }
        }
    }

    /// Adds a new extension and loads it if its package verifies.
    ///
    /// An already known id is handled as an update, unless the package is
    /// unchanged, in which case the live extension is left alone.
    pub async fn on_package_installed(&self, descriptor: PackageDescriptor) {
        let _routing = self.routing.lock().await;
        let id = descriptor.extension_id();
        if let Some(existing) = self.get(&id) {
            let current = existing.descriptor();
            if current.fingerprint == descriptor.fingerprint && current.status == descriptor.status {
                tracing::debug!(extension_id = %id, "Package unchanged, keeping extension");
                return;
            }
            self.update_existing(&existing, descriptor).await;
            return;
        }

        let extension = Arc::new(Extension::new(
            descriptor,
            self.connector.clone(),
            self.options.connection,
            self.events.clone(),
        ));
        self.extensions.write().insert(id.clone(), extension.clone());
        tracing::info!(extension_id = %id, "Extension added");
        let _ = self.events.send(ExtensionEvent::Added(extension.info()));

        if !extension.mark_as_loaded().await {
            tracing::warn!(
                extension_id = %id,
                issues = ?extension.descriptor().status.issues,
                "Package failed verification"
            );
        }
    }

    /// Unloads the matching extension, then refreshes and reloads it.
    ///
    /// Unknown ids are handled as an install.
    pub async fn on_package_updated(&self, descriptor: PackageDescriptor) {
        let routing = self.routing.lock().await;
        if let Some(existing) = self.get(&descriptor.extension_id()) {
            self.update_existing(&existing, descriptor).await;
            return;
        }
        drop(routing);
        self.on_package_installed(descriptor).await;
    }

    pub async fn on_package_uninstalling(&self, descriptor: PackageDescriptor) {
        let _routing = self.routing.lock().await;
        let id = descriptor.extension_id();
        let Some(extension) = self.get(&id) else {
            tracing::debug!(extension_id = %id, "Uninstall for unknown extension");
            return;
        };

        let mut status = descriptor.status;
        status.removed = true;
        extension.refresh_package_status(status);
        extension.unload().await;
        self.extensions.write().remove(&id);
        tracing::info!(extension_id = %id, "Extension removed");
        let _ = self.events.send(ExtensionEvent::Removed(id));
    }

    /// Re-evaluates integrity: a loaded extension that no longer verifies goes
    /// offline, an offline one that verifies again is reloaded.
    pub async fn on_package_status_changed(&self, descriptor: PackageDescriptor) {
        let _routing = self.routing.lock().await;
        let id = descriptor.extension_id();
        let Some(extension) = self.get(&id) else {
            tracing::debug!(extension_id = %id, "Status change for unknown extension");
            return;
        };

        let verified = descriptor.status.verify_is_ok();
        extension.refresh_package_status(descriptor.status);
        if extension.is_loaded() && !verified {
            tracing::warn!(extension_id = %id, "Package no longer verifies, unloading");
            extension.unload().await;
        } else if extension.status() == ExtensionStatus::Offline && verified {
            tracing::info!(extension_id = %id, "Package verifies again, reloading");
            extension.mark_as_loaded().await;
        }
    }

    /// Invokes `request` on extension `id`; unknown ids fail as not loaded.
    pub async fn invoke(
        &self,
        id: &ExtensionId,
        request: WorkRequest,
        progress: Option<ProgressCallback>,
    ) -> InvokeOutcome {
        match self.get(id) {
            Some(extension) => extension.invoke(request, progress).await,
            None => {
                tracing::warn!(extension_id = %id, "Invocation for unknown extension");
                InvokeOutcome::Failed(InvokeFailure::NotLoaded)
            }
        }
    }

    async fn update_existing(&self, extension: &Extension, descriptor: PackageDescriptor) {
        extension.unload().await;
        if extension.update(descriptor).await {
            let _ = self.events.send(ExtensionEvent::Updated(extension.info()));
        }
    }
}
