//! One extension and its lifecycle.
//!
//! State transitions (`enable`, `disable`, `mark_as_loaded`, `unload`, `update`) are
//! serialized by a per-extension async lock, so concurrent lifecycle requests for the
//! same extension apply one after another while other extensions proceed freely.
//! Cancelling a transition releases the lock.

use exthost_ipc::{
    Connection, ConnectionOptions, ConnectionStatus, Connector, ProgressCallback, WorkRequest,
    WorkResult,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::events::{ExtensionEvent, ExtensionInfo, ExtensionStatus};
use crate::outcome::{InvokeFailure, InvokeOutcome};
use crate::package::{ExtensionId, PackageDescriptor, PackageStatus};

#[derive(Debug)]
struct Lifecycle {
    descriptor: PackageDescriptor,
    enabled: bool,
    /// Set by an explicit `disable`, cleared once the extension is enabled again.
    disabled: bool,
    loaded: bool,
    offline: bool,
}

impl Lifecycle {
    fn status(&self) -> ExtensionStatus {
        if self.loaded {
            ExtensionStatus::Loaded
        } else if self.offline {
            ExtensionStatus::Offline
        } else if self.disabled {
            ExtensionStatus::Disabled
        } else {
            ExtensionStatus::Unloaded
        }
    }

    fn visible(&self) -> bool {
        self.loaded
    }
}

pub struct Extension {
    id: ExtensionId,
    state: RwLock<Lifecycle>,
    transition: AsyncMutex<()>,
    connection: Mutex<Option<Arc<Connection>>>,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    events: broadcast::Sender<ExtensionEvent>,
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Extension {
    /// Creates an unloaded extension; a package that already fails verification starts offline.
    pub fn new(
        descriptor: PackageDescriptor,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
        events: broadcast::Sender<ExtensionEvent>,
    ) -> Self {
        let offline = descriptor.status.is_offline();
        Self {
            id: descriptor.extension_id(),
            state: RwLock::new(Lifecycle {
                descriptor,
                enabled: false,
                disabled: false,
                loaded: false,
                offline,
            }),
            transition: AsyncMutex::new(()),
            connection: Mutex::new(None),
            connector,
            options,
            events,
        }
    }

    pub fn id(&self) -> &ExtensionId {
        &self.id
    }

    pub fn status(&self) -> ExtensionStatus {
        self.state.read().status()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().loaded
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn is_visible(&self) -> bool {
        self.state.read().visible()
    }

    pub fn descriptor(&self) -> PackageDescriptor {
        self.state.read().descriptor.clone()
    }

    /// State of the current connection, if one has been created.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.connection.lock().as_ref().map(|c| c.status())
    }

    pub fn info(&self) -> ExtensionInfo {
        let state = self.state.read();
        let manifest = &state.descriptor.manifest;
        ExtensionInfo {
            id: self.id.clone(),
            package_id: manifest.package.id.clone(),
            version: manifest.package.version.clone(),
            publisher: manifest.package.publisher.clone(),
            display_name: state.descriptor.display_name().to_string(),
            description: manifest.extension.description.clone(),
            logo: manifest
                .extension
                .logo
                .as_ref()
                .map(|logo| state.descriptor.root.join(logo)),
            service: state.descriptor.service().map(str::to_string),
            root: state.descriptor.root.clone(),
            status: state.status(),
            enabled: state.enabled,
            visible: state.visible(),
            issues: state.descriptor.status.issues.clone(),
        }
    }

    pub async fn enable(&self) {
        let _transition = self.transition.lock().await;
        self.mutate(|state| {
            state.enabled = true;
            state.disabled = false;
        });
        self.mark_as_loaded_locked();
    }

    /// Disables an enabled extension; a second call does nothing.
    pub async fn disable(&self) {
        let _transition = self.transition.lock().await;
        if !self.state.read().enabled {
            return;
        }
        self.mutate(|state| {
            state.enabled = false;
            state.disabled = true;
        });
        self.unload_locked().await;
    }

    /// Loads the extension if its package verifies; returns whether it is loaded.
    pub async fn mark_as_loaded(&self) -> bool {
        let _transition = self.transition.lock().await;
        self.mark_as_loaded_locked()
    }

    pub async fn unload(&self) {
        let _transition = self.transition.lock().await;
        self.unload_locked().await;
    }

    /// Refreshes metadata and service endpoint from `descriptor`, then loads.
    ///
    /// Ignored (with a warning) when `descriptor` belongs to another extension.
    pub async fn update(&self, descriptor: PackageDescriptor) -> bool {
        let incoming = descriptor.extension_id();
        if incoming != self.id {
            tracing::warn!(
                extension_id = %self.id,
                incoming = %incoming,
                "Ignoring update for a different extension"
            );
            return false;
        }

        let _transition = self.transition.lock().await;
        if self.is_loaded() && !descriptor.status.verify_is_ok() {
            self.unload_locked().await;
        }

        let target_changed = {
            let mut state = self.state.write();
            let changed = state.descriptor.service_target() != descriptor.service_target();
            state.descriptor = descriptor;
            changed
        };
        if target_changed {
            self.close_connection().await;
        }

        if !self.mark_as_loaded_locked() {
            let offline = self.state.read().descriptor.status.is_offline();
            self.mutate(|state| state.offline = offline);
        }
        tracing::debug!(extension_id = %self.id, "Extension updated");
        true
    }

    /// Replaces the package integrity verdict without changing lifecycle state.
    pub fn refresh_package_status(&self, status: PackageStatus) {
        self.state.write().descriptor.status = status;
    }

    /// Runs `request` on the extension's service.
    ///
    /// Never fails: every error becomes [`InvokeOutcome::Failed`]. Nothing is
    /// attempted while the extension is not loaded.
    pub async fn invoke(
        &self,
        request: WorkRequest,
        progress: Option<ProgressCallback>,
    ) -> InvokeOutcome {
        if !self.is_loaded() {
            return InvokeOutcome::Failed(InvokeFailure::NotLoaded);
        }
        let connection = match self.connection() {
            Ok(connection) => connection,
            Err(failure) => return InvokeOutcome::Failed(failure),
        };

        if let Err(err) = connection.open().await {
            return InvokeOutcome::Failed(err.into());
        }
        if !self.is_loaded() {
            // Unloaded while the channel was opening.
            connection.close().await;
            return InvokeOutcome::Failed(InvokeFailure::NotLoaded);
        }

        let operation = request.operation.clone();
        match connection.call(request, progress).await {
            Ok(WorkResult {
                result: Some(value),
            }) => InvokeOutcome::Completed(value),
            Ok(WorkResult { result: None }) => {
                tracing::warn!(
                    extension_id = %self.id,
                    operation = %operation,
                    "Work result carried no result field"
                );
                InvokeOutcome::Failed(InvokeFailure::MalformedResponse(
                    "missing result field".into(),
                ))
            }
            Err(err) => {
                tracing::debug!(
                    extension_id = %self.id,
                    operation = %operation,
                    error = %err,
                    "Invocation failed"
                );
                InvokeOutcome::Failed(err.into())
            }
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, InvokeFailure> {
        let mut slot = self.connection.lock();
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let target = self
            .state
            .read()
            .descriptor
            .service_target()
            .ok_or(InvokeFailure::NoService)?;
        let connection = Arc::new(Connection::new(
            target,
            self.connector.clone(),
            self.options,
        ));
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn close_connection(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    fn mark_as_loaded_locked(&self) -> bool {
        if !self.state.read().descriptor.status.verify_is_ok() {
            tracing::debug!(extension_id = %self.id, "Package failed verification, not loading");
            return false;
        }
        self.mutate(|state| {
            state.enabled = true;
            state.disabled = false;
            if !state.loaded {
                state.loaded = true;
                state.offline = false;
            }
        });
        true
    }

    async fn unload_locked(&self) {
        self.mutate(|state| {
            if state.loaded {
                state.offline = state.descriptor.status.is_offline();
                state.loaded = false;
            }
        });
        self.close_connection().await;
    }

    fn mutate(&self, apply: impl FnOnce(&mut Lifecycle)) {
        let (before, after, visible) = {
            let mut state = self.state.write();
            let before = (state.status(), state.visible());
            apply(&mut state);
            (before, state.status(), state.visible())
        };
        if before == (after, visible) {
            return;
        }
        tracing::info!(
            extension_id = %self.id,
            from = %before.0,
            to = %after,
            visible,
            "Extension state changed"
        );
        let _ = self.events.send(ExtensionEvent::StateChanged {
            id: self.id.clone(),
            status: after,
            visible,
        });
    }
}
