use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::package::{ExtensionId, IntegrityIssue};

/// Lifecycle state of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Unloaded,
    Loaded,
    Disabled,
    Offline,
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExtensionStatus::Unloaded => "unloaded",
            ExtensionStatus::Loaded => "loaded",
            ExtensionStatus::Disabled => "disabled",
            ExtensionStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Read-only view of an extension for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionInfo {
    pub id: ExtensionId,
    pub package_id: String,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub display_name: String,
    pub description: Option<String>,
    pub logo: Option<PathBuf>,
    pub service: Option<String>,
    pub root: PathBuf,
    pub status: ExtensionStatus,
    pub enabled: bool,
    pub visible: bool,
    pub issues: Vec<IntegrityIssue>,
}

/// Notification emitted by the manager and its extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionEvent {
    Added(ExtensionInfo),
    Updated(ExtensionInfo),
    Removed(ExtensionId),
    StateChanged {
        id: ExtensionId,
        status: ExtensionStatus,
        visible: bool,
    },
}

impl ExtensionEvent {
    pub fn extension_id(&self) -> &ExtensionId {
        match self {
            ExtensionEvent::Added(info) | ExtensionEvent::Updated(info) => &info.id,
            ExtensionEvent::Removed(id) | ExtensionEvent::StateChanged { id, .. } => id,
        }
    }
}
