//! Extension discovery and lifecycle management.
//!
//! A [`PackageSource`] lists installed extension packages and reports changes;
//! the [`ExtensionManager`] turns those into [`Extension`]s whose lifecycle it
//! drives, and each extension lazily opens one connection to its host process
//! when invoked.

pub mod events;
pub mod extension;
pub mod manager;
pub mod outcome;
pub mod package;
pub mod source;

pub use events::{ExtensionEvent, ExtensionInfo, ExtensionStatus};
pub use extension::Extension;
pub use manager::{ExtensionManager, ManagerOptions};
pub use outcome::{InvokeFailure, InvokeOutcome};
pub use package::{
    verify_package, ExtensionId, IntegrityIssue, ManifestError, PackageDescriptor, PackageStatus,
    MANIFEST_FILE_NAME, SERVICE_PROPERTY,
};
pub use source::{
    diff_snapshots, scan_packages, DirectoryPackageSource, MemoryPackageSource, PackageEvent,
    PackageSource, PackageSubscription, SourceError,
};
