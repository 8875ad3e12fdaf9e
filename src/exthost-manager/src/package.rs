//! Package manifests, descriptors and integrity verification.

use exthost_ipc::{Endpoint, LaunchSpec, ServiceTarget};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the manifest at the root of every package directory.
pub const MANIFEST_FILE_NAME: &str = "extension.toml";

/// Manifest property naming the extension's service endpoint.
pub const SERVICE_PROPERTY: &str = "Service";

/// Stable identifier of an extension in the manager's collection.
///
/// Formed as `{package id}/{application id}!{extension id}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtensionId(pub String);

impl ExtensionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn derive(package_id: &str, app_id: &str, extension_id: &str) -> Self {
        Self(format!("{package_id}/{app_id}!{extension_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExtensionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ExtensionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Extension contract the package implements.
    pub contract: String,
    pub package: PackageSection,
    pub extension: ExtensionSection,
    /// Free-form properties; `Service` names the service endpoint.
    #[serde(default)]
    pub properties: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub launch: Option<LaunchSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSection {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSection {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<PathBuf>,
}

/// How to start the package's host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSection {
    /// Relative to the package root.
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Expected hex SHA-256 of the executable.
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("manifest {path} declares contract {found:?}, expected {expected:?}")]
    ContractMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },
    #[error("manifest {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// A problem that prevents a package from being loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    MissingExecutable { path: PathBuf },
    OutsidePackage { path: PathBuf },
    DigestMismatch { expected: String, actual: String },
    Unreadable { path: PathBuf, message: String },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingExecutable { path } => {
                write!(f, "executable {} does not exist", path.display())
            }
            IntegrityIssue::OutsidePackage { path } => {
                write!(f, "executable {} is outside the package", path.display())
            }
            IntegrityIssue::DigestMismatch { expected, actual } => {
                write!(f, "executable digest {actual} does not match {expected}")
            }
            IntegrityIssue::Unreadable { path, message } => {
                write!(f, "cannot read {}: {message}", path.display())
            }
        }
    }
}

/// Integrity verdict for a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageStatus {
    pub issues: Vec<IntegrityIssue>,
    /// The package is being uninstalled.
    pub removed: bool,
}

impl PackageStatus {
    pub fn verify_is_ok(&self) -> bool {
        self.issues.is_empty() && !self.removed
    }

    /// Verification failed for a package that is still installed.
    pub fn is_offline(&self) -> bool {
        !self.verify_is_ok() && !self.removed
    }
}

/// A discovered package and its integrity verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    pub root: PathBuf,
    pub manifest: Manifest,
    /// Hex SHA-256 of the manifest bytes.
    pub fingerprint: String,
    pub status: PackageStatus,
}

impl PackageDescriptor {
    /// Reads and verifies the package in directory `root`.
    pub fn load(root: &Path, contract: &str) -> Result<Self, ManifestError> {
        let path = root.join(MANIFEST_FILE_NAME);
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(root, &text, contract)
    }

    /// Parses manifest `text` for a package rooted at `root` and verifies it.
    pub fn parse(root: impl Into<PathBuf>, text: &str, contract: &str) -> Result<Self, ManifestError> {
        let root = root.into();
        let path = root.join(MANIFEST_FILE_NAME);
        let manifest: Manifest = toml::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.clone(),
            source,
        })?;

        if manifest.contract != contract {
            return Err(ManifestError::ContractMismatch {
                path,
                found: manifest.contract,
                expected: contract.to_string(),
            });
        }
        for (field, value) in [
            ("package.id", &manifest.package.id),
            ("package.app_id", &manifest.package.app_id),
            ("extension.id", &manifest.extension.id),
        ] {
            if value.trim().is_empty() {
                return Err(ManifestError::Invalid {
                    path,
                    reason: format!("{field} must not be empty"),
                });
            }
        }
        if let Some(value) = manifest.properties.get(SERVICE_PROPERTY) {
            if !value.is_str() {
                return Err(ManifestError::Invalid {
                    path,
                    reason: format!("property {SERVICE_PROPERTY} must be a string"),
                });
            }
        }

        let status = verify_package(&root, manifest.launch.as_ref());
        Ok(Self {
            fingerprint: hex::encode(Sha256::digest(text.as_bytes())),
            root,
            manifest,
            status,
        })
    }

    pub fn extension_id(&self) -> ExtensionId {
        ExtensionId::derive(
            &self.manifest.package.id,
            &self.manifest.package.app_id,
            &self.manifest.extension.id,
        )
    }

    pub fn package_id(&self) -> &str {
        &self.manifest.package.id
    }

    pub fn display_name(&self) -> &str {
        self.manifest
            .extension
            .display_name
            .as_deref()
            .unwrap_or(&self.manifest.extension.id)
    }

    /// Service endpoint name from the `Service` property, if declared.
    pub fn service(&self) -> Option<&str> {
        self.manifest
            .properties
            .get(SERVICE_PROPERTY)
            .and_then(toml::Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Where to reach the extension's service, if it has one.
    pub fn service_target(&self) -> Option<ServiceTarget> {
        let service = self.service()?;
        let launch = self.manifest.launch.as_ref().map(|launch| LaunchSpec {
            executable: self.root.join(&launch.executable),
            args: launch.args.clone(),
            working_dir: Some(self.root.clone()),
            env: launch
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        });
        Some(ServiceTarget {
            endpoint: Endpoint::new(self.package_id(), service),
            launch,
        })
    }

    /// Marks the package as being uninstalled.
    pub fn into_removed(mut self) -> Self {
        self.status.removed = true;
        self
    }
}

fn canonicalize_within_root(path: &Path, root: &Path) -> Option<PathBuf> {
    let Ok(canon) = path.canonicalize() else {
        return None;
    };
    let cleaned = canon.clean();
    if cleaned.starts_with(root) {
        Some(cleaned)
    } else {
        None
    }
}

/// Checks the declared executable of a package rooted at `root`.
pub fn verify_package(root: &Path, launch: Option<&LaunchSection>) -> PackageStatus {
    let mut status = PackageStatus::default();
    let Some(launch) = launch else {
        return status;
    };

    let candidate = root.join(&launch.executable);
    if !candidate.exists() {
        status.issues.push(IntegrityIssue::MissingExecutable { path: candidate });
        return status;
    }
    let root = root
        .canonicalize()
        .map(|canon| canon.clean())
        .unwrap_or_else(|_| root.clean());
    let Some(executable) = canonicalize_within_root(&candidate, &root) else {
        status.issues.push(IntegrityIssue::OutsidePackage { path: candidate });
        return status;
    };

    if let Some(expected) = &launch.sha256 {
        match std::fs::read(&executable) {
            Ok(bytes) => {
                let actual = hex::encode(Sha256::digest(&bytes));
                if !actual.eq_ignore_ascii_case(expected.trim()) {
                    status.issues.push(IntegrityIssue::DigestMismatch {
                        expected: expected.trim().to_ascii_lowercase(),
                        actual,
                    });
                }
            }
            Err(err) => status.issues.push(IntegrityIssue::Unreadable {
                path: executable,
                message: err.to_string(),
            }),
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const CONTRACT: &str = "exthost.tool";

    fn manifest(launch: &str) -> String {
        format!(
            r#"
contract = "exthost.tool"

[package]
id = "com.example.filestat"
app_id = "FileStat"
version = "1.0.0"

[extension]
id = "filestat"
display_name = "File statistics"

[properties]
Service = "filestat-service"
{launch}
"#
        )
    }

    #[test]
    fn parses_identity_and_service() {
        let descriptor = PackageDescriptor::parse("/pkgs/filestat", &manifest(""), CONTRACT).unwrap();
        assert_eq!(
            descriptor.extension_id().as_str(),
            "com.example.filestat/FileStat!filestat"
        );
        assert_eq!(descriptor.service(), Some("filestat-service"));
        assert_eq!(descriptor.display_name(), "File statistics");
        assert!(descriptor.status.verify_is_ok());

        let target = descriptor.service_target().unwrap();
        assert_eq!(target.endpoint, Endpoint::new("com.example.filestat", "filestat-service"));
        assert!(target.launch.is_none());
    }

    #[test]
    fn fingerprint_tracks_manifest_bytes() {
        let a = PackageDescriptor::parse("/p", &manifest(""), CONTRACT).unwrap();
        let b = PackageDescriptor::parse("/p", &manifest("# touched"), CONTRACT).unwrap();
        assert_eq!(a.fingerprint.len(), 64);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn rejects_other_contracts_and_empty_ids() {
        let text = manifest("").replace("exthost.tool", "someone.else");
        let err = PackageDescriptor::parse("/p", &text, CONTRACT).unwrap_err();
        assert!(matches!(err, ManifestError::ContractMismatch { .. }));

        let text = manifest("").replace(r#"id = "filestat""#, r#"id = " ""#);
        let err = PackageDescriptor::parse("/p", &text, CONTRACT).unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));

        let err = PackageDescriptor::parse("/p", "contract = 3", CONTRACT).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn missing_executable_fails_verification() {
        let dir = tempdir().unwrap();
        let text = manifest("[launch]\nexecutable = \"bin/host\"\n");
        let descriptor = PackageDescriptor::parse(dir.path(), &text, CONTRACT).unwrap();
        assert!(!descriptor.status.verify_is_ok());
        assert!(descriptor.status.is_offline());
        assert!(matches!(
            descriptor.status.issues[0],
            IntegrityIssue::MissingExecutable { .. }
        ));
    }

    #[test]
    fn digest_is_checked_when_declared() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/host"), b"#!/bin/sh\n").unwrap();
        let digest = hex::encode(Sha256::digest(b"#!/bin/sh\n"));

        let good = manifest(&format!(
            "[launch]\nexecutable = \"bin/host\"\nsha256 = \"{}\"\n",
            digest.to_uppercase()
        ));
        let descriptor = PackageDescriptor::load_from_str_for_test(dir.path(), &good);
        assert!(descriptor.status.verify_is_ok(), "{:?}", descriptor.status);

        let bad = manifest("[launch]\nexecutable = \"bin/host\"\nsha256 = \"00ff\"\n");
        let descriptor = PackageDescriptor::load_from_str_for_test(dir.path(), &bad);
        assert!(matches!(
            descriptor.status.issues.as_slice(),
            [IntegrityIssue::DigestMismatch { .. }]
        ));
    }

    #[test]
    fn executable_escaping_the_package_is_rejected() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("pkg");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("elsewhere"), b"x").unwrap();

        let text = manifest("[launch]\nexecutable = \"../elsewhere\"\n");
        let descriptor = PackageDescriptor::load_from_str_for_test(&root, &text);
        assert!(matches!(
            descriptor.status.issues.as_slice(),
            [IntegrityIssue::OutsidePackage { .. }]
        ));
    }

    #[test]
    fn removed_package_never_verifies() {
        let descriptor = PackageDescriptor::parse("/p", &manifest(""), CONTRACT)
            .unwrap()
            .into_removed();
        assert!(!descriptor.status.verify_is_ok());
        assert!(!descriptor.status.is_offline());
    }

    impl PackageDescriptor {
        fn load_from_str_for_test(root: &Path, text: &str) -> Self {
            fs::write(root.join(MANIFEST_FILE_NAME), text).unwrap();
            Self::load(root, CONTRACT).unwrap()
        }
    }
}
