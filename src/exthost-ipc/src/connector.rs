//! Service addressing and establishing raw channels to extension host processes.

use async_trait::async_trait;
use exthost_core::{AppDirs, IpcConfig};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::frame::FrameChannel;
#[cfg(any(unix, windows))]
use crate::frame::StreamChannel;

/// Environment variable carrying the endpoint address to a launched host process.
pub const ENDPOINT_ENV: &str = "EXTHOST_ENDPOINT";

const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Logical address of an extension's message channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    package_id: String,
    service: String,
}

impl Endpoint {
    pub fn new(package_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            service: service.into(),
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Platform address: a socket file under `socket_dir` on Unix, a named pipe on Windows.
    pub fn address(&self, socket_dir: &Path) -> String {
        let name = format!(
            "{}.{}",
            sanitize_component(&self.package_id),
            sanitize_component(&self.service)
        );
        #[cfg(windows)]
        {
            let _ = socket_dir;
            format!(r"\\.\pipe\exthost.{name}")
        }
        #[cfg(not(windows))]
        {
            socket_dir
                .join(format!("{name}.sock"))
                .to_string_lossy()
                .into_owned()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package_id, self.service)
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// How to start a host process that is not already listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Path to the host executable.
    pub executable: PathBuf,
    /// Arguments passed before `--endpoint <address>`.
    pub args: Vec<String>,
    /// Working directory for the host process.
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set for the host process.
    pub env: Vec<(String, String)>,
}

/// Everything needed to reach one extension service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub endpoint: Endpoint,
    pub launch: Option<LaunchSpec>,
}

/// A freshly established channel, plus the host process if this connector launched it.
pub struct ConnectedChannel {
    pub channel: Box<dyn FrameChannel>,
    pub process: Option<Child>,
}

impl ConnectedChannel {
    pub fn new(channel: Box<dyn FrameChannel>) -> Self {
        Self {
            channel,
            process: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("no host is listening at {address}: {source}")]
    Unreachable {
        address: String,
        source: std::io::Error,
    },
    #[error("failed to prepare socket directory {path}: {source}")]
    SocketDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn host process {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },
    #[error("host process {executable} exited before listening ({status})")]
    ProcessExited { executable: PathBuf, status: String },
    #[error("host process did not listen at {address} within {waited:?}: {source}")]
    NoListener {
        address: String,
        waited: Duration,
        source: std::io::Error,
    },
    #[error("connections to {0} are refused")]
    Refused(String),
}

/// Opens raw channels to extension services.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ServiceTarget) -> Result<ConnectedChannel, ConnectorError>;
}

/// Connects over Unix domain sockets or Windows named pipes, launching the host on demand.
#[derive(Debug, Clone)]
pub struct LocalSocketConnector {
    socket_dir: PathBuf,
    open_timeout: Duration,
    buffer_size: usize,
}

impl LocalSocketConnector {
    pub fn new(socket_dir: impl Into<PathBuf>, open_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            open_timeout,
            buffer_size,
        }
    }

    pub fn from_config(config: &IpcConfig, dirs: &AppDirs) -> Self {
        Self::new(
            config.socket_dir(dirs),
            config.open_timeout(),
            config.buffer_size,
        )
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    async fn launch_and_dial(
        &self,
        launch: &LaunchSpec,
        address: &str,
    ) -> Result<ConnectedChannel, ConnectorError> {
        #[cfg(not(windows))]
        tokio::fs::create_dir_all(&self.socket_dir)
            .await
            .map_err(|source| ConnectorError::SocketDir {
                path: self.socket_dir.clone(),
                source,
            })?;

        let mut child = spawn_host(launch, address)?;
        tracing::debug!(
            executable = %launch.executable.display(),
            address,
            "Launched extension host process"
        );

        let started = Instant::now();
        loop {
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ConnectorError::ProcessExited {
                    executable: launch.executable.clone(),
                    status: status.to_string(),
                });
            }
            match dial(address, self.buffer_size).await {
                Ok(channel) => {
                    return Ok(ConnectedChannel {
                        channel,
                        process: Some(child),
                    })
                }
                Err(_) if started.elapsed() < self.open_timeout => continue,
                Err(source) => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(error = %err, "Failed to kill unresponsive host process");
                    }
                    return Err(ConnectorError::NoListener {
                        address: address.to_string(),
                        waited: self.open_timeout,
                        source,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Connector for LocalSocketConnector {
    async fn connect(&self, target: &ServiceTarget) -> Result<ConnectedChannel, ConnectorError> {
        let address = target.endpoint.address(&self.socket_dir);
        let first_error = match dial(&address, self.buffer_size).await {
            Ok(channel) => return Ok(ConnectedChannel::new(channel)),
            Err(err) => err,
        };

        match &target.launch {
            Some(launch) => self.launch_and_dial(launch, &address).await,
            None => Err(ConnectorError::Unreachable {
                address,
                source: first_error,
            }),
        }
    }
}

fn spawn_host(launch: &LaunchSpec, address: &str) -> Result<Child, ConnectorError> {
    let mut cmd = Command::new(&launch.executable);
    cmd.args(&launch.args)
        .arg("--endpoint")
        .arg(address)
        .env(ENDPOINT_ENV, address)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if let Some(ref dir) = launch.working_dir {
        cmd.current_dir(dir);
    }

    for (key, value) in &launch.env {
        cmd.env(key, value);
    }

    cmd.spawn().map_err(|source| ConnectorError::Spawn {
        executable: launch.executable.clone(),
        source,
    })
}

#[cfg(unix)]
async fn dial(address: &str, buffer_size: usize) -> std::io::Result<Box<dyn FrameChannel>> {
    let stream = tokio::net::UnixStream::connect(address).await?;
    Ok(Box::new(StreamChannel::new(stream, buffer_size)))
}

#[cfg(windows)]
async fn dial(address: &str, buffer_size: usize) -> std::io::Result<Box<dyn FrameChannel>> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(address)?;
    Ok(Box::new(StreamChannel::new(client, buffer_size)))
}

#[cfg(not(any(unix, windows)))]
async fn dial(address: &str, _buffer_size: usize) -> std::io::Result<Box<dyn FrameChannel>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("local sockets are not available on this platform ({address})"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display_names_package_and_service() {
        let endpoint = Endpoint::new("com.example.filestat", "filestat-service");
        assert_eq!(endpoint.to_string(), "com.example.filestat/filestat-service");
    }

    #[test]
    #[cfg(unix)]
    fn unix_address_is_socket_file_under_dir() {
        let endpoint = Endpoint::new("com.example/evil", "svc name");
        let address = endpoint.address(Path::new("/run/exthost"));
        assert_eq!(address, "/run/exthost/com.example_evil.svc_name.sock");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn connect_without_listener_or_launch_is_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = LocalSocketConnector::new(tmp.path(), Duration::from_millis(200), 2048);
        let target = ServiceTarget {
            endpoint: Endpoint::new("pkg", "svc"),
            launch: None,
        };
        let err = connector.connect(&target).await.err().expect("should fail");
        assert!(matches!(err, ConnectorError::Unreachable { .. }));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn connect_reaches_existing_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = LocalSocketConnector::new(tmp.path(), Duration::from_millis(200), 2048);
        let endpoint = Endpoint::new("pkg", "svc");
        let listener = tokio::net::UnixListener::bind(endpoint.address(tmp.path())).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let target = ServiceTarget {
            endpoint,
            launch: None,
        };
        let connected = connector.connect(&target).await.expect("should connect");
        assert!(connected.process.is_none());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn launched_process_that_never_listens_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = LocalSocketConnector::new(tmp.path(), Duration::from_millis(200), 2048);
        let target = ServiceTarget {
            endpoint: Endpoint::new("pkg", "svc"),
            launch: Some(LaunchSpec {
                executable: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), "sleep 5".into(), "sh".into()],
                working_dir: None,
                env: vec![],
            }),
        };
        let err = connector.connect(&target).await.err().expect("should fail");
        assert!(matches!(err, ConnectorError::NoListener { .. }));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn missing_executable_fails_to_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = LocalSocketConnector::new(tmp.path(), Duration::from_millis(200), 2048);
        let target = ServiceTarget {
            endpoint: Endpoint::new("pkg", "svc"),
            launch: Some(LaunchSpec {
                executable: tmp.path().join("does-not-exist"),
                args: vec![],
                working_dir: None,
                env: vec![],
            }),
        };
        let err = connector.connect(&target).await.err().expect("should fail");
        assert!(matches!(err, ConnectorError::Spawn { .. }));
    }
}
