use async_trait::async_trait;
use exthost_ipc::{
    serve_channel, ConnectedChannel, ConnectionStatus, Connector, ConnectorError, HandlerError,
    HostError, Progress, ProgressReporter, ServeExit, ServiceTarget, StreamChannel,
    TransportLimits, WorkHandler, WorkRequest,
};
use exthost_manager::{
    DirectoryPackageSource, ExtensionEvent, ExtensionId, ExtensionManager, ExtensionStatus,
    IntegrityIssue, InvokeFailure, InvokeOutcome, ManagerOptions, MemoryPackageSource,
    PackageDescriptor, PackageEvent, PackageSource, MANIFEST_FILE_NAME,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CONTRACT: &str = "exthost.tool";

/// Adds numbers, reporting progress once per operand.
struct Adder;

#[async_trait]
impl WorkHandler for Adder {
    async fn handle(
        &self,
        request: WorkRequest,
        progress: ProgressReporter,
    ) -> Result<Value, HandlerError> {
        if request.operation != "add" {
            return Err(HandlerError::UnknownOperation(request.operation));
        }
        let operands = request
            .arguments
            .get("operands")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::InvalidArguments("operands".into()))?;
        let mut sum = 0.0;
        for (i, operand) in operands.iter().enumerate() {
            sum += operand.as_f64().unwrap_or(0.0);
            progress.report(((i + 1) * 100 / operands.len()) as u8, None);
        }
        Ok(json!(sum))
    }
}

/// Serves every connection with an in-process host over `tokio::io::duplex`.
#[derive(Default)]
struct InProcessConnector {
    connects: AtomicUsize,
    hosts: Mutex<Vec<JoinHandle<Result<ServeExit, HostError>>>>,
}

impl InProcessConnector {
    fn hosts(&self) -> Vec<JoinHandle<Result<ServeExit, HostError>>> {
        std::mem::take(&mut *self.hosts.lock())
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self, _target: &ServiceTarget) -> Result<ConnectedChannel, ConnectorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let limits = TransportLimits::default();
        let (near, far) = tokio::io::duplex(16 * 1024);
        self.hosts.lock().push(tokio::spawn(serve_channel(
            Box::new(StreamChannel::new(far, limits.buffer_size)),
            Arc::new(Adder),
            limits,
        )));
        Ok(ConnectedChannel::new(Box::new(StreamChannel::new(
            near,
            limits.buffer_size,
        ))))
    }
}

fn manifest(name: &str, display_name: &str) -> String {
    format!(
        "contract = \"{CONTRACT}\"\n\n[package]\nid = \"com.example.{name}\"\napp_id = \"App\"\n\n[extension]\nid = \"{name}\"\ndisplay_name = \"{display_name}\"\n\n[properties]\nService = \"{name}-service\"\n"
    )
}

fn descriptor(name: &str, display_name: &str) -> PackageDescriptor {
    PackageDescriptor::parse(
        PathBuf::from("/packages").join(name),
        &manifest(name, display_name),
        CONTRACT,
    )
    .unwrap()
}

fn no_watch() -> ManagerOptions {
    ManagerOptions {
        watch: false,
        ..ManagerOptions::default()
    }
}

fn setup(
    packages: Vec<PackageDescriptor>,
) -> (
    Arc<ExtensionManager>,
    Arc<MemoryPackageSource>,
    Arc<InProcessConnector>,
) {
    let source = Arc::new(MemoryPackageSource::new(packages));
    let connector = Arc::new(InProcessConnector::default());
    let manager = ExtensionManager::new(source.clone(), connector.clone(), no_watch());
    (manager, source, connector)
}

fn drain(rx: &mut broadcast::Receiver<ExtensionEvent>) -> Vec<ExtensionEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn add(operands: &[f64]) -> WorkRequest {
    WorkRequest::new("add", json!({ "operands": operands }))
}

#[tokio::test]
async fn discovered_package_loads_then_goes_offline() {
    let (manager, _, _) = setup(vec![descriptor("alpha", "Alpha")]);
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let id = ExtensionId::from("com.example.alpha/App!alpha");
    let alpha = manager.get(&id).unwrap();
    assert_eq!(alpha.status(), ExtensionStatus::Loaded);
    assert!(alpha.is_visible());
    let seen = drain(&mut events);
    assert!(matches!(&seen[0], ExtensionEvent::Added(info) if info.status == ExtensionStatus::Unloaded));
    assert_eq!(
        seen[1],
        ExtensionEvent::StateChanged {
            id: id.clone(),
            status: ExtensionStatus::Loaded,
            visible: true
        }
    );

    let mut tampered = descriptor("alpha", "Alpha");
    tampered.status.issues.push(IntegrityIssue::DigestMismatch {
        expected: "00".into(),
        actual: "ff".into(),
    });
    manager.on_package_status_changed(tampered).await;

    assert_eq!(alpha.status(), ExtensionStatus::Offline);
    assert!(!alpha.is_visible());
    assert!(alpha.is_enabled());
    assert_eq!(
        drain(&mut events),
        vec![ExtensionEvent::StateChanged {
            id: id.clone(),
            status: ExtensionStatus::Offline,
            visible: false
        }]
    );

    manager
        .on_package_status_changed(descriptor("alpha", "Alpha"))
        .await;
    assert_eq!(alpha.status(), ExtensionStatus::Loaded);
}

#[tokio::test]
async fn invoke_while_unloaded_makes_no_connection() {
    let (manager, _, connector) = setup(vec![descriptor("alpha", "Alpha")]);
    manager.start().await.unwrap();
    let alpha = manager.get(&ExtensionId::from("com.example.alpha/App!alpha")).unwrap();
    alpha.unload().await;
    assert_eq!(alpha.status(), ExtensionStatus::Unloaded);

    let outcome = alpha.invoke(add(&[1.0, 2.0]), None).await;
    assert_eq!(outcome, InvokeOutcome::Failed(InvokeFailure::NotLoaded));
    assert!(outcome.as_f64().is_nan());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invoke_reuses_one_connection_and_reports_progress() {
    let (manager, _, connector) = setup(vec![descriptor("alpha", "Alpha")]);
    manager.start().await.unwrap();
    let id = ExtensionId::from("com.example.alpha/App!alpha");

    let progress = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = progress.clone();
    let outcome = manager
        .invoke(
            &id,
            add(&[1.0, 2.0, 3.5, 4.0]),
            Some(Arc::new(move |update: &Progress| sink.lock().push(update.percentage))),
        )
        .await;
    assert_eq!(outcome.as_f64(), 10.5);
    assert_eq!(*progress.lock(), vec![25, 50, 75, 100]);

    let outcome = manager.invoke(&id, add(&[2.0]), None).await;
    assert_eq!(outcome, InvokeOutcome::Completed(json!(2.0)));

    let outcome = manager
        .invoke(&id, WorkRequest::new("divide", Value::Null), None)
        .await;
    assert!(matches!(outcome, InvokeOutcome::Failed(InvokeFailure::Remote(_))));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    let alpha = manager.get(&id).unwrap();
    assert_eq!(alpha.connection_status(), Some(ConnectionStatus::Open));
}

#[tokio::test]
async fn concurrent_invocations_are_serialized() {
    let (manager, _, connector) = setup(vec![descriptor("alpha", "Alpha")]);
    manager.start().await.unwrap();
    let id = ExtensionId::from("com.example.alpha/App!alpha");

    let calls = (0..8).map(|i| {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.invoke(&id, add(&[i as f64, 1.0]), None).await })
    });
    for (i, call) in calls.collect::<Vec<_>>().into_iter().enumerate() {
        assert_eq!(call.await.unwrap().as_f64(), i as f64 + 1.0);
    }
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_closes_connection_and_reloads_once() {
    let (manager, source, connector) = setup(vec![descriptor("alpha", "Alpha")]);
    manager.start().await.unwrap();
    let id = ExtensionId::from("com.example.alpha/App!alpha");
    assert!(manager.invoke(&id, add(&[1.0]), None).await.is_completed());
    let first_host = connector.hosts().remove(0);

    let mut events = manager.subscribe();
    source.publish(PackageEvent::Updated(descriptor("alpha", "Alpha Two")));
    manager
        .on_package_updated(descriptor("alpha", "Alpha Two"))
        .await;

    assert_eq!(first_host.await.unwrap().unwrap(), ServeExit::Shutdown);
    assert_eq!(manager.len(), 1);
    let alpha = manager.get(&id).unwrap();
    assert_eq!(alpha.status(), ExtensionStatus::Loaded);
    assert_eq!(alpha.info().display_name, "Alpha Two");
    assert!(alpha.connection_status().is_none());

    let seen = drain(&mut events);
    let loaded = seen
        .iter()
        .filter(|event| {
            matches!(
                event,
                ExtensionEvent::StateChanged {
                    status: ExtensionStatus::Loaded,
                    ..
                }
            )
        })
        .count();
    assert_eq!(loaded, 1);
    assert!(matches!(seen.last(), Some(ExtensionEvent::Updated(info)) if info.status == ExtensionStatus::Loaded));

    assert!(manager.invoke(&id, add(&[1.0]), None).await.is_completed());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn uninstall_closes_connection_and_removes() {
    let (manager, _, connector) = setup(vec![descriptor("alpha", "Alpha"), descriptor("beta", "Beta")]);
    manager.start().await.unwrap();
    let id = ExtensionId::from("com.example.alpha/App!alpha");
    assert!(manager.invoke(&id, add(&[1.0]), None).await.is_completed());

    manager
        .on_package_uninstalling(descriptor("alpha", "Alpha").into_removed())
        .await;
    assert_eq!(
        connector.hosts().remove(0).await.unwrap().unwrap(),
        ServeExit::Shutdown
    );
    assert!(manager.get(&id).is_none());
    assert_eq!(manager.len(), 1);

    let outcome = manager.invoke(&id, add(&[1.0]), None).await;
    assert_eq!(outcome, InvokeOutcome::Failed(InvokeFailure::NotLoaded));
}

#[tokio::test]
async fn shutdown_unloads_everything() {
    let (manager, _, _) = setup(vec![descriptor("alpha", "Alpha"), descriptor("beta", "Beta")]);
    manager.start().await.unwrap();
    manager.shutdown().await;
    assert!(manager
        .extensions()
        .iter()
        .all(|ext| ext.status() == ExtensionStatus::Unloaded && !ext.is_visible()));
}

#[tokio::test]
async fn watched_directory_drives_the_manager() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(DirectoryPackageSource::new(
        tmp.path(),
        CONTRACT,
        Duration::from_millis(50),
    ));
    assert!(source.list_packages().await.unwrap().is_empty());

    let manager = ExtensionManager::new(
        source,
        Arc::new(InProcessConnector::default()),
        ManagerOptions {
            watch: true,
            ..ManagerOptions::default()
        },
    );
    let mut events = manager.subscribe();
    assert_eq!(manager.start().await.unwrap(), 0);

    let pkg = tmp.path().join("alpha");
    std::fs::create_dir_all(&pkg).unwrap();
    std::fs::write(pkg.join(MANIFEST_FILE_NAME), manifest("alpha", "Alpha")).unwrap();

    let id = ExtensionId::from("com.example.alpha/App!alpha");
    let loaded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ExtensionEvent::StateChanged {
                    status: ExtensionStatus::Loaded,
                    id: loaded,
                    ..
                }) => break loaded,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("extension loaded from watched directory");
    assert_eq!(loaded, id);

    std::fs::remove_dir_all(&pkg).unwrap();
    let removed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ExtensionEvent::Removed(removed)) = events.recv().await {
                break removed;
            }
        }
    })
    .await
    .expect("extension removed after its directory was deleted");
    assert_eq!(removed, id);
    assert!(manager.is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn discovery_between_delete_and_rescan_keeps_the_uninstall() {
    let tmp = tempfile::tempdir().unwrap();
    let pkg = tmp.path().join("alpha");
    std::fs::create_dir_all(&pkg).unwrap();
    std::fs::write(pkg.join(MANIFEST_FILE_NAME), manifest("alpha", "Alpha")).unwrap();

    let manager = ExtensionManager::new(
        Arc::new(DirectoryPackageSource::new(
            tmp.path(),
            CONTRACT,
            Duration::from_millis(300),
        )),
        Arc::new(InProcessConnector::default()),
        ManagerOptions {
            watch: true,
            ..ManagerOptions::default()
        },
    );
    let mut events = manager.subscribe();
    assert_eq!(manager.start().await.unwrap(), 1);
    let id = ExtensionId::from("com.example.alpha/App!alpha");
    assert_eq!(manager.get(&id).unwrap().status(), ExtensionStatus::Loaded);

    std::fs::remove_dir_all(&pkg).unwrap();
    // Lands inside the debounce window, before the watcher rescans.
    assert!(manager.discover().await.unwrap().is_empty());

    let removed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ExtensionEvent::Removed(removed)) = events.recv().await {
                break removed;
            }
        }
    })
    .await
    .expect("uninstall still reported after an intervening discovery");
    assert_eq!(removed, id);
    assert!(manager.is_empty());
    manager.shutdown().await;
}
