use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exthost_core::{init_logging, AppDirs, Config};
use exthost_ipc::{Progress, ProgressCallback, WorkRequest};
use exthost_manager::{ExtensionEvent, ExtensionId, ExtensionInfo, ExtensionManager};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Parser)]
#[command(name = "exthost", version, about = "Discovers and drives out-of-process extensions")]
struct Cli {
    /// Package directory override (takes precedence over config)
    #[arg(long, global = true)]
    packages_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List installed extensions and their status
    List {
        /// Print extension info as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send one work request to an extension and print the result
    Invoke(InvokeCommand),
    /// Load extensions and print lifecycle events until interrupted
    Watch,
}

#[derive(Debug, Parser, Clone)]
struct InvokeCommand {
    /// Extension id, or an unambiguous package or extension id suffix
    extension: String,
    /// Operation name understood by the extension
    operation: String,
    /// JSON arguments for the operation
    #[arg(long, default_value = "null")]
    args: String,
}

#[derive(Debug, Error)]
enum SelectorError {
    #[error("no installed extension matches '{0}'")]
    NotFound(String),
    #[error("'{query}' matches several extensions: {}", candidates.join(", "))]
    Ambiguous {
        query: String,
        candidates: Vec<String>,
    },
    #[error("--args is not valid JSON: {0}")]
    Arguments(#[from] serde_json::Error),
}

impl InvokeCommand {
    fn request(&self) -> Result<WorkRequest, SelectorError> {
        let arguments: Value = serde_json::from_str(&self.args)?;
        Ok(WorkRequest::new(self.operation.clone(), arguments))
    }
}

/// Matches `query` against full ids first, then against the extension and
/// package parts of each id.
fn resolve_extension(infos: &[ExtensionInfo], query: &str) -> Result<ExtensionId, SelectorError> {
    if let Some(info) = infos.iter().find(|info| info.id.as_str() == query) {
        return Ok(info.id.clone());
    }

    let matches: Vec<&ExtensionInfo> = infos
        .iter()
        .filter(|info| {
            let extension_part = info.id.as_str().rsplit('!').next();
            extension_part == Some(query) || info.package_id == query
        })
        .collect();

    match matches.as_slice() {
        [] => Err(SelectorError::NotFound(query.to_string())),
        [only] => Ok(only.id.clone()),
        many => Err(SelectorError::Ambiguous {
            query: query.to_string(),
            candidates: many.iter().map(|info| info.id.to_string()).collect(),
        }),
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    if let Some(dir) = cli.packages_dir {
        config.extensions.packages_dir = Some(dir);
    }
    let _logging = init_logging(&config.logging, &dirs)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(cli.command, &config, &dirs))
}

async fn run(command: Command, config: &Config, dirs: &AppDirs) -> Result<ExitCode> {
    let manager = ExtensionManager::from_config(config, dirs);
    tracing::info!(
        packages_dir = %config.extensions.packages_dir(dirs).display(),
        "Starting extension host"
    );

    let code = match command {
        Command::List { json } => {
            manager.load_installed().await?;
            print_extensions(&manager.infos(), json)?;
            ExitCode::SUCCESS
        }
        Command::Invoke(invoke) => {
            let request = invoke.request()?;
            manager.load_installed().await?;
            let id = resolve_extension(&manager.infos(), &invoke.extension)?;

            let progress: ProgressCallback = Arc::new(|p: &Progress| match &p.message {
                Some(message) => eprintln!("[{:>3}%] {message}", p.percentage),
                None => eprintln!("[{:>3}%]", p.percentage),
            });
            let outcome = manager.invoke(&id, request, Some(progress)).await;
            match outcome.into_result() {
                Ok(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    ExitCode::SUCCESS
                }
                Err(failure) => {
                    eprintln!("{id}: {failure}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Watch => {
            let events = manager.subscribe();
            let loaded = manager.start().await?;
            println!("{loaded} extension(s) loaded; watching for changes (Ctrl-C to stop)");
            watch_events(events).await;
            ExitCode::SUCCESS
        }
    };

    manager.shutdown().await;
    Ok(code)
}

async fn watch_events(mut events: broadcast::Receiver<ExtensionEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", describe_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "Failed to listen for Ctrl-C");
                }
                break;
            }
        }
    }
}

fn describe_event(event: &ExtensionEvent) -> String {
    match event {
        ExtensionEvent::Added(info) => format!("added    {} ({})", info.id, info.status),
        ExtensionEvent::Updated(info) => format!("updated  {} ({})", info.id, info.status),
        ExtensionEvent::Removed(id) => format!("removed  {id}"),
        ExtensionEvent::StateChanged { id, status, visible } => {
            let shown = if *visible { "visible" } else { "hidden" };
            format!("state    {id} -> {status}, {shown}")
        }
    }
}

fn print_extensions(infos: &[ExtensionInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(infos)?);
        return Ok(());
    }

    if infos.is_empty() {
        println!("No extensions installed.");
        return Ok(());
    }

    for info in infos {
        let service = info.service.as_deref().unwrap_or("(none)");
        println!("{} [{}]", info.id, info.status);
        println!("  name: {}", info.display_name);
        println!("  service: {service}");
        for issue in &info.issues {
            println!("  issue: {issue}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use exthost_manager::ExtensionStatus;

    fn info(id: &str, package_id: &str) -> ExtensionInfo {
        ExtensionInfo {
            id: ExtensionId::from(id),
            package_id: package_id.to_string(),
            version: None,
            publisher: None,
            display_name: id.to_string(),
            description: None,
            logo: None,
            service: Some("svc".into()),
            root: PathBuf::from("/tmp"),
            status: ExtensionStatus::Loaded,
            enabled: true,
            visible: true,
            issues: Vec::new(),
        }
    }

    #[test]
    fn full_id_wins_over_suffix() {
        let infos = vec![info("a/app!b", "a"), info("b/app!a", "b")];
        let id = resolve_extension(&infos, "a/app!b").expect("exact id should resolve");
        assert_eq!(id.as_str(), "a/app!b");
    }

    #[test]
    fn extension_or_package_part_resolves_when_unique() {
        let infos = vec![info("tools/app!hash", "tools"), info("media/app!probe", "media")];
        assert_eq!(resolve_extension(&infos, "hash").unwrap().as_str(), "tools/app!hash");
        assert_eq!(resolve_extension(&infos, "media").unwrap().as_str(), "media/app!probe");
    }

    #[test]
    fn ambiguous_and_missing_queries_fail() {
        let infos = vec![info("one/app!stat", "one"), info("two/app!stat", "two")];
        let err = resolve_extension(&infos, "stat").expect_err("two candidates");
        match err {
            SelectorError::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let err = resolve_extension(&infos, "nope").expect_err("no candidates");
        assert!(matches!(err, SelectorError::NotFound(_)));
    }

    #[test]
    fn invoke_arguments_must_be_json() {
        let cli = Cli::try_parse_from([
            "exthost",
            "invoke",
            "filestat",
            "stat",
            "--args",
            r#"{"path": "/tmp"}"#,
        ])
        .expect("arguments should parse");
        let Command::Invoke(invoke) = cli.command else {
            panic!("expected invoke command");
        };
        let request = invoke.request().expect("valid json");
        assert_eq!(request.operation, "stat");
        assert_eq!(request.arguments["path"], "/tmp");

        let bad = InvokeCommand {
            extension: "filestat".into(),
            operation: "stat".into(),
            args: "{path".into(),
        };
        assert!(matches!(bad.request(), Err(SelectorError::Arguments(_))));
    }

    #[test]
    fn packages_dir_is_global() {
        let cli = Cli::try_parse_from(["exthost", "list", "--packages-dir", "/opt/ext", "--json"])
            .expect("global flag after subcommand");
        assert_eq!(cli.packages_dir, Some(PathBuf::from("/opt/ext")));
        assert!(matches!(cli.command, Command::List { json: true }));
    }

    #[test]
    fn state_events_describe_visibility() {
        let event = ExtensionEvent::StateChanged {
            id: ExtensionId::from("p/a!e"),
            status: ExtensionStatus::Offline,
            visible: false,
        };
        assert!(describe_event(&event).ends_with("hidden"));
    }
}
