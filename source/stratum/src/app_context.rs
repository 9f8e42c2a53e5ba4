use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;

use crate::api::auth::AllowAll;
use crate::api::{ApiStatus, GetRequest, LogLevel};
use crate::fswatch::ConfigWatcher;
use crate::render::ElementSer;
use crate::scheduler::{self, GcPeriods, GcWindows};
use crate::service::Service;

#[derive(Debug, Parser)]
#[command(name = "stratum", version, about = "Hierarchical configuration service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label '{raw}' must look like key=value"))
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service: periodic GC plus, optionally, filesystem-driven
    /// reloads of every registered namespace.
    Serve {
        /// Re-index namespaces when their files change on disk.
        #[arg(long)]
        watch: bool,
        /// Worker threads for the runtime; defaults to the CPU count.
        #[arg(long)]
        threads: Option<usize>,
        /// How long an unused merged config stays cached.
        #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
        merged_config_window: Duration,
        /// How long an idle, unwatched namespace stays indexed.
        #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
        namespace_window: Duration,
        /// How long deprecated versions stay resolvable.
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        version_window: Duration,
    },
    /// Resolve one document and print it as YAML.
    Get {
        /// Namespace root path.
        #[arg(long)]
        root: PathBuf,
        /// Document name.
        #[arg(long)]
        document: String,
        /// Request labels, repeatable: --label env=prod
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Flavor suffixes to layer in, repeatable.
        #[arg(long = "flavor")]
        flavors: Vec<String>,
        /// Version to pin; 0 is the current one.
        #[arg(long, default_value_t = 0)]
        version: u32,
        /// Template document to render instead of printing the element.
        #[arg(long)]
        template: Option<String>,
    },
}

pub struct AppContext {
    service: Service,
    windows: GcWindows,
    watch: bool,
}

impl AppContext {
    pub fn bootstrap(watch: bool, windows: GcWindows) -> AppContext {
        let service = Service::new(Arc::new(AllowAll));
        AppContext {
            service,
            windows,
            watch,
        }
    }

    pub fn service(&self) -> Service {
        self.service.clone()
    }

    /// Run until ctrl-c: the GC time wheel always, the filesystem watcher
    /// when asked for.
    pub async fn run(self) -> miette::Result<()> {
        let scheduler = scheduler::spawn(
            Arc::clone(self.service.registry()),
            GcPeriods::default(),
            self.windows.clone(),
        );

        let watcher = if self.watch {
            let mut watcher = ConfigWatcher::new(self.service.clone());
            Some(tokio::spawn(async move {
                if let Err(err) = watcher.watch().await {
                    tracing::error!("filesystem watcher stopped: {err}");
                }
            }))
        } else {
            None
        };

        tracing::info!("service running (pid {})", std::process::id());
        tokio::signal::ctrl_c().await.into_diagnostic()?;
        tracing::info!("shutting down");

        scheduler.abort();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        Ok(())
    }
}

/// One-shot resolve for the `get` subcommand.
pub async fn run_get(
    root: PathBuf,
    document: String,
    labels: Vec<(String, String)>,
    flavors: Vec<String>,
    version: u32,
    template: Option<String>,
) -> miette::Result<()> {
    let rendered = template.is_some();
    let service = Service::new(Arc::new(AllowAll));
    let response = service
        .get(GetRequest {
            root_path: root,
            labels: stratum_model::Labels::new(labels),
            document,
            flavors,
            version,
            template,
            log_level: LogLevel::Warn,
            with_position: false,
            token: None,
        })
        .await;

    for entry in &response.logs {
        tracing::warn!("{}", entry.message);
    }
    if response.status != ApiStatus::Ok {
        return Err(miette::miette!("request failed: {:?}", response.status));
    }

    if rendered {
        if let Some(payload) = &response.payload {
            print!("{}", String::from_utf8_lossy(payload));
        }
    } else if let Some(element) = &response.element {
        let out = serde_yaml::to_string(&ElementSer(element)).into_diagnostic()?;
        print!("{out}");
    }
    tracing::info!(
        version = response.version,
        checksum = %hex32(&response.checksum),
        "resolved"
    );
    Ok(())
}

fn hex32(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
