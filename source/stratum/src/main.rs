use clap::Parser;
use tokio::runtime::Builder;

use stratum::app_context::{AppContext, Cli, Command};
use stratum::scheduler::GcWindows;

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_thread_ids(true).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            watch,
            threads,
            merged_config_window,
            namespace_window,
            version_window,
        } => {
            let mut builder = Builder::new_multi_thread();
            builder.enable_all();
            builder.worker_threads(threads.unwrap_or_else(num_cpus::get));
            let rt = builder.build().expect("Failed to build Tokio runtime");

            let windows = GcWindows {
                merged_configs: merged_config_window.as_secs(),
                namespaces: namespace_window.as_secs(),
                versions: version_window.as_secs(),
            };
            let ctx = AppContext::bootstrap(watch, windows);
            rt.block_on(ctx.run())
        }
        Command::Get {
            root,
            document,
            labels,
            flavors,
            version,
            template,
        } => {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to build Tokio runtime");
            rt.block_on(stratum::app_context::run_get(
                root, document, labels, flavors, version, template,
            ))
        }
    }
}
