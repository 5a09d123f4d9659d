use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ds_client::MemoryServer;
use dsflow::{
    config::{ConfigManager, EnvConfigManager},
    connection::ConnectionManager,
    flow::{Flow, FlowRuntime, load_flow_from_file},
    logger::{LogConfig, init_tracing},
    status::TracingReporter,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dsflow", about = "Records, events and RPCs as flow steps", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow until Ctrl-C
    Run(RunArgs),
    /// Check a flow file without running it
    Validate { flow: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    flow: PathBuf,

    /// Log filter directive (e.g. error, warn, info, debug, dsflow=trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rolling log files and the request report here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// `.env` file holding DS_USER / DS_PASSWORD
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { flow } => {
            load_flow_from_file(&flow).with_context(|| format!("invalid flow {}", flow.display()))?;
            println!("✅ Flow file is valid.");
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&LogConfig::new(args.log_level, args.log_dir))?;

    let mut flow = load_flow_from_file(&args.flow).with_context(|| format!("loading {}", args.flow.display()))?;
    let config = ConfigManager(EnvConfigManager::new(args.env_file));
    flow.resolve_credentials(&config).await;

    // The in-process backend is the only transport compiled in.
    for (server, url) in configured_urls(&flow) {
        warn!(%server, %url, "no network transport available, using the in-process memory backend instead");
    }
    let backend = MemoryServer::new();
    let connections = ConnectionManager::new(Arc::new(backend));
    let runtime = match FlowRuntime::start(flow, &connections, Arc::new(TracingReporter)).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start flow: {e}");
            return Err(e.into());
        }
    };

    info!(flow = %runtime.id(), "running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    runtime.shutdown().await;
    connections.shutdown().await;
    Ok(())
}

/// `(server id, url)` of every server the flow names, ordered by id.
fn configured_urls(flow: &Flow) -> Vec<(String, String)> {
    let mut urls: Vec<(String, String)> =
        flow.servers().values().map(|s| (s.id.clone(), s.url())).collect();
    urls.sort();
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_the_urls_the_memory_backend_stands_in_for() {
        let yaml = "id: f\nservers:\n  b:\n    host: ds.b\n  a:\n    host: ds.a\n    port: 7000\n";
        let flow: Flow = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(
            configured_urls(&flow),
            vec![("a".to_string(), "ds.a:7000".to_string()), ("b".to_string(), "ds.b:6020".to_string())]
        );
    }
}
