//! localfwd - forward local ports to remote services
//!
//! Starts one proxy session per forward, reports their status periodically and
//! tears everything down on Ctrl+C.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config_file, ConfigFile, ForwardSpec};
use localfwd_proxy::{ProxyManager, ProxyResponse};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// localfwd - Forward local TCP ports to remote services
#[derive(Parser, Debug)]
#[command(name = "localfwd")]
#[command(about = "localfwd - Forward local TCP ports to remote services")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter (trace, debug, info, warn, error or a full EnvFilter directive)
    #[arg(long, global = true, env = "LOCALFWD_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen on local ports and forward every connection to a remote endpoint
    #[command(long_about = r#"
Listen on local ports and forward every accepted connection to a remote
endpoint. Runs until Ctrl+C, then stops all forwards.

EXAMPLES:
  # Forward a random free local port to a database
  localfwd forward -L 10.0.0.5:5432

  # Pin the local port and label the forward
  localfwd forward -L 15432:10.0.0.5:5432 --project demo --service db

  # Start every forward listed in a config file
  localfwd forward --config forwards.yaml --json

ENVIRONMENT VARIABLES:
  LOCALFWD_CONFIG        Configuration file (YAML)
  LOCALFWD_LOG           Log filter
"#)]
    Forward {
        /// Forward spec, may be repeated
        #[arg(short = 'L', long = "forward", value_name = "[LOCAL:]HOST:PORT")]
        forwards: Vec<String>,

        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "LOCALFWD_CONFIG")]
        config: Option<PathBuf>,

        /// Project label attached to every forward
        #[arg(long)]
        project: Option<String>,

        /// Service label attached to every forward
        #[arg(long)]
        service: Option<String>,

        /// Interface to listen on
        #[arg(long)]
        bind_host: Option<String>,

        /// Remote dial timeout in seconds
        #[arg(long)]
        dial_timeout: Option<u64>,

        /// Print started proxies and status snapshots as JSON
        #[arg(long)]
        json: bool,

        /// Seconds between status reports (0 disables)
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level: {}", level))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" })),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn print_started(proxy: &ProxyResponse, bind_host: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(proxy)?);
    } else {
        println!(
            "Forwarding {}:{} -> {}:{} (id {})",
            bind_host, proxy.local_port, proxy.remote_host, proxy.remote_port, proxy.proxy_id
        );
    }
    Ok(())
}

async fn report_status(manager: &ProxyManager, json: bool) -> Result<()> {
    let list = manager.list_proxies().await;
    if json {
        println!("{}", serde_json::to_string(&list)?);
        return Ok(());
    }

    for status in &list.proxies {
        info!(
            proxy_id = %status.proxy_id(),
            local_port = status.local_port(),
            status = %status.status(),
            connections = status.connections_in,
            bytes_in = status.bytes_in,
            bytes_out = status.bytes_out,
            "Proxy status"
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_forward(
    forwards: Vec<String>,
    config_path: Option<PathBuf>,
    project: Option<String>,
    service: Option<String>,
    bind_host: Option<String>,
    dial_timeout: Option<u64>,
    json: bool,
    status_interval: u64,
) -> Result<()> {
    let mut file = match &config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    // CLI args override config file
    if let Some(host) = bind_host {
        file.proxy.bind_host = host;
    }
    if let Some(secs) = dial_timeout {
        file.proxy.dial_timeout_secs = secs;
    }
    if let Some(project) = project {
        file.target.project = project;
    }
    if let Some(service) = service {
        file.target.service = service;
    }
    for spec in &forwards {
        file.forwards.push(ForwardSpec::parse(spec)?);
    }

    if file.forwards.is_empty() {
        bail!("No forwards given (use -L [LOCAL:]HOST:PORT or a config file)");
    }

    let manager = ProxyManager::with_config(file.proxy);

    for spec in &file.forwards {
        match manager
            .start_proxy(
                file.target.clone(),
                spec.local_port,
                &spec.remote_host,
                spec.remote_port,
            )
            .await
        {
            Ok(proxy) => print_started(&proxy, &manager.config().bind_host, json)?,
            Err(e) => {
                error!("Failed to start forward to {}:{}", spec.remote_host, spec.remote_port);
                manager.stop_all_proxies().await?;
                return Err(e).context("Failed to start forward");
            }
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = (status_interval > 0).then(|| {
        let period = Duration::from_secs(status_interval);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = tick => report_status(&manager, json).await?,
        }
    }

    let stopped = manager.stop_all_proxies().await?;
    info!("Stopped {} forward(s)", stopped.stopped);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Forward {
            forwards,
            config,
            project,
            service,
            bind_host,
            dial_timeout,
            json,
            status_interval,
        } => {
            run_forward(
                forwards,
                config,
                project,
                service,
                bind_host,
                dial_timeout,
                json,
                status_interval,
            )
            .await
        }
    }
}
