//! zmesh-dataplane: mesh sidecar dataplane
//!
//! This is the main entry point for the sidecar binary.
//!
//! # Usage
//!
//! ```bash
//! # Install interception rules, then run both proxy engines
//! sudo ./zmesh-dataplane intercept install -c ./config/application.yaml
//! ./zmesh-dataplane run -c ./config/application.yaml
//!
//! # Print the rules without touching the kernel
//! ./zmesh-dataplane intercept show
//!
//! # Tear everything down
//! sudo ./zmesh-dataplane intercept remove
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zmesh_dataplane::config::{
    create_default_config, find_config, load_config_with_env, Config, LogConfig,
};
use zmesh_dataplane::interception::{InterceptionController, InterceptionRuleSet, IptablesFilter};
use zmesh_dataplane::proxy::{Direction, ProxyEngine};
use zmesh_dataplane::{is_root, DataplaneError};

/// Service-mesh sidecar dataplane
#[derive(Parser)]
#[command(name = "zmesh-dataplane")]
#[command(about = "Transparent TCP proxy and traffic interception for mesh sidecars")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the inbound and outbound proxy engines
    Run {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Manage packet-filter interception rules
    Intercept {
        #[command(subcommand)]
        action: InterceptAction,
    },

    /// Validate the configuration and exit
    CheckConfig {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Write a default configuration file and exit
    GenerateConfig {
        /// Output path (.yaml or .json)
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum InterceptAction {
    /// Install baseline chains, outbound capture and inbound capture
    Install {
        #[command(flatten)]
        config: ConfigArg,

        /// Only create chains and jump rules
        #[arg(long)]
        baseline_only: bool,
    },

    /// Remove every interception rule and chain
    Remove {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Print the rules that would be installed
    Show {
        #[command(flatten)]
        config: ConfigArg,
    },
}

#[derive(clap::Args)]
struct ConfigArg {
    /// Configuration file path (searched in ./ and ./config/ when omitted)
    #[arg(short, long, env = "ZMESH_CONFIG")]
    config: Option<PathBuf>,
}

impl ConfigArg {
    fn load(&self) -> Result<(Config, PathBuf)> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => find_config().context("No configuration file found")?,
        };
        let config = load_config_with_env(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        Ok((config, path))
    }
}

/// Initialize logging
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tokio=warn", log.level.to_lowercase()))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(log.target);

    if log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let (config, path) = config.load()?;
            init_logging(&config.log);
            info!("zmesh-dataplane v{}", zmesh_dataplane::VERSION);
            info!("Configuration loaded from {}", path.display());
            run(config).await
        }
        Command::Intercept { action } => intercept(action),
        Command::CheckConfig { config } => {
            let (config, path) = config.load()?;
            println!(
                "Configuration at {} is valid (inbound {}:{} {}, outbound {}:{} {})",
                path.display(),
                config.inbound.host,
                config.inbound.port,
                config.inbound.mode,
                config.outbound.host,
                config.outbound.port,
                config.outbound.mode
            );
            Ok(())
        }
        Command::GenerateConfig { path } => generate_config(&path),
    }
}

fn generate_config(path: &Path) -> Result<()> {
    create_default_config(path)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
    println!("Generated default configuration at {}", path.display());
    Ok(())
}

fn intercept(action: InterceptAction) -> Result<()> {
    match action {
        InterceptAction::Show { config } => {
            let (config, _) = config.load()?;
            let rules = InterceptionRuleSet::from_config(&config)?;
            let cmd = if config.interception.ipv6 {
                "ip6tables"
            } else {
                "iptables"
            };
            for chain in rules.chains() {
                println!("{cmd} -t {} -N {}", chain.table, chain.name);
            }
            for rule in rules.all_rules() {
                println!("{cmd} {rule}");
            }
            Ok(())
        }
        InterceptAction::Install {
            config,
            baseline_only,
        } => {
            let (config, _) = config.load()?;
            init_logging(&config.log);
            let controller = build_controller(&config)?;

            if baseline_only {
                controller.install_baseline()?;
            } else {
                controller.install_all()?;
            }
            info!("Interception rules installed");
            Ok(())
        }
        InterceptAction::Remove { config } => {
            let (config, _) = config.load()?;
            init_logging(&config.log);
            let controller = build_controller(&config)?;
            controller.remove_all()?;
            info!("Interception rules removed");
            Ok(())
        }
    }
}

fn build_controller(config: &Config) -> Result<InterceptionController<IptablesFilter>> {
    if !is_root() {
        warn!("Not running as root; packet-filter changes need CAP_NET_ADMIN");
    }

    let rules = InterceptionRuleSet::from_config(config)?;
    let filter = IptablesFilter::new(config.interception.ipv6)?;
    Ok(InterceptionController::new(filter, rules))
}

async fn run(config: Config) -> Result<()> {
    let start_time = Instant::now();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let inbound = Arc::new(ProxyEngine::new(
        Direction::Inbound,
        config.inbound.clone(),
        &config.connection,
    ));
    let outbound = Arc::new(ProxyEngine::new(
        Direction::Outbound,
        config.outbound.clone(),
        &config.connection,
    ));

    // Bind both before serving so a bad listener aborts startup cleanly
    let inbound_listener = inbound
        .bind(&config.connection)
        .context("Failed to start inbound engine")?;
    let outbound_listener = outbound
        .bind(&config.connection)
        .context("Failed to start outbound engine")?;

    let mut inbound_task = tokio::spawn(
        Arc::clone(&inbound).serve(inbound_listener, shutdown_tx.subscribe()),
    );
    let mut outbound_task = tokio::spawn(
        Arc::clone(&outbound).serve(outbound_listener, shutdown_tx.subscribe()),
    );

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let first = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            None
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            None
        }
        res = &mut inbound_task => Some((Direction::Inbound, res)),
        res = &mut outbound_task => Some((Direction::Outbound, res)),
    };

    // Stop accepting and let in-flight connections drain
    let _ = shutdown_tx.send(());

    let (mut result, remaining) = match first {
        None => (
            Ok(()),
            vec![
                (Direction::Inbound, inbound_task),
                (Direction::Outbound, outbound_task),
            ],
        ),
        Some((Direction::Inbound, res)) => (
            engine_exit(Direction::Inbound, res),
            vec![(Direction::Outbound, outbound_task)],
        ),
        Some((Direction::Outbound, res)) => (
            engine_exit(Direction::Outbound, res),
            vec![(Direction::Inbound, inbound_task)],
        ),
    };

    for (direction, task) in remaining {
        let exit = engine_exit(direction, task.await);
        if result.is_ok() {
            result = exit;
        }
    }

    info!("Shutdown complete");
    result
}

fn engine_exit(direction: Direction, res: Result<Result<(), DataplaneError>, JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} engine failed: {}", direction, e);
            Err(anyhow::Error::new(e).context(format!("{direction} engine failed")))
        }
        Err(e) => {
            error!("{} engine task panicked: {}", direction, e);
            Err(anyhow::anyhow!("{direction} engine task failed: {e}"))
        }
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
