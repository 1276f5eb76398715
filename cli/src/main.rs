use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use daemon::{db, methods::MethodRegistry, Agent, LocalStore, StandaloneControlPlane};
use ferry_core::{models::TransferStatus, AgentConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ferry", version, about = "Deliver watched files to their destinations")]
struct Cli {
	/// Config file (default: <config dir>/ferry/ferry.toml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Debug-level logging
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Watch sources and transfer files until interrupted
	Run,
	/// Scan every source once and register what changed
	Scan,
	/// Show transfer counts by status
	Status,
	/// Hand a failed or interrupted transfer back to the queue
	Retry { transfer_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config_path = cli.config.clone().unwrap_or_else(default_config_path);
	let config = AgentConfig::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;
	init_logging(&config, cli.verbose)?;
	let config = Arc::new(config);

	let db = db::open(&config.db_path())
		.await
		.with_context(|| format!("opening store at {}", config.db_path().display()))?;
	let store = LocalStore::new(db);

	match cli.command {
		Command::Run => run(config, store).await,
		Command::Scan => scan(config, store).await,
		Command::Status => status(&store).await,
		Command::Retry { transfer_id } => retry(&store, &transfer_id).await,
	}
}

fn default_config_path() -> PathBuf {
	dirs::config_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("ferry")
		.join("ferry.toml")
}

/// stderr plus `<data_dir>/logs/ferry.log`. `RUST_LOG` overrides the default filter.
fn init_logging(config: &AgentConfig, verbose: bool) -> Result<()> {
	let log_dir = config.log_dir();
	std::fs::create_dir_all(&log_dir).with_context(|| format!("creating {}", log_dir.display()))?;
	let file_appender = tracing_appender::rolling::never(&log_dir, "ferry.log");

	let default_filter = if verbose {
		"ferry=debug,daemon=debug,ferry_core=debug"
	} else {
		"ferry=info,daemon=info"
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_writer(std::io::stderr))
		.with(fmt::layer().with_ansi(false).with_writer(file_appender))
		.init();
	Ok(())
}

fn agent(config: Arc<AgentConfig>, store: LocalStore) -> Agent {
	let control = Arc::new(StandaloneControlPlane::new(config.clone()));
	Agent::new(config, store, control, MethodRegistry::builtin())
}

async fn run(config: Arc<AgentConfig>, store: LocalStore) -> Result<()> {
	let agent = agent(config, store);
	let handle = agent.start().await.context("starting agent")?;

	tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
	info!("interrupt received");
	handle.shutdown().await;
	Ok(())
}

async fn scan(config: Arc<AgentConfig>, store: LocalStore) -> Result<()> {
	let agent = agent(config, store);
	let mut failed = false;

	for (source, result) in agent.scan_all().await {
		match result {
			Ok(summary) => println!(
				"{} {}: {} files, {} registered, {} unchanged, {} failed",
				style("✓").green(),
				style(&source).bold(),
				summary.files,
				summary.registered,
				summary.unchanged,
				summary.failed,
			),
			Err(e) => {
				failed = true;
				println!("{} {}: {e}", style("✗").red(), style(&source).bold());
			}
		}
	}

	if failed {
		anyhow::bail!("one or more sources could not be scanned");
	}
	Ok(())
}

async fn status(store: &LocalStore) -> Result<()> {
	let counts = store.status_counts().await.context("reading transfer counts")?;

	for status in TransferStatus::ALL {
		let count = counts.iter().find(|(s, _)| *s == status).map(|(_, n)| *n).unwrap_or(0);
		let label = match status {
			TransferStatus::Complete => style(status.as_str()).green(),
			TransferStatus::Failed | TransferStatus::Interrupted => style(status.as_str()).red(),
			_ => style(status.as_str()).cyan(),
		};
		println!("{label:>12} {count}");
	}
	Ok(())
}

async fn retry(store: &LocalStore, transfer_id: &str) -> Result<()> {
	let record = store
		.reset_transfer(transfer_id)
		.await
		.with_context(|| format!("resetting transfer {transfer_id}"))?;
	println!(
		"{} {} is {} again (attempt {})",
		style("✓").green(),
		record.id,
		record.status,
		record.attempts
	);
	Ok(())
}
