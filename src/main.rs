//! CLI entry point, closely modeled on the teacher's
//! `agentgateway-app/src/main.rs`: a single-threaded tokio runtime, config
//! loaded from either `--config` (inline bytes) or `--file` (path), an
//! optional `--validate-only` dry run, then handing off to [`app::run`].
//! The teacher's version-printing and `--copy-self` musl packaging flags
//! have no counterpart in this core and were dropped, see DESIGN.md.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use llm_relay::app;
use llm_relay::config::{self, Config};
use llm_relay::telemetry;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Use config from bytes.
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the config, then exit without serving traffic.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.unwrap()
		.block_on(async move {
			let cfg = match (args.config, args.file) {
				(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file may be given"),
				(Some(inline), None) => config::parse_config(&inline)?,
				(None, Some(path)) => config::load_config(&path)?,
				(None, None) => Config::default(),
			};

			if args.validate_only {
				config::RuntimeConfig::build(&cfg)?;
				println!("configuration is valid");
				return Ok(());
			}

			serve(Arc::new(cfg)).await
		})
}

async fn serve(cfg: Arc<Config>) -> anyhow::Result<()> {
	info!(listen_addr = %cfg.listen_addr, "starting llm-relay");
	app::run(cfg).await?.wait_termination().await
}
