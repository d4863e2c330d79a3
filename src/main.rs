use std::path::PathBuf;
use std::process;

use clap::Parser;
use latch_core::prelude::*;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

use latchd::config::{Config, RawConfig};
use latchd::mtrcs::{self, Metrics};
use latchd::server;
use latchd::service::LockService;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from file
	#[arg(short, long, value_name = "file")]
	conf: Option<PathBuf>,

	/// Address to listen on (host:port)
	#[arg(long)]
	bind: Option<String>,

	/// Number of addressable lock databases (db ids below this value, max 256)
	#[arg(long)]
	databases: Option<usize>,

	/// Shards per lock database (power of two)
	#[arg(long)]
	shards: Option<usize>,

	/// Timer wheel buckets, i.e. seconds of immediate timer horizon
	#[arg(long)]
	wheel_size: Option<usize>,

	/// Default log level when RUST_LOG is unset
	#[arg(long)]
	log_level: Option<String>,

	/// Log output format: plain or json
	#[arg(long)]
	log_format: Option<String>,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let flags = RawConfig {
		bind: args.bind,
		databases: args.databases,
		shards: args.shards,
		wheel_size: args.wheel_size,
		log_level: args.log_level,
		log_format: args.log_format,
	};
	let config = match Config::resolve(args.conf.as_deref(), flags) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("config error: {err:#}");
			process::exit(1);
		},
	};
	if let Err(err) = latch_core::telemetry::init(&config.log_level, config.log_format) {
		eprintln!("logging init error: {err:#}");
		process::exit(1);
	}
	info!(
		bind = %config.bind,
		databases = config.databases,
		shards = config.shards,
		wheel_size = config.wheel_size,
		"starting latchd"
	);

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(mtrcs::sub_registry(&mut registry)));

	let token = CancellationToken::new();
	let service = Arc::new(LockService::new(
		config.databases,
		config.shards,
		config.wheel_size,
		token.child_token(),
	));

	let listener = match tokio::net::TcpListener::bind(&config.bind).await {
		Ok(listener) => listener,
		Err(err) => {
			error!(bind = %config.bind, %err, "bind failed");
			process::exit(2);
		},
	};

	let shutdown = latch_core::signal::Shutdown::new();
	let server = tokio::spawn(server::run(listener, service, metrics, token.child_token()));

	shutdown.wait().await;
	token.cancel();
	let _ = server.await;
	info!("shutdown complete");
}
