use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
	Plain,
	Json,
}

impl std::str::FromStr for LogFormat {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"plain" | "text" => Ok(LogFormat::Plain),
			"json" => Ok(LogFormat::Json),
			other => anyhow::bail!("unknown log format {other:?} (expected \"plain\" or \"json\")"),
		}
	}
}

/// Install the global tracing subscriber. `default_level` applies when
/// RUST_LOG is unset; RUST_LOG always wins.
pub fn init(default_level: &str, format: LogFormat) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(false);
	match format {
		LogFormat::Plain => builder.init(),
		LogFormat::Json => builder.json().init(),
	}
	Ok(())
}
