//! Server configuration.
//!
//! Layering, strongest first: command-line flags, `LATCHD_*` environment
//! variables, the YAML config file, built-in defaults.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use latch_core::telemetry::LogFormat;
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "127.0.0.1:5658";
pub const DEFAULT_DATABASES: usize = 256;
pub const DEFAULT_SHARDS: usize = 16;
pub const DEFAULT_WHEEL_SIZE: usize = 64;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone, Debug)]
pub struct Config {
	/// host:port the server listens on.
	pub bind: String,
	/// Number of addressable lock databases; commands may name db ids
	/// below this value. The wire field is one byte, so at most 256.
	pub databases: usize,
	/// Shards per lock database; must be a power of two.
	pub shards: usize,
	/// Timer wheel buckets per shard, i.e. seconds of immediate horizon.
	pub wheel_size: usize,
	pub log_level: String,
	pub log_format: LogFormat,
}

/// One layer of optional settings: the YAML file deserializes into this,
/// and CLI flags are collected into one as well.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	pub bind: Option<String>,
	pub databases: Option<usize>,
	pub shards: Option<usize>,
	pub wheel_size: Option<usize>,
	pub log_level: Option<String>,
	pub log_format: Option<String>,
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	T::Err: Display,
{
	match std::env::var(env) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.map_err(|err| anyhow::anyhow!("invalid {env}={val}: {err}")),
		_ => Ok(None),
	}
}

impl Config {
	pub fn resolve(file: Option<&Path>, overrides: RawConfig) -> anyhow::Result<Config> {
		let raw = match file {
			Some(path) => {
				let contents = std::fs::read_to_string(path)
					.with_context(|| format!("reading config file {}", path.display()))?;
				serde_yaml::from_str(&contents)
					.with_context(|| format!("parsing config file {}", path.display()))?
			},
			None => RawConfig::default(),
		};
		let env = RawConfig {
			bind: parse("LATCHD_BIND")?,
			databases: parse("LATCHD_DATABASES")?,
			shards: parse("LATCHD_SHARDS")?,
			wheel_size: parse("LATCHD_WHEEL_SIZE")?,
			log_level: parse("LATCHD_LOG_LEVEL")?,
			log_format: parse("LATCHD_LOG_FORMAT")?,
		};
		Config::layer(overrides, env, raw)
	}

	fn layer(flags: RawConfig, env: RawConfig, file: RawConfig) -> anyhow::Result<Config> {
		let config = Config {
			bind: flags
				.bind
				.or(env.bind)
				.or(file.bind)
				.unwrap_or_else(|| DEFAULT_BIND.to_string()),
			databases: flags
				.databases
				.or(env.databases)
				.or(file.databases)
				.unwrap_or(DEFAULT_DATABASES),
			shards: flags
				.shards
				.or(env.shards)
				.or(file.shards)
				.unwrap_or(DEFAULT_SHARDS),
			wheel_size: flags
				.wheel_size
				.or(env.wheel_size)
				.or(file.wheel_size)
				.unwrap_or(DEFAULT_WHEEL_SIZE),
			log_level: flags
				.log_level
				.or(env.log_level)
				.or(file.log_level)
				.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
			log_format: flags
				.log_format
				.or(env.log_format)
				.or(file.log_format)
				.as_deref()
				.map(LogFormat::from_str)
				.transpose()?
				.unwrap_or(LogFormat::Plain),
		};
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> anyhow::Result<()> {
		self
			.bind
			.parse::<std::net::SocketAddr>()
			.with_context(|| format!("invalid bind address {:?}", self.bind))?;
		if self.databases == 0 || self.databases > 256 {
			anyhow::bail!("databases must be within 1..=256, got {}", self.databases);
		}
		if !self.shards.is_power_of_two() || self.shards > 1024 {
			anyhow::bail!("shards must be a power of two up to 1024, got {}", self.shards);
		}
		if self.wheel_size < 2 || self.wheel_size > 3600 {
			anyhow::bail!("wheel_size must be within 2..=3600, got {}", self.wheel_size);
		}
		Ok(())
	}
}
