use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_ASYNC_TRANSFERS: usize = 4;
const DEFAULT_QUEUE_HIGH_WATER_MARK: usize = 64;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),

	#[error("duplicate {kind} id: {id}")]
	DuplicateId { kind: &'static str, id: String },

	#[error("destination {destination} references unknown host {host}")]
	UnknownHost { destination: String, host: String },

	#[error("source {source_id} references unknown destination {destination}")]
	UnknownDestination { source_id: String, destination: String },

	#[error("{0} must be greater than zero")]
	ZeroLimit(&'static str),
}

/// Agent configuration, usually read from `ferry.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
	#[serde(default = "default_data_dir")]
	pub data_dir: PathBuf,
	/// Default per-destination concurrency.
	#[serde(default = "default_max_async_transfers")]
	pub max_async_transfers: usize,
	/// Default per-destination backlog bound.
	#[serde(default = "default_queue_high_water_mark")]
	pub queue_high_water_mark: usize,
	#[serde(default = "default_sweep_interval_secs")]
	pub sweep_interval_secs: u64,
	/// Per-job deadline; unset means no deadline.
	#[serde(default)]
	pub job_timeout_secs: Option<u64>,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub sources: Vec<SourceConfig>,
	#[serde(default)]
	pub hosts: Vec<HostConfig>,
	#[serde(default)]
	pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
	/// 0 disables automatic retries.
	pub max_attempts: u32,
	pub base_backoff_secs: u64,
	pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self { max_attempts: 3, base_backoff_secs: 30, max_backoff_secs: 3600 }
	}
}

/// A watched local directory tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
	pub id: String,
	pub name: String,
	pub basepath: PathBuf,
	#[serde(default)]
	pub exclude: Vec<String>,
	#[serde(default)]
	pub destinations: Vec<String>,
	#[serde(default = "default_scan_interval_secs")]
	pub scan_interval_secs: u64,
}

/// Groups destinations and supplies their transfer method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
	pub id: String,
	pub transfer_method: String,
	#[serde(default)]
	pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationConfig {
	pub id: String,
	pub host_id: String,
	/// Base delivery path handed to the transfer method.
	pub location: PathBuf,
	#[serde(default)]
	pub concurrency: Option<usize>,
	#[serde(default)]
	pub max_backlog: Option<usize>,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			data_dir: default_data_dir(),
			max_async_transfers: DEFAULT_MAX_ASYNC_TRANSFERS,
			queue_high_water_mark: DEFAULT_QUEUE_HIGH_WATER_MARK,
			sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
			job_timeout_secs: None,
			retry: RetryConfig::default(),
			sources: Vec::new(),
			hosts: Vec::new(),
			destinations: Vec::new(),
		}
	}
}

impl AgentConfig {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml(&text)
	}

	pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
		let config: AgentConfig = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	/// Check that ids are unique and every reference resolves.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_async_transfers == 0 {
			return Err(ConfigError::ZeroLimit("max_async_transfers"));
		}
		if self.queue_high_water_mark == 0 {
			return Err(ConfigError::ZeroLimit("queue_high_water_mark"));
		}

		unique_ids("source", self.sources.iter().map(|s| s.id.as_str()))?;
		unique_ids("host", self.hosts.iter().map(|h| h.id.as_str()))?;
		unique_ids("destination", self.destinations.iter().map(|d| d.id.as_str()))?;

		for dest in &self.destinations {
			if self.host(&dest.host_id).is_none() {
				return Err(ConfigError::UnknownHost {
					destination: dest.id.clone(),
					host: dest.host_id.clone(),
				});
			}
			if dest.concurrency == Some(0) {
				return Err(ConfigError::ZeroLimit("destination concurrency"));
			}
			if dest.max_backlog == Some(0) {
				return Err(ConfigError::ZeroLimit("destination max_backlog"));
			}
		}

		for source in &self.sources {
			for dest_id in &source.destinations {
				if self.destination(dest_id).is_none() {
					return Err(ConfigError::UnknownDestination {
						source_id: source.id.clone(),
						destination: dest_id.clone(),
					});
				}
			}
		}

		Ok(())
	}

	pub fn source(&self, id: &str) -> Option<&SourceConfig> {
		self.sources.iter().find(|s| s.id == id)
	}

	pub fn host(&self, id: &str) -> Option<&HostConfig> {
		self.hosts.iter().find(|h| h.id == id)
	}

	pub fn destination(&self, id: &str) -> Option<&DestinationConfig> {
		self.destinations.iter().find(|d| d.id == id)
	}

	pub fn concurrency_for(&self, destination: &DestinationConfig) -> usize {
		destination.concurrency.unwrap_or(self.max_async_transfers)
	}

	pub fn backlog_for(&self, destination: &DestinationConfig) -> usize {
		destination.max_backlog.unwrap_or(self.queue_high_water_mark)
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval_secs.max(1))
	}

	pub fn job_timeout(&self) -> Option<Duration> {
		self.job_timeout_secs.map(Duration::from_secs)
	}

	pub fn db_path(&self) -> PathBuf {
		self.data_dir.join("ferry.db")
	}

	pub fn log_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}

fn unique_ids<'a>(kind: &'static str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
	let mut seen = HashSet::new();
	for id in ids {
		if !seen.insert(id) {
			return Err(ConfigError::DuplicateId { kind, id: id.to_string() });
		}
	}
	Ok(())
}

fn default_data_dir() -> PathBuf {
	dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("ferry")
}

fn default_max_async_transfers() -> usize {
	DEFAULT_MAX_ASYNC_TRANSFERS
}

fn default_queue_high_water_mark() -> usize {
	DEFAULT_QUEUE_HIGH_WATER_MARK
}

fn default_sweep_interval_secs() -> u64 {
	DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_scan_interval_secs() -> u64 {
	DEFAULT_SCAN_INTERVAL_SECS
}
