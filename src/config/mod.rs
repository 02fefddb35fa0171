use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub pacs: PacsConfig,
	pub storage: StorageConfig,
	pub renderer: RendererConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional `config.toml` in the
	/// working directory and `WADO_CACHE_*` environment variables (in that order).
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("WADO_CACHE")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: tracing::Level,
	/// Sentry DSN. Sentry is disabled if this is not set.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
	pub dimse: DimseServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub base_path: String,
	/// Request timeout in seconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

/// The STORE-SCP that receives the C-STORE sub-operations of a C-MOVE.
#[derive(Debug, Clone, Deserialize)]
pub struct DimseServerConfig {
	pub aet: String,
	pub interface: IpAddr,
	pub port: u16,
}

/// The remote PACS that is queried (C-FIND) and retrieved from (C-MOVE).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PacsConfig {
	pub aet: String,
	pub host: String,
	pub port: u16,
	/// Timeout for C-FIND in milliseconds.
	pub find_timeout: u64,
	/// Timeout for C-MOVE in milliseconds.
	pub move_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	/// Root directory of the instance cache (`<path>/<study>/<instance>`).
	pub path: PathBuf,
	/// Media type declared for parts of the default (full object) format.
	pub mime_type: String,
	/// Transfer syntax declared for parts of the default (full object) format.
	/// The STORE-SCP only accepts instances encoded with it.
	pub transfer_syntax: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererBackend {
	/// In-process rendering with dicom-pixeldata.
	Builtin,
	/// External conversion tool, e.g. `dcmj2pnm` from DCMTK.
	Process,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
	pub backend: RendererBackend,
	pub process: ProcessRendererConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessRendererConfig {
	pub program: String,
	/// Arguments placed before the quality flag.
	pub args: Vec<String>,
	pub quality_flag: String,
	pub single_frame_args: Vec<String>,
	pub all_frames_args: Vec<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_defaults() {
		let config = AppConfig::new().unwrap();

		assert_eq!(config.server.http.port, 8080);
		assert_eq!(config.storage.mime_type, "application/dicom");
		assert_eq!(config.storage.transfer_syntax, "1.2.840.10008.1.2");
		assert_eq!(config.renderer.backend, RendererBackend::Builtin);
		assert_eq!(config.renderer.process.quality_flag, "+Jq");
		assert!(config.telemetry.sentry.is_none());
	}
}
