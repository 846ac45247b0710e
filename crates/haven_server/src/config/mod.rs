#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use haven_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.haven/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".haven").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub persistence: PersistenceSettings,
	/// Seed a demo group with a welcome message on startup.
	pub seed_demo_data: bool,
}

/// Gateway settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket bind endpoint (`ws://host:port`). `--bind` wins over this.
	pub ws_bind: String,
	/// HTTP bind address (host:port) for health and the history API.
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Close a connection after this long without an inbound frame.
	pub idle_timeout_secs: u64,
	/// Per-connection outbound queue depth before fan-out drops frames.
	pub outbound_queue_capacity: usize,
	/// Largest inbound text frame the gateway decodes.
	pub max_frame_bytes: usize,
	/// Message rate limiting: per-connection burst size.
	pub message_rate_limit_burst: u32,
	/// Message rate limiting: per-connection messages per minute.
	pub message_rate_limit_per_minute: u32,
	/// Verbose per-subscription hub logging.
	pub debug_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			ws_bind: "ws://127.0.0.1:8080".to_string(),
			http_bind: "127.0.0.1:8081".to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			idle_timeout_secs: 60,
			outbound_queue_capacity: 256,
			max_frame_bytes: haven_protocol::DEFAULT_MAX_FRAME_BYTES,
			message_rate_limit_burst: 20,
			message_rate_limit_per_minute: 600,
			debug_logs: false,
		}
	}
}

/// Chat semantics the store and history API enforce.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	/// Maximum message body length in characters.
	pub max_message_chars: usize,
	/// History page size when the request omits `limit`.
	pub history_default_limit: u32,
	/// Hard cap a requested `limit` is clamped to.
	pub history_max_limit: u32,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			max_message_chars: haven_domain::MAX_MESSAGE_CHARS,
			history_default_limit: 50,
			history_max_limit: 200,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres: or mysql:). Absent means in-memory.
	pub database_url: Option<String>,
	/// Timeout applied to individual store operations.
	pub op_timeout_ms: u64,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self { database_url: None, op_timeout_ms: 5_000 }
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	seed_demo_data: Option<bool>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	ws_bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	idle_timeout_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	message_rate_limit_burst: Option<u32>,
	message_rate_limit_per_minute: Option<u32>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	max_message_chars: Option<usize>,
	history_default_limit: Option<u32>,
	history_max_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	op_timeout_ms: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let chat_defaults = ChatSettings::default();
		let persistence_defaults = PersistenceSettings::default();

		Self {
			server: ServerSettings {
				ws_bind: file
					.server
					.ws_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.ws_bind),
				http_bind: file
					.server
					.http_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.http_bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				idle_timeout_secs: file
					.server
					.idle_timeout_secs
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.idle_timeout_secs),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbound_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
				message_rate_limit_burst: file
					.server
					.message_rate_limit_burst
					.unwrap_or(server_defaults.message_rate_limit_burst),
				message_rate_limit_per_minute: file
					.server
					.message_rate_limit_per_minute
					.unwrap_or(server_defaults.message_rate_limit_per_minute),
				debug_logs: file.server.debug_logs.unwrap_or(server_defaults.debug_logs),
			},
			chat: ChatSettings {
				max_message_chars: file
					.chat
					.max_message_chars
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.max_message_chars),
				history_default_limit: file
					.chat
					.history_default_limit
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.history_default_limit),
				history_max_limit: file
					.chat
					.history_max_limit
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.history_max_limit),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				op_timeout_ms: file
					.persistence
					.op_timeout_ms
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.op_timeout_ms),
			},
			seed_demo_data: file.seed_demo_data.unwrap_or(false),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HAVEN_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HAVEN_WS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.ws_bind = v;
			info!("server config: ws_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HAVEN_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HAVEN_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HAVEN_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.idle_timeout_secs = secs;
		info!(secs, "server config: idle_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_MESSAGE_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.message_rate_limit_burst = burst;
		info!(burst, "server config: message_rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_MESSAGE_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.message_rate_limit_per_minute = rate;
		info!(rate, "server config: message_rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_CHAT_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.trim().parse::<usize>()
		&& chars > 0
	{
		cfg.chat.max_message_chars = chars;
		info!(chars, "chat config: max_message_chars overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_HISTORY_DEFAULT_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.chat.history_default_limit = limit;
		info!(limit, "chat config: history_default_limit overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_HISTORY_MAX_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.chat.history_max_limit = limit;
		info!(limit, "chat config: history_max_limit overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HAVEN_OP_TIMEOUT_MS")
		&& let Ok(timeout) = v.trim().parse::<u64>()
		&& timeout > 0
	{
		cfg.persistence.op_timeout_ms = timeout;
		info!(timeout, "persistence: op_timeout_ms overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.debug_logs = enabled;
		info!(enabled, "server config: debug_logs overridden by env");
	}

	if let Ok(v) = std::env::var("HAVEN_SEED_DEMO_DATA")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.seed_demo_data = enabled;
		info!(enabled, "server config: seed_demo_data overridden by env");
	}

	if cfg.chat.history_default_limit > cfg.chat.history_max_limit {
		warn!(
			default = cfg.chat.history_default_limit,
			max = cfg.chat.history_max_limit,
			"chat config: history_default_limit > history_max_limit; clamping default"
		);
		cfg.chat.history_default_limit = cfg.chat.history_max_limit;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_defaults_fill_every_setting() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.ws_bind, "ws://127.0.0.1:8080");
		assert_eq!(cfg.server.http_bind, "127.0.0.1:8081");
		assert!(cfg.server.metrics_bind.is_none());
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.server.idle_timeout_secs, 60);
		assert_eq!(cfg.server.outbound_queue_capacity, 256);
		assert_eq!(cfg.server.max_frame_bytes, 64 * 1024);
		assert!(!cfg.server.debug_logs);
		assert_eq!(cfg.chat.history_default_limit, 50);
		assert_eq!(cfg.chat.history_max_limit, 200);
		assert!(cfg.persistence.database_url.is_none());
		assert!(!cfg.seed_demo_data);
	}

	#[test]
	fn blank_strings_are_treated_as_absent() {
		let file: FileConfig = toml::from_str(
			r#"
[server]
http_bind = "  "
auth_hmac_secret = ""

[persistence]
database_url = ""
"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.http_bind, "127.0.0.1:8081");
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn toml_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
seed_demo_data = true

[server]
ws_bind = "ws://0.0.0.0:8080"
http_bind = "0.0.0.0:9000"
idle_timeout_secs = 30
outbound_queue_capacity = 64

[chat]
history_default_limit = 25
history_max_limit = 100

[persistence]
database_url = "sqlite::memory:"
op_timeout_ms = 1000
"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);
		assert!(cfg.seed_demo_data);
		assert_eq!(cfg.server.ws_bind, "ws://0.0.0.0:8080");
		assert_eq!(cfg.server.http_bind, "0.0.0.0:9000");
		assert_eq!(cfg.server.idle_timeout_secs, 30);
		assert_eq!(cfg.server.outbound_queue_capacity, 64);
		assert_eq!(cfg.chat.history_default_limit, 25);
		assert_eq!(cfg.chat.history_max_limit, 100);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.persistence.op_timeout_ms, 1000);
	}

	#[test]
	fn parse_env_bool_accepts_common_spellings() {
		assert_eq!(parse_env_bool("1"), Some(true));
		assert_eq!(parse_env_bool(" on "), Some(true));
		assert_eq!(parse_env_bool("FALSE"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
