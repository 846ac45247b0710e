#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use haven_domain::ConnectionId;
use haven_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::{AuthResolver, DevAuthResolver, HmacAuthResolver};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::groups::{GroupRegistry, PersistentGroupBackend};
use crate::server::http::{HealthState, HttpState, spawn_http_server};
use crate::server::hub::{GroupHub, GroupHubConfig};
use crate::server::registry::ConnectionRegistry;
use crate::server::seed::seed_demo_data;
use crate::server::store::{MessageStore, PersistentMessageBackend, StoreConfig};

/// Dev-only flag to accept unsigned `sub:name` tokens.
const HAVEN_ACCEPT_DEV_TOKENS_ENV: &str = "HAVEN_ACCEPT_DEV_TOKENS";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: haven_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint; overrides ws_bind from the config file\n\
\t         (default: ws://127.0.0.1:8080). Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<SocketAddr> {
	let mut bind_endpoint: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint.map(|raw| {
		let bind = WsEndpoint::parse(&raw).unwrap_or_else(|e| {
			eprintln!("{e}");
			usage_and_exit();
		});

		bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
			eprintln!("{e}");
			usage_and_exit();
		})
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,haven_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("haven_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let cli_bind = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = match cli_bind {
		Some(addr) => addr,
		None => WsEndpoint::parse(&server_cfg.server.ws_bind)
			.and_then(|bind| bind.to_socket_addr_if_ip_literal())
			.map_err(|e| anyhow::anyhow!("invalid ws_bind: {e}"))?,
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store_cfg = StoreConfig {
		max_message_chars: server_cfg.chat.max_message_chars,
		default_page_limit: server_cfg.chat.history_default_limit,
		max_page_limit: server_cfg.chat.history_max_limit,
		op_timeout: Duration::from_millis(server_cfg.persistence.op_timeout_ms),
	};
	let op_timeout = store_cfg.op_timeout;

	let (store, groups) = if let Some(database_url) = server_cfg.persistence.database_url.as_deref() {
		let message_backend = PersistentMessageBackend::connect(database_url).await?;
		let group_backend = PersistentGroupBackend::connect(database_url).await?;
		info!("persistent chat stores connected");
		(
			MessageStore::new_persistent(message_backend, store_cfg),
			GroupRegistry::new_persistent(group_backend, op_timeout),
		)
	} else {
		info!("no database_url configured; using in-memory chat stores");
		(
			MessageStore::new_in_memory(store_cfg),
			GroupRegistry::new_in_memory(op_timeout),
		)
	};

	if server_cfg.seed_demo_data {
		if let Err(e) = seed_demo_data(&groups, &store).await {
			warn!(error = %e, "demo data seeding failed");
		}
	}

	let dev_tokens_enabled = cfg!(debug_assertions)
		&& std::env::var(HAVEN_ACCEPT_DEV_TOKENS_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false);

	let auth: Arc<dyn AuthResolver> = if let Some(secret) = server_cfg.server.auth_hmac_secret.clone() {
		info!("auth: hmac token verification enabled");
		Arc::new(HmacAuthResolver::new(secret))
	} else if dev_tokens_enabled {
		warn!(
			env = HAVEN_ACCEPT_DEV_TOKENS_ENV,
			"auth: accepting unsigned dev tokens (debug build only)"
		);
		Arc::new(DevAuthResolver)
	} else {
		return Err(anyhow::anyhow!(
			"no auth secret configured; set [server] auth_hmac_secret or HAVEN_SERVER_AUTH_HMAC_SECRET"
		));
	};

	let hub = GroupHub::new(GroupHubConfig {
		debug_logs: server_cfg.server.debug_logs,
	});
	let registry = ConnectionRegistry::new();

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		idle_timeout: Duration::from_secs(server_cfg.server.idle_timeout_secs),
		message_rate_limit_burst: server_cfg.server.message_rate_limit_burst,
		message_rate_limit_per_minute: server_cfg.server.message_rate_limit_per_minute,
	};

	let health_state = HealthState::new();
	let http_addr: SocketAddr = server_cfg
		.server
		.http_bind
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid http_bind {:?}: {e}", server_cfg.server.http_bind))?;
	spawn_http_server(
		http_addr,
		HttpState {
			health: health_state.clone(),
			store: store.clone(),
			groups: groups.clone(),
		},
	);
	info!(%http_addr, "http server listening");

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "haven_server: websocket endpoint ready");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(pair) => pair,
			Err(e) => {
				warn!(error = %e, "failed to accept tcp connection");
				continue;
			}
		};

		let conn_id = ConnectionId::new(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("haven_server_connections_total").increment(1);

		let registry = registry.clone();
		let hub = hub.clone();
		let store = store.clone();
		let groups = groups.clone();
		let auth = Arc::clone(&auth);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(
				conn_id,
				stream,
				peer,
				registry,
				hub,
				store,
				groups,
				auth,
				conn_settings,
			)
			.await
			{
				warn!(conn_id = %conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
