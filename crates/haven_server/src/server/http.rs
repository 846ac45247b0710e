#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use haven_domain::{ChatError, GroupId, MessageId};
use haven_protocol::{ApiFailure, HistoryResponse};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::groups::GroupRegistry;
use crate::server::store::MessageStore;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared state for the HTTP surface: health probes plus the history API.
#[derive(Clone)]
pub struct HttpState {
	pub health: HealthState,
	pub store: MessageStore,
	pub groups: GroupRegistry,
}

pub fn spawn_http_server(bind: SocketAddr, state: HttpState) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve_http(listener, state).await
}

pub(crate) async fn serve_http(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(Response::builder()
			.status(StatusCode::METHOD_NOT_ALLOWED)
			.body(Full::new(Bytes::new()))
			.unwrap());
	}

	let path = req.uri().path();
	match path {
		"/healthz" => Ok(Response::builder()
			.status(StatusCode::OK)
			.body(Full::new(Bytes::from_static(b"ok")))
			.unwrap()),
		"/readyz" => {
			if state.health.is_ready() {
				Ok(Response::builder()
					.status(StatusCode::OK)
					.body(Full::new(Bytes::from_static(b"ready")))
					.unwrap())
			} else {
				Ok(Response::builder()
					.status(StatusCode::SERVICE_UNAVAILABLE)
					.body(Full::new(Bytes::from_static(b"not-ready")))
					.unwrap())
			}
		}
		"/api/chat/history" => Ok(handle_history(req.uri().query(), &state).await),
		_ => Ok(Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Full::new(Bytes::new()))
			.unwrap()),
	}
}

async fn handle_history(query: Option<&str>, state: &HttpState) -> Response<Full<Bytes>> {
	metrics::counter!("haven_server_history_requests_total").increment(1);
	let query = query.unwrap_or("");

	let Some(group_id) = query_param(query, "group_id") else {
		return failure_response(StatusCode::BAD_REQUEST, "group_id is required");
	};

	let before = match query_param(query, "before") {
		None => None,
		Some(raw) => match raw.parse::<MessageId>() {
			Ok(id) => Some(id),
			Err(_) => return failure_response(StatusCode::BAD_REQUEST, "invalid before cursor"),
		},
	};

	let limit = match query_param(query, "limit") {
		None => None,
		Some(raw) => match raw.parse::<u32>() {
			Ok(n) => Some(n),
			Err(_) => return failure_response(StatusCode::BAD_REQUEST, "invalid limit"),
		},
	};

	match fetch_history(state, group_id, before, limit).await {
		Ok(response) => match serde_json::to_vec(&response) {
			Ok(body) => json_response(StatusCode::OK, body),
			Err(err) => {
				warn!(error = %err, "failed to encode history response");
				failure_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
			}
		},
		Err(err) => failure_response(status_for(&err), err.to_string()),
	}
}

async fn fetch_history(
	state: &HttpState,
	group_id: &str,
	before: Option<MessageId>,
	limit: Option<u32>,
) -> Result<HistoryResponse, ChatError> {
	let group_id = GroupId::new(group_id)?;
	state.groups.ensure_group_exists(&group_id).await?;
	let page = state.store.page(&group_id, before, limit).await?;
	Ok(HistoryResponse::from_page(&page))
}

fn status_for(err: &ChatError) -> StatusCode {
	match err {
		ChatError::Validation(_) => StatusCode::BAD_REQUEST,
		ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
		ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
		ChatError::NotFound(_) => StatusCode::NOT_FOUND,
		ChatError::Conflict(_) => StatusCode::CONFLICT,
		ChatError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
	}
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap()
}

fn failure_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(&ApiFailure::new(message)).unwrap_or_default();
	json_response(status, body)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=')?;
		(k == key).then_some(v)
	})
}
