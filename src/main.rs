pub(crate) mod api;
pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod rendering;
pub(crate) mod retrieve;
pub(crate) mod types;
pub(crate) mod utils;

use crate::backend::dimse::{
	FindServiceClassUser, MoveServiceClassUser, StoreServiceClassProvider,
};
use crate::backend::DicomTranscoder;
use crate::config::{AppConfig, HttpServerConfig, RendererBackend};
use crate::rendering::{ImageConverter, PixelDataConverter, ProcessConverter};
use crate::retrieve::Retriever;
use axum::extract::Request;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID written to the file meta group of received instances.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.18994594767128987334405878241180021636";

/// The implementation version name written to the file meta group of received instances.
/// It consists of the string "WADO-CACHE" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("WADO-CACHE ", env!("CARGO_PKG_VERSION"));

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

#[derive(Clone)]
pub struct AppState {
	pub retriever: Arc<Retriever>,
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	tokio::fs::create_dir_all(&config.storage.path).await?;

	let dimse = config.server.dimse.clone();
	let query = FindServiceClassUser::new(dimse.aet.clone(), config.pacs.clone());
	let orchestrator =
		MoveServiceClassUser::new(dimse.aet.clone(), dimse.aet.clone(), config.pacs.clone());
	let converter: Arc<dyn ImageConverter> = match config.renderer.backend {
		RendererBackend::Builtin => Arc::new(PixelDataConverter),
		RendererBackend::Process => {
			Arc::new(ProcessConverter::new(config.renderer.process.clone()))
		}
	};
	let retriever = Retriever::new(
		&config.storage,
		Arc::new(query),
		Arc::new(orchestrator),
		Arc::new(DicomTranscoder),
		converter,
	);

	let storage = config.storage.clone();
	tokio::spawn(async move {
		let storescp = StoreServiceClassProvider::new(dimse, storage);
		if let Err(err) = storescp.spawn().await {
			error!("Failed to spawn STORE-SCP thread: {err}");
			// Unrecoverable error - exit the process
			std::process::exit(-1);
		}
	});

	let app_state = AppState {
		retriever: Arc::new(retriever),
	};

	let app = api::routes(&config.server.http.base_path)
		.layer(CorsLayer::permissive())
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(TimeoutLayer::new(Duration::from_secs(
			config.server.http.request_timeout,
		)))
		.with_state(app_state);

	let HttpServerConfig {
		interface: host,
		port,
		..
	} = config.server.http;
	let addr = SocketAddr::from((host, port));
	let listener = TcpListener::bind(addr).await?;

	info!("Started WADO-RS server on http://{addr}");
	if config.server.http.graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("WADO-CACHE/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
