use std::{
	collections::HashMap,
	net::SocketAddr,
	path::{Component, Path as FsPath, PathBuf},
	sync::Arc,
	time::{Instant, UNIX_EPOCH},
};

use anyhow::Result;
use axum::{
	extract::{Path, Query, State},
	http::{HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::{signal, task, time::sleep};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tour_cms_server::{
	cache::ResponseCache,
	config::Config,
	content::{Change, ContentStore},
	error::{StoreError, StoreResult},
	fsio,
	mirror::{GitHubContents, MirrorSync, RemoteStore},
	paths::{DocKind, PathResolver},
	stats::{StatsAggregator, StatsQuery},
};

const SESSION_HEADER: &str = "x-session-id";
const RESPONSE_CACHE_MAX_ENTRIES: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "tour-cms-server", version, about = "Content and analytics backend for the virtual tour")]
struct Cli {
	/// Bind address for the HTTP server (overrides PORT / HTTP_BIND)
	#[arg(long)]
	bind: Option<SocketAddr>,

	/// CMS data root for scenes, tours, graph and stats
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<PathBuf>,

	/// Component root used for project and legacy document locations
	#[arg(long, env = "BASE_DIR")]
	base_dir: Option<PathBuf>,

	/// Uploads root reported by the storage health check
	#[arg(long, env = "UPLOADS_DIR")]
	uploads_dir: Option<PathBuf>,
}

impl Cli {
	fn apply(self, config: &mut Config) {
		if let Some(bind) = self.bind {
			config.bind = bind;
		}
		if let Some(base) = self.base_dir {
			if self.uploads_dir.is_none() {
				config.uploads_dir = base.join("uploads");
			}
			if self.data_dir.is_none() {
				config.data_dir = base.join("cms").join("data");
				config.stats_path = base.join("stats.json");
			}
			config.base_dir = base;
		}
		if let Some(data) = self.data_dir {
			config.stats_path = data.join("stats.json");
			config.data_dir = data;
		}
		if let Some(uploads) = self.uploads_dir {
			config.uploads_dir = uploads;
		}
	}
}

struct AppState {
	start_time: Instant,
	config: Config,
	content: Arc<ContentStore>,
	stats: Arc<StatsAggregator>,
	// keyed by request path + query; invalidated by prefix on writes
	cache: ResponseCache,
}

#[derive(Serialize)]
struct Health {
	status: &'static str,
	uptime_ms: u128,
}

#[derive(Serialize)]
struct LocalFileInfo {
	path: PathBuf,
	exists: bool,
	size: Option<u64>,
	mtime: Option<f64>,
	sha256: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

#[inline]
fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>, details: Option<JsonValue>) -> Response {
	let body = json!({ "error": { "code": code, "message": message.into(), "details": details } });
	(status, Json(body)).into_response()
}

fn store_error(err: StoreError) -> Response {
	let status = match &err {
		StoreError::Validation(_) => StatusCode::BAD_REQUEST,
		StoreError::NotFound(_) => StatusCode::NOT_FOUND,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	if status.is_server_error() {
		error!(%err, "request failed");
	}
	let details = match &err {
		StoreError::Corruption { backup: Some(backup), .. } => Some(json!({ "backup": backup })),
		_ => None,
	};
	json_error(status, err.code(), err.to_string(), details)
}

/// Run store work off the async executor and map failures to HTTP errors.
async fn run_blocking<T, F>(f: F) -> Result<T, Response>
where
	F: FnOnce() -> StoreResult<T> + Send + 'static,
	T: Send + 'static,
{
	match task::spawn_blocking(f).await {
		Ok(Ok(value)) => Ok(value),
		Ok(Err(err)) => Err(store_error(err)),
		Err(err) => {
			error!(%err, "blocking task failed");
			Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "worker task failed", None))
		}
	}
}

/// Hand remote documents to the mirror and return the mutation's value.
fn publish<T>(state: &AppState, change: Change<T>) -> T {
	for published in change.remote {
		state.content.mirror().spawn_remote(published);
	}
	change.value
}

/// Merge an extra status/message pair into a serialized report.
fn with_status<T: Serialize>(report: &T, message: &str) -> JsonValue {
	let mut body = json!(report);
	if let Some(obj) = body.as_object_mut() {
		obj.insert("status".into(), json!("ok"));
		obj.insert("message".into(), json!(message));
	}
	body
}

fn session_header(headers: &HeaderMap) -> Option<String> {
	headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();
	let mut config = Config::load()?;
	Cli::parse().apply(&mut config);

	let remote: Option<Arc<dyn RemoteStore>> = match &config.remote {
		Some(rc) => {
			info!(repo = %rc.repo, branch = %rc.branch, "remote mirror enabled");
			Some(Arc::new(GitHubContents::new(rc)?))
		}
		None => None,
	};
	let bind_addr = config.bind;
	let state = build_state(config, remote)?;

	let mut tasks = Vec::new();

	let maint_state = state.clone();
	tasks.push(task::spawn(async move { maintenance_loop(maint_state).await; }));

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(%bind_addr, "Starting HTTP server");
	let app = build_router(state.clone());
	tasks.push(task::spawn(async move {
		if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
			error!(%err, "server error");
		}
	}));

	signal::ctrl_c().await?;
	info!("Shutdown signal received");
	for t in tasks {
		t.abort();
	}
	Ok(())
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn ensure_dirs(config: &Config) -> Result<()> {
	std::fs::create_dir_all(&config.data_dir)?;
	std::fs::create_dir_all(&config.uploads_dir)?;
	if let Some(parent) = config.stats_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	Ok(())
}

fn build_state(config: Config, remote: Option<Arc<dyn RemoteStore>>) -> Result<Arc<AppState>> {
	ensure_dirs(&config)?;
	let resolver = PathResolver::new(config.data_dir.clone(), config.base_dir.clone(), config.container_dir.clone());
	let mirror = Arc::new(MirrorSync::new(resolver.clone(), remote, config.remote_paths.clone()));
	let content = Arc::new(ContentStore::open(resolver, mirror)?);
	let stats = Arc::new(StatsAggregator::new(config.stats_path.clone(), config.session_timeout_secs));
	info!(data_dir = %config.data_dir.display(), stats = %config.stats_path.display(), "state ready");
	Ok(Arc::new(AppState {
		start_time: Instant::now(),
		cache: ResponseCache::new(config.response_cache_ttl, RESPONSE_CACHE_MAX_ENTRIES),
		config,
		content,
		stats,
	}))
}

fn build_router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/health/storage", get(health_storage))
		.route("/health/sync", get(health_sync))
		.route("/api/scenes", get(scenes_list).post(scenes_create))
		.route("/api/scenes/:id", get(scenes_get).put(scenes_update).delete(scenes_delete))
		.route("/api/tours", get(tours_list).post(tours_create))
		.route("/api/tours/:id", get(tours_get).put(tours_update).delete(tours_delete))
		.route("/api/graph", get(graph_get).post(graph_save).put(graph_save))
		.route("/api/graph/regenerate", post(graph_regenerate))
		.route("/api/graph/cleanup", post(graph_cleanup))
		.route("/api/route", get(route_find))
		.route("/api/analytics/visit", post(analytics_visit))
		.route("/api/analytics/ping", post(analytics_ping))
		.route("/api/analytics/stats", get(analytics_stats))
		.route("/api/analytics/concurrent", get(analytics_concurrent))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
	Json(Health { status: "ok", uptime_ms: state.start_time.elapsed().as_millis() })
}

/// Effective storage locations, plus an optional existence check under uploads.
async fn health_storage(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
	let content = state.content.clone();
	let paths = match run_blocking(move || Ok(content.paths())).await {
		Ok(p) => p,
		Err(resp) => return resp,
	};
	let test_file = params.get("file").filter(|f| !f.is_empty()).cloned();
	let exists = test_file.as_deref().map(|name| {
		let rel = FsPath::new(name);
		rel.components().all(|c| matches!(c, Component::Normal(_))) && state.config.uploads_dir.join(rel).exists()
	});
	Json(json!({
		"cms_data_dir": state.config.data_dir,
		"uploads_dir": state.config.uploads_dir,
		"scenes_file_write": paths.scenes_file_write,
		"scenes_loaded_from": paths.scenes_loaded_from,
		"graph_path": paths.graph_path,
		"tours_file_path": paths.tours_file_path,
		"test_file": test_file,
		"test_file_exists": exists,
	}))
	.into_response()
}

fn local_file_info(path: &FsPath) -> LocalFileInfo {
	let path = fsio::absolutize(path);
	let meta = match std::fs::metadata(&path) {
		Ok(m) => m,
		Err(_) => return LocalFileInfo { path, exists: false, size: None, mtime: None, sha256: None, error: None },
	};
	let mtime = meta.modified().ok().and_then(|t| t.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_secs_f64());
	match std::fs::read(&path) {
		Ok(bytes) => LocalFileInfo { sha256: Some(fsio::sha256_hex(&bytes)), path, exists: true, size: Some(meta.len()), mtime, error: None },
		Err(err) => {
			warn!(path = %path.display(), %err, "could not hash local document");
			LocalFileInfo { path, exists: true, size: Some(meta.len()), mtime, sha256: None, error: Some(err.to_string()) }
		}
	}
}

/// Local document digests against the remote mirror's copies.
async fn health_sync(State(state): State<Arc<AppState>>) -> Response {
	const KEY: &str = "/health/sync";
	if let Some(cached) = state.cache.get(KEY) {
		return Json(cached).into_response();
	}
	let content = state.content.clone();
	let locals = match run_blocking(move || Ok(DocKind::ALL.map(|kind| (kind, local_file_info(&content.local_path(kind)))))).await {
		Ok(l) => l,
		Err(resp) => return resp,
	};
	let mirror = state.content.mirror();
	let mut body = serde_json::Map::new();
	body.insert(
		"github".into(),
		json!({
			"configured": mirror.remote_configured(),
			"repo": state.config.remote.as_ref().map(|r| r.repo.clone()),
			"branch": state.config.remote.as_ref().map(|r| r.branch.clone()),
		}),
	);
	for (kind, disk) in locals {
		let remote = mirror.remote_status(kind).await;
		let in_sync = matches!((&disk.sha256, &remote.gh_sha256), (Some(d), Some(g)) if d == g);
		let mut entry = json!(disk);
		if let Some(obj) = entry.as_object_mut() {
			obj.insert("gh".into(), json!(remote));
			obj.insert("in_sync".into(), json!(in_sync));
		}
		body.insert(kind.as_str().into(), entry);
	}
	let body = JsonValue::Object(body);
	state.cache.put(KEY, body.clone());
	Json(body).into_response()
}

// scenes

async fn scenes_list(State(state): State<Arc<AppState>>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || Ok(content.list_scenes())).await {
		Ok(scenes) => Json(scenes).into_response(),
		Err(resp) => resp,
	}
}

async fn scenes_get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.get_scene(&id)).await {
		Ok(scene) => Json(scene).into_response(),
		Err(resp) => resp,
	}
}

async fn scenes_create(State(state): State<Arc<AppState>>, Json(body): Json<JsonValue>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.create_scene(body)).await {
		Ok(change) => {
			let scene = publish(&state, change);
			state.cache.invalidate(Some("/api/route"));
			(StatusCode::CREATED, Json(scene)).into_response()
		}
		Err(resp) => resp,
	}
}

async fn scenes_update(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(body): Json<JsonValue>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.update_scene(&id, body)).await {
		Ok(change) => {
			let scene = publish(&state, change);
			state.cache.invalidate(Some("/api/route"));
			Json(scene).into_response()
		}
		Err(resp) => resp,
	}
}

async fn scenes_delete(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.delete_scene(&id)).await {
		Ok(change) => {
			let removed = publish(&state, change);
			state.cache.invalidate(Some("/api/route"));
			debug!(scene_id = %removed, "scene delete acknowledged");
			StatusCode::NO_CONTENT.into_response()
		}
		Err(resp) => resp,
	}
}

// tours

async fn tours_list(State(state): State<Arc<AppState>>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || Ok(content.list_tours())).await {
		Ok(tours) => Json(tours).into_response(),
		Err(resp) => resp,
	}
}

async fn tours_get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.get_tour(&id)).await {
		Ok(tour) => Json(tour).into_response(),
		Err(resp) => resp,
	}
}

async fn tours_create(State(state): State<Arc<AppState>>, Json(body): Json<JsonValue>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.create_tour(body)).await {
		Ok(change) => (StatusCode::CREATED, Json(publish(&state, change))).into_response(),
		Err(resp) => resp,
	}
}

async fn tours_update(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(body): Json<JsonValue>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.update_tour(&id, body)).await {
		Ok(change) => Json(publish(&state, change)).into_response(),
		Err(resp) => resp,
	}
}

async fn tours_delete(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
	let content = state.content.clone();
	let tour_id = id.clone();
	match run_blocking(move || content.delete_tour(&tour_id)).await {
		Ok(change) => {
			publish(&state, change);
			Json(json!({ "message": format!("Tour '{id}' deleted") })).into_response()
		}
		Err(resp) => resp,
	}
}

// graph

async fn graph_get(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
	let raw = params.get("raw").map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(false);
	let content = state.content.clone();
	let graph = run_blocking(move || Ok(if raw { content.graph_raw() } else { content.graph_view() })).await;
	match graph {
		Ok(graph) => Json(graph).into_response(),
		Err(resp) => resp,
	}
}

async fn graph_save(State(state): State<Arc<AppState>>, Json(body): Json<JsonValue>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.save_graph(body)).await {
		Ok(change) => {
			let report = publish(&state, change);
			Json(with_status(&report, "Graph saved")).into_response()
		}
		Err(resp) => resp,
	}
}

async fn graph_regenerate(State(state): State<Arc<AppState>>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.regenerate_graph()).await {
		Ok(change) => {
			let report = publish(&state, change);
			Json(with_status(&report, "Graph regenerated from scenes (positions preserved)")).into_response()
		}
		Err(resp) => resp,
	}
}

async fn graph_cleanup(State(state): State<Arc<AppState>>) -> Response {
	let content = state.content.clone();
	match run_blocking(move || content.cleanup_graph()).await {
		Ok(change) => {
			let report = publish(&state, change);
			Json(with_status(&report, "Graph cleaned successfully")).into_response()
		}
		Err(resp) => resp,
	}
}

async fn route_find(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
	let (Some(from), Some(to)) = (params.get("from").filter(|s| !s.is_empty()), params.get("to").filter(|s| !s.is_empty())) else {
		return json_error(StatusCode::BAD_REQUEST, "INVALID_INPUT", "from and to are required", None);
	};
	let key = format!("/api/route?from={from}&to={to}");
	if let Some(cached) = state.cache.get(&key) {
		return Json(cached).into_response();
	}
	let content = state.content.clone();
	let (from, to) = (from.clone(), to.clone());
	match run_blocking(move || content.route(&from, &to)).await {
		Ok(path) => {
			let body = json!({ "path": path });
			state.cache.put(key, body.clone());
			Json(body).into_response()
		}
		Err(resp) => resp,
	}
}

// analytics

async fn analytics_visit(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
	let stats = state.stats.clone();
	let session = session_header(&headers);
	match run_blocking(move || stats.track_visit(session)).await {
		Ok(outcome) => Json(outcome).into_response(),
		Err(resp) => resp,
	}
}

async fn analytics_ping(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<JsonValue> {
	let concurrent = state.stats.ping(session_header(&headers).as_deref());
	Json(json!({ "concurrent": concurrent }))
}

async fn analytics_stats(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> Response {
	let stats = state.stats.clone();
	match run_blocking(move || Ok(stats.get_stats(&query))).await {
		Ok(report) => Json(report).into_response(),
		Err(resp) => resp,
	}
}

async fn analytics_concurrent(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
	state.stats.cleanup_inactive();
	Json(json!({ "concurrent": state.stats.concurrent() }))
}

/// Expire idle sessions and stale cache entries. Never writes the stats file.
async fn maintenance_loop(state: Arc<AppState>) {
	let interval = state.config.session_clean_interval;
	loop {
		sleep(interval).await;
		let expired = state.stats.cleanup_inactive();
		let pruned = state.cache.prune();
		if expired > 0 || pruned > 0 {
			debug!(expired, pruned, concurrent = state.stats.concurrent(), "maintenance pass");
		}
	}
}

async fn shutdown_signal() {
	let _ = signal::ctrl_c().await;
}
