use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mirror::RemotePaths;

/// Credentials and target of the remote contents-API mirror.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
	pub token: String,
	pub repo: String,
	pub branch: String,
	pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub base_dir: PathBuf,
	pub data_dir: PathBuf,
	pub uploads_dir: PathBuf,
	pub stats_path: PathBuf,
	pub container_dir: Option<PathBuf>,
	pub remote: Option<RemoteConfig>,
	pub remote_paths: RemotePaths,
	pub session_timeout_secs: u64,
	pub session_clean_interval: Duration,
	pub response_cache_ttl: Duration,
}

const DEFAULT_BIND: &str = "127.0.0.1:5000";
const DEFAULT_CONTAINER_DIR: &str = "/app/cms/data";

impl Config {
	/// Read `.env` (if any) and the process environment.
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		Self::from_lookup(|k| std::env::var(k).ok())
	}

	pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
		let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
		let num = |k: &str, default: u64| var(k).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

		let bind = match var("PORT").and_then(|p| p.parse::<u16>().ok()) {
			Some(port) => format!("0.0.0.0:{port}"),
			None => var("HTTP_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
		};
		let bind: SocketAddr = bind.parse()?;

		let base_dir = match var("BASE_DIR") {
			Some(dir) => PathBuf::from(dir),
			None => std::env::current_dir()?,
		};
		let data_override = var("DATA_DIR").map(PathBuf::from);
		let data_dir = data_override.clone().unwrap_or_else(|| base_dir.join("cms").join("data"));
		let stats_path = data_override.unwrap_or_else(|| base_dir.clone()).join("stats.json");
		let uploads_dir = var("UPLOADS_DIR").map(PathBuf::from).unwrap_or_else(|| base_dir.join("uploads"));
		let container_dir = match get("CONTAINER_DATA_DIR") {
			Some(v) if v.trim().is_empty() => None,
			Some(v) => Some(PathBuf::from(v.trim())),
			None => Some(PathBuf::from(DEFAULT_CONTAINER_DIR)),
		};

		let remote = match (var("GH_TOKEN"), var("GH_REPO")) {
			(Some(token), Some(repo)) => Some(RemoteConfig {
				token,
				repo,
				branch: var("GH_BRANCH").unwrap_or_else(|| "main".to_string()),
				api_base: var("GH_API_BASE").unwrap_or_else(|| "https://api.github.com".to_string()),
			}),
			_ => None,
		};
		let defaults = RemotePaths::default();
		let remote_paths = RemotePaths {
			scenes: var("GH_PATH_SCENES").unwrap_or(defaults.scenes),
			tours: var("GH_PATH_TOURS").unwrap_or(defaults.tours),
			graph: var("GH_PATH_GRAPH").unwrap_or(defaults.graph),
		};

		Ok(Self {
			bind,
			base_dir,
			data_dir,
			uploads_dir,
			stats_path,
			container_dir,
			remote,
			remote_paths,
			session_timeout_secs: num("SESSION_TIMEOUT_SECS", 120),
			session_clean_interval: Duration::from_millis(num("SESSION_CLEAN_INTERVAL_MS", 300_000)),
			response_cache_ttl: Duration::from_millis(num("RESPONSE_CACHE_TTL_MS", 30_000)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn load(pairs: &[(&str, &str)]) -> Config {
		let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		Config::from_lookup(|k| env.get(k).cloned()).unwrap()
	}

	#[test]
	fn defaults_follow_base_dir() {
		let cfg = load(&[("BASE_DIR", "/srv/backend")]);
		assert_eq!(cfg.bind, "127.0.0.1:5000".parse().unwrap());
		assert_eq!(cfg.data_dir, PathBuf::from("/srv/backend/cms/data"));
		assert_eq!(cfg.stats_path, PathBuf::from("/srv/backend/stats.json"));
		assert_eq!(cfg.uploads_dir, PathBuf::from("/srv/backend/uploads"));
		assert_eq!(cfg.container_dir, Some(PathBuf::from("/app/cms/data")));
		assert!(cfg.remote.is_none());
		assert_eq!(cfg.remote_paths.scenes, "backend/scenes.json");
		assert_eq!(cfg.session_timeout_secs, 120);
	}

	#[test]
	fn data_dir_moves_stats_and_remote_needs_both_keys() {
		let cfg = load(&[("BASE_DIR", "/b"), ("DATA_DIR", "/data/data"), ("CONTAINER_DATA_DIR", ""), ("GH_TOKEN", "t"), ("PORT", "8080")]);
		assert_eq!(cfg.stats_path, PathBuf::from("/data/data/stats.json"));
		assert_eq!(cfg.container_dir, None);
		assert!(cfg.remote.is_none());
		assert_eq!(cfg.bind.port(), 8080);

		let cfg = load(&[("BASE_DIR", "/b"), ("GH_TOKEN", "t"), ("GH_REPO", "o/r"), ("GH_PATH_GRAPH", "g.json")]);
		let remote = cfg.remote.unwrap();
		assert_eq!((remote.repo.as_str(), remote.branch.as_str()), ("o/r", "main"));
		assert_eq!(cfg.remote_paths.graph, "g.json");
	}
}
