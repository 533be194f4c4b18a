//! Best-effort replication of saved documents: local mirror copies and an
//! optional remote contents-by-path store (GitHub contents API).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::RemoteConfig;
use crate::error::{StoreError, StoreResult};
use crate::fsio;
use crate::paths::{DocKind, PathResolver};

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const UPSERT_TIMEOUT: Duration = Duration::from_secs(30);

/// A document that has just been durably written to its primary location.
#[derive(Debug, Clone)]
pub struct Published {
	pub kind: DocKind,
	pub path: PathBuf,
	pub bytes: Arc<Vec<u8>>,
}

impl Published {
	pub fn new(kind: DocKind, path: PathBuf, bytes: Vec<u8>) -> Self {
		Self { kind, path, bytes: Arc::new(bytes) }
	}
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
	pub revision: String,
	pub content: Vec<u8>,
	pub size: Option<u64>,
}

/// Remote version-controlled store addressed by path. Writes must carry the
/// current revision token when the path already exists.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
	async fn fetch(&self, path: &str) -> StoreResult<Option<RemoteFile>>;

	async fn upsert(&self, path: &str, content: &[u8], revision: Option<&str>, message: &str) -> StoreResult<()>;

	async fn get_revision(&self, path: &str) -> Option<String> {
		match self.fetch(path).await {
			Ok(file) => file.map(|f| f.revision),
			Err(err) => {
				warn!(path, %err, "remote revision lookup failed");
				None
			}
		}
	}
}

#[derive(Deserialize)]
struct ContentsResponse {
	sha: String,
	#[serde(default)]
	content: Option<String>,
	#[serde(default)]
	size: Option<u64>,
}

#[derive(Serialize)]
struct ContentsPut<'a> {
	message: &'a str,
	branch: &'a str,
	content: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	sha: Option<&'a str>,
}

/// GitHub contents API client.
pub struct GitHubContents {
	client: reqwest::Client,
	api_base: String,
	repo: String,
	branch: String,
	token: String,
}

impl GitHubContents {
	pub fn new(cfg: &RemoteConfig) -> StoreResult<Self> {
		let client = reqwest::Client::builder()
			.user_agent(concat!("tour-cms-server/", env!("CARGO_PKG_VERSION")))
			.timeout(UPSERT_TIMEOUT)
			.build()
			.map_err(|e| StoreError::Mirror(e.to_string()))?;
		Ok(Self {
			client,
			api_base: cfg.api_base.trim_end_matches('/').to_string(),
			repo: cfg.repo.clone(),
			branch: cfg.branch.clone(),
			token: cfg.token.clone(),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}/repos/{}/contents/{}", self.api_base, self.repo, path.trim_start_matches('/'))
	}

	fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
		self.client
			.request(method, self.url(path))
			.header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
			.header(reqwest::header::ACCEPT, "application/vnd.github+json")
	}
}

#[async_trait::async_trait]
impl RemoteStore for GitHubContents {
	async fn fetch(&self, path: &str) -> StoreResult<Option<RemoteFile>> {
		let resp = self
			.request(reqwest::Method::GET, path)
			.query(&[("ref", self.branch.as_str())])
			.timeout(FETCH_TIMEOUT)
			.send()
			.await
			.map_err(|e| StoreError::Mirror(e.to_string()))?;
		let status = resp.status();
		if status == reqwest::StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !status.is_success() {
			return Err(StoreError::Mirror(format!("GET {path}: status {}", status.as_u16())));
		}
		let body: ContentsResponse = resp.json().await.map_err(|e| StoreError::Mirror(e.to_string()))?;
		let content = match body.content {
			Some(b64) => {
				let compact: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();
				base64::engine::general_purpose::STANDARD
					.decode(compact)
					.map_err(|e| StoreError::Mirror(format!("GET {path}: bad base64: {e}")))?
			}
			None => Vec::new(),
		};
		Ok(Some(RemoteFile { revision: body.sha, content, size: body.size }))
	}

	async fn upsert(&self, path: &str, content: &[u8], revision: Option<&str>, message: &str) -> StoreResult<()> {
		let body = ContentsPut {
			message,
			branch: &self.branch,
			content: base64::engine::general_purpose::STANDARD.encode(content),
			sha: revision,
		};
		let resp = self
			.request(reqwest::Method::PUT, path)
			.json(&body)
			.send()
			.await
			.map_err(|e| StoreError::Mirror(e.to_string()))?;
		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}
		let text = resp.text().await.unwrap_or_default();
		let snippet: String = text.chars().take(200).collect();
		Err(StoreError::Mirror(format!("PUT {path}: status {} {snippet}", status.as_u16())))
	}
}

#[derive(Debug, Clone)]
pub struct RemotePaths {
	pub scenes: String,
	pub tours: String,
	pub graph: String,
}

impl Default for RemotePaths {
	fn default() -> Self {
		Self {
			scenes: "backend/scenes.json".to_string(),
			tours: "cms/data/tours.json".to_string(),
			graph: "cms/data/graph.json".to_string(),
		}
	}
}

impl RemotePaths {
	pub fn get(&self, kind: DocKind) -> &str {
		match kind {
			DocKind::Scenes => &self.scenes,
			DocKind::Tours => &self.tours,
			DocKind::Graph => &self.graph,
		}
	}
}

#[derive(Debug, Default)]
pub struct MirrorReport {
	pub written: Vec<PathBuf>,
	pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Serialize)]
pub struct RemoteStatus {
	pub configured: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub gh_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub gh_sha: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub gh_sha256: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub size: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

pub struct MirrorSync {
	resolver: PathResolver,
	remote: Option<Arc<dyn RemoteStore>>,
	remote_paths: RemotePaths,
	// one remote write at a time so revision reads are not raced by our own puts
	gate: AsyncMutex<()>,
}

impl MirrorSync {
	pub fn new(resolver: PathResolver, remote: Option<Arc<dyn RemoteStore>>, remote_paths: RemotePaths) -> Self {
		Self { resolver, remote, remote_paths, gate: AsyncMutex::new(()) }
	}

	pub fn local_only(resolver: PathResolver) -> Self {
		Self::new(resolver, None, RemotePaths::default())
	}

	pub fn remote_configured(&self) -> bool {
		self.remote.is_some()
	}

	/// Secondary locations for `kind`, deduplicated by absolute path and
	/// excluding `primary`. The container location only counts when mounted.
	pub fn targets(&self, kind: DocKind, primary: &Path) -> Vec<PathBuf> {
		let primary = fsio::absolutize(primary);
		let container = self.resolver.container_path(kind).map(|p| fsio::absolutize(&p));
		let mut out: Vec<PathBuf> = Vec::new();
		for p in self.resolver.candidates(kind).into_iter().chain(self.resolver.legacy_paths(kind)) {
			if p == primary || out.contains(&p) {
				continue;
			}
			if container.as_ref() == Some(&p) && !p.parent().map(Path::is_dir).unwrap_or(false) {
				continue;
			}
			out.push(p);
		}
		out
	}

	/// Copy `bytes` to every secondary location; failures are logged per target.
	pub fn mirror_local(&self, kind: DocKind, primary: &Path, bytes: &[u8]) -> MirrorReport {
		let mut report = MirrorReport::default();
		for target in self.targets(kind, primary) {
			match fsio::write_atomic(&target, bytes) {
				Ok(()) => report.written.push(target),
				Err(err) => {
					warn!(kind = kind.as_str(), target = %target.display(), %err, "mirror write failed");
					report.failed.push((target, err.to_string()));
				}
			}
		}
		if !report.written.is_empty() {
			info!(kind = kind.as_str(), mirrors = report.written.len(), "mirrored document");
		}
		report
	}

	/// Read-modify-write upsert to the remote store. Never fails the caller.
	pub async fn push_remote(&self, published: &Published) -> bool {
		let Some(remote) = self.remote.as_ref() else { return false };
		let _turn = self.gate.lock().await;
		let path = self.remote_paths.get(published.kind);
		let revision = remote.get_revision(path).await;
		let message = format!("CMS: update {}", published.kind.file_name());
		match remote.upsert(path, &published.bytes, revision.as_deref(), &message).await {
			Ok(()) => {
				info!(kind = published.kind.as_str(), remote_path = path, "committed to remote");
				true
			}
			Err(err) => {
				warn!(kind = published.kind.as_str(), remote_path = path, %err, "remote mirror failed");
				false
			}
		}
	}

	/// Fire-and-forget variant of [`push_remote`](Self::push_remote).
	pub fn spawn_remote(self: &Arc<Self>, published: Published) {
		if self.remote.is_none() {
			return;
		}
		let this = Arc::clone(self);
		tokio::spawn(async move {
			this.push_remote(&published).await;
		});
	}

	pub async fn remote_status(&self, kind: DocKind) -> RemoteStatus {
		let path = self.remote_paths.get(kind).to_string();
		let Some(remote) = self.remote.as_ref() else {
			return RemoteStatus { configured: false, gh_path: None, gh_sha: None, gh_sha256: None, size: None, error: None };
		};
		match remote.fetch(&path).await {
			Ok(Some(file)) => RemoteStatus {
				configured: true,
				gh_sha256: Some(fsio::sha256_hex(&file.content)),
				gh_sha: Some(file.revision),
				size: file.size.or(Some(file.content.len() as u64)),
				gh_path: Some(path),
				error: None,
			},
			Ok(None) => RemoteStatus { configured: true, gh_path: Some(path), gh_sha: None, gh_sha256: None, size: None, error: Some("not found".to_string()) },
			Err(err) => RemoteStatus { configured: true, gh_path: Some(path), gh_sha: None, gh_sha256: None, size: None, error: Some(err.to_string()) },
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::fs;
	use std::sync::Mutex as StdMutex;
	use tempfile::TempDir;

	/// In-memory remote used by the store and handler tests.
	#[derive(Default)]
	pub(crate) struct FakeRemote {
		pub files: StdMutex<HashMap<String, (String, Vec<u8>)>>,
		pub puts: StdMutex<Vec<(String, Option<String>)>>,
		pub fail_upserts: bool,
	}

	#[async_trait::async_trait]
	impl RemoteStore for FakeRemote {
		async fn fetch(&self, path: &str) -> StoreResult<Option<RemoteFile>> {
			let files = self.files.lock().unwrap();
			Ok(files.get(path).map(|(rev, content)| RemoteFile { revision: rev.clone(), content: content.clone(), size: Some(content.len() as u64) }))
		}

		async fn upsert(&self, path: &str, content: &[u8], revision: Option<&str>, _message: &str) -> StoreResult<()> {
			self.puts.lock().unwrap().push((path.to_string(), revision.map(str::to_string)));
			if self.fail_upserts {
				return Err(StoreError::Mirror("remote rejected".into()));
			}
			let mut files = self.files.lock().unwrap();
			let next = format!("rev{}", files.len() + 1);
			files.insert(path.to_string(), (next, content.to_vec()));
			Ok(())
		}
	}

	fn resolver(root: &Path) -> PathResolver {
		PathResolver::new(root.join("data"), root.join("project").join("backend"), Some(root.join("app").join("cms").join("data")))
	}

	#[test]
	fn targets_exclude_primary_and_unmounted_container() {
		let dir = TempDir::new().unwrap();
		let r = resolver(dir.path());
		let mirror = MirrorSync::local_only(r.clone());
		let primary = r.default_path(DocKind::Scenes);
		let targets = mirror.targets(DocKind::Scenes, &primary);
		assert!(!targets.contains(&fsio::absolutize(&primary)));
		assert!(targets.iter().all(|t| !t.starts_with(dir.path().join("app"))));
		assert!(targets.iter().any(|t| t.ends_with("backend/scenes.json")));

		fs::create_dir_all(dir.path().join("app").join("cms").join("data")).unwrap();
		let targets = mirror.targets(DocKind::Scenes, &primary);
		assert!(targets.iter().any(|t| t.starts_with(dir.path().join("app"))));
	}

	#[test]
	fn one_bad_target_does_not_block_the_others() {
		let dir = TempDir::new().unwrap();
		let r = resolver(dir.path());
		// a regular file where the project cms directory should be
		fs::create_dir_all(dir.path().join("project")).unwrap();
		fs::write(dir.path().join("project").join("cms"), b"blocker").unwrap();
		let mirror = MirrorSync::local_only(r.clone());
		let report = mirror.mirror_local(DocKind::Scenes, &r.default_path(DocKind::Scenes), b"[]");
		assert_eq!(report.failed.len(), 1);
		assert!(!report.written.is_empty());
		for w in &report.written {
			assert_eq!(fs::read(w).unwrap(), b"[]");
		}
	}

	#[tokio::test]
	async fn push_remote_sends_existing_revision() {
		let dir = TempDir::new().unwrap();
		let fake = Arc::new(FakeRemote::default());
		fake.files.lock().unwrap().insert("cms/data/tours.json".into(), ("abc".into(), b"[]".to_vec()));
		let mirror = MirrorSync::new(resolver(dir.path()), Some(fake.clone()), RemotePaths::default());
		let published = Published::new(DocKind::Tours, dir.path().join("tours.json"), b"[{}]".to_vec());
		assert!(mirror.push_remote(&published).await);
		let puts = fake.puts.lock().unwrap().clone();
		assert_eq!(puts, vec![("cms/data/tours.json".to_string(), Some("abc".to_string()))]);

		let status = mirror.remote_status(DocKind::Tours).await;
		assert_eq!(status.gh_sha256.as_deref(), Some(fsio::sha256_hex(b"[{}]").as_str()));
	}

	#[tokio::test]
	async fn remote_failure_is_swallowed() {
		let dir = TempDir::new().unwrap();
		let fake = Arc::new(FakeRemote { fail_upserts: true, ..Default::default() });
		let mirror = MirrorSync::new(resolver(dir.path()), Some(fake.clone()), RemotePaths::default());
		let published = Published::new(DocKind::Graph, dir.path().join("graph.json"), b"{}".to_vec());
		assert!(!mirror.push_remote(&published).await);
		assert_eq!(fake.puts.lock().unwrap()[0].1, None);
	}
}
