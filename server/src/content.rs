//! The per-process content store: scenes, tours and the graph behind one
//! lock, with graph regeneration wired to scene mutations.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::graph::{self, CleanupReport, Graph, GraphStore, RegenerateReport, SaveReport};
use crate::mirror::{MirrorSync, Published};
use crate::paths::{DocKind, PathResolver};
use crate::scenes::{Scene, SceneStore};
use crate::tours::{Tour, TourPatch, TourStore};

/// Result of a mutation plus the documents that should go to the remote store.
#[derive(Debug)]
pub struct Change<T> {
	pub value: T,
	pub remote: Vec<Published>,
}

impl<T> Change<T> {
	fn new(value: T, remote: Vec<Published>) -> Self {
		Self { value, remote }
	}
}

#[derive(Debug, Serialize)]
pub struct DocumentPaths {
	pub scenes_file_write: PathBuf,
	pub scenes_loaded_from: Option<PathBuf>,
	pub graph_path: PathBuf,
	pub tours_file_path: PathBuf,
}

struct Stores {
	scenes: SceneStore,
	tours: TourStore,
	graph: GraphStore,
}

impl Stores {
	/// Keep the graph in step with scenes; failure here never fails the scene write.
	fn regenerate_after_scene_change(&mut self) {
		if let Err(err) = self.graph.regenerate(self.scenes.scenes()) {
			warn!(%err, "could not regenerate graph after scene change");
		}
	}
}

pub struct ContentStore {
	stores: StdMutex<Stores>,
	mirror: Arc<MirrorSync>,
}

impl ContentStore {
	/// Bootstrap documents into the data directory, then open every store.
	pub fn open(resolver: PathResolver, mirror: Arc<MirrorSync>) -> StoreResult<Self> {
		for kind in DocKind::ALL {
			if let Some(from) = resolver.bootstrap(kind) {
				info!(kind = kind.as_str(), from = %from.display(), "migrated document into data directory");
			}
		}
		let scenes = SceneStore::open(resolver.clone(), Arc::clone(&mirror))?;
		let tours = TourStore::open(&resolver)?;
		let graph = GraphStore::open(resolver)?;
		info!(
			scenes = scenes.scenes().len(),
			scenes_from = ?scenes.loaded_from(),
			tours = %tours.path().display(),
			graph = %graph.path().display(),
			"content stores ready"
		);
		Ok(Self { stores: StdMutex::new(Stores { scenes, tours, graph }), mirror })
	}

	fn lock(&self) -> MutexGuard<'_, Stores> {
		self.stores.lock().unwrap_or_else(|p| p.into_inner())
	}

	pub fn mirror(&self) -> &Arc<MirrorSync> {
		&self.mirror
	}

	pub fn paths(&self) -> DocumentPaths {
		let s = self.lock();
		DocumentPaths {
			scenes_file_write: s.scenes.primary_path(),
			scenes_loaded_from: s.scenes.loaded_from().map(PathBuf::from),
			graph_path: s.graph.path().to_path_buf(),
			tours_file_path: s.tours.path().to_path_buf(),
		}
	}

	pub fn local_path(&self, kind: DocKind) -> PathBuf {
		let p = self.paths();
		match kind {
			DocKind::Scenes => p.scenes_file_write,
			DocKind::Tours => p.tours_file_path,
			DocKind::Graph => p.graph_path,
		}
	}

	// scenes

	pub fn list_scenes(&self) -> Vec<Scene> {
		self.lock().scenes.list()
	}

	pub fn get_scene(&self, id: &str) -> StoreResult<Scene> {
		self.lock().scenes.get(id)
	}

	pub fn create_scene(&self, payload: Value) -> StoreResult<Change<Scene>> {
		let mut s = self.lock();
		let (scene, published) = s.scenes.create(payload)?;
		s.regenerate_after_scene_change();
		Ok(Change::new(scene, vec![published]))
	}

	pub fn update_scene(&self, id: &str, payload: Value) -> StoreResult<Change<Scene>> {
		let mut s = self.lock();
		let (scene, published) = s.scenes.update(id, payload)?;
		s.regenerate_after_scene_change();
		Ok(Change::new(scene, vec![published]))
	}

	pub fn delete_scene(&self, id: &str) -> StoreResult<Change<String>> {
		let mut s = self.lock();
		let (removed, published) = s.scenes.delete(id)?;
		s.regenerate_after_scene_change();
		Ok(Change::new(removed, vec![published]))
	}

	// tours

	pub fn list_tours(&self) -> Vec<Tour> {
		self.lock().tours.list()
	}

	pub fn get_tour(&self, id: &str) -> StoreResult<Tour> {
		self.lock().tours.get(id)
	}

	pub fn create_tour(&self, payload: Value) -> StoreResult<Change<Tour>> {
		let patch = TourPatch::from_value(payload)?;
		let (tour, published) = self.lock().tours.create(patch)?;
		Ok(Change::new(tour, vec![published]))
	}

	pub fn update_tour(&self, id: &str, payload: Value) -> StoreResult<Change<Tour>> {
		let patch = TourPatch::from_value(payload)?;
		let (tour, published) = self.lock().tours.update(id, patch)?;
		Ok(Change::new(tour, vec![published]))
	}

	pub fn delete_tour(&self, id: &str) -> StoreResult<Change<()>> {
		let published = self.lock().tours.delete(id)?;
		Ok(Change::new((), vec![published]))
	}

	// graph

	pub fn graph_view(&self) -> Graph {
		let mut s = self.lock();
		s.scenes.reload();
		let Stores { scenes, graph, .. } = &mut *s;
		graph.view(scenes.scenes())
	}

	pub fn graph_raw(&self) -> Graph {
		self.lock().graph.raw()
	}

	pub fn save_graph(&self, client: Value) -> StoreResult<Change<SaveReport>> {
		let (report, published) = self.lock().graph.save(client)?;
		Ok(Change::new(report, vec![published]))
	}

	pub fn regenerate_graph(&self) -> StoreResult<Change<RegenerateReport>> {
		let mut s = self.lock();
		s.scenes.reload();
		let Stores { scenes, graph, .. } = &mut *s;
		let (report, _) = graph.regenerate(scenes.scenes())?;
		Ok(Change::new(report, Vec::new()))
	}

	pub fn cleanup_graph(&self) -> StoreResult<Change<CleanupReport>> {
		let mut s = self.lock();
		s.scenes.reload();
		let ids = s.scenes.ids();
		let (report, _) = s.graph.cleanup(&ids)?;
		Ok(Change::new(report, Vec::new()))
	}

	/// Shortest hotspot path between two scenes.
	pub fn route(&self, from: &str, to: &str) -> StoreResult<Vec<String>> {
		let mut s = self.lock();
		s.scenes.reload();
		graph::shortest_route(s.scenes.scenes(), from, to).ok_or_else(|| StoreError::NotFound(format!("no path from {from} to {to}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::fs;
	use tempfile::TempDir;

	fn open(dir: &TempDir) -> ContentStore {
		let resolver = PathResolver::new(dir.path().join("data"), dir.path().join("backend"), None);
		let mirror = Arc::new(MirrorSync::local_only(resolver.clone()));
		ContentStore::open(resolver, mirror).unwrap()
	}

	#[test]
	fn scene_mutations_regenerate_the_graph() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir);
		store.create_scene(json!({"id": "a", "hotspots": [{"target": "b"}]})).unwrap();
		store.create_scene(json!({"id": "b"})).unwrap();
		let g = store.graph_raw();
		assert_eq!(g.nodes.len(), 2);
		assert_eq!(g.edges.len(), 1);

		store.save_graph(json!({"nodes": [{"id": "a", "x": 5, "y": 6}, {"id": "b"}], "edges": []})).unwrap();
		store.update_scene("a", json!({"hotspots": []})).unwrap();
		let g = store.graph_raw();
		assert!(g.edges.is_empty());
		let a = g.nodes.iter().find(|n| n.id == "a").unwrap();
		assert_eq!(a.x, Some(json!(5)));

		store.delete_scene("b").unwrap();
		let ids: Vec<String> = store.graph_raw().nodes.into_iter().map(|n| n.id).collect();
		assert!(ids.contains(&"b".to_string()), "regeneration keeps nodes without scenes");
		let report = store.cleanup_graph().unwrap().value;
		assert_eq!(report.removed_nodes, vec!["b"]);
	}

	#[test]
	fn mutations_report_remote_documents() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir);
		let change = store.create_scene(json!({"id": "a"})).unwrap();
		assert_eq!(change.remote.len(), 1);
		assert_eq!(change.remote[0].kind, DocKind::Scenes);
		let change = store.create_tour(json!({"name": "T"})).unwrap();
		assert_eq!(change.remote[0].kind, DocKind::Tours);
		assert!(store.regenerate_graph().unwrap().remote.is_empty());
	}

	#[test]
	fn open_bootstraps_from_project_location() {
		let dir = TempDir::new().unwrap();
		let project = dir.path().join("cms").join("data");
		fs::create_dir_all(&project).unwrap();
		fs::write(project.join("tours.json"), br#"[{"id": "t", "name": "Old"}]"#).unwrap();
		let store = open(&dir);
		assert!(dir.path().join("data").join("tours.json").exists());
		assert_eq!(store.get_tour("t").unwrap().name, "Old");
		assert!(store.paths().tours_file_path.starts_with(dir.path().join("data")));
	}

	#[test]
	fn route_not_found_is_typed() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir);
		store.create_scene(json!({"id": "a", "hotspots": [{"target": "b"}]})).unwrap();
		store.create_scene(json!({"id": "b"})).unwrap();
		assert_eq!(store.route("a", "b").unwrap(), vec!["a", "b"]);
		assert!(matches!(store.route("b", "a"), Err(StoreError::NotFound(_))));
	}
}
