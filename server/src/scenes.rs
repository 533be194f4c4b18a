//! Scene document store: identifier-keyed records backed by `scenes.json`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::fsio::{self, CorruptBackups};
use crate::mirror::{MirrorSync, Published};
use crate::paths::{DocKind, PathResolver};
use crate::urlnorm::{normalize_url, normalize_value};

/// Fields holding media URLs that are normalized before persistence.
pub const URL_FIELDS: &[&str] = &["url"];

const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_BACKOFF: Duration = Duration::from_millis(100);

/// One scene record. `record` is the full JSON object (including `id`) so
/// unknown fields survive a round trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
	pub id: String,
	record: Map<String, Value>,
}

impl Serialize for Scene {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.record.serialize(serializer)
	}
}

/// Identifier as a string; numeric identifiers are accepted and stringified.
pub fn id_string(value: &Value) -> Option<String> {
	match value {
		Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

/// Serde adapter for identifier fields written as either strings or numbers.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let value = <Value as serde::Deserialize>::deserialize(deserializer)?;
	id_string(&value).ok_or_else(|| serde::de::Error::custom("identifier must be a non-empty string or a number"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hotspot {
	pub target: Option<String>,
	pub label: String,
}

impl Scene {
	pub fn from_record(mut record: Map<String, Value>) -> Option<Self> {
		let id = record.get("id").and_then(id_string)?;
		record.insert("id".to_string(), Value::String(id.clone()));
		Some(Self { id, record })
	}

	pub fn get(&self, field: &str) -> Option<&Value> {
		self.record.get(field)
	}

	/// Display label: Vietnamese name first, then any plain or localized name, then the id.
	pub fn label(&self) -> String {
		match self.record.get("name") {
			Some(Value::String(s)) if !s.is_empty() => s.clone(),
			Some(Value::Object(names)) => names
				.get("vi")
				.and_then(Value::as_str)
				.or_else(|| names.get("en").and_then(Value::as_str))
				.or_else(|| names.values().find_map(Value::as_str))
				.map(str::to_string)
				.unwrap_or_else(|| self.id.clone()),
			_ => self.id.clone(),
		}
	}

	pub fn floor(&self) -> Value {
		match self.record.get("floor") {
			Some(v) if !v.is_null() => v.clone(),
			_ => Value::from(0),
		}
	}

	/// Hotspots in declaration order; `target` is the navigation field only.
	pub fn hotspots(&self) -> Vec<Hotspot> {
		let Some(Value::Array(items)) = self.record.get("hotspots") else { return Vec::new() };
		items
			.iter()
			.filter_map(Value::as_object)
			.map(|h| Hotspot {
				target: h.get("target").and_then(id_string),
				label: h.get("label").and_then(Value::as_str).unwrap_or_default().to_string(),
			})
			.collect()
	}

	/// Navigation neighbours, accepting the `targetScene`/`targetSceneId` aliases.
	pub fn neighbor_ids(&self) -> Vec<String> {
		let Some(Value::Array(items)) = self.record.get("hotspots") else { return Vec::new() };
		let mut out: Vec<String> = Vec::new();
		for h in items.iter().filter_map(Value::as_object) {
			let target = ["target", "targetScene", "targetSceneId"].iter().find_map(|k| h.get(*k).and_then(id_string));
			if let Some(t) = target {
				if !out.contains(&t) {
					out.push(t);
				}
			}
		}
		out
	}

	/// Copy with URL fields rendered for clients (rooted, query kept).
	pub fn for_display(&self) -> Scene {
		let mut out = self.clone();
		for field in URL_FIELDS {
			if let Some(Value::String(u)) = out.record.get_mut(*field) {
				*u = normalize_url(u, true);
			}
		}
		out
	}

	fn normalize_urls(&mut self) {
		for field in URL_FIELDS {
			if let Some(v) = self.record.get_mut(*field) {
				normalize_value(v);
			}
		}
	}
}

/// How a field in an update payload combines with the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
	/// Payload value replaces the stored one.
	Incoming,
	/// Never changed by an update.
	Immutable,
	/// Stored value is kept when the payload omits the field; an explicit
	/// `null` clears it.
	KeepExistingWhenAbsent,
}

pub const MERGE_RULES: &[(&str, MergeRule)] = &[
	("id", MergeRule::Immutable),
	("floors", MergeRule::KeepExistingWhenAbsent),
	("description", MergeRule::KeepExistingWhenAbsent),
	("keywords", MergeRule::KeepExistingWhenAbsent),
	("author", MergeRule::KeepExistingWhenAbsent),
	("created_at", MergeRule::KeepExistingWhenAbsent),
	("updated_at", MergeRule::KeepExistingWhenAbsent),
];

pub fn merge_rule(field: &str) -> MergeRule {
	MERGE_RULES.iter().find(|(name, _)| *name == field).map(|(_, rule)| *rule).unwrap_or(MergeRule::Incoming)
}

/// Shallow merge of `payload` into `existing` following [`MERGE_RULES`].
pub fn merge_scene(existing: &Scene, payload: &Map<String, Value>) -> Scene {
	let mut merged = existing.clone();
	for (field, value) in payload {
		match merge_rule(field) {
			MergeRule::Immutable => {}
			MergeRule::Incoming | MergeRule::KeepExistingWhenAbsent => {
				merged.record.insert(field.clone(), value.clone());
			}
		}
	}
	merged.normalize_urls();
	merged
}

/// Parse either encoding of the collection: a list of objects with `id`,
/// or an object mapping id to record. Later duplicates replace earlier ones
/// in place.
pub fn parse_collection(value: Value) -> StoreResult<Vec<Scene>> {
	let mut out: Vec<Scene> = Vec::new();
	let mut push = |scene: Scene| match out.iter_mut().find(|s| s.id == scene.id) {
		Some(slot) => *slot = scene,
		None => out.push(scene),
	};
	match value {
		Value::Array(items) => {
			for item in items {
				match item {
					Value::Object(record) => match Scene::from_record(record) {
						Some(scene) => push(scene),
						None => debug!("skipping scene without id"),
					},
					_ => debug!("skipping non-object scene entry"),
				}
			}
		}
		Value::Object(map) => {
			for (key, item) in map {
				match item {
					Value::Object(mut record) => {
						if record.get("id").and_then(id_string).is_none() {
							record.insert("id".to_string(), Value::String(key));
						}
						if let Some(scene) = Scene::from_record(record) {
							push(scene);
						}
					}
					_ => debug!(key = %key, "skipping non-object scene entry"),
				}
			}
		}
		_ => return Err(StoreError::Validation("scenes document must be a list or an object".into())),
	}
	Ok(out)
}

fn read_collection(path: &Path) -> StoreResult<Vec<Scene>> {
	let value: Value = fsio::read_json(path)?;
	parse_collection(value).map_err(|_| StoreError::Corruption { path: path.to_path_buf(), backup: None })
}

pub struct SceneStore {
	resolver: PathResolver,
	mirror: Arc<MirrorSync>,
	scenes: Vec<Scene>,
	loaded_from: Option<PathBuf>,
	backups: CorruptBackups,
}

impl SceneStore {
	/// Resolve the backing file and load it. Never fails on unreadable content.
	pub fn open(resolver: PathResolver, mirror: Arc<MirrorSync>) -> StoreResult<Self> {
		let path = resolver.resolve(DocKind::Scenes)?;
		let mut store = Self { resolver, mirror, scenes: Vec::new(), loaded_from: None, backups: CorruptBackups::default() };
		store.load(&path);
		Ok(store)
	}

	pub fn primary_path(&self) -> PathBuf {
		fsio::absolutize(&self.resolver.default_path(DocKind::Scenes))
	}

	pub fn loaded_from(&self) -> Option<&Path> {
		self.loaded_from.as_deref()
	}

	pub fn scenes(&self) -> &[Scene] {
		&self.scenes
	}

	pub fn ids(&self) -> HashSet<String> {
		self.scenes.iter().map(|s| s.id.clone()).collect()
	}

	/// Replace the in-memory collection from `path`. On failure the
	/// collection is left empty; corrupt files are backed up first.
	pub fn load(&mut self, path: &Path) -> bool {
		self.scenes.clear();
		match read_collection(path) {
			Ok(scenes) => {
				debug!(path = %path.display(), count = scenes.len(), "loaded scenes");
				self.scenes = scenes;
				self.loaded_from = Some(path.to_path_buf());
				true
			}
			Err(StoreError::Corruption { .. }) => {
				self.backups.backup_file(path);
				warn!(path = %path.display(), "scenes file is corrupt, starting empty");
				false
			}
			Err(err) => {
				warn!(path = %path.display(), %err, "failed to load scenes");
				false
			}
		}
	}

	/// Refresh from the authoritative file to absorb writes by other processes.
	pub fn reload(&mut self) {
		let primary = self.primary_path();
		let source = if fsio::is_non_empty_file(&primary) { Some(primary) } else { self.loaded_from.clone() };
		if let Some(path) = source.filter(|p| p.exists()) {
			self.load(&path);
		}
	}

	fn position(&self, id: &str) -> Option<usize> {
		self.scenes.iter().position(|s| s.id == id)
	}

	/// Write the collection to the primary location, verify it reads back,
	/// then copy it to every mirror location.
	pub fn save(&mut self) -> StoreResult<Published> {
		let primary = self.primary_path();
		for scene in &mut self.scenes {
			scene.normalize_urls();
		}
		let bytes = fsio::to_pretty_bytes(&self.scenes)?;
		fsio::write_in_place(&primary, &bytes)?;
		info!(path = %primary.display(), count = self.scenes.len(), "saved scenes");
		self.verify(&primary);
		self.mirror.mirror_local(DocKind::Scenes, &primary, &bytes);
		Ok(Published::new(DocKind::Scenes, primary, bytes))
	}

	fn verify(&mut self, path: &Path) {
		for attempt in 1..=VERIFY_ATTEMPTS {
			match read_collection(path) {
				Ok(scenes) => {
					self.scenes = scenes;
					self.loaded_from = Some(path.to_path_buf());
					return;
				}
				Err(err) => {
					warn!(path = %path.display(), attempt, %err, "verify reload failed");
					if attempt < VERIFY_ATTEMPTS {
						std::thread::sleep(VERIFY_BACKOFF);
					}
				}
			}
		}
		error!(path = %path.display(), "scenes file did not verify after save");
	}

	/// Save; on failure restore the in-memory collection from disk so it
	/// never holds state that was not persisted.
	fn save_or_restore(&mut self) -> StoreResult<Published> {
		match self.save() {
			Ok(published) => Ok(published),
			Err(err) => {
				error!(%err, "scene save failed, restoring from disk");
				self.reload();
				Err(err)
			}
		}
	}

	pub fn list(&mut self) -> Vec<Scene> {
		self.reload();
		self.scenes.iter().map(Scene::for_display).collect()
	}

	pub fn get(&mut self, id: &str) -> StoreResult<Scene> {
		self.reload();
		self.position(id)
			.map(|i| self.scenes[i].for_display())
			.ok_or_else(|| StoreError::NotFound(format!("scene {id}")))
	}

	pub fn create(&mut self, payload: Value) -> StoreResult<(Scene, Published)> {
		let Value::Object(record) = payload else {
			return Err(StoreError::Validation("scene body must be a JSON object".into()));
		};
		let mut scene = Scene::from_record(record).ok_or_else(|| StoreError::Validation("scene id required".into()))?;
		self.reload();
		if self.position(&scene.id).is_some() {
			return Err(StoreError::Validation(format!("scene '{}' already exists", scene.id)));
		}
		scene.normalize_urls();
		let id = scene.id.clone();
		self.scenes.push(scene);
		let published = self.save_or_restore()?;
		info!(scene_id = %id, "created scene");
		let created = self.position(&id).map(|i| self.scenes[i].clone()).ok_or_else(|| StoreError::NotFound(format!("scene {id}")))?;
		Ok((created, published))
	}

	pub fn update(&mut self, id: &str, payload: Value) -> StoreResult<(Scene, Published)> {
		let Value::Object(patch) = payload else {
			return Err(StoreError::Validation("scene body must be a JSON object".into()));
		};
		if patch.is_empty() {
			return Err(StoreError::Validation("no data provided".into()));
		}
		self.reload();
		let idx = self.position(id).ok_or_else(|| StoreError::NotFound(format!("scene {id}")))?;
		let merged = merge_scene(&self.scenes[idx], &patch);
		if let (Some(old), Some(new)) = (self.scenes[idx].get("url"), merged.get("url")) {
			if old != new {
				info!(scene_id = %id, from = %old, to = %new, "scene url changed");
			}
		}
		self.scenes[idx] = merged;
		let published = self.save_or_restore()?;
		let updated = self.position(id).map(|i| self.scenes[i].clone()).ok_or_else(|| StoreError::NotFound(format!("scene {id}")))?;
		Ok((updated, published))
	}

	/// Delete by id, falling back to a case-insensitive match. Returns the
	/// id that was actually removed.
	pub fn delete(&mut self, id: &str) -> StoreResult<(String, Published)> {
		self.reload();
		let idx = self
			.position(id)
			.or_else(|| self.scenes.iter().position(|s| s.id.eq_ignore_ascii_case(id)))
			.ok_or_else(|| StoreError::NotFound(format!("scene {id}")))?;
		let actual = self.scenes.remove(idx).id;
		if actual != id {
			info!(requested = %id, scene_id = %actual, "deleting scene matched case-insensitively");
		}
		let mut published = self.save_or_restore()?;
		if let Some(still) = self.position(&actual) {
			warn!(scene_id = %actual, "scene still present after delete, removing again");
			self.scenes.remove(still);
			published = self.save_or_restore()?;
		}
		info!(scene_id = %actual, remaining = self.scenes.len(), "deleted scene");
		Ok((actual, published))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::fs;
	use tempfile::TempDir;

	fn store(dir: &TempDir) -> SceneStore {
		let resolver = PathResolver::new(dir.path().join("data"), dir.path().join("backend"), None);
		let mirror = Arc::new(MirrorSync::local_only(resolver.clone()));
		SceneStore::open(resolver, mirror).unwrap()
	}

	fn on_disk_ids(path: &Path) -> Vec<String> {
		let v: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
		v.as_array().unwrap().iter().map(|s| s["id"].as_str().unwrap().to_string()).collect()
	}

	#[test]
	fn accepts_both_encodings() {
		let list = parse_collection(json!([{"id": "a", "x": 1}, {"id": 7}, {"name": "no id"}])).unwrap();
		assert_eq!(list.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a", "7"]);
		let map = parse_collection(json!({"b": {"name": "B"}, "c": {"id": "c2"}})).unwrap();
		assert_eq!(map.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "c2"]);
		assert!(parse_collection(json!(3)).is_err());
	}

	#[test]
	fn merge_keeps_legacy_fields_and_id() {
		let existing = Scene::from_record(json!({"id": "a", "description": "old", "url": "x.jpg", "floor": 1}).as_object().unwrap().clone()).unwrap();
		let patch = json!({"id": "zzz", "url": "assets/assets/new.jpg?v=9", "floor": 2}).as_object().unwrap().clone();
		let merged = merge_scene(&existing, &patch);
		assert_eq!(merged.id, "a");
		assert_eq!(merged.get("id"), Some(&json!("a")));
		assert_eq!(merged.get("description"), Some(&json!("old")));
		assert_eq!(merged.get("url"), Some(&json!("/assets/new.jpg")));
		assert_eq!(merged.get("floor"), Some(&json!(2)));

		let patch = json!({"description": "new", "keywords": null}).as_object().unwrap().clone();
		let merged = merge_scene(&existing, &patch);
		assert_eq!(merged.get("description"), Some(&json!("new")));
		assert_eq!(merged.get("keywords"), Some(&Value::Null));

		let patch = json!({"description": null}).as_object().unwrap().clone();
		let merged = merge_scene(&existing, &patch);
		assert_eq!(merged.get("description"), Some(&Value::Null));
		assert_eq!(merged.get("floor"), Some(&json!(1)));
	}

	#[test]
	fn update_preserves_unspecified_description() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "hall", "description": "Main hall", "url": "/assets/h.jpg"})).unwrap();
		let (updated, _) = s.update("hall", json!({"url": "/assets/h2.jpg"})).unwrap();
		assert_eq!(updated.get("description"), Some(&json!("Main hall")));
		let (updated, _) = s.update("hall", json!({"description": "Lobby"})).unwrap();
		assert_eq!(updated.get("description"), Some(&json!("Lobby")));
		let (updated, _) = s.update("hall", json!({"description": null})).unwrap();
		assert_eq!(updated.get("description"), Some(&Value::Null));
		assert_eq!(updated.get("url"), Some(&json!("/assets/h2.jpg")));
		assert!(matches!(s.update("nope", json!({"a": 1})), Err(StoreError::NotFound(_))));
	}

	#[test]
	fn save_then_load_round_trips() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "a", "name": {"vi": "Sảnh"}, "hotspots": [{"target": "b"}]})).unwrap();
		s.create(json!({"id": "b", "custom": [1, 2, 3]})).unwrap();
		let before = s.scenes().to_vec();
		let path = s.primary_path();
		let mut fresh = store(&dir);
		assert!(fresh.load(&path));
		assert_eq!(fresh.scenes(), before.as_slice());
	}

	#[test]
	fn duplicate_create_is_rejected_without_change() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "x", "name": "first"})).unwrap();
		let err = s.create(json!({"id": "x", "name": "second"})).unwrap_err();
		assert!(matches!(err, StoreError::Validation(_)));
		assert_eq!(s.get("x").unwrap().get("name"), Some(&json!("first")));
		assert!(matches!(s.create(json!({"name": "anon"})), Err(StoreError::Validation(_))));
		assert!(matches!(s.create(json!({"id": "  "})), Err(StoreError::Validation(_))));
	}

	#[test]
	fn delete_then_get_is_not_found_and_gone_from_disk() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "a"})).unwrap();
		s.create(json!({"id": "b"})).unwrap();
		s.delete("a").unwrap();
		assert!(matches!(s.get("a"), Err(StoreError::NotFound(_))));
		assert_eq!(on_disk_ids(&s.primary_path()), vec!["b"]);
	}

	#[test]
	fn delete_falls_back_to_case_insensitive_match() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "scenea"})).unwrap();
		let (removed, _) = s.delete("SceneA").unwrap();
		assert_eq!(removed, "scenea");
		assert!(on_disk_ids(&s.primary_path()).is_empty());
		assert!(matches!(s.delete("SceneA"), Err(StoreError::NotFound(_))));
	}

	#[test]
	fn external_edits_are_seen_before_mutation() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "a"})).unwrap();
		fs::write(s.primary_path(), serde_json::to_vec(&json!([{"id": "a"}, {"id": "hand"}])).unwrap()).unwrap();
		s.update("hand", json!({"name": "edited"})).unwrap();
		assert_eq!(on_disk_ids(&s.primary_path()), vec!["a", "hand"]);
	}

	#[test]
	fn corrupt_file_loads_empty_and_is_backed_up() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		let path = s.primary_path();
		fs::write(&path, b"[{\"id\": ").unwrap();
		assert!(!s.load(&path));
		assert!(s.scenes().is_empty());
		s.reload();
		s.reload();
		assert!(!s.load(&path));
		let backups = fs::read_dir(path.parent().unwrap())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
			.count();
		assert_eq!(backups, 1);
	}

	#[test]
	fn save_mirrors_to_legacy_location() {
		let dir = TempDir::new().unwrap();
		let mut s = store(&dir);
		s.create(json!({"id": "m"})).unwrap();
		assert_eq!(on_disk_ids(&dir.path().join("backend").join("scenes.json")), vec!["m"]);
	}

	#[test]
	fn neighbours_accept_target_aliases() {
		let scene = Scene::from_record(
			json!({"id": "a", "hotspots": [{"target": "b"}, {"targetScene": "c"}, {"targetSceneId": "d"}, {"label": "info"}, {"target": "b"}]})
				.as_object()
				.unwrap()
				.clone(),
		)
		.unwrap();
		assert_eq!(scene.neighbor_ids(), vec!["b", "c", "d"]);
		assert_eq!(scene.hotspots().iter().filter(|h| h.target.is_some()).count(), 2);
	}
}
