//! Tour document store: an ordered list of named scene sequences.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::fsio::{self, CorruptBackups};
use crate::mirror::Published;
use crate::paths::{DocKind, PathResolver};
use crate::scenes::{deserialize_id, id_string};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tour {
	#[serde(deserialize_with = "deserialize_id")]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub keywords: Vec<String>,
	#[serde(default)]
	pub scenes: Vec<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Client payload for create and update; every field optional.
#[derive(Debug, Default, Deserialize)]
pub struct TourPatch {
	#[serde(default)]
	id: Option<Value>,
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	keywords: Option<Vec<String>>,
	#[serde(default)]
	scenes: Option<Vec<String>>,
}

impl TourPatch {
	pub fn from_value(value: Value) -> StoreResult<Self> {
		match value {
			Value::Object(ref map) if map.is_empty() => Err(StoreError::Validation("no data provided".into())),
			Value::Object(_) => serde_json::from_value(value).map_err(|e| StoreError::Validation(e.to_string())),
			_ => Err(StoreError::Validation("tour body must be a JSON object".into())),
		}
	}
}

fn read_tours(path: &Path) -> StoreResult<Vec<Tour>> {
	let value: Value = fsio::read_json(path)?;
	let Value::Array(items) = value else {
		return Err(StoreError::Corruption { path: path.to_path_buf(), backup: None });
	};
	let mut tours = Vec::with_capacity(items.len());
	for item in items {
		match serde_json::from_value::<Tour>(item) {
			Ok(t) => tours.push(t),
			Err(err) => warn!(path = %path.display(), %err, "skipping malformed tour"),
		}
	}
	Ok(tours)
}

pub struct TourStore {
	tours: Vec<Tour>,
	path: PathBuf,
	backups: CorruptBackups,
}

impl TourStore {
	/// Load from the first existing candidate, creating an empty list in the
	/// data directory when there is none.
	pub fn open(resolver: &PathResolver) -> StoreResult<Self> {
		let path = resolver.resolve(DocKind::Tours)?;
		if !path.exists() {
			fsio::write_in_place(&path, b"[]\n")?;
			info!(path = %path.display(), "created empty tours file");
		}
		let mut store = Self { tours: Vec::new(), path, backups: CorruptBackups::default() };
		store.reload();
		Ok(store)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn reload(&mut self) {
		match read_tours(&self.path) {
			Ok(tours) => self.tours = tours,
			Err(StoreError::Corruption { .. }) => {
				self.backups.backup_file(&self.path);
				warn!(path = %self.path.display(), "tours file is corrupt, starting empty");
				self.tours.clear();
			}
			Err(err) => {
				warn!(path = %self.path.display(), %err, "failed to load tours");
				self.tours.clear();
			}
		}
	}

	/// Truncate-in-place write with fsync, then re-read what landed on disk.
	fn save(&mut self) -> StoreResult<Published> {
		let bytes = fsio::to_pretty_bytes(&self.tours)?;
		fsio::write_in_place(&self.path, &bytes)?;
		info!(path = %self.path.display(), count = self.tours.len(), "saved tours");
		match read_tours(&self.path) {
			Ok(tours) => self.tours = tours,
			Err(err) => warn!(path = %self.path.display(), %err, "could not reload tours after save"),
		}
		Ok(Published::new(DocKind::Tours, self.path.clone(), bytes))
	}

	fn save_or_restore(&mut self) -> StoreResult<Published> {
		self.save().map_err(|err| {
			self.reload();
			err
		})
	}

	pub fn list(&mut self) -> Vec<Tour> {
		self.reload();
		self.tours.clone()
	}

	pub fn get(&mut self, id: &str) -> StoreResult<Tour> {
		self.reload();
		self.tours.iter().find(|t| t.id == id).cloned().ok_or_else(|| StoreError::NotFound(format!("tour {id}")))
	}

	pub fn create(&mut self, patch: TourPatch) -> StoreResult<(Tour, Published)> {
		let name = patch.name.filter(|n| !n.trim().is_empty()).ok_or_else(|| StoreError::Validation("tour name is required".into()))?;
		let id = patch.id.as_ref().and_then(id_string).unwrap_or_else(|| format!("tour_{}", chrono::Utc::now().timestamp()));
		self.reload();
		if self.tours.iter().any(|t| t.id == id) {
			return Err(StoreError::Validation(format!("tour with id '{id}' already exists")));
		}
		let tour = Tour { id, name, keywords: patch.keywords.unwrap_or_default(), scenes: patch.scenes.unwrap_or_default(), extra: Map::new() };
		self.tours.push(tour.clone());
		let published = self.save_or_restore()?;
		info!(tour_id = %tour.id, "created tour");
		Ok((tour, published))
	}

	/// Update in place; the id never changes and omitted fields keep their values.
	pub fn update(&mut self, id: &str, patch: TourPatch) -> StoreResult<(Tour, Published)> {
		self.reload();
		let slot = self.tours.iter_mut().find(|t| t.id == id).ok_or_else(|| StoreError::NotFound(format!("tour {id}")))?;
		if let Some(name) = patch.name {
			slot.name = name;
		}
		if let Some(keywords) = patch.keywords {
			slot.keywords = keywords;
		}
		if let Some(scenes) = patch.scenes {
			slot.scenes = scenes;
		}
		let updated = slot.clone();
		let published = self.save_or_restore()?;
		info!(tour_id = %id, "updated tour");
		Ok((updated, published))
	}

	pub fn delete(&mut self, id: &str) -> StoreResult<Published> {
		self.reload();
		let before = self.tours.len();
		self.tours.retain(|t| t.id != id);
		if self.tours.len() == before {
			return Err(StoreError::NotFound(format!("tour {id}")));
		}
		let published = self.save_or_restore()?;
		info!(tour_id = %id, "deleted tour");
		Ok(published)
	}
}
