//! Candidate-location resolution for the scenes, tours and graph documents.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::fsio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
	Scenes,
	Tours,
	Graph,
}

impl DocKind {
	pub const ALL: [DocKind; 3] = [DocKind::Scenes, DocKind::Tours, DocKind::Graph];

	pub fn file_name(self) -> &'static str {
		match self {
			DocKind::Scenes => "scenes.json",
			DocKind::Tours => "tours.json",
			DocKind::Graph => "graph.json",
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			DocKind::Scenes => "scenes",
			DocKind::Tours => "tours",
			DocKind::Graph => "graph",
		}
	}
}

/// Knows every place a document may live across deployment layouts.
#[derive(Debug, Clone)]
pub struct PathResolver {
	data_dir: PathBuf,
	base_dir: PathBuf,
	container_dir: Option<PathBuf>,
}

impl PathResolver {
	pub fn new(data_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>, container_dir: Option<PathBuf>) -> Self {
		Self { data_dir: data_dir.into(), base_dir: base_dir.into(), container_dir }
	}

	/// Primary write location: always inside the configured data directory.
	pub fn default_path(&self, kind: DocKind) -> PathBuf {
		self.data_dir.join(kind.file_name())
	}

	pub fn container_path(&self, kind: DocKind) -> Option<PathBuf> {
		self.container_dir.as_ref().map(|d| d.join(kind.file_name()))
	}

	/// Candidates in priority order: data dir, project-relative,
	/// container mount, component-relative. Deduplicated by absolute path.
	pub fn candidates(&self, kind: DocKind) -> Vec<PathBuf> {
		let name = kind.file_name();
		let mut out: Vec<PathBuf> = Vec::with_capacity(4);
		let mut push = |p: PathBuf| {
			let abs = fsio::absolutize(&p);
			if !out.contains(&abs) {
				out.push(abs);
			}
		};
		push(self.default_path(kind));
		push(self.base_dir.join("..").join("cms").join("data").join(name));
		if let Some(p) = self.container_path(kind) {
			push(p);
		}
		push(self.base_dir.join("cms").join("data").join(name));
		out
	}

	/// Legacy locations that receive mirror copies but are never resolved from.
	pub fn legacy_paths(&self, kind: DocKind) -> Vec<PathBuf> {
		match kind {
			DocKind::Scenes => vec![fsio::absolutize(&self.base_dir.join(kind.file_name()))],
			DocKind::Tours | DocKind::Graph => Vec::new(),
		}
	}

	/// First candidate that exists and is non-empty, without touching disk otherwise.
	pub fn find_existing(&self, kind: DocKind) -> Option<PathBuf> {
		self.candidates(kind).into_iter().find(|p| fsio::is_non_empty_file(p))
	}

	/// Resolve the backing file for `kind`, creating the default location
	/// (and, for scenes, an empty-collection placeholder) when none exists.
	pub fn resolve(&self, kind: DocKind) -> StoreResult<PathBuf> {
		if let Some(found) = self.find_existing(kind) {
			debug!(kind = kind.as_str(), path = %found.display(), "resolved document");
			return Ok(found);
		}
		let default = fsio::absolutize(&self.default_path(kind));
		if let Some(dir) = default.parent() {
			fs::create_dir_all(dir).map_err(|e| StoreError::storage(dir, e))?;
		}
		if kind == DocKind::Scenes && !default.exists() {
			fs::write(&default, b"[]\n").map_err(|e| StoreError::storage(&default, e))?;
			info!(path = %default.display(), "created empty scenes file");
		} else {
			warn!(kind = kind.as_str(), path = %default.display(), "no existing document, using default location");
		}
		Ok(default)
	}

	/// Copy a document found outside the data directory into it, so the
	/// persistent volume becomes authoritative. Returns the bootstrap source.
	pub fn bootstrap(&self, kind: DocKind) -> Option<PathBuf> {
		let target = fsio::absolutize(&self.default_path(kind));
		if target.exists() {
			return None;
		}
		let source = self.candidates(kind).into_iter().skip(1).find(|p| fsio::is_non_empty_file(p))?;
		let copied = target
			.parent()
			.map(fs::create_dir_all)
			.unwrap_or(Ok(()))
			.and_then(|_| fs::copy(&source, &target));
		match copied {
			Ok(_) => {
				info!(kind = kind.as_str(), from = %source.display(), to = %target.display(), "bootstrapped document");
				Some(source)
			}
			Err(err) => {
				warn!(kind = kind.as_str(), %err, "bootstrap copy failed");
				None
			}
		}
	}
}
