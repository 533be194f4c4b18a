use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the document, graph and stats stores.
#[derive(Error, Debug)]
pub enum StoreError {
	#[error("validation failed: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("storage failure at {}: {source}", path.display())]
	Storage {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("corrupt document at {} (backup: {backup:?})", path.display())]
	Corruption { path: PathBuf, backup: Option<PathBuf> },

	#[error("lock busy: {}", .0.display())]
	LockBusy(PathBuf),

	#[error("mirror failure: {0}")]
	Mirror(String),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
	pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		StoreError::Storage { path: path.into(), source }
	}

	/// Stable machine-readable code used in HTTP error bodies.
	pub fn code(&self) -> &'static str {
		match self {
			StoreError::Validation(_) => "INVALID_INPUT",
			StoreError::NotFound(_) => "NOT_FOUND",
			StoreError::Corruption { .. } => "CORRUPTION_DETECTED",
			StoreError::Mirror(_) => "MIRROR_FAILURE",
			StoreError::Storage { .. } | StoreError::LockBusy(_) | StoreError::Json(_) => "STORAGE_FAILURE",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_follow_taxonomy() {
		assert_eq!(StoreError::Validation("x".into()).code(), "INVALID_INPUT");
		assert_eq!(StoreError::NotFound("x".into()).code(), "NOT_FOUND");
		let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
		let err = StoreError::storage("/tmp/x.json", io);
		assert_eq!(err.code(), "STORAGE_FAILURE");
		assert!(err.to_string().contains("/tmp/x.json"));
	}
}
