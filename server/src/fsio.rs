//! File primitives shared by the stores: atomic replacement, in-place
//! rewrite with durability, corrupt-file backups and the inter-process lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

pub fn to_pretty_bytes<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
	let mut bytes = serde_json::to_vec_pretty(value)?;
	bytes.push(b'\n');
	Ok(bytes)
}

/// Read and parse a JSON file. Parse failures are reported as
/// `Corruption` without a backup; callers decide whether to back up.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
	let raw = fs::read(path).map_err(|e| StoreError::storage(path, e))?;
	serde_json::from_slice(&raw).map_err(|err| {
		debug!(path = %path.display(), %err, "JSON parse failed");
		StoreError::Corruption { path: path.to_path_buf(), backup: None }
	})
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
	Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// True when `path` exists and holds at least one byte.
pub fn is_non_empty_file(path: &Path) -> bool {
	fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn ensure_parent(path: &Path) -> StoreResult<()> {
	if let Some(dir) = path.parent() {
		if !dir.as_os_str().is_empty() {
			fs::create_dir_all(dir).map_err(|e| StoreError::storage(dir, e))?;
		}
	}
	Ok(())
}

/// Write to a sibling temp file, fsync it, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
	ensure_parent(path)?;
	let dir = match path.parent() {
		Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
		_ => PathBuf::from("."),
	};
	let mut tmp = tempfile::Builder::new()
		.prefix("._tmp_")
		.suffix(".json")
		.tempfile_in(&dir)
		.map_err(|e| StoreError::storage(&dir, e))?;
	tmp.write_all(bytes).map_err(|e| StoreError::storage(tmp.path(), e))?;
	tmp.flush().map_err(|e| StoreError::storage(tmp.path(), e))?;
	tmp.as_file().sync_all().map_err(|e| StoreError::storage(tmp.path(), e))?;
	tmp.persist(path).map_err(|e| StoreError::storage(path, e.error))?;
	Ok(())
}

/// Rewrite `path` in place (truncate, write, flush, fsync) so the inode is
/// kept for anything holding the file open; creates it when missing.
pub fn write_in_place(path: &Path, bytes: &[u8]) -> StoreResult<()> {
	ensure_parent(path)?;
	let mut file = OpenOptions::new()
		.create(true)
		.write(true)
		.truncate(false)
		.open(path)
		.map_err(|e| StoreError::storage(path, e))?;
	let io = |e| StoreError::storage(path, e);
	file.set_len(0).map_err(io)?;
	file.seek(SeekFrom::Start(0)).map_err(io)?;
	file.write_all(bytes).map_err(io)?;
	file.flush().map_err(io)?;
	file.sync_all().map_err(io)?;
	Ok(())
}

/// Copy an unreadable file to `<path>.corrupt.<unixtime>.bak`.
pub fn backup_corrupt(path: &Path) -> std::io::Result<PathBuf> {
	let ts = chrono::Utc::now().timestamp();
	let mut name = path.as_os_str().to_os_string();
	name.push(format!(".corrupt.{ts}.bak"));
	let backup = PathBuf::from(name);
	fs::copy(path, &backup)?;
	warn!(path = %path.display(), backup = %backup.display(), "backed up corrupt file");
	Ok(backup)
}

/// Remembers the digest of the last corrupt content backed up so a store
/// that re-reads the same broken file does not copy it on every read.
#[derive(Debug, Default)]
pub struct CorruptBackups {
	last_digest: StdMutex<Option<String>>,
}

impl CorruptBackups {
	/// Back up `path` unless `raw` matches the last content already copied.
	pub fn backup(&self, path: &Path, raw: &[u8]) -> Option<PathBuf> {
		let digest = sha256_hex(raw);
		let mut last = self.last_digest.lock().unwrap_or_else(|p| p.into_inner());
		if last.as_deref() == Some(digest.as_str()) {
			debug!(path = %path.display(), "corrupt content already backed up");
			return None;
		}
		match backup_corrupt(path) {
			Ok(backup) => {
				*last = Some(digest);
				Some(backup)
			}
			Err(err) => {
				warn!(path = %path.display(), %err, "failed to back up corrupt file");
				None
			}
		}
	}

	/// Read the current bytes of `path` and back them up once.
	pub fn backup_file(&self, path: &Path) -> Option<PathBuf> {
		match fs::read(path) {
			Ok(raw) => self.backup(path, &raw),
			Err(err) => {
				warn!(path = %path.display(), %err, "could not read corrupt file for backup");
				None
			}
		}
	}
}

/// Absolute, lexically normalized form of `path` (no filesystem access
/// beyond the current directory lookup).
pub fn absolutize(path: &Path) -> PathBuf {
	let joined = if path.is_absolute() {
		path.to_path_buf()
	} else {
		std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
	};
	let mut out = PathBuf::new();
	for comp in joined.components() {
		match comp {
			Component::CurDir => {}
			Component::ParentDir => {
				out.pop();
			}
			other => out.push(other.as_os_str()),
		}
	}
	out
}

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Advisory exclusive lock on a sentinel file, released on drop.
pub struct FileLock {
	file: File,
	path: PathBuf,
}

impl FileLock {
	/// Acquire the lock with a bounded number of retries.
	pub fn acquire(path: &Path) -> StoreResult<Self> {
		ensure_parent(path)?;
		let file = OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.truncate(false)
			.open(path)
			.map_err(|e| StoreError::storage(path, e))?;
		for attempt in 0..LOCK_ATTEMPTS {
			match file.try_lock_exclusive() {
				Ok(()) => return Ok(Self { file, path: path.to_path_buf() }),
				Err(_) if attempt + 1 < LOCK_ATTEMPTS => std::thread::sleep(LOCK_RETRY_DELAY),
				Err(err) => {
					warn!(path = %path.display(), %err, "giving up on lock");
				}
			}
		}
		Err(StoreError::LockBusy(path.to_path_buf()))
	}
}

impl Drop for FileLock {
	fn drop(&mut self) {
		if let Err(err) = FileExt::unlock(&self.file) {
			warn!(path = %self.path.display(), %err, "unlock failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tempfile::TempDir;

	#[test]
	fn atomic_write_replaces_and_leaves_no_temp_files() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("nested").join("doc.json");
		write_atomic(&path, b"[1]").unwrap();
		write_atomic(&path, b"[1,2]").unwrap();
		assert_eq!(fs::read(&path).unwrap(), b"[1,2]");
		let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().starts_with("._tmp_"))
			.collect();
		assert!(leftovers.is_empty());
	}

	#[test]
	fn in_place_write_truncates_longer_content() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("doc.json");
		write_in_place(&path, b"[1,2,3,4,5,6,7,8]").unwrap();
		write_in_place(&path, b"[]").unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
	}

	#[test]
	fn read_json_reports_corruption_for_garbage() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("bad.json");
		fs::write(&path, "{not json").unwrap();
		let err = read_json::<serde_json::Value>(&path).unwrap_err();
		assert!(matches!(err, StoreError::Corruption { .. }));
		fs::write(&path, to_pretty_bytes(&json!({"a": 1})).unwrap()).unwrap();
		assert_eq!(read_json::<serde_json::Value>(&path).unwrap(), json!({"a": 1}));
	}

	#[test]
	fn backup_keeps_original_bytes() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("stats.json");
		fs::write(&path, b"\x00garbage").unwrap();
		let backup = backup_corrupt(&path).unwrap();
		assert!(backup.to_string_lossy().contains("stats.json.corrupt."));
		assert_eq!(fs::read(backup).unwrap(), b"\x00garbage");
	}

	#[test]
	fn repeated_corrupt_content_is_backed_up_once() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("graph.json");
		let backups = CorruptBackups::default();
		fs::write(&path, b"{broken").unwrap();
		assert!(backups.backup_file(&path).is_some());
		assert!(backups.backup_file(&path).is_none());
		fs::write(&path, b"[broken").unwrap();
		let changed = backups.backup(&path, b"[broken").unwrap();
		assert_eq!(fs::read(changed).unwrap(), b"[broken");
	}

	#[test]
	fn absolutize_collapses_parent_segments() {
		let p = absolutize(Path::new("/srv/app/backend/../cms/./data/scenes.json"));
		assert_eq!(p, PathBuf::from("/srv/app/cms/data/scenes.json"));
	}

	#[test]
	fn lock_is_reacquirable_after_drop() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("stats.json.lock");
		{
			let _held = FileLock::acquire(&path).unwrap();
		}
		let _again = FileLock::acquire(&path).unwrap();
	}
}
