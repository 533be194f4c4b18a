//! Visit analytics shared by every worker process through one JSON file.
//!
//! Counters are only ever changed inside a read-modify-write under an
//! exclusive file lock. Live sessions are per process and never persisted;
//! only the historical peak of the live count is.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::fsio::{self, CorruptBackups, FileLock};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
	#[serde(default)]
	pub daily: BTreeMap<String, u64>,
	#[serde(default)]
	pub weekly: BTreeMap<String, u64>,
	#[serde(default)]
	pub monthly: BTreeMap<String, u64>,
	#[serde(default)]
	pub peak_concurrent: u64,
	#[serde(default)]
	pub peak_concurrent_date: Option<String>,
}

impl StatsSnapshot {
	pub fn total_visits(&self) -> u64 {
		self.daily.values().sum()
	}
}

pub fn day_key(date: NaiveDate) -> String {
	date.format("%Y-%m-%d").to_string()
}

/// `YYYY-Www` of the Monday starting the week containing `date`.
pub fn week_key(date: NaiveDate) -> String {
	let monday = date - ChronoDuration::days(i64::from(date.weekday().num_days_from_monday()));
	monday.format("%Y-W%W").to_string()
}

pub fn month_key(date: NaiveDate) -> String {
	date.format("%Y-%m").to_string()
}

fn month_start(index: i32) -> Option<NaiveDate> {
	NaiveDate::from_ymd_opt(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Bucket {
	Day { date: String, visits: u64 },
	Week { week: String, visits: u64 },
	Month { month: String, visits: u64 },
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct StatsQuery {
	pub period: Option<String>,
	pub year: Option<String>,
	pub month: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
	pub current_concurrent: usize,
	pub peak_concurrent: u64,
	pub peak_concurrent_date: Option<String>,
	pub total_visits_all_time: u64,
	pub today_visits: u64,
	pub data: Vec<Bucket>,
	pub period: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VisitOutcome {
	pub session_id: String,
	pub concurrent: usize,
}

enum DiskRead {
	Missing,
	Parsed(StatsSnapshot),
	Corrupt(Vec<u8>),
}

pub struct StatsAggregator {
	path: PathBuf,
	lock_path: PathBuf,
	session_timeout_secs: i64,
	sessions: StdMutex<HashMap<String, NaiveDateTime>>,
	snapshot: StdMutex<StatsSnapshot>,
	backups: CorruptBackups,
}

fn now_local() -> NaiveDateTime {
	Local::now().naive_local()
}

impl StatsAggregator {
	pub fn new(path: impl Into<PathBuf>, session_timeout_secs: u64) -> Self {
		let path = path.into();
		let mut lock_path = path.clone().into_os_string();
		lock_path.push(".lock");
		let agg = Self {
			lock_path: PathBuf::from(lock_path),
			path,
			session_timeout_secs: i64::try_from(session_timeout_secs).unwrap_or(i64::MAX),
			sessions: StdMutex::new(HashMap::new()),
			snapshot: StdMutex::new(StatsSnapshot::default()),
			backups: CorruptBackups::default(),
		};
		agg.refresh_from_disk();
		agg
	}

	fn read_disk(&self) -> StoreResult<DiskRead> {
		let raw = match fs::read(&self.path) {
			Ok(raw) => raw,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(DiskRead::Missing),
			Err(err) => return Err(StoreError::storage(&self.path, err)),
		};
		let value: Value = match serde_json::from_slice(&raw) {
			Ok(v) => v,
			Err(_) => return Ok(DiskRead::Corrupt(raw)),
		};
		// Anything but an object is unusable and must be preserved before a
		// write replaces it.
		if !value.is_object() {
			warn!(path = %self.path.display(), "stats file root is not an object");
			return Ok(DiskRead::Corrupt(raw));
		}
		match serde_json::from_value(value) {
			Ok(snapshot) => Ok(DiskRead::Parsed(snapshot)),
			Err(_) => Ok(DiskRead::Corrupt(raw)),
		}
	}

	/// Best-effort refresh of the in-memory snapshot; keeps the previous
	/// snapshot on any failure.
	fn refresh_from_disk(&self) {
		match self.read_disk() {
			Ok(DiskRead::Parsed(snapshot)) => {
				debug!(days = snapshot.daily.len(), peak = snapshot.peak_concurrent, "reloaded stats");
				*self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
			}
			Ok(DiskRead::Missing) => debug!(path = %self.path.display(), "stats file not found"),
			Ok(DiskRead::Corrupt(raw)) => {
				warn!(path = %self.path.display(), "stats file is corrupt, keeping in-memory stats");
				self.backups.backup(&self.path, &raw);
			}
			Err(err) => warn!(%err, "error reloading stats"),
		}
	}

	fn expire_sessions(sessions: &mut HashMap<String, NaiveDateTime>, now: NaiveDateTime, timeout_secs: i64) -> usize {
		let before = sessions.len();
		sessions.retain(|_, seen| (now - *seen).num_seconds() <= timeout_secs);
		before - sessions.len()
	}

	/// Drop sessions idle longer than the timeout. Returns how many were removed.
	pub fn cleanup_inactive(&self) -> usize {
		self.cleanup_inactive_at(now_local())
	}

	pub fn cleanup_inactive_at(&self, now: NaiveDateTime) -> usize {
		let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
		let removed = Self::expire_sessions(&mut sessions, now, self.session_timeout_secs);
		if removed > 0 {
			info!(removed, "cleaned up inactive sessions");
		}
		removed
	}

	pub fn concurrent(&self) -> usize {
		self.cleanup_inactive();
		self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len()
	}

	/// Count one visit at `now` against the shared file.
	pub fn record_visit_at(&self, now: NaiveDateTime) -> StoreResult<StatsSnapshot> {
		let concurrent = self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len() as u64;
		let _lock = FileLock::acquire(&self.lock_path)?;
		let mut disk = match self.read_disk()? {
			DiskRead::Parsed(s) => s,
			DiskRead::Missing => StatsSnapshot::default(),
			DiskRead::Corrupt(raw) => {
				warn!(path = %self.path.display(), "stats file is corrupt, starting from an empty snapshot");
				self.backups.backup(&self.path, &raw);
				StatsSnapshot::default()
			}
		};
		let date = now.date();
		*disk.daily.entry(day_key(date)).or_insert(0) += 1;
		*disk.weekly.entry(week_key(date)).or_insert(0) += 1;
		*disk.monthly.entry(month_key(date)).or_insert(0) += 1;
		if concurrent > disk.peak_concurrent {
			disk.peak_concurrent = concurrent;
			disk.peak_concurrent_date = Some(now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
			info!(peak = concurrent, "new peak concurrent users");
		}
		fsio::write_atomic(&self.path, &fsio::to_pretty_bytes(&disk)?)?;
		*self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = disk.clone();
		Ok(disk)
	}

	pub fn record_visit(&self) -> StoreResult<StatsSnapshot> {
		self.record_visit_at(now_local())
	}

	/// Register or refresh a session and count a visit for it.
	pub fn track_visit(&self, session_id: Option<String>) -> StoreResult<VisitOutcome> {
		let now = now_local();
		let session_id = session_id.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string());
		{
			let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
			Self::expire_sessions(&mut sessions, now, self.session_timeout_secs);
			sessions.insert(session_id.clone(), now);
		}
		self.record_visit_at(now)?;
		let concurrent = self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len();
		debug!(session = %session_id, concurrent, "visit tracked");
		Ok(VisitOutcome { session_id, concurrent })
	}

	/// Keep an existing session alive. Unknown ids are ignored.
	pub fn ping(&self, session_id: Option<&str>) -> usize {
		let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
		match session_id.and_then(|id| sessions.get_mut(id)) {
			Some(seen) => *seen = now_local(),
			None => debug!("ping without a known session"),
		}
		sessions.len()
	}

	pub fn get_stats(&self, query: &StatsQuery) -> StatsReport {
		self.get_stats_at(query, now_local())
	}

	pub fn get_stats_at(&self, query: &StatsQuery, now: NaiveDateTime) -> StatsReport {
		self.refresh_from_disk();
		self.cleanup_inactive_at(now);
		let current_concurrent = self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len();
		let snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner()).clone();
		let today = now.date();
		let (period, data) = series(&snapshot, query, today);
		StatsReport {
			current_concurrent,
			peak_concurrent: snapshot.peak_concurrent,
			peak_concurrent_date: snapshot.peak_concurrent_date.clone(),
			total_visits_all_time: snapshot.total_visits(),
			today_visits: snapshot.daily.get(&day_key(today)).copied().unwrap_or(0),
			data,
			period,
		}
	}
}

fn parse_year(year: Option<&str>) -> Option<i32> {
	let y = year?.trim().parse::<i32>().ok()?;
	NaiveDate::from_ymd_opt(y, 1, 1).map(|_| y)
}

fn count(map: &BTreeMap<String, u64>, key: &str) -> u64 {
	map.get(key).copied().unwrap_or(0)
}

fn last_days(s: &StatsSnapshot, today: NaiveDate, n: i64) -> Vec<Bucket> {
	(0..n)
		.rev()
		.map(|i| {
			let date = day_key(today - ChronoDuration::days(i));
			Bucket::Day { visits: count(&s.daily, &date), date }
		})
		.collect()
}

fn year_months(s: &StatsSnapshot, year: i32) -> Vec<Bucket> {
	(1..=12)
		.filter_map(|m| NaiveDate::from_ymd_opt(year, m, 1))
		.map(|d| {
			let month = month_key(d);
			Bucket::Month { visits: count(&s.monthly, &month), month }
		})
		.collect()
}

fn days_of_month(s: &StatsSnapshot, first: NaiveDate) -> Vec<Bucket> {
	first
		.iter_days()
		.take_while(|d| d.month() == first.month())
		.map(|d| {
			let date = day_key(d);
			Bucket::Day { visits: count(&s.daily, &date), date }
		})
		.collect()
}

fn series(s: &StatsSnapshot, q: &StatsQuery, today: NaiveDate) -> (&'static str, Vec<Bucket>) {
	let year = parse_year(q.year.as_deref());
	match q.period.as_deref().unwrap_or("day") {
		"day" => {
			let first = match (year, q.month.as_deref().and_then(|m| m.trim().parse::<u32>().ok())) {
				(Some(y), Some(m)) => NaiveDate::from_ymd_opt(y, m, 1),
				_ => None,
			};
			match (first, year, q.month.is_some()) {
				(Some(first), _, _) => ("day", days_of_month(s, first)),
				(None, Some(y), false) => ("month", year_months(s, y)),
				_ => ("day", last_days(s, today, 30)),
			}
		}
		"week" => {
			let data: Vec<Bucket> = (0..12)
				.rev()
				.map(|i| {
					let week = week_key(today - ChronoDuration::weeks(i));
					Bucket::Week { visits: count(&s.weekly, &week), week }
				})
				.collect();
			("week", data)
		}
		_ => match year {
			Some(y) => ("month", year_months(s, y)),
			None => {
				let current = today.year() * 12 + today.month0() as i32;
				let data: Vec<Bucket> = (0..12)
					.rev()
					.filter_map(|i| month_start(current - i))
					.map(|d| {
						let month = month_key(d);
						Bucket::Month { visits: count(&s.monthly, &month), month }
					})
					.collect();
				("month", data)
			}
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use tempfile::TempDir;

	fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
		NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
	}

	fn query(period: &str, year: Option<&str>, month: Option<&str>) -> StatsQuery {
		StatsQuery { period: Some(period.into()), year: year.map(Into::into), month: month.map(Into::into) }
	}

	#[test]
	fn keys_match_calendar_conventions() {
		let d = NaiveDate::from_ymd_opt(2025, 1, 8).unwrap();
		assert_eq!(day_key(d), "2025-01-08");
		assert_eq!(month_key(d), "2025-01");
		// Wednesday of the week starting Monday 2025-01-06
		assert_eq!(week_key(d), "2025-W01");
		assert_eq!(week_key(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()), "2025-W01");
	}

	#[test]
	fn same_day_visits_add_up_exactly() {
		let dir = TempDir::new().unwrap();
		let agg = StatsAggregator::new(dir.path().join("stats.json"), 120);
		for _ in 0..7 {
			agg.record_visit_at(at(2025, 3, 14, 10)).unwrap();
		}
		let snap = agg.record_visit_at(at(2025, 3, 14, 23)).unwrap();
		assert_eq!(snap.daily["2025-03-14"], 8);
		assert_eq!(snap.monthly["2025-03"], 8);
		assert_eq!(snap.total_visits(), 8);
	}

	#[test]
	fn peak_never_decreases() {
		let dir = TempDir::new().unwrap();
		let agg = StatsAggregator::new(dir.path().join("stats.json"), 120);
		agg.track_visit(Some("a".into())).unwrap();
		agg.track_visit(Some("b".into())).unwrap();
		let out = agg.track_visit(Some("c".into())).unwrap();
		assert_eq!(out.concurrent, 3);
		let fresh = StatsAggregator::new(dir.path().join("stats.json"), 120);
		let snap = fresh.record_visit().unwrap();
		assert_eq!(snap.peak_concurrent, 3);
		assert!(snap.peak_concurrent_date.is_some());
		assert_eq!(snap.total_visits(), 4);
	}

	#[test]
	fn separate_writers_do_not_lose_increments() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("stats.json");
		let handles: Vec<_> = (0..4)
			.map(|_| {
				let agg = Arc::new(StatsAggregator::new(&path, 120));
				std::thread::spawn(move || {
					for _ in 0..25 {
						agg.record_visit_at(at(2025, 6, 1, 12)).unwrap();
					}
				})
			})
			.collect();
		for h in handles {
			h.join().unwrap();
		}
		let agg = StatsAggregator::new(&path, 120);
		let report = agg.get_stats_at(&query("day", Some("2025"), Some("6")), at(2025, 6, 2, 0));
		assert_eq!(report.total_visits_all_time, 100);
		assert_eq!(report.data[0], Bucket::Day { date: "2025-06-01".into(), visits: 100 });
	}

	#[test]
	fn corrupt_file_gives_default_report_and_one_backup() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("stats.json");
		let agg = StatsAggregator::new(&path, 120);
		fs::write(&path, b"{\"daily\": {\"2025-").unwrap();
		let r1 = agg.get_stats(&StatsQuery::default());
		let r2 = agg.get_stats(&StatsQuery::default());
		assert_eq!((r1.total_visits_all_time, r1.peak_concurrent), (0, 0));
		assert_eq!(r2.data.len(), 30);
		let backups: Vec<_> = fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().starts_with("stats.json.corrupt."))
			.collect();
		assert_eq!(backups.len(), 1);
		assert_eq!(fs::read(backups[0].path()).unwrap(), b"{\"daily\": {\"2025-");
	}

	#[test]
	fn non_object_stats_file_is_backed_up_before_reset() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("stats.json");
		fs::write(&path, b"[1, 2, 3]").unwrap();
		let agg = StatsAggregator::new(&path, 120);
		let snap = agg.record_visit_at(at(2025, 5, 2, 8)).unwrap();
		assert_eq!(snap.daily["2025-05-02"], 1);
		let backups: Vec<_> = fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().starts_with("stats.json.corrupt."))
			.collect();
		assert_eq!(backups.len(), 1);
		assert_eq!(fs::read(backups[0].path()).unwrap(), b"[1, 2, 3]");
	}

	#[test]
	fn sessions_expire_and_ping_refreshes_known_only() {
		let dir = TempDir::new().unwrap();
		let agg = StatsAggregator::new(dir.path().join("stats.json"), 120);
		agg.sessions.lock().unwrap().insert("old".into(), now_local() - ChronoDuration::seconds(300));
		agg.sessions.lock().unwrap().insert("live".into(), now_local());
		assert_eq!(agg.ping(Some("stranger")), 2);
		assert_eq!(agg.ping(None), 2);
		assert_eq!(agg.concurrent(), 1);
		let generated = agg.track_visit(None).unwrap();
		assert!(Uuid::parse_str(&generated.session_id).is_ok());
		assert_eq!(generated.concurrent, 2);
	}

	#[test]
	fn series_shapes() {
		let dir = TempDir::new().unwrap();
		let agg = StatsAggregator::new(dir.path().join("stats.json"), 120);
		agg.record_visit_at(at(2024, 2, 29, 9)).unwrap();
		let now = at(2024, 3, 10, 9);

		let r = agg.get_stats_at(&query("day", Some("2024"), Some("2")), now);
		assert_eq!((r.period, r.data.len()), ("day", 29));
		assert_eq!(r.data[28], Bucket::Day { date: "2024-02-29".into(), visits: 1 });

		let r = agg.get_stats_at(&query("day", Some("2024"), None), now);
		assert_eq!((r.period, r.data.len()), ("month", 12));
		assert_eq!(r.data[1], Bucket::Month { month: "2024-02".into(), visits: 1 });

		let r = agg.get_stats_at(&query("day", Some("abc"), Some("13")), now);
		assert_eq!((r.period, r.data.len()), ("day", 30));

		let r = agg.get_stats_at(&query("week", None, None), now);
		assert_eq!(r.data.len(), 12);
		assert_eq!(r.data[11], Bucket::Week { week: week_key(now.date()), visits: 0 });

		let r = agg.get_stats_at(&query("month", None, None), now);
		let months: Vec<_> = r.data.iter().map(|b| match b { Bucket::Month { month, .. } => month.clone(), _ => unreachable!() }).collect();
		assert_eq!(months.first().map(String::as_str), Some("2023-04"));
		assert_eq!(months.last().map(String::as_str), Some("2024-03"));
		assert_eq!(r.today_visits, 0);
		assert_eq!(r.total_visits_all_time, 1);
	}
}
