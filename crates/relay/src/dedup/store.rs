//! Record stores backing the deduplication protocol.
//!
//! Two implementations share one trait: [`MemoryStore`] keeps records in
//! process (tests, single-instance deployments), [`FileStore`] keeps them as
//! JSON files in a shared state directory so that several uncoordinated relay
//! instances observe each other's claims. Claims use create-new file
//! semantics; that is best-effort atomicity, which is all the protocol needs
//! because the in-process registry narrows the remaining race window.
//!
//! Records are time-bounded: a processing claim whose owner died expires
//! after [`PROCESSING_TTL_MS`], and published results are retained for
//! [`RESULT_RETENTION_MS`] so late followers can still read them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tabchat_protocol::Response;

use crate::error::Result;

/// Lifetime of an unfinished processing claim.
pub const PROCESSING_TTL_MS: u64 = 30_000;

/// How long a published result stays readable for late followers.
pub const RESULT_RETENTION_MS: u64 = 30_000;

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
	Processing,
	Completed,
}

/// Claim written by the owner of a request before doing any work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
	pub request_id: String,
	pub owner_instance_id: String,
	pub started_at: u64,
	pub status: ProcessingStatus,
}

impl ProcessingRecord {
	pub fn new(request_id: impl Into<String>, owner_instance_id: impl Into<String>) -> Self {
		Self {
			request_id: request_id.into(),
			owner_instance_id: owner_instance_id.into(),
			started_at: now_ms(),
			status: ProcessingStatus::Processing,
		}
	}

	fn expired(&self, ttl_ms: u64, now: u64) -> bool {
		self.status == ProcessingStatus::Processing && self.started_at.saturating_add(ttl_ms) < now
	}
}

/// Result written exactly once by the owner after the work succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
	pub request_id: String,
	pub owner_instance_id: String,
	pub completed_at: u64,
	pub response: Response,
}

/// Shared-storage record store the dedup protocol runs against.
///
/// Multi-writer, single record per key, last-writer-wins for status
/// transitions; TTL-based garbage collection is the only cleanup discipline.
pub trait RecordStore: Send + Sync {
	/// Atomically writes a processing claim unless a live one already exists.
	/// Returns false when another instance holds the claim.
	fn try_claim(&self, record: &ProcessingRecord) -> Result<bool>;

	/// Live (non-expired) processing record for a request, if any.
	fn processing(&self, request_id: &str) -> Result<Option<ProcessingRecord>>;

	/// Flips the processing claim to COMPLETED. Missing records are fine.
	fn mark_completed(&self, request_id: &str) -> Result<()>;

	/// Writes a result record unless one exists; the first write wins.
	/// Returns false when a record was already present.
	fn put_result(&self, record: &ResultRecord) -> Result<bool>;

	fn result(&self, request_id: &str) -> Result<Option<ResultRecord>>;

	/// Removes both records for a request.
	fn remove(&self, request_id: &str) -> Result<()>;

	/// Drops records past their TTL or retention window. Returns how many
	/// requests were cleaned up.
	fn purge_expired(&self, now: u64) -> Result<usize>;
}

/// In-process record store.
pub struct MemoryStore {
	processing: DashMap<String, ProcessingRecord>,
	results: DashMap<String, ResultRecord>,
	ttl_ms: u64,
	retention_ms: u64,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::with_windows(PROCESSING_TTL_MS, RESULT_RETENTION_MS)
	}

	pub fn with_windows(ttl_ms: u64, retention_ms: u64) -> Self {
		Self {
			processing: DashMap::new(),
			results: DashMap::new(),
			ttl_ms,
			retention_ms,
		}
	}
}

impl RecordStore for MemoryStore {
	fn try_claim(&self, record: &ProcessingRecord) -> Result<bool> {
		let now = now_ms();
		match self.processing.entry(record.request_id.clone()) {
			Entry::Occupied(mut entry) => {
				if entry.get().expired(self.ttl_ms, now) {
					entry.insert(record.clone());
					Ok(true)
				} else {
					Ok(false)
				}
			}
			Entry::Vacant(entry) => {
				entry.insert(record.clone());
				Ok(true)
			}
		}
	}

	fn processing(&self, request_id: &str) -> Result<Option<ProcessingRecord>> {
		let now = now_ms();
		Ok(self
			.processing
			.get(request_id)
			.map(|r| r.value().clone())
			.filter(|r| !r.expired(self.ttl_ms, now)))
	}

	fn mark_completed(&self, request_id: &str) -> Result<()> {
		if let Some(mut record) = self.processing.get_mut(request_id) {
			record.status = ProcessingStatus::Completed;
		}
		Ok(())
	}

	fn put_result(&self, record: &ResultRecord) -> Result<bool> {
		match self.results.entry(record.request_id.clone()) {
			Entry::Occupied(_) => Ok(false),
			Entry::Vacant(entry) => {
				entry.insert(record.clone());
				Ok(true)
			}
		}
	}

	fn result(&self, request_id: &str) -> Result<Option<ResultRecord>> {
		Ok(self.results.get(request_id).map(|r| r.value().clone()))
	}

	fn remove(&self, request_id: &str) -> Result<()> {
		self.processing.remove(request_id);
		self.results.remove(request_id);
		Ok(())
	}

	fn purge_expired(&self, now: u64) -> Result<usize> {
		let mut stale: Vec<String> = self
			.results
			.iter()
			.filter(|r| r.completed_at.saturating_add(self.retention_ms) < now)
			.map(|r| r.request_id.clone())
			.collect();
		stale.extend(
			self.processing
				.iter()
				.filter(|r| r.expired(self.ttl_ms, now))
				.map(|r| r.request_id.clone()),
		);
		stale.sort();
		stale.dedup();
		for request_id in &stale {
			self.remove(request_id)?;
		}
		Ok(stale.len())
	}
}

/// File-backed record store shared between relay instances.
pub struct FileStore {
	dir: PathBuf,
	ttl_ms: u64,
	retention_ms: u64,
}

impl FileStore {
	pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
		Self::with_windows(dir, PROCESSING_TTL_MS, RESULT_RETENTION_MS)
	}

	pub fn with_windows(dir: impl Into<PathBuf>, ttl_ms: u64, retention_ms: u64) -> Result<Self> {
		let dir = dir.into();
		fs::create_dir_all(&dir)?;
		Ok(Self {
			dir,
			ttl_ms,
			retention_ms,
		})
	}

	fn processing_path(&self, request_id: &str) -> PathBuf {
		self.dir
			.join(format!("{}.processing.json", sanitize(request_id)))
	}

	fn result_path(&self, request_id: &str) -> PathBuf {
		self.dir
			.join(format!("{}.result.json", sanitize(request_id)))
	}

	fn write_new<T: Serialize>(path: &Path, record: &T) -> Result<bool> {
		match fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(path)
		{
			Ok(file) => {
				serde_json::to_writer(file, record)?;
				Ok(true)
			}
			Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
			Err(err) => Err(err.into()),
		}
	}
}

fn sanitize(request_id: &str) -> String {
	request_id
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'_'
			}
		})
		.take(100)
		.collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
	fs::read_to_string(path)
		.ok()
		.and_then(|content| serde_json::from_str(&content).ok())
}

fn remove_if_present(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err.into()),
	}
}

impl RecordStore for FileStore {
	fn try_claim(&self, record: &ProcessingRecord) -> Result<bool> {
		let path = self.processing_path(&record.request_id);
		if Self::write_new(&path, record)? {
			return Ok(true);
		}

		// An existing claim only blocks us while it is live. Stale or
		// unreadable claims are overwritten; the brief remove/create window
		// is an accepted imprecision of the shared store.
		let existing: Option<ProcessingRecord> = read_json(&path);
		let stale = match existing {
			Some(existing) => existing.expired(self.ttl_ms, now_ms()),
			None => true,
		};
		if !stale {
			return Ok(false);
		}
		remove_if_present(&path)?;
		Self::write_new(&path, record)
	}

	fn processing(&self, request_id: &str) -> Result<Option<ProcessingRecord>> {
		let record: Option<ProcessingRecord> = read_json(&self.processing_path(request_id));
		Ok(record.filter(|r| !r.expired(self.ttl_ms, now_ms())))
	}

	fn mark_completed(&self, request_id: &str) -> Result<()> {
		let path = self.processing_path(request_id);
		if let Some(mut record) = read_json::<ProcessingRecord>(&path) {
			record.status = ProcessingStatus::Completed;
			fs::write(&path, serde_json::to_string(&record)?)?;
		}
		Ok(())
	}

	fn put_result(&self, record: &ResultRecord) -> Result<bool> {
		Self::write_new(&self.result_path(&record.request_id), record)
	}

	fn result(&self, request_id: &str) -> Result<Option<ResultRecord>> {
		Ok(read_json(&self.result_path(request_id)))
	}

	fn remove(&self, request_id: &str) -> Result<()> {
		remove_if_present(&self.processing_path(request_id))?;
		remove_if_present(&self.result_path(request_id))
	}

	fn purge_expired(&self, now: u64) -> Result<usize> {
		let mut purged = 0;
		for entry in fs::read_dir(&self.dir)? {
			let path = entry?.path();
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};

			let stale = if name.ends_with(".result.json") {
				read_json::<ResultRecord>(&path)
					.map(|r| r.completed_at.saturating_add(self.retention_ms) < now)
					.unwrap_or(true)
			} else if name.ends_with(".processing.json") {
				read_json::<ProcessingRecord>(&path)
					.map(|r| r.expired(self.ttl_ms, now))
					.unwrap_or(true)
			} else {
				false
			};

			if stale {
				remove_if_present(&path)?;
				purged += 1;
			}
		}
		Ok(purged)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tempfile::TempDir;

	use super::*;

	fn response(index: u32) -> Response {
		Response {
			conversation_id: "c1".to_string(),
			message_id: format!("msg_{index}"),
			content: "answer".to_string(),
			raw_capture: None,
			completion_time: now_ms(),
			response_index: index,
			degraded: false,
		}
	}

	#[test]
	fn memory_claim_is_exclusive() {
		let store = MemoryStore::new();
		assert!(
			store
				.try_claim(&ProcessingRecord::new("r1", "inst_a"))
				.unwrap()
		);
		assert!(
			!store
				.try_claim(&ProcessingRecord::new("r1", "inst_b"))
				.unwrap()
		);
		let record = store.processing("r1").unwrap().unwrap();
		assert_eq!(record.owner_instance_id, "inst_a");
	}

	#[test]
	fn memory_claim_exclusive_under_contention() {
		let store = Arc::new(MemoryStore::new());
		let handles: Vec<_> = (0..8)
			.map(|i| {
				let store = store.clone();
				std::thread::spawn(move || {
					store
						.try_claim(&ProcessingRecord::new("r1", format!("inst_{i}")))
						.unwrap()
				})
			})
			.collect();
		let winners = handles
			.into_iter()
			.map(|handle| handle.join().unwrap())
			.filter(|claimed| *claimed)
			.count();
		assert_eq!(winners, 1);
	}

	#[test]
	fn expired_claim_can_be_retaken() {
		let store = MemoryStore::with_windows(0, RESULT_RETENTION_MS);
		let mut first = ProcessingRecord::new("r1", "inst_a");
		first.started_at = now_ms().saturating_sub(10);
		assert!(store.try_claim(&first).unwrap());
		assert!(store.processing("r1").unwrap().is_none());
		assert!(
			store
				.try_claim(&ProcessingRecord::new("r1", "inst_b"))
				.unwrap()
		);
	}

	#[test]
	fn completed_claim_does_not_expire_with_ttl() {
		let store = MemoryStore::with_windows(0, RESULT_RETENTION_MS);
		let mut record = ProcessingRecord::new("r1", "inst_a");
		record.status = ProcessingStatus::Completed;
		record.started_at = now_ms().saturating_sub(10);
		assert!(store.try_claim(&record).unwrap());
		assert!(store.processing("r1").unwrap().is_some());
	}

	#[test]
	fn result_first_write_wins() {
		let store = MemoryStore::new();
		let first = ResultRecord {
			request_id: "r1".to_string(),
			owner_instance_id: "inst_a".to_string(),
			completed_at: now_ms(),
			response: response(1),
		};
		let second = ResultRecord {
			owner_instance_id: "inst_b".to_string(),
			..first.clone()
		};
		assert!(store.put_result(&first).unwrap());
		assert!(!store.put_result(&second).unwrap());
		assert_eq!(
			store.result("r1").unwrap().unwrap().owner_instance_id,
			"inst_a"
		);
	}

	#[test]
	fn file_claim_is_exclusive_across_instances() {
		let dir = TempDir::new().unwrap();
		let a = FileStore::new(dir.path()).unwrap();
		let b = FileStore::new(dir.path()).unwrap();

		assert!(a.try_claim(&ProcessingRecord::new("r1", "inst_a")).unwrap());
		assert!(!b.try_claim(&ProcessingRecord::new("r1", "inst_b")).unwrap());

		let seen = b.processing("r1").unwrap().unwrap();
		assert_eq!(seen.owner_instance_id, "inst_a");
	}

	#[test]
	fn file_result_visible_to_other_instance() {
		let dir = TempDir::new().unwrap();
		let a = FileStore::new(dir.path()).unwrap();
		let b = FileStore::new(dir.path()).unwrap();

		assert!(a.try_claim(&ProcessingRecord::new("r1", "inst_a")).unwrap());
		a.mark_completed("r1").unwrap();
		assert!(
			a.put_result(&ResultRecord {
				request_id: "r1".to_string(),
				owner_instance_id: "inst_a".to_string(),
				completed_at: now_ms(),
				response: response(1),
			})
			.unwrap()
		);

		let processing = b.processing("r1").unwrap().unwrap();
		assert_eq!(processing.status, ProcessingStatus::Completed);
		let result = b.result("r1").unwrap().unwrap();
		assert_eq!(result.response.response_index, 1);
	}

	#[test]
	fn file_purge_drops_expired_records() {
		let dir = TempDir::new().unwrap();
		let store = FileStore::with_windows(dir.path(), 1_000, 1_000).unwrap();

		let mut old = ProcessingRecord::new("r_old", "inst_a");
		old.started_at = now_ms().saturating_sub(60_000);
		assert!(store.try_claim(&old).unwrap());
		assert!(store.try_claim(&ProcessingRecord::new("r_new", "inst_a")).unwrap());
		assert!(
			store
				.put_result(&ResultRecord {
					request_id: "r_old".to_string(),
					owner_instance_id: "inst_a".to_string(),
					completed_at: now_ms().saturating_sub(60_000),
					response: response(1),
				})
				.unwrap()
		);

		let purged = store.purge_expired(now_ms()).unwrap();
		assert_eq!(purged, 2);
		assert!(store.processing("r_old").unwrap().is_none());
		assert!(store.result("r_old").unwrap().is_none());
		assert!(store.processing("r_new").unwrap().is_some());
	}

	#[test]
	fn request_ids_are_sanitized_for_paths() {
		let dir = TempDir::new().unwrap();
		let store = FileStore::new(dir.path()).unwrap();
		assert!(
			store
				.try_claim(&ProcessingRecord::new("req/../../etc", "inst_a"))
				.unwrap()
		);
		assert!(store.processing("req/../../etc").unwrap().is_some());
		// everything stayed inside the store directory
		for entry in fs::read_dir(dir.path()).unwrap() {
			let name = entry.unwrap().file_name();
			assert!(!name.to_string_lossy().contains('/'));
		}
	}
}
