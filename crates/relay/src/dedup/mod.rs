//! Cross-instance request deduplication.
//!
//! Several execution contexts can observe the same inbound request: the relay
//! process itself may be re-initialized, and more than one instance can be
//! alive for a moment during a restart. The protocol guarantees at-most-once
//! execution per request id with two independent layers:
//!
//! 1. a shared-storage claim ([`store::RecordStore`]) visible to every
//!    instance, taken with best-effort atomicity;
//! 2. a process-local registry that demotes a context to follower when
//!    another task in the same process already won.
//!
//! Owners do the work and publish a [`store::ResultRecord`]; followers poll
//! for that record at a fixed interval with a bounded wait, watching the
//! owner's claim for expiry or a completed-but-missing-result inconsistency
//! so they never hang indefinitely.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tabchat_protocol::Response;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use self::store::{ProcessingRecord, ProcessingStatus, RecordStore, ResultRecord, now_ms};

/// Role of an execution context for one request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Owner,
	Follower,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
	/// Follower poll interval for the owner's result.
	pub poll_interval: Duration,
	/// Bound on the follower's total wait.
	pub wait_timeout: Duration,
	/// How long a COMPLETED claim may sit without a result before the wait
	/// fails as inconsistent.
	pub completed_grace: Duration,
	/// How long records stay around after publication so late followers can
	/// still read the result.
	pub retention: Duration,
	/// Interval of the background TTL sweep.
	pub gc_interval: Duration,
}

impl Default for DedupConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(500),
			wait_timeout: Duration::from_secs(60),
			completed_grace: Duration::from_secs(5),
			retention: Duration::from_secs(30),
			gc_interval: Duration::from_secs(30),
		}
	}
}

/// Entry point of the deduplication protocol.
///
/// One gate per execution context; the store handle is passed in rather than
/// reached through a global.
pub struct DedupGate {
	instance_id: String,
	store: Arc<dyn RecordStore>,
	local: DashSet<String>,
	config: DedupConfig,
}

impl DedupGate {
	pub fn new(store: Arc<dyn RecordStore>, instance_id: impl Into<String>) -> Self {
		Self::with_config(store, instance_id, DedupConfig::default())
	}

	pub fn with_config(
		store: Arc<dyn RecordStore>,
		instance_id: impl Into<String>,
		config: DedupConfig,
	) -> Self {
		Self {
			instance_id: instance_id.into(),
			store,
			local: DashSet::new(),
			config,
		}
	}

	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}

	/// Runs the claim protocol for a request id.
	///
	/// At most one context across all instances transitions to [`Role::Owner`];
	/// everyone else must [`DedupGate::await_result`].
	pub fn claim(&self, request_id: &str) -> Result<Role> {
		// Replay of a request whose result is still retained: follower fast
		// path, the result is read without re-executing anything.
		if self.store.result(request_id)?.is_some() {
			return Ok(Role::Follower);
		}
		if self.store.processing(request_id)?.is_some() {
			return Ok(Role::Follower);
		}

		let record = ProcessingRecord::new(request_id, &self.instance_id);
		if !self.store.try_claim(&record)? {
			return Ok(Role::Follower);
		}

		// Second layer: the process-local registry. Losing here means another
		// task in this process is already handling the request.
		if !self.local.insert(request_id.to_string()) {
			return Ok(Role::Follower);
		}

		debug!(
			target = "tabchat.dedup",
			request_id,
			instance = %self.instance_id,
			"claimed request"
		);
		Ok(Role::Owner)
	}

	/// Follower path: polls for the owner's published result.
	pub async fn await_result(&self, request_id: &str) -> Result<ResultRecord> {
		let deadline = tokio::time::Instant::now() + self.config.wait_timeout;
		let mut completed_seen: Option<tokio::time::Instant> = None;

		loop {
			if let Some(result) = self.store.result(request_id)? {
				return Ok(result);
			}

			match self.store.processing(request_id)? {
				None => return Err(Error::OwnerDataMissing(request_id.to_string())),
				Some(record) if record.status == ProcessingStatus::Completed => {
					let seen = completed_seen.get_or_insert_with(tokio::time::Instant::now);
					if seen.elapsed() >= self.config.completed_grace {
						return Err(Error::Timeout {
							ms: self.config.completed_grace.as_millis() as u64,
							condition: format!("result for completed request {request_id}"),
						});
					}
				}
				Some(_) => {}
			}

			if tokio::time::Instant::now() >= deadline {
				return Err(Error::Timeout {
					ms: self.config.wait_timeout.as_millis() as u64,
					condition: format!("result for request {request_id}"),
				});
			}
			sleep(self.config.poll_interval).await;
		}
	}

	/// Owner path epilogue: publishes the result and flips the claim to
	/// COMPLETED. The first published result wins; a duplicate write is logged
	/// and discarded.
	pub fn publish(&self, request_id: &str, response: Response) -> Result<ResultRecord> {
		let record = ResultRecord {
			request_id: request_id.to_string(),
			owner_instance_id: self.instance_id.clone(),
			completed_at: now_ms(),
			response,
		};
		if !self.store.put_result(&record)? {
			warn!(
				target = "tabchat.dedup",
				request_id, "result already present; keeping first write"
			);
		}
		self.store.mark_completed(request_id)?;
		Ok(record)
	}

	/// Abandons a claim after a failed or not-executed turn so followers fail
	/// fast instead of waiting out the TTL.
	pub fn release(&self, request_id: &str) -> Result<()> {
		self.local.remove(request_id);
		self.store.remove(request_id)
	}

	/// Removes both records after the retention window.
	pub fn schedule_cleanup(self: &Arc<Self>, request_id: String) {
		let gate = Arc::clone(self);
		tokio::spawn(async move {
			sleep(gate.config.retention).await;
			gate.local.remove(&request_id);
			if let Err(err) = gate.store.remove(&request_id) {
				warn!(
					target = "tabchat.dedup",
					request_id = %request_id,
					error = %err,
					"cleanup failed"
				);
			}
		});
	}

	/// Periodic TTL sweep over the shared store.
	pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let gate = Arc::clone(self);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(gate.config.gc_interval);
			interval.tick().await;
			loop {
				interval.tick().await;
				match gate.store.purge_expired(now_ms()) {
					Ok(0) => {}
					Ok(count) => {
						debug!(target = "tabchat.dedup", count, "purged expired dedup records");
					}
					Err(err) => {
						warn!(target = "tabchat.dedup", error = %err, "dedup gc sweep failed");
					}
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::store::MemoryStore;
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

	#[tokio::test]
	async fn single_owner_across_instances() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let a = DedupGate::new(store.clone(), "inst_a");
		let b = DedupGate::new(store, "inst_b");

		assert_eq!(a.claim("r1").unwrap(), Role::Owner);
		assert_eq!(b.claim("r1").unwrap(), Role::Follower);
		assert_eq!(a.claim("r1").unwrap(), Role::Follower);
	}

	#[tokio::test]
	async fn local_registry_demotes_second_winner() {
		// A store whose durable claim always succeeds, so only the
		// process-local registry can break the tie.
		struct AlwaysClaims(MemoryStore);
		impl RecordStore for AlwaysClaims {
			fn try_claim(&self, record: &ProcessingRecord) -> crate::Result<bool> {
				let _ = self.0.try_claim(record)?;
				Ok(true)
			}
			fn processing(&self, _request_id: &str) -> crate::Result<Option<ProcessingRecord>> {
				Ok(None)
			}
			fn mark_completed(&self, request_id: &str) -> crate::Result<()> {
				self.0.mark_completed(request_id)
			}
			fn put_result(&self, record: &ResultRecord) -> crate::Result<bool> {
				self.0.put_result(record)
			}
			fn result(&self, _request_id: &str) -> crate::Result<Option<ResultRecord>> {
				Ok(None)
			}
			fn remove(&self, request_id: &str) -> crate::Result<()> {
				self.0.remove(request_id)
			}
			fn purge_expired(&self, now: u64) -> crate::Result<usize> {
				self.0.purge_expired(now)
			}
		}

		let gate = DedupGate::new(Arc::new(AlwaysClaims(MemoryStore::new())), "inst_a");
		assert_eq!(gate.claim("r1").unwrap(), Role::Owner);
		assert_eq!(gate.claim("r1").unwrap(), Role::Follower);
	}

	#[tokio::test(start_paused = true)]
	async fn follower_receives_published_result() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let owner = Arc::new(DedupGate::new(store.clone(), "inst_a"));
		let follower = DedupGate::new(store, "inst_b");

		assert_eq!(owner.claim("r1").unwrap(), Role::Owner);
		assert_eq!(follower.claim("r1").unwrap(), Role::Follower);

		let publisher = owner.clone();
		tokio::spawn(async move {
			sleep(Duration::from_secs(1)).await;
			publisher.publish("r1", response(1)).unwrap();
		});

		let record = follower.await_result("r1").await.unwrap();
		assert_eq!(record.response.response_index, 1);
		assert_eq!(record.owner_instance_id, "inst_a");
	}

	#[tokio::test(start_paused = true)]
	async fn follower_fails_fast_when_owner_record_vanishes() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let gate = DedupGate::new(store, "inst_a");

		assert_eq!(gate.claim("r1").unwrap(), Role::Owner);
		gate.release("r1").unwrap();

		let err = gate.await_result("r1").await.unwrap_err();
		assert!(matches!(err, Error::OwnerDataMissing(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn completed_claim_without_result_times_out_after_grace() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let gate = DedupGate::new(store.clone(), "inst_a");

		assert_eq!(gate.claim("r1").unwrap(), Role::Owner);
		store.mark_completed("r1").unwrap();

		let err = gate.await_result("r1").await.unwrap_err();
		let Error::Timeout { condition, .. } = err else {
			panic!("expected timeout, got {err:?}");
		};
		assert!(condition.contains("completed"));
	}

	#[tokio::test(start_paused = true)]
	async fn follower_wait_is_bounded() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let gate = DedupGate::new(store, "inst_a");

		assert_eq!(gate.claim("r1").unwrap(), Role::Owner);

		let started = tokio::time::Instant::now();
		let err = gate.await_result("r1").await.unwrap_err();
		assert!(err.is_timeout());
		assert!(started.elapsed() >= Duration::from_secs(60));
	}

	#[tokio::test]
	async fn replay_with_retained_result_is_follower() {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
		let gate = DedupGate::new(store, "inst_a");

		assert_eq!(gate.claim("r1").unwrap(), Role::Owner);
		gate.publish("r1", response(1)).unwrap();

		assert_eq!(gate.claim("r1").unwrap(), Role::Follower);
		let record = gate.await_result("r1").await.unwrap();
		assert_eq!(record.response.message_id, "msg_1");
	}
}
