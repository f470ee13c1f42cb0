use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::observability::MetricsRegistry;

const LEASE_BLOCK_SECS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
	#[error("queue backend error: {0}")]
	Backend(#[from] redis::RedisError),
	#[error("queue entry was not valid JSON: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// Wire format for a queued hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
	pub host: String,
	pub ts: i64,
	pub attempt: u32,
}

impl QueueEntry {
	fn new(host: impl Into<String>) -> Self {
		let ts = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);
		Self {
			host: host.into(),
			ts,
			attempt: 0,
		}
	}
}

/// A leased queue entry. The host is visible to the caller immediately;
/// `ack` must be called once the host's batch has been handed to the
/// emitter so the entry is removed from the processing (in-flight) list.
/// Dropping a `Lease` without acking leaves the entry in the processing
/// queue for operator recovery, preserving at-least-once delivery.
pub struct Lease {
	pub host: String,
	raw_entry: String,
	queue: RedisWorkQueue,
}

impl Lease {
	pub async fn ack(self) -> Result<(), QueueError> {
		let mut conn = self.queue.conn.clone();
		let _: () = conn.lrem(&self.queue.processing_key, 1, &self.raw_entry).await?;
		Ok(())
	}
}

/// Redis-backed `BRPOPLPUSH`-style lease queue: atomic pop-tail/push-head
/// with a blocking timeout. The processing list acts as an in-flight set;
/// entries left there after a worker crash are visible for operator
/// recovery (`queue list --processing`-style tooling, out of scope here).
#[derive(Clone)]
pub struct RedisWorkQueue {
	conn: redis::aio::ConnectionManager,
	queue_key: String,
	processing_key: String,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl RedisWorkQueue {
	pub async fn connect(addr: &str, queue_key: impl Into<String>) -> anyhow::Result<Self> {
		let client = redis::Client::open(addr)?;
		let conn = client.get_connection_manager().await?;
		let queue_key = queue_key.into();
		let processing_key = format!("{queue_key}:processing");
		Ok(Self {
			conn,
			queue_key,
			processing_key,
			metrics: None,
		})
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// Appends `host` to the tail of the main queue.
	pub async fn seed(&self, host: &str) -> Result<(), QueueError> {
		let entry = QueueEntry::new(host);
		let raw = serde_json::to_string(&entry)?;
		let mut conn = self.conn.clone();
		let _: () = conn.lpush(&self.queue_key, raw).await?;
		if let Some(m) = &self.metrics {
			m.queue_seeds_total.inc();
		}
		Ok(())
	}

	/// Atomically moves one entry from the tail of the main queue to the
	/// head of the processing queue, blocking up to 5s. Returns `None` if
	/// no work was available in that window.
	pub async fn lease(&self) -> Result<Option<Lease>, QueueError> {
		let mut conn = self.conn.clone();
		let raw: Option<String> = conn
			.brpoplpush(&self.queue_key, &self.processing_key, LEASE_BLOCK_SECS as f64)
			.await?;

		let Some(raw) = raw else {
			if let Some(m) = &self.metrics {
				m.queue_empty_leases_total.inc();
			}
			return Ok(None);
		};

		let entry: QueueEntry = serde_json::from_str(&raw)?;
		if let Some(m) = &self.metrics {
			m.queue_leases_total.inc();
		}
		Ok(Some(Lease {
			host: entry.host,
			raw_entry: raw,
			queue: self.clone(),
		}))
	}
}

/// Alternative producer for operators without a shared queue backend: reads
/// the newline-delimited `domains` file and feeds the same bounded
/// in-process channel the worker pool consumes from. `#`-prefixed and blank
/// lines are ignored; each line is lowercased and trailing-dot-stripped.
pub async fn spawn_file_producer(
	path: impl AsRef<Path>,
	tx: mpsc::Sender<String>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	let path = path.as_ref().to_path_buf();
	let file = tokio::fs::File::open(&path).await?;
	let handle = tokio::spawn(async move {
		let reader = BufReader::new(file);
		let mut lines = reader.lines();
		loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					let host = crate::model::normalize_host(&line);
					if host.is_empty() || host.starts_with('#') {
						continue;
					}
					if tx.send(host).await.is_err() {
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					tracing::warn!(error = %e, path = %path.display(), "error reading domains file");
					break;
				}
			}
		}
	});
	Ok(handle)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn queue_entry_round_trips_through_json() {
		let entry = QueueEntry::new("example.com");
		let raw = serde_json::to_string(&entry).unwrap();
		let parsed: QueueEntry = serde_json::from_str(&raw).unwrap();
		assert_eq!(parsed.host, "example.com");
		assert_eq!(parsed.attempt, 0);
	}

	#[tokio::test]
	async fn file_producer_skips_comments_and_blank_lines() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("domains.txt");
		tokio::fs::write(
			&path,
			"# comment\n\nExample.COM.\n  \nanother.example\n",
		)
		.await
		.unwrap();

		let (tx, mut rx) = mpsc::channel(8);
		let handle = spawn_file_producer(&path, tx).await.unwrap();

		let mut hosts = Vec::new();
		while let Some(h) = rx.recv().await {
			hosts.push(h);
		}
		handle.await.unwrap();

		assert_eq!(hosts, vec!["example.com", "another.example"]);
	}
}
