use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

use crate::model::Batch;
use crate::observability::MetricsRegistry;

pub const DEFAULT_BATCH_MAX_EDGES: u32 = 10_000;
pub const DEFAULT_FLUSH_SEC: u64 = 2;
const RETRY_BUDGET: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct EmitterConfig {
	pub ingest_url: Option<String>,
	pub batch_max_edges: u32,
	pub batch_flush_interval: Duration,
	pub spool_dir: PathBuf,
}

impl Default for EmitterConfig {
	fn default() -> Self {
		Self {
			ingest_url: None,
			batch_max_edges: DEFAULT_BATCH_MAX_EDGES,
			batch_flush_interval: Duration::from_secs(DEFAULT_FLUSH_SEC),
			spool_dir: PathBuf::from("./spool"),
		}
	}
}

/// Accumulates per-host contributions and flushes them as a single JSON
/// batch, by size trigger, by timer, or on shutdown drain. Failed POSTs are
/// spooled to disk rather than dropped.
pub struct Emitter {
	accumulator: Mutex<Batch>,
	// Held across deliver() so concurrent flush callers (append()'s size
	// trigger racing the timer) hand snapshots to the sink one at a time, in
	// the order they were snapshotted — the accumulator lock alone only
	// protects the snapshot-and-reset, not the POST that follows it.
	delivery: Mutex<()>,
	config: EmitterConfig,
	http: reqwest::Client,
	metrics: Arc<MetricsRegistry>,
}

impl Emitter {
	pub fn new(
		probe_id: impl Into<String>,
		run_id: impl Into<String>,
		config: EmitterConfig,
		metrics: Arc<MetricsRegistry>,
	) -> anyhow::Result<Self> {
		Self::with_client(probe_id, run_id, config, metrics, reqwest::Client::new())
	}

	pub fn with_client(
		probe_id: impl Into<String>,
		run_id: impl Into<String>,
		config: EmitterConfig,
		metrics: Arc<MetricsRegistry>,
		http: reqwest::Client,
	) -> anyhow::Result<Self> {
		std::fs::create_dir_all(&config.spool_dir)?;
		Ok(Self {
			accumulator: Mutex::new(Batch::new(probe_id, run_id)),
			delivery: Mutex::new(()),
			config,
			http,
			metrics,
		})
	}

	/// Merges a host pipeline's contributions into the accumulator under a
	/// lock, then flushes if the configured edge-count threshold is met.
	pub async fn append(&self, contribution: Batch) {
		let should_flush = {
			let mut acc = self.accumulator.lock().await;
			acc.merge(contribution);
			acc.edge_count() as u32 >= self.config.batch_max_edges
				|| acc.node_count() as u32 >= self.config.batch_max_edges / 2
		};
		if should_flush {
			self.flush().await;
		}
	}

	/// Snapshots and resets the accumulator, then delivers the snapshot. A
	/// no-op if the accumulator is empty. Delivery is serialized behind
	/// `delivery` so concurrent flush callers (a worker's size trigger
	/// racing the timer tick) hand their snapshots to the sink one at a
	/// time, in the order each was snapshotted.
	pub async fn flush(&self) {
		let snapshot = {
			let mut acc = self.accumulator.lock().await;
			if acc.is_empty() {
				return;
			}
			acc.take()
		};
		let _delivery_guard = self.delivery.lock().await;
		self.deliver(snapshot).await;
	}

	async fn deliver(&self, batch: Batch) {
		self.metrics.emitter_flushes_total.inc();
		let start = Instant::now();

		let Some(url) = self.config.ingest_url.as_deref() else {
			match serde_json::to_string(&batch) {
				Ok(json) => println!("{json}"),
				Err(e) => tracing::error!(error = %e, "failed to serialize batch for stdout sink"),
			}
			self.metrics
				.emitter_flush_latency_ms
				.observe(start.elapsed().as_millis() as f64);
			return;
		};

		match self.post_with_retry(url, &batch).await {
			Ok(()) => {
				self.metrics
					.emitter_flush_latency_ms
					.observe(start.elapsed().as_millis() as f64);
			}
			Err(e) => {
				tracing::warn!(error = %e, "sink POST exhausted retries, spooling batch");
				self.metrics.emitter_post_failures_total.inc();
				if let Err(spool_err) = self.spool(&batch) {
					tracing::error!(error = %spool_err, "failed to write spool file, batch lost");
				}
			}
		}
	}

	/// POSTs `batch` to `url` with exponential backoff and jitter, capped at
	/// a 30s total elapsed-time budget. 3xx/4xx/5xx all count as failure.
	async fn post_with_retry(&self, url: &str, batch: &Batch) -> anyhow::Result<()> {
		let deadline = Instant::now() + RETRY_BUDGET;
		let mut backoff = INITIAL_BACKOFF;

		loop {
			match self.http.post(url).json(batch).send().await {
				Ok(resp) if resp.status().is_success() => return Ok(()),
				Ok(resp) => {
					tracing::debug!(status = %resp.status(), url, "sink returned non-2xx");
				}
				Err(e) => {
					tracing::debug!(error = %e, url, "sink POST transport error");
				}
			}

			if Instant::now() >= deadline {
				anyhow::bail!("sink POST retry budget ({RETRY_BUDGET:?}) exhausted");
			}

			let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4 + 1);
			let sleep_for = backoff + Duration::from_millis(jitter_ms);
			tokio::time::sleep(sleep_for.min(deadline.saturating_duration_since(Instant::now())))
				.await;
			backoff = (backoff * 2).min(RETRY_BUDGET);
		}
	}

	fn spool(&self, batch: &Batch) -> anyhow::Result<()> {
		let now = chrono::Utc::now();
		let filename = format!("{}.json", now.format("%Y%m%dT%H%M%S.%9f"));
		let path = self.config.spool_dir.join(filename);
		let json = serde_json::to_vec_pretty(batch)?;
		std::fs::write(&path, json)?;
		self.metrics.emitter_spool_writes_total.inc();
		self.metrics.emitter_spool_pending.inc();
		tracing::info!(path = %path.display(), "batch spooled after exhausted retries");
		Ok(())
	}

	/// Flushes the accumulator, then attempts to replay every file currently
	/// in the spool directory in directory order. Successfully delivered
	/// files are deleted; failures are left for the next drain.
	pub async fn drain(&self) {
		self.flush().await;
		self.replay_spool().await;
	}

	async fn replay_spool(&self) {
		let mut entries = match std::fs::read_dir(&self.config.spool_dir) {
			Ok(entries) => entries
				.filter_map(|e| e.ok())
				.map(|e| e.path())
				.filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
				.collect::<Vec<_>>(),
			Err(e) => {
				tracing::warn!(error = %e, "failed to list spool directory");
				return;
			}
		};
		entries.sort();

		for path in entries {
			match self.replay_one(&path).await {
				Ok(true) => {
					self.metrics.emitter_spool_replays_total.inc();
					self.metrics.emitter_spool_pending.dec();
				}
				Ok(false) => {}
				Err(e) => {
					tracing::warn!(error = %e, path = %path.display(), "failed to replay spool file");
				}
			}
		}
	}

	async fn replay_one(&self, path: &Path) -> anyhow::Result<bool> {
		let Some(url) = self.config.ingest_url.as_deref() else {
			return Ok(false);
		};
		let bytes = std::fs::read(path)?;
		let batch: Batch = serde_json::from_slice(&bytes)?;

		match self.post_with_retry(url, &batch).await {
			Ok(()) => {
				std::fs::remove_file(path)?;
				Ok(true)
			}
			Err(_) => Ok(false),
		}
	}

	/// Spawns the periodic flush timer. Runs until the returned handle is
	/// aborted (e.g. on shutdown, after the worker pool has drained).
	pub fn spawn_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.config.batch_flush_interval);
			loop {
				interval.tick().await;
				self.flush().await;
			}
		})
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::model::{DomainNode, Edge, EdgeType};
	use chrono::Utc;

	fn sample_contribution() -> Batch {
		let now = Utc::now();
		let mut batch = Batch::new("p1", "r1");
		batch.nodes_domain.push(DomainNode {
			host: "a.example".into(),
			apex: "a.example".into(),
			first_seen: now,
			last_seen: now,
		});
		batch.edges.push(Edge {
			edge_type: EdgeType::LinksTo,
			source: "a.example".into(),
			target: "b.example".into(),
			observed_at: now,
			probe_id: "p1".into(),
			run_id: "r1".into(),
		});
		batch
	}

	#[tokio::test]
	async fn flush_with_no_sink_is_a_noop_when_empty() {
		let dir = tempfile::tempdir().unwrap();
		let metrics = Arc::new(MetricsRegistry::new());
		let config = EmitterConfig {
			spool_dir: dir.path().to_path_buf(),
			..Default::default()
		};
		let emitter = Emitter::new("p1", "r1", config, metrics).unwrap();
		emitter.flush().await; // should not panic, no sink configured, nothing accumulated
	}

	#[tokio::test]
	async fn failed_post_spools_a_valid_batch_file() {
		let dir = tempfile::tempdir().unwrap();
		let metrics = Arc::new(MetricsRegistry::new());
		let config = EmitterConfig {
			ingest_url: Some("http://127.0.0.1:1/unreachable".to_string()),
			spool_dir: dir.path().to_path_buf(),
			..Default::default()
		};
		let http = reqwest::Client::builder()
			.timeout(Duration::from_millis(200))
			.build()
			.unwrap();
		let emitter = Emitter::with_client("p1", "r1", config, metrics, http).unwrap();

		emitter.append(sample_contribution()).await;
		emitter.flush().await;

		let files: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.collect();
		assert_eq!(files.len(), 1);

		let content = std::fs::read_to_string(files[0].path()).unwrap();
		let parsed: Batch = serde_json::from_str(&content).unwrap();
		assert_eq!(parsed.nodes_domain.len(), 1);
	}

	#[tokio::test]
	async fn append_merges_under_lock() {
		let dir = tempfile::tempdir().unwrap();
		let metrics = Arc::new(MetricsRegistry::new());
		let config = EmitterConfig {
			spool_dir: dir.path().to_path_buf(),
			batch_max_edges: 100,
			..Default::default()
		};
		let emitter = Emitter::new("p1", "r1", config, metrics).unwrap();
		emitter.append(sample_contribution()).await;
		emitter.append(sample_contribution()).await;

		let acc = emitter.accumulator.lock().await;
		assert_eq!(acc.nodes_domain.len(), 2);
		assert_eq!(acc.edges.len(), 2);
	}
}
