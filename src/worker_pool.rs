use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::observability::MetricsRegistry;
use crate::pipeline::CrawlPipeline;

pub const DEFAULT_CONCURRENCY: u32 = 256;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8_192;

/// Fixed-size pool of host workers pulling from a single bounded channel
/// fed by either the work-queue adapter or the file reader. Each worker
/// wraps its pipeline call so a panic while processing one host is caught
/// and counted rather than taking down the whole pool: one bad host must
/// never affect the others.
pub struct WorkerPool {
	concurrency: u32,
	metrics: Arc<MetricsRegistry>,
}

impl WorkerPool {
	pub fn new(concurrency: u32, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			concurrency: concurrency.max(1),
			metrics,
		}
	}

	/// Spawns `concurrency` worker tasks sharing `rx` behind a mutex (tokio's
	/// mpsc receiver isn't `Clone`; workers take turns polling it, which is
	/// equivalent to a work-stealing pool since each `recv` call is a single
	/// atomic dequeue). Returns once every worker has exited: either the
	/// channel closed (producer done) or `shutdown` was triggered and all
	/// in-flight hosts finished.
	pub async fn run(
		&self,
		pipeline: Arc<CrawlPipeline>,
		rx: mpsc::Receiver<String>,
		shutdown: CancellationToken,
	) {
		let rx = Arc::new(Mutex::new(rx));
		let mut handles = Vec::with_capacity(self.concurrency as usize);

		for worker_id in 0..self.concurrency {
			let rx = rx.clone();
			let pipeline = pipeline.clone();
			let shutdown = shutdown.clone();
			let metrics = self.metrics.clone();

			handles.push(tokio::spawn(async move {
				worker_loop(worker_id, rx, pipeline, shutdown, metrics).await;
			}));
		}

		for handle in handles {
			if let Err(e) = handle.await {
				tracing::error!(error = %e, "worker task join failed");
			}
		}
	}
}

async fn worker_loop(
	worker_id: u32,
	rx: Arc<Mutex<mpsc::Receiver<String>>>,
	pipeline: Arc<CrawlPipeline>,
	shutdown: CancellationToken,
	metrics: Arc<MetricsRegistry>,
) {
	loop {
		let host = {
			let mut rx = rx.lock().await;
			tokio::select! {
				biased;
				_ = shutdown.cancelled() => None,
				maybe_host = rx.recv() => maybe_host,
			}
		};

		let Some(host) = host else {
			tracing::debug!(worker_id, "worker exiting: channel closed or shutdown requested");
			return;
		};

		// A graceful shutdown lets the in-flight host finish; only a new
		// dequeue is refused once cancellation fires (checked above).
		let host_for_panic_msg = host.clone();
		let result = std::panic::AssertUnwindSafe(pipeline.process_host(host))
			.catch_unwind()
			.await;

		match result {
			Ok(()) => metrics.hosts_processed_total.inc(),
			Err(panic) => {
				metrics.worker_panics_total.inc();
				let msg = panic_message(&panic);
				tracing::error!(worker_id, host = %host_for_panic_msg, panic = %msg, "host pipeline panicked");
			}
		}
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::circuit_breaker::CircuitBreakerMap;
	use crate::dedup::InMemoryDedup;
	use crate::dns::DnsResolver;
	use crate::emitter::{Emitter, EmitterConfig};
	use crate::http_client::ResilientHttpClient;
	use crate::pipeline::{CrawlPipeline, PipelineConfig};
	use crate::rate_limiter::RateLimiter;
	use crate::robots::RobotsCache;
	use crate::tls_inspect::TlsInspector;

	fn test_pipeline(dir: &std::path::Path) -> Arc<CrawlPipeline> {
		let metrics = Arc::new(MetricsRegistry::new());
		let breakers = Arc::new(CircuitBreakerMap::new());
		let emitter = Arc::new(
			Emitter::new(
				"p1",
				"r1",
				EmitterConfig {
					spool_dir: dir.to_path_buf(),
					..Default::default()
				},
				metrics.clone(),
			)
			.unwrap(),
		);
		Arc::new(CrawlPipeline::new(
			PipelineConfig {
				probe_id: "p1".into(),
				run_id: "r1".into(),
				user_agent: "test-agent/1.0".into(),
				exclude_tlds: vec![],
			},
			DnsResolver::from_system_config().unwrap(),
			TlsInspector::new(),
			Arc::new(RateLimiter::new(1000.0, 10)),
			RobotsCache::new(),
			Arc::new(InMemoryDedup::new()),
			ResilientHttpClient::new(breakers, "test-agent/1.0").unwrap(),
			emitter,
			metrics,
			CancellationToken::new(),
		))
	}

	#[tokio::test]
	async fn pool_drains_channel_then_exits_when_closed() {
		let dir = tempfile::tempdir().unwrap();
		let pipeline = test_pipeline(dir.path());
		let pool = WorkerPool::new(4, Arc::new(MetricsRegistry::new()));

		let (tx, rx) = mpsc::channel(8);
		tx.send("excluded.invalid".to_string()).await.unwrap();
		drop(tx);

		let shutdown = CancellationToken::new();
		pool.run(pipeline, rx, shutdown).await;
	}
}
