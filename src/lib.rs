pub mod apex;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dns;
pub mod emitter;
pub mod html_links;
pub mod http_client;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod rate_limiter;
pub mod robots;
pub mod tls_inspect;
pub mod worker_pool;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreakerMap;
use crate::dedup::{Deduplicator, InMemoryDedup, SharedDedup};
use crate::dns::DnsResolver;
use crate::emitter::{Emitter, EmitterConfig};
use crate::http_client::ResilientHttpClient;
use crate::pipeline::{CrawlPipeline, PipelineConfig};
use crate::queue::{spawn_file_producer, RedisWorkQueue};
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsCache;
use crate::tls_inspect::TlsInspector;
use crate::worker_pool::WorkerPool;

const WORKER_CHANNEL_CAPACITY: usize = 8_192;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 2.0;
const RATE_LIMIT_BURST: u32 = 4;

/// Wires every component together and runs the crawl to completion (file
/// producer) or until shutdown (queue producer): observability, the shared
/// per-host rate limiter/circuit breaker/robots cache/dedup, the resilient
/// HTTP client, the batch emitter, and the worker pool consuming a bounded
/// channel fed by whichever producer is configured.
///
/// Errors while wiring optional components are logged and degrade the run
/// (e.g. no dedup backend configured falls back to in-memory) rather than
/// aborting.
pub async fn run() {
	let obs_state = match crate::observability::init_observability().await {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to initialize observability: {}", e);
			crate::observability::ObservabilityState::default()
		}
	};
	let metrics = obs_state.metrics;

	let settings = match crate::config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to load config: {}", e);
			crate::config::Settings::default()
		}
	};

	let breakers = Arc::new(CircuitBreakerMap::new().with_metrics(metrics.clone()));

	let dns = match DnsResolver::from_system_config() {
		Ok(d) => d,
		Err(e) => {
			eprintln!("fatal: failed to initialize DNS resolver: {}", e);
			return;
		}
	};
	let tls = TlsInspector::new();

	let rate_limiter = Arc::new(
		RateLimiter::new(RATE_LIMIT_REFILL_PER_SEC, RATE_LIMIT_BURST).with_metrics(metrics.clone()),
	);
	let _janitor_handle = rate_limiter.clone().spawn_janitor();

	let robots = RobotsCache::new().with_metrics(metrics.clone());

	let dedup: Arc<dyn Deduplicator> = match &settings.redis_addr {
		Some(addr) => match SharedDedup::connect(addr).await {
			Ok(d) => Arc::new(d.with_metrics(metrics.clone())) as Arc<dyn Deduplicator>,
			Err(e) => {
				eprintln!("warning: failed to connect shared dedup backend ({e}), falling back to in-memory");
				Arc::new(InMemoryDedup::new()) as Arc<dyn Deduplicator>
			}
		},
		None => Arc::new(InMemoryDedup::new()) as Arc<dyn Deduplicator>,
	};

	let http_client = match ResilientHttpClient::new(breakers.clone(), &settings.user_agent) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("fatal: failed to build HTTP client: {}", e);
			return;
		}
	};

	let emitter_http = match build_emitter_http_client(&settings) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("fatal: failed to build emitter HTTP client (mTLS material): {}", e);
			return;
		}
	};

	let emitter = match Emitter::with_client(
		settings.probe_id.clone(),
		settings.run_id.clone(),
		EmitterConfig {
			ingest_url: settings.ingest_url.clone(),
			batch_max_edges: settings.batch_max_edges,
			batch_flush_interval: Duration::from_secs(settings.batch_flush_sec),
			spool_dir: settings.spool_dir.clone().into(),
		},
		metrics.clone(),
		emitter_http,
	) {
		Ok(e) => Arc::new(e),
		Err(e) => {
			eprintln!("fatal: failed to initialize batch emitter: {}", e);
			return;
		}
	};
	let _flush_timer_handle = emitter.clone().spawn_timer();

	// Two independent tokens, per §5's "must be distinguishable from a
	// hard-cancel": `shutdown` only stops the worker pool from dequeuing new
	// hosts (workers finish the host they're on). `hard_cancel` is threaded
	// into the pipeline's own suspension points (DNS, TLS) so an operator
	// who signals a second time can interrupt an in-flight lookup/handshake
	// instead of waiting for it to finish.
	let shutdown = CancellationToken::new();
	let hard_cancel = CancellationToken::new();

	let pipeline = Arc::new(CrawlPipeline::new(
		PipelineConfig {
			probe_id: settings.probe_id.clone(),
			run_id: settings.run_id.clone(),
			user_agent: settings.user_agent.clone(),
			exclude_tlds: settings.exclude_tlds.clone(),
		},
		dns,
		tls,
		rate_limiter,
		robots,
		dedup,
		http_client,
		emitter.clone(),
		metrics.clone(),
		hard_cancel.clone(),
	));

	let (tx, rx) = mpsc::channel::<String>(WORKER_CHANNEL_CAPACITY);
	let producer_handle = match spawn_producer(&settings, tx, metrics.clone()).await {
		Ok(h) => h,
		Err(e) => {
			eprintln!("fatal: failed to start a work producer: {}", e);
			return;
		}
	};

	let shutdown_for_signal = shutdown.clone();
	let hard_cancel_for_signal = hard_cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("shutdown signal received, draining in-flight hosts");
			shutdown_for_signal.cancel();
		}
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::warn!("second shutdown signal received, cancelling in-flight work immediately");
			hard_cancel_for_signal.cancel();
		}
	});

	let pool = WorkerPool::new(settings.concurrency, metrics.clone());
	pool.run(pipeline, rx, shutdown).await;

	if let Some(handle) = producer_handle {
		handle.abort();
	}

	tracing::info!("worker pool drained, flushing emitter and replaying spool");
	emitter.drain().await;
}

/// Builds the emitter's HTTP client, presenting the configured mTLS client
/// certificate/key to the sink and augmenting trust roots with the
/// configured CA bundle, if any. Falls back to a plain client when no mTLS
/// material is configured.
fn build_emitter_http_client(settings: &config::Settings) -> anyhow::Result<reqwest::Client> {
	let mut builder = reqwest::Client::builder();

	if let (Some(cert_path), Some(key_path)) = (&settings.mtls_cert, &settings.mtls_key) {
		let mut identity_pem = std::fs::read(cert_path)?;
		identity_pem.extend(std::fs::read(key_path)?);
		let identity = reqwest::Identity::from_pem(&identity_pem)?;
		builder = builder.identity(identity);
	}

	if let Some(ca_path) = &settings.mtls_ca {
		let ca_pem = std::fs::read(ca_path)?;
		let ca_cert = reqwest::Certificate::from_pem(&ca_pem)?;
		builder = builder.add_root_certificate(ca_cert);
	}

	Ok(builder.build()?)
}

/// Starts whichever work producer is configured, feeding normalized
/// hostnames into `tx`: the file-backed reader if `domains` is set,
/// otherwise the Redis work queue if `redis_queue_addr` is set. Returns
/// `Ok(None)` if neither is configured (the channel closes immediately and
/// the worker pool exits once drained).
async fn spawn_producer(
	settings: &config::Settings,
	tx: mpsc::Sender<String>,
	metrics: Arc<observability::MetricsRegistry>,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
	if let Some(path) = &settings.domains {
		let handle = spawn_file_producer(path, tx).await?;
		return Ok(Some(handle));
	}

	if let Some(addr) = &settings.redis_queue_addr {
		let queue = RedisWorkQueue::connect(addr, settings.redis_queue_key.clone())
			.await?
			.with_metrics(metrics);
		let handle = tokio::spawn(async move {
			loop {
				match queue.lease().await {
					Ok(Some(lease)) => {
						let host = lease.host.clone();
						let sent = tx.send(host.clone()).await.is_ok();
						if let Err(e) = lease.ack().await {
							tracing::warn!(error = %e, %host, "failed to ack leased queue entry");
						}
						if !sent {
							break;
						}
					}
					Ok(None) => continue,
					Err(e) => {
						tracing::warn!(error = %e, "queue lease error, backing off");
						tokio::time::sleep(Duration::from_secs(1)).await;
					}
				}
			}
		});
		return Ok(Some(handle));
	}

	tracing::warn!("no producer configured: neither `domains` nor `redis_queue_addr` is set");
	Ok(None)
}
