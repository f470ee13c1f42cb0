use prometheus::{
	Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Central registry for all Prometheus metrics emitted by the crawl engine.
///
/// Per-host cardinality is deliberately avoided: breaker/rate-limiter/robots
/// counters are aggregated by outcome, not broken out by host.
pub struct MetricsRegistry {
	registry: Registry,

	// DNS resolver
	pub dns_lookups_total: IntCounterVec,

	// TLS inspector
	pub tls_inspections_total: IntCounter,
	pub tls_inspections_failed: IntCounter,
	pub tls_inspections_timed_out: IntCounter,
	pub tls_inspection_duration_seconds: Histogram,
	pub tls_certs_expired_total: IntCounter,
	pub tls_certs_self_signed_total: IntCounter,

	// HTML link extractor
	pub html_links_extracted_total: IntCounter,
	pub html_bodies_truncated_total: IntCounter,

	// Robots cache
	pub robots_fetches_total: IntCounter,
	pub robots_cache_hits_total: IntCounter,
	pub robots_fail_open_total: IntCounter,
	pub robots_blocked_total: IntCounter,

	// Per-host circuit breaker
	pub breaker_opened_total: IntCounter,
	pub breaker_half_opened_total: IntCounter,
	pub breaker_closed_total: IntCounter,
	pub breaker_rejected_total: IntCounter,

	// Per-host rate limiter
	pub rate_limiter_waits_total: IntCounter,
	pub rate_limiter_evictions_total: IntCounter,

	// Deduplicator
	pub dedup_hits_total: IntCounter,
	pub dedup_misses_total: IntCounter,
	pub dedup_backend_errors_total: IntCounter,

	// Work queue
	pub queue_seeds_total: IntCounter,
	pub queue_leases_total: IntCounter,
	pub queue_empty_leases_total: IntCounter,

	// Batch emitter
	pub emitter_flushes_total: IntCounter,
	pub emitter_post_failures_total: IntCounter,
	pub emitter_spool_writes_total: IntCounter,
	pub emitter_spool_replays_total: IntCounter,
	pub emitter_spool_pending: IntGauge,
	pub emitter_flush_latency_ms: Histogram,

	// Worker pool
	pub worker_panics_total: IntCounter,
	pub hosts_processed_total: IntCounter,
}

macro_rules! register_counter {
	($registry:expr, $name:expr, $help:expr) => {{
		let c = IntCounter::with_opts(Opts::new($name, $help).namespace("crawler")).unwrap();
		$registry.register(Box::new(c.clone())).unwrap();
		c
	}};
}

macro_rules! register_gauge {
	($registry:expr, $name:expr, $help:expr) => {{
		let g = IntGauge::with_opts(Opts::new($name, $help).namespace("crawler")).unwrap();
		$registry.register(Box::new(g.clone())).unwrap();
		g
	}};
}

macro_rules! register_histogram {
	($registry:expr, $name:expr, $help:expr, $buckets:expr) => {{
		let h = Histogram::with_opts(
			HistogramOpts::new($name, $help)
				.namespace("crawler")
				.buckets($buckets),
		)
		.unwrap();
		$registry.register(Box::new(h.clone())).unwrap();
		h
	}};
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let dns_lookups_total = IntCounterVec::new(
			Opts::new(
				"crawler_dns_lookups_total",
				"DNS lookups performed, by record type and outcome",
			)
			.namespace("crawler"),
			&["record_type", "outcome"],
		)
		.unwrap();
		registry.register(Box::new(dns_lookups_total.clone())).unwrap();

		let tls_inspections_total =
			register_counter!(registry, "crawler_tls_inspections_total", "TLS inspections attempted");
		let tls_inspections_failed = register_counter!(
			registry,
			"crawler_tls_inspections_failed_total",
			"TLS inspections that failed (handshake, TCP, or DNS)"
		);
		let tls_inspections_timed_out = register_counter!(
			registry,
			"crawler_tls_inspections_timed_out_total",
			"TLS inspections that exceeded the dial budget"
		);
		let tls_inspection_duration_seconds = register_histogram!(
			registry,
			"crawler_tls_inspection_duration_seconds",
			"TLS dial+handshake duration",
			vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 4.0, 8.0]
		);

		let tls_certs_expired_total = register_counter!(
			registry,
			"crawler_tls_certs_expired_total",
			"Leaf certificates presented past their not_after"
		);
		let tls_certs_self_signed_total = register_counter!(
			registry,
			"crawler_tls_certs_self_signed_total",
			"Leaf certificates whose subject CN matches their issuer CN"
		);

		let html_links_extracted_total = register_counter!(
			registry,
			"crawler_html_links_extracted_total",
			"External hostnames extracted from root pages"
		);
		let html_bodies_truncated_total = register_counter!(
			registry,
			"crawler_html_bodies_truncated_total",
			"Root-page bodies truncated at the size cap"
		);

		let robots_fetches_total =
			register_counter!(registry, "crawler_robots_fetches_total", "robots.txt fetch attempts");
		let robots_cache_hits_total = register_counter!(
			registry,
			"crawler_robots_cache_hits_total",
			"robots.txt answered from cache"
		);
		let robots_fail_open_total = register_counter!(
			registry,
			"crawler_robots_fail_open_total",
			"robots.txt fetches that fell back to allow-all"
		);
		let robots_blocked_total = register_counter!(
			registry,
			"crawler_robots_blocked_total",
			"Hosts whose root page was blocked by robots policy"
		);

		let breaker_opened_total = register_counter!(
			registry,
			"crawler_breaker_opened_total",
			"Per-host circuit breaker Closed->Open transitions"
		);
		let breaker_half_opened_total = register_counter!(
			registry,
			"crawler_breaker_half_opened_total",
			"Per-host circuit breaker Open->HalfOpen transitions"
		);
		let breaker_closed_total = register_counter!(
			registry,
			"crawler_breaker_closed_total",
			"Per-host circuit breaker ->Closed transitions"
		);
		let breaker_rejected_total = register_counter!(
			registry,
			"crawler_breaker_rejected_total",
			"Calls rejected because the per-host breaker was Open"
		);

		let rate_limiter_waits_total = register_counter!(
			registry,
			"crawler_rate_limiter_waits_total",
			"Per-host rate-limiter wait() suspensions resolved"
		);
		let rate_limiter_evictions_total = register_counter!(
			registry,
			"crawler_rate_limiter_evictions_total",
			"Per-host rate limiters evicted by the janitor"
		);

		let dedup_hits_total =
			register_counter!(registry, "crawler_dedup_hits_total", "Dedup keys already seen");
		let dedup_misses_total =
			register_counter!(registry, "crawler_dedup_misses_total", "Dedup keys seen for the first time");
		let dedup_backend_errors_total = register_counter!(
			registry,
			"crawler_dedup_backend_errors_total",
			"Shared dedup backend errors (fail-open)"
		);

		let queue_seeds_total =
			register_counter!(registry, "crawler_queue_seeds_total", "Hostnames appended to the work queue");
		let queue_leases_total =
			register_counter!(registry, "crawler_queue_leases_total", "Successful queue leases");
		let queue_empty_leases_total = register_counter!(
			registry,
			"crawler_queue_empty_leases_total",
			"Lease attempts that timed out with no work available"
		);

		let emitter_flushes_total =
			register_counter!(registry, "crawler_emitter_flushes_total", "Batch flushes performed");
		let emitter_post_failures_total = register_counter!(
			registry,
			"crawler_emitter_post_failures_total",
			"Sink POSTs that exhausted retries"
		);
		let emitter_spool_writes_total = register_counter!(
			registry,
			"crawler_emitter_spool_writes_total",
			"Batches written to the spool directory"
		);
		let emitter_spool_replays_total = register_counter!(
			registry,
			"crawler_emitter_spool_replays_total",
			"Spool files successfully replayed"
		);
		let emitter_spool_pending =
			register_gauge!(registry, "crawler_emitter_spool_pending", "Spool files currently on disk");
		let emitter_flush_latency_ms = register_histogram!(
			registry,
			"crawler_emitter_flush_latency_ms",
			"Flush-to-sink latency in milliseconds",
			vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0]
		);

		let worker_panics_total =
			register_counter!(registry, "crawler_worker_panics_total", "Host pipelines that panicked");
		let hosts_processed_total =
			register_counter!(registry, "crawler_hosts_processed_total", "Hosts fully processed");

		Self {
			registry,
			dns_lookups_total,
			tls_inspections_total,
			tls_inspections_failed,
			tls_inspections_timed_out,
			tls_inspection_duration_seconds,
			tls_certs_expired_total,
			tls_certs_self_signed_total,
			html_links_extracted_total,
			html_bodies_truncated_total,
			robots_fetches_total,
			robots_cache_hits_total,
			robots_fail_open_total,
			robots_blocked_total,
			breaker_opened_total,
			breaker_half_opened_total,
			breaker_closed_total,
			breaker_rejected_total,
			rate_limiter_waits_total,
			rate_limiter_evictions_total,
			dedup_hits_total,
			dedup_misses_total,
			dedup_backend_errors_total,
			queue_seeds_total,
			queue_leases_total,
			queue_empty_leases_total,
			emitter_flushes_total,
			emitter_post_failures_total,
			emitter_spool_writes_total,
			emitter_spool_replays_total,
			emitter_spool_pending,
			emitter_flush_latency_ms,
			worker_panics_total,
			hosts_processed_total,
		}
	}

	/// Encode metrics in Prometheus text format, for an (out-of-scope) HTTP
	/// endpoint to serve.
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				tracing::warn!(error = %e, "failed to encode metrics");
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry.
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new();
		assert!(!registry.encode().is_empty());
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new();
		registry.hosts_processed_total.inc();
		registry.dns_lookups_total.with_label_values(&["a", "ok"]).inc();
		assert!(!registry.encode().is_empty());
	}
}
