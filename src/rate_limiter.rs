use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::observability::MetricsRegistry;

/// Default cap on the number of distinct per-host limiters tracked at once.
pub const DEFAULT_CAPACITY: usize = 10_000;
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_EVICTION_AGE: Duration = Duration::from_secs(60 * 60);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last_refill: Instant,
	last_used: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_sec: f64) -> Self {
		let now = Instant::now();
		Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec,
			last_refill: now,
			last_used: now,
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
		self.last_refill = now;
	}

	fn try_acquire(&mut self) -> bool {
		let now = Instant::now();
		self.refill(now);
		self.last_used = now;
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Per-host token-bucket rate limiter, keyed by host, with bounded memory.
///
/// At most one bucket exists per host, created lazily on first reference.
/// A background janitor evicts idle buckets once the map exceeds `capacity`,
/// so memory stays bounded under a long-running crawl over many distinct
/// hosts without serializing callers for different hosts on a single lock
/// held for the duration of a wait.
pub struct RateLimiter {
	buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
	burst: u32,
	refill_per_sec: f64,
	capacity: usize,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl RateLimiter {
	pub fn new(refill_per_sec: f64, burst: u32) -> Self {
		Self::with_capacity(refill_per_sec, burst, DEFAULT_CAPACITY)
	}

	pub fn with_capacity(refill_per_sec: f64, burst: u32, capacity: usize) -> Self {
		Self {
			buckets: Mutex::new(HashMap::new()),
			burst,
			refill_per_sec,
			capacity,
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	async fn bucket_for(&self, host: &str) -> Arc<Mutex<TokenBucket>> {
		let mut map = self.buckets.lock().await;
		map.entry(host.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(self.burst, self.refill_per_sec))))
			.clone()
	}

	/// Non-blocking: consumes one token if available for `host`.
	pub async fn allow(&self, host: &str) -> bool {
		let bucket = self.bucket_for(host).await;
		let mut b = bucket.lock().await;
		b.try_acquire()
	}

	/// Suspends the caller until a token is available for `host`. Always
	/// succeeds eventually; polls the bucket rather than holding the map
	/// lock, so other hosts are never blocked by this host's wait.
	pub async fn wait(&self, host: &str) {
		let bucket = self.bucket_for(host).await;
		loop {
			{
				let mut b = bucket.lock().await;
				if b.try_acquire() {
					if let Some(m) = &self.metrics {
						m.rate_limiter_waits_total.inc();
					}
					return;
				}
				let deficit = (1.0 - b.tokens).max(0.0);
				let wait_secs = if b.refill_per_sec > 0.0 {
					deficit / b.refill_per_sec
				} else {
					JANITOR_INTERVAL.as_secs_f64()
				};
				drop(b);
				tokio::time::sleep(Duration::from_secs_f64(wait_secs.max(0.0)).max(MIN_POLL_INTERVAL))
					.await;
			}
		}
	}

	/// Spawns the periodic janitor: every `JANITOR_INTERVAL`, if the bucket
	/// map exceeds `capacity`, evicts entries idle longer than
	/// `IDLE_EVICTION_AGE`.
	pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(JANITOR_INTERVAL);
			loop {
				interval.tick().await;
				self.evict_idle().await;
			}
		})
	}

	async fn evict_idle(&self) {
		let mut map = self.buckets.lock().await;
		if map.len() <= self.capacity {
			return;
		}
		let now = Instant::now();
		let mut evicted = 0u64;
		let mut stale = Vec::new();
		for (host, bucket) in map.iter() {
			let b = bucket.lock().await;
			if now.duration_since(b.last_used) >= IDLE_EVICTION_AGE {
				stale.push(host.clone());
			}
		}
		for host in stale {
			map.remove(&host);
			evicted += 1;
		}
		if evicted > 0 {
			if let Some(m) = &self.metrics {
				m.rate_limiter_evictions_total.inc_by(evicted);
			}
			tracing::debug!(evicted, remaining = map.len(), "rate limiter janitor evicted idle hosts");
		}
	}

	#[cfg(feature = "unit-tests")]
	async fn tracked_hosts(&self) -> usize {
		self.buckets.lock().await.len()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn allow_consumes_burst_then_denies() {
		let limiter = RateLimiter::new(0.0, 2);
		assert!(limiter.allow("a.example").await);
		assert!(limiter.allow("a.example").await);
		assert!(!limiter.allow("a.example").await);
	}

	#[tokio::test]
	async fn distinct_hosts_have_independent_buckets() {
		let limiter = RateLimiter::new(0.0, 1);
		assert!(limiter.allow("a.example").await);
		assert!(!limiter.allow("a.example").await);
		assert!(limiter.allow("b.example").await);
	}

	#[tokio::test]
	async fn wait_eventually_succeeds_after_refill() {
		let limiter = RateLimiter::new(1000.0, 1);
		assert!(limiter.allow("a.example").await);
		tokio::time::timeout(Duration::from_secs(2), limiter.wait("a.example"))
			.await
			.expect("wait should resolve once tokens refill");
	}

	#[tokio::test]
	async fn janitor_evicts_only_when_cap_exceeded_and_idle() {
		let limiter = Arc::new(RateLimiter::with_capacity(10.0, 1, 1));
		limiter.allow("a.example").await;
		limiter.allow("b.example").await;
		assert_eq!(limiter.tracked_hosts().await, 2);

		// Not idle yet: a direct call to evict_idle should do nothing even
		// though capacity (1) is exceeded, because last_used is recent.
		limiter.evict_idle().await;
		assert_eq!(limiter.tracked_hosts().await, 2);
	}
}
