use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::observability::MetricsRegistry;

const DEFAULT_ROLLING_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_FAILURE_RATIO: f64 = 0.6;
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_MAX_REQUESTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open for host")]
pub struct BreakerOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
	Closed,
	Open,
	HalfOpen,
}

enum State {
	Closed {
		requests: u32,
		failures: u32,
		window_start: Instant,
	},
	Open {
		not_before: Instant,
	},
	HalfOpen {
		trials: u32,
		successes: u32,
	},
}

struct HostBreaker {
	state: State,
}

impl HostBreaker {
	fn new() -> Self {
		Self {
			state: State::Closed {
				requests: 0,
				failures: 0,
				window_start: Instant::now(),
			},
		}
	}
}

/// Per-host Closed/Open/Half-open circuit breaker with a rolling failure
/// window in Closed state, keyed by host rather than a single instance.
pub struct CircuitBreakerMap {
	hosts: Mutex<HashMap<String, Arc<Mutex<HostBreaker>>>>,
	rolling_interval: Duration,
	threshold: u32,
	failure_ratio: f64,
	open_timeout: Duration,
	half_open_max_requests: u32,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl CircuitBreakerMap {
	pub fn new() -> Self {
		Self {
			hosts: Mutex::new(HashMap::new()),
			rolling_interval: DEFAULT_ROLLING_INTERVAL,
			threshold: DEFAULT_THRESHOLD,
			failure_ratio: DEFAULT_FAILURE_RATIO,
			open_timeout: DEFAULT_OPEN_TIMEOUT,
			half_open_max_requests: DEFAULT_HALF_OPEN_MAX_REQUESTS,
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	async fn breaker_for(&self, host: &str) -> Arc<Mutex<HostBreaker>> {
		let mut map = self.hosts.lock().await;
		map.entry(host.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(HostBreaker::new())))
			.clone()
	}

	/// Checks whether a call for `host` may proceed right now, transitioning
	/// Open -> Half-open if the timeout has elapsed. Returns an error if the
	/// breaker is (still) Open.
	pub async fn before_call(&self, host: &str) -> Result<(), BreakerOpenError> {
		let breaker = self.breaker_for(host).await;
		let mut b = breaker.lock().await;
		let now = Instant::now();

		match b.state {
			State::Closed { window_start, .. } => {
				if now.duration_since(window_start) >= self.rolling_interval {
					b.state = State::Closed {
						requests: 0,
						failures: 0,
						window_start: now,
					};
				}
				Ok(())
			}
			State::Open { not_before } => {
				if now >= not_before {
					tracing::debug!(host, "circuit breaker Open -> HalfOpen");
					b.state = State::HalfOpen {
						trials: 0,
						successes: 0,
					};
					if let Some(m) = &self.metrics {
						m.breaker_half_opened_total.inc();
					}
					Ok(())
				} else {
					if let Some(m) = &self.metrics {
						m.breaker_rejected_total.inc();
					}
					Err(BreakerOpenError)
				}
			}
			State::HalfOpen { trials, successes } => {
				if trials < self.half_open_max_requests {
					b.state = State::HalfOpen {
						trials: trials + 1,
						successes,
					};
					Ok(())
				} else {
					if let Some(m) = &self.metrics {
						m.breaker_rejected_total.inc();
					}
					Err(BreakerOpenError)
				}
			}
		}
	}

	/// Records the outcome of a call permitted by `before_call`. `success`
	/// is false for a transport error or an HTTP response with status >= 500;
	/// 4xx responses are not failures and should be reported as `true`.
	pub async fn record_result(&self, host: &str, success: bool) {
		let breaker = self.breaker_for(host).await;
		let mut b = breaker.lock().await;
		let now = Instant::now();

		match &mut b.state {
			State::Closed {
				requests, failures, ..
			} => {
				*requests += 1;
				if !success {
					*failures += 1;
				}
				if *requests >= self.threshold
					&& (*failures as f64 / *requests as f64) >= self.failure_ratio
				{
					tracing::warn!(host, requests = *requests, failures = *failures, "circuit breaker opening");
					b.state = State::Open {
						not_before: now + self.open_timeout,
					};
					if let Some(m) = &self.metrics {
						m.breaker_opened_total.inc();
					}
				}
			}
			State::HalfOpen { successes, .. } => {
				if !success {
					tracing::warn!(host, "circuit breaker reopening after half-open failure");
					b.state = State::Open {
						not_before: now + self.open_timeout,
					};
					if let Some(m) = &self.metrics {
						m.breaker_opened_total.inc();
					}
				} else {
					*successes += 1;
					if *successes >= self.half_open_max_requests {
						b.state = State::Closed {
							requests: 0,
							failures: 0,
							window_start: now,
						};
						if let Some(m) = &self.metrics {
							m.breaker_closed_total.inc();
						}
					}
				}
			}
			State::Open { .. } => {}
		}
	}

	pub async fn state_of(&self, host: &str) -> BreakerStateKind {
		let breaker = self.breaker_for(host).await;
		let b = breaker.lock().await;
		match b.state {
			State::Closed { .. } => BreakerStateKind::Closed,
			State::Open { .. } => BreakerStateKind::Open,
			State::HalfOpen { .. } => BreakerStateKind::HalfOpen,
		}
	}

	pub async fn reset(&self, host: &str) {
		let breaker = self.breaker_for(host).await;
		let mut b = breaker.lock().await;
		b.state = State::Closed {
			requests: 0,
			failures: 0,
			window_start: Instant::now(),
		};
	}
}

impl Default for CircuitBreakerMap {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn closed_opens_after_threshold_and_ratio_met() {
		let cb = CircuitBreakerMap::new();
		for _ in 0..4 {
			cb.before_call("flaky.example").await.unwrap();
			cb.record_result("flaky.example", false).await;
		}
		assert_eq!(cb.state_of("flaky.example").await, BreakerStateKind::Closed);

		cb.before_call("flaky.example").await.unwrap();
		cb.record_result("flaky.example", false).await;
		assert_eq!(cb.state_of("flaky.example").await, BreakerStateKind::Open);

		assert!(cb.before_call("flaky.example").await.is_err());
	}

	#[tokio::test]
	async fn four_xx_is_not_a_failure() {
		let cb = CircuitBreakerMap::new();
		for _ in 0..10 {
			cb.before_call("ok.example").await.unwrap();
			cb.record_result("ok.example", true).await;
		}
		assert_eq!(cb.state_of("ok.example").await, BreakerStateKind::Closed);
	}

	#[tokio::test]
	async fn explicit_reset_clears_open_state() {
		let cb = CircuitBreakerMap::new();
		for _ in 0..5 {
			cb.before_call("bad.example").await.unwrap();
			cb.record_result("bad.example", false).await;
		}
		assert_eq!(cb.state_of("bad.example").await, BreakerStateKind::Open);
		cb.reset("bad.example").await;
		assert_eq!(cb.state_of("bad.example").await, BreakerStateKind::Closed);
		assert!(cb.before_call("bad.example").await.is_ok());
	}

	#[tokio::test]
	async fn half_open_recovers_to_closed_after_trial_successes() {
		let cb = CircuitBreakerMap::new();
		for _ in 0..5 {
			cb.before_call("flaky.example").await.unwrap();
			cb.record_result("flaky.example", false).await;
		}
		assert_eq!(cb.state_of("flaky.example").await, BreakerStateKind::Open);

		// Force the Open -> HalfOpen transition without waiting out the real
		// 30s timeout: drive it through the private state directly.
		{
			let breaker = cb.breaker_for("flaky.example").await;
			let mut b = breaker.lock().await;
			b.state = State::Open {
				not_before: Instant::now() - Duration::from_secs(1),
			};
		}

		for _ in 0..DEFAULT_HALF_OPEN_MAX_REQUESTS {
			cb.before_call("flaky.example").await.unwrap();
			assert_eq!(cb.state_of("flaky.example").await, BreakerStateKind::HalfOpen);
			cb.record_result("flaky.example", true).await;
		}

		assert_eq!(cb.state_of("flaky.example").await, BreakerStateKind::Closed);
		assert!(cb.before_call("flaky.example").await.is_ok());
	}

	#[tokio::test]
	async fn independent_hosts_do_not_share_state() {
		let cb = CircuitBreakerMap::new();
		for _ in 0..5 {
			cb.before_call("bad.example").await.unwrap();
			cb.record_result("bad.example", false).await;
		}
		assert_eq!(cb.state_of("bad.example").await, BreakerStateKind::Open);
		assert_eq!(cb.state_of("good.example").await, BreakerStateKind::Closed);
	}
}
