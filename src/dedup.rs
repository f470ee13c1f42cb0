use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use redis::AsyncCommands;

use crate::observability::MetricsRegistry;

pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Atomically tests-and-marks a dedup key. Returns `true` iff the key was
/// already present (i.e. this observation should be omitted from the batch).
#[async_trait]
pub trait Deduplicator: Send + Sync {
	async fn seen(&self, key: &str) -> bool;
}

/// Unbounded-per-process, thread-safe dedup set for a single crawl run.
pub struct InMemoryDedup {
	set: DashSet<String>,
}

impl InMemoryDedup {
	pub fn new() -> Self {
		Self { set: DashSet::new() }
	}
}

impl Default for InMemoryDedup {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Deduplicator for InMemoryDedup {
	async fn seen(&self, key: &str) -> bool {
		!self.set.insert(key.to_string())
	}
}

/// Cross-process dedup backed by a shared store, keyed `seen:{key}` with a
/// per-key TTL. `SET key 1 NX EX ttl` gives atomic set-if-absent: the
/// command reports whether it actually set the value, so "did not set"
/// means "already seen".
///
/// On any backend error this fails open (returns `false`, i.e. "not seen")
/// rather than blocking or panicking, and records the error for
/// observability; a flaky shared store must never stall or abort a crawl.
pub struct SharedDedup {
	conn: redis::aio::ConnectionManager,
	ttl_secs: u64,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl SharedDedup {
	pub async fn connect(addr: &str) -> anyhow::Result<Self> {
		Self::connect_with_ttl(addr, DEFAULT_TTL_SECS).await
	}

	pub async fn connect_with_ttl(addr: &str, ttl_secs: u64) -> anyhow::Result<Self> {
		let client = redis::Client::open(addr)?;
		let conn = client.get_connection_manager().await?;
		Ok(Self {
			conn,
			ttl_secs,
			metrics: None,
		})
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}
}

#[async_trait]
impl Deduplicator for SharedDedup {
	async fn seen(&self, key: &str) -> bool {
		let mut conn = self.conn.clone();
		let redis_key = format!("seen:{key}");

		let result: redis::RedisResult<Option<String>> = conn
			.set_options(
				&redis_key,
				"1",
				redis::SetOptions::default()
					.conditional_set(redis::ExistenceCheck::NX)
					.with_expiration(redis::SetExpiry::EX(self.ttl_secs as usize)),
			)
			.await;

		match result {
			Ok(Some(_)) => {
				// Value was set: this is the first observation of `key`.
				if let Some(m) = &self.metrics {
					m.dedup_misses_total.inc();
				}
				false
			}
			Ok(None) => {
				// NX prevented the set: already seen.
				if let Some(m) = &self.metrics {
					m.dedup_hits_total.inc();
				}
				true
			}
			Err(e) => {
				tracing::warn!(error = %e, key = %redis_key, "dedup backend error, failing open");
				if let Some(m) = &self.metrics {
					m.dedup_backend_errors_total.inc();
				}
				false
			}
		}
	}
}

pub fn domain_key(host: &str) -> String {
	format!("domain|{host}")
}

pub fn ip_key(ip: &str) -> String {
	format!("nodeip|{ip}")
}

pub fn cert_key(spki: &str) -> String {
	format!("cert|{spki}")
}

pub fn edge_key(source: &str, edge_type: &str, target: &str) -> String {
	format!("edge|{source}|{edge_type}|{target}")
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn in_memory_dedup_reports_first_appearance_then_seen() {
		let dedup = InMemoryDedup::new();
		assert!(!dedup.seen("domain|example.com").await);
		assert!(dedup.seen("domain|example.com").await);
		assert!(dedup.seen("domain|example.com").await);
	}

	#[tokio::test]
	async fn in_memory_dedup_distinct_keys_are_independent() {
		let dedup = InMemoryDedup::new();
		assert!(!dedup.seen("domain|a.com").await);
		assert!(!dedup.seen("domain|b.com").await);
	}

	#[test]
	fn key_builders_match_spec_formats() {
		assert_eq!(domain_key("example.com"), "domain|example.com");
		assert_eq!(ip_key("1.2.3.4"), "nodeip|1.2.3.4");
		assert_eq!(cert_key("abc123"), "cert|abc123");
		assert_eq!(
			edge_key("a.com", "RESOLVES_TO", "1.2.3.4"),
			"edge|a.com|RESOLVES_TO|1.2.3.4"
		);
	}
}
