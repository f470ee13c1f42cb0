use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio_util::sync::CancellationToken;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Results of the five concurrent record-type lookups performed against a
/// single host. Each field is empty, never an error, when its lookup fails
/// or times out; failures are logged at `debug` and counted by the caller.
#[derive(Debug, Default, Clone)]
pub struct DnsRecords {
	pub ips: Vec<IpAddr>,
	pub nameservers: Vec<String>,
	pub cname: Option<String>,
	pub mxs: Vec<String>,
	pub txts: Vec<String>,
}

/// Thin wrapper around the platform resolver, shared across pipeline workers.
#[derive(Clone)]
pub struct DnsResolver {
	inner: Arc<TokioAsyncResolver>,
}

impl DnsResolver {
	pub fn from_system_config() -> anyhow::Result<Self> {
		let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
			.unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
		opts.timeout = LOOKUP_TIMEOUT;
		let resolver = TokioAsyncResolver::tokio(config, opts);
		Ok(Self {
			inner: Arc::new(resolver),
		})
	}

	/// Performs A/AAAA, NS, CNAME, MX, and TXT lookups concurrently. A single
	/// hanging or failing lookup never blocks the other four. Races the whole
	/// join against `shutdown`: a root cancellation drops whichever lookups
	/// are still in flight and returns an all-empty result rather than
	/// waiting out their individual timeouts.
	pub async fn resolve_all(&self, host: &str, shutdown: &CancellationToken) -> DnsRecords {
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => {
				tracing::debug!(%host, "DNS resolution cancelled");
				DnsRecords::default()
			}
			records = self.resolve_all_uncancellable(host) => records,
		}
	}

	async fn resolve_all_uncancellable(&self, host: &str) -> DnsRecords {
		let (ips, ns, cname, mx, txt) = tokio::join!(
			self.lookup_ips(host),
			self.lookup_ns(host),
			self.lookup_cname(host),
			self.lookup_mx(host),
			self.lookup_txt(host),
		);

		DnsRecords {
			ips: ips.unwrap_or_default(),
			nameservers: ns.unwrap_or_default(),
			cname: cname.flatten(),
			mxs: mx.unwrap_or_default(),
			txts: txt.unwrap_or_default(),
		}
	}

	async fn lookup_ips(&self, host: &str) -> Option<Vec<IpAddr>> {
		let fut = self.inner.lookup_ip(host);
		match tokio::time::timeout(LOOKUP_TIMEOUT, fut).await {
			Ok(Ok(response)) => Some(response.iter().collect()),
			Ok(Err(e)) => {
				tracing::debug!(%host, error = %e, "A/AAAA lookup failed");
				None
			}
			Err(_) => {
				tracing::debug!(%host, "A/AAAA lookup timed out");
				None
			}
		}
	}

	async fn lookup_ns(&self, host: &str) -> Option<Vec<String>> {
		let fut = self.inner.ns_lookup(host);
		match tokio::time::timeout(LOOKUP_TIMEOUT, fut).await {
			Ok(Ok(response)) => Some(
				response
					.iter()
					.map(|ns| strip_trailing_dot(&ns.to_string()))
					.collect(),
			),
			Ok(Err(e)) => {
				tracing::debug!(%host, error = %e, "NS lookup failed");
				None
			}
			Err(_) => {
				tracing::debug!(%host, "NS lookup timed out");
				None
			}
		}
	}

	async fn lookup_cname(&self, host: &str) -> Option<Option<String>> {
		let fut = self.inner.lookup(host, hickory_resolver::proto::rr::RecordType::CNAME);
		match tokio::time::timeout(LOOKUP_TIMEOUT, fut).await {
			Ok(Ok(response)) => Some(
				response
					.iter()
					.next()
					.and_then(|rdata| rdata.as_cname().map(|c| strip_trailing_dot(&c.to_string()))),
			),
			Ok(Err(e)) => {
				tracing::debug!(%host, error = %e, "CNAME lookup failed");
				None
			}
			Err(_) => {
				tracing::debug!(%host, "CNAME lookup timed out");
				None
			}
		}
	}

	async fn lookup_mx(&self, host: &str) -> Option<Vec<String>> {
		let fut = self.inner.mx_lookup(host);
		match tokio::time::timeout(LOOKUP_TIMEOUT, fut).await {
			Ok(Ok(response)) => Some(
				response
					.iter()
					.map(|mx| strip_trailing_dot(&mx.exchange().to_string()))
					.collect(),
			),
			Ok(Err(e)) => {
				tracing::debug!(%host, error = %e, "MX lookup failed");
				None
			}
			Err(_) => {
				tracing::debug!(%host, "MX lookup timed out");
				None
			}
		}
	}

	async fn lookup_txt(&self, host: &str) -> Option<Vec<String>> {
		let fut = self.inner.txt_lookup(host);
		match tokio::time::timeout(LOOKUP_TIMEOUT, fut).await {
			Ok(Ok(response)) => Some(
				response
					.iter()
					.map(|txt| txt.to_string())
					.collect(),
			),
			Ok(Err(e)) => {
				tracing::debug!(%host, error = %e, "TXT lookup failed");
				None
			}
			Err(_) => {
				tracing::debug!(%host, "TXT lookup timed out");
				None
			}
		}
	}
}

fn strip_trailing_dot(name: &str) -> String {
	name.trim_end_matches('.').to_string()
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn strip_trailing_dot_removes_single_trailing_dot() {
		assert_eq!(strip_trailing_dot("ns1.example.com."), "ns1.example.com");
		assert_eq!(strip_trailing_dot("ns1.example.com"), "ns1.example.com");
	}

	#[test]
	fn dns_records_default_is_all_empty() {
		let records = DnsRecords::default();
		assert!(records.ips.is_empty());
		assert!(records.nameservers.is_empty());
		assert!(records.cname.is_none());
		assert!(records.mxs.is_empty());
		assert!(records.txts.is_empty());
	}
}
