use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized hostname, lowercase and trailing-dot-stripped.
pub fn normalize_host(host: &str) -> String {
	host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainNode {
	pub host: String,
	pub apex: String,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpNode {
	pub ip: String,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertNode {
	pub spki_sha256: String,
	pub subject_cn: Option<String>,
	pub issuer_cn: Option<String>,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EdgeType {
	#[serde(rename = "RESOLVES_TO")]
	ResolvesTo,
	#[serde(rename = "USES_NS")]
	UsesNs,
	#[serde(rename = "ALIAS_OF")]
	AliasOf,
	#[serde(rename = "USES_MX")]
	UsesMx,
	#[serde(rename = "LINKS_TO")]
	LinksTo,
	#[serde(rename = "USES_CERT")]
	UsesCert,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
	#[serde(rename = "type")]
	pub edge_type: EdgeType,
	pub source: String,
	pub target: String,
	pub observed_at: DateTime<Utc>,
	pub probe_id: String,
	pub run_id: String,
}

/// A single flushable unit of graph contributions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Batch {
	pub probe_id: String,
	pub run_id: String,
	#[serde(default)]
	pub nodes_domain: Vec<DomainNode>,
	#[serde(default)]
	pub nodes_ip: Vec<IpNode>,
	#[serde(default)]
	pub nodes_cert: Vec<CertNode>,
	#[serde(default)]
	pub edges: Vec<Edge>,
}

impl Batch {
	pub fn new(probe_id: impl Into<String>, run_id: impl Into<String>) -> Self {
		Self {
			probe_id: probe_id.into(),
			run_id: run_id.into(),
			..Default::default()
		}
	}

	pub fn is_empty(&self) -> bool {
		self.nodes_domain.is_empty()
			&& self.nodes_ip.is_empty()
			&& self.nodes_cert.is_empty()
			&& self.edges.is_empty()
	}

	/// Number of node entries across all node kinds, used by the emitter's
	/// flush-trigger size check.
	pub fn node_count(&self) -> usize {
		self.nodes_domain.len() + self.nodes_ip.len() + self.nodes_cert.len()
	}

	pub fn edge_count(&self) -> usize {
		self.edges.len()
	}

	/// Merge another batch's contributions into this one, preserving order.
	pub fn merge(&mut self, other: Batch) {
		self.nodes_domain.extend(other.nodes_domain);
		self.nodes_ip.extend(other.nodes_ip);
		self.nodes_cert.extend(other.nodes_cert);
		self.edges.extend(other.edges);
	}

	/// Take the current contents, leaving an empty batch with the same
	/// probe/run identifiers behind, for the emitter's flush snapshot step.
	pub fn take(&mut self) -> Batch {
		std::mem::replace(self, Batch::new(self.probe_id.clone(), self.run_id.clone()))
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn normalize_host_lowercases_and_strips_trailing_dot() {
		assert_eq!(normalize_host("Example.COM."), "example.com");
		assert_eq!(normalize_host("  example.com  "), "example.com");
	}

	#[test]
	fn batch_merge_accumulates_all_kinds() {
		let now = Utc::now();
		let mut a = Batch::new("p1", "r1");
		a.nodes_domain.push(DomainNode {
			host: "a.com".into(),
			apex: "a.com".into(),
			first_seen: now,
			last_seen: now,
		});
		let mut b = Batch::new("p1", "r1");
		b.edges.push(Edge {
			edge_type: EdgeType::LinksTo,
			source: "a.com".into(),
			target: "b.com".into(),
			observed_at: now,
			probe_id: "p1".into(),
			run_id: "r1".into(),
		});
		a.merge(b);
		assert_eq!(a.nodes_domain.len(), 1);
		assert_eq!(a.edges.len(), 1);
		assert!(!a.is_empty());
	}

	#[test]
	fn batch_take_resets_accumulator() {
		let now = Utc::now();
		let mut a = Batch::new("p1", "r1");
		a.nodes_ip.push(IpNode {
			ip: "1.2.3.4".into(),
			first_seen: now,
			last_seen: now,
		});
		let snapshot = a.take();
		assert_eq!(snapshot.nodes_ip.len(), 1);
		assert!(a.is_empty());
		assert_eq!(a.probe_id, "p1");
	}

	#[test]
	fn edge_type_serializes_to_screaming_snake_case() {
		let json = serde_json::to_string(&EdgeType::UsesCert).unwrap();
		assert_eq!(json, "\"USES_CERT\"");
	}
}
