use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::observability::MetricsRegistry;

const CACHE_CAPACITY: usize = 4096;
const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct Rule {
	allow: bool,
	path: String,
}

#[derive(Debug, Clone, Default)]
struct Group {
	agents: Vec<String>,
	rules: Vec<Rule>,
}

/// Parsed robots.txt policy, or the fail-open "allow everything" default.
#[derive(Debug, Clone, Default)]
pub struct RobotsData {
	groups: Vec<Group>,
}

impl RobotsData {
	pub fn allow_all() -> Self {
		Self { groups: Vec::new() }
	}

	fn parse(body: &str) -> Self {
		let mut groups: Vec<Group> = Vec::new();
		let mut current: Option<Group> = None;
		let mut seen_rule_in_current = false;

		for raw_line in body.lines() {
			let line = raw_line.split('#').next().unwrap_or("").trim();
			if line.is_empty() {
				continue;
			}
			let Some((key, value)) = line.split_once(':') else {
				continue;
			};
			let key = key.trim().to_ascii_lowercase();
			let value = value.trim();

			match key.as_str() {
				"user-agent" => {
					if current.is_some() && seen_rule_in_current {
						groups.push(current.take().unwrap());
						seen_rule_in_current = false;
					}
					let group = current.get_or_insert_with(Group::default);
					group.agents.push(value.to_ascii_lowercase());
				}
				"disallow" => {
					if let Some(group) = current.as_mut() {
						if !value.is_empty() {
							group.rules.push(Rule {
								allow: false,
								path: value.to_string(),
							});
						} else {
							// Empty Disallow means "allow everything" for this group.
							group.rules.push(Rule {
								allow: true,
								path: String::new(),
							});
						}
						seen_rule_in_current = true;
					}
				}
				"allow" => {
					if let Some(group) = current.as_mut() {
						group.rules.push(Rule {
							allow: true,
							path: value.to_string(),
						});
						seen_rule_in_current = true;
					}
				}
				_ => {}
			}
		}
		if let Some(group) = current {
			groups.push(group);
		}

		Self { groups }
	}
}

/// Chooses the group matching `user_agent` (case-insensitive substring
/// match against the directive's product token), falling back to the `*`
/// group, then evaluates the longest-matching rule for `path`. Ties between
/// equal-length Allow/Disallow rules favor Allow. No matching rule means
/// allowed.
pub fn allowed(data: &RobotsData, user_agent: &str, path: &str) -> bool {
	let ua = user_agent.to_ascii_lowercase();

	let specific = data.groups.iter().find(|g| {
		g.agents
			.iter()
			.any(|a| a != "*" && ua.contains(a.as_str()))
	});
	let group = specific.or_else(|| data.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

	let Some(group) = group else {
		return true;
	};

	let best = group
		.rules
		.iter()
		.filter(|rule| path.starts_with(rule.path.as_str()))
		.max_by_key(|rule| (rule.path.len(), rule.allow));

	match best {
		Some(rule) => rule.allow,
		None => true,
	}
}

/// True iff `host` equals one of `excluded_tlds` or ends with `.{tld}` for
/// some excluded tld. Case-sensitive match on the already-lowercased host.
pub fn skip_by_tld(host: &str, excluded_tlds: &[String]) -> bool {
	excluded_tlds
		.iter()
		.any(|tld| host == tld || host.ends_with(&format!(".{tld}")))
}

struct CacheEntry {
	data: RobotsData,
	inserted_at: Instant,
}

/// Bounded, TTL-checked cache of robots.txt policies, fetched https-then-http
/// and fail-open on any error.
pub struct RobotsCache {
	cache: Mutex<LruCache<String, CacheEntry>>,
	client: reqwest::Client,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl RobotsCache {
	pub fn new() -> Self {
		Self::with_capacity(CACHE_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let client = reqwest::Client::builder()
			.timeout(FETCH_TIMEOUT)
			.build()
			.unwrap_or_else(|_| reqwest::Client::new());
		Self {
			cache: Mutex::new(LruCache::new(
				NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
			)),
			client,
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub async fn get(&self, host: &str) -> RobotsData {
		{
			let mut cache = self.cache.lock().await;
			if let Some(entry) = cache.get(host) {
				if entry.inserted_at.elapsed() < ENTRY_TTL {
					if let Some(m) = &self.metrics {
						m.robots_cache_hits_total.inc();
					}
					return entry.data.clone();
				}
			}
		}

		let data = self.fetch(host).await;
		let mut cache = self.cache.lock().await;
		cache.put(
			host.to_string(),
			CacheEntry {
				data: data.clone(),
				inserted_at: Instant::now(),
			},
		);
		data
	}

	async fn fetch(&self, host: &str) -> RobotsData {
		if let Some(m) = &self.metrics {
			m.robots_fetches_total.inc();
		}

		for scheme in ["https", "http"] {
			let url = format!("{scheme}://{host}/robots.txt");
			match self.client.get(&url).send().await {
				Ok(resp) if resp.status().is_success() => {
					return match resp.text().await {
						Ok(body) => RobotsData::parse(&body),
						Err(_) => {
							if let Some(m) = &self.metrics {
								m.robots_fail_open_total.inc();
							}
							RobotsData::allow_all()
						}
					};
				}
				Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
					return RobotsData::allow_all();
				}
				_ => continue,
			}
		}

		if let Some(m) = &self.metrics {
			m.robots_fail_open_total.inc();
		}
		RobotsData::allow_all()
	}
}

impl Default for RobotsCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn allows_everything_when_no_rules_match() {
		let data = RobotsData::allow_all();
		assert!(allowed(&data, "prober", "/"));
	}

	#[test]
	fn star_group_denies_disallowed_path() {
		let data = RobotsData::parse("User-agent: *\nDisallow: /\n");
		assert!(!allowed(&data, "prober", "/"));
	}

	#[test]
	fn specific_agent_overrides_star_group() {
		let data = RobotsData::parse(
			"User-agent: *\nDisallow: /\n\nUser-agent: prober\nAllow: /\n",
		);
		assert!(allowed(&data, "prober", "/"));
		assert!(!allowed(&data, "othercrawler", "/"));
	}

	#[test]
	fn longest_matching_rule_wins() {
		let data = RobotsData::parse("User-agent: *\nDisallow: /private\nAllow: /private/public\n");
		assert!(!allowed(&data, "prober", "/private/secret"));
		assert!(allowed(&data, "prober", "/private/public/page"));
	}

	#[test]
	fn skip_by_tld_matches_exact_and_suffix() {
		let excluded = vec!["gov".to_string(), "mil".to_string()];
		assert!(skip_by_tld("something.gov", &excluded));
		assert!(skip_by_tld("sub.something.gov", &excluded));
		assert!(!skip_by_tld("example.com", &excluded));
	}

	#[tokio::test]
	async fn cache_miss_for_unreachable_host_fails_open() {
		let cache = RobotsCache::new();
		let data = cache.get("this-host-should-not-resolve.invalid").await;
		assert!(allowed(&data, "prober", "/anything"));
	}
}
