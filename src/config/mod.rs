use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for the crawl engine.
///
/// Values are loaded from (in order): `config` file (optional), environment
/// variables prefixed with `CRAWL_` (e.g. `CRAWL_CONCURRENCY`), then explicit
/// `std::env::var` reads of the same names as a final override.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Settings {
	/// Path to the newline-delimited hostnames file (file-backed queue producer).
	pub domains: Option<String>,
	pub probe_id: String,
	pub run_id: String,
	pub concurrency: u32,
	pub user_agent: String,
	pub exclude_tlds: Vec<String>,
	pub ingest_url: Option<String>,
	pub batch_max_edges: u32,
	pub batch_flush_sec: u64,
	pub spool_dir: String,
	pub mtls_cert: Option<String>,
	pub mtls_key: Option<String>,
	pub mtls_ca: Option<String>,
	pub redis_addr: Option<String>,
	pub redis_queue_addr: Option<String>,
	pub redis_queue_key: String,
	pub log_level: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			domains: None,
			probe_id: "default".to_string(),
			run_id: "default".to_string(),
			concurrency: 256,
			user_agent: "vanopticon-prober/1.0".to_string(),
			exclude_tlds: Vec::new(),
			ingest_url: None,
			batch_max_edges: 10_000,
			batch_flush_sec: 2,
			spool_dir: "./spool".to_string(),
			mtls_cert: None,
			mtls_key: None,
			mtls_ca: None,
			redis_addr: None,
			redis_queue_addr: None,
			redis_queue_key: "crawl:queue".to_string(),
			log_level: Some("info".to_string()),
		}
	}
}

/// Partial settings used to overlay environment/file values on top of defaults.
#[derive(Debug, Deserialize, Default)]
struct PartialSettings {
	domains: Option<String>,
	probe_id: Option<String>,
	run_id: Option<String>,
	concurrency: Option<u32>,
	user_agent: Option<String>,
	exclude_tlds: Option<String>,
	ingest_url: Option<String>,
	batch_max_edges: Option<u32>,
	batch_flush_sec: Option<u64>,
	spool_dir: Option<String>,
	mtls_cert: Option<String>,
	mtls_key: Option<String>,
	mtls_ca: Option<String>,
	redis_addr: Option<String>,
	redis_queue_addr: Option<String>,
	redis_queue_key: Option<String>,
	log_level: Option<String>,
}

fn parse_tld_list(s: &str) -> Vec<String> {
	s.split(',')
		.map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
		.filter(|t| !t.is_empty())
		.collect()
}

/// Load settings from config file (optional) and environment variables.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		// Use a double-underscore separator so single-underscore env names like
		// `CRAWL_BATCH_MAX_EDGES` map to `batch_max_edges` instead of nesting.
		.add_source(config::Environment::with_prefix("CRAWL").separator("__"));

	let cfg = builder.build()?;

	let partial: PartialSettings = cfg.try_deserialize().unwrap_or_default();

	let mut s = Settings::default();
	if let Some(v) = partial.domains {
		s.domains = Some(v);
	}
	if let Some(v) = partial.probe_id {
		s.probe_id = v;
	}
	if let Some(v) = partial.run_id {
		s.run_id = v;
	}
	if let Some(v) = partial.concurrency {
		s.concurrency = v;
	}
	if let Some(v) = partial.user_agent {
		s.user_agent = v;
	}
	if let Some(v) = partial.exclude_tlds {
		s.exclude_tlds = parse_tld_list(&v);
	}
	if let Some(v) = partial.ingest_url {
		s.ingest_url = Some(v);
	}
	if let Some(v) = partial.batch_max_edges {
		s.batch_max_edges = v;
	}
	if let Some(v) = partial.batch_flush_sec {
		s.batch_flush_sec = v;
	}
	if let Some(v) = partial.spool_dir {
		s.spool_dir = v;
	}
	if let Some(v) = partial.mtls_cert {
		s.mtls_cert = Some(v);
	}
	if let Some(v) = partial.mtls_key {
		s.mtls_key = Some(v);
	}
	if let Some(v) = partial.mtls_ca {
		s.mtls_ca = Some(v);
	}
	if let Some(v) = partial.redis_addr {
		s.redis_addr = Some(v);
	}
	if let Some(v) = partial.redis_queue_addr {
		s.redis_queue_addr = Some(v);
	}
	if let Some(v) = partial.redis_queue_key {
		s.redis_queue_key = v;
	}
	if let Some(v) = partial.log_level {
		s.log_level = Some(v);
	}

	// Explicit overrides: some environments (CI, test harnesses) set env vars
	// in ways `config::Environment` doesn't map as expected; read the
	// canonical names directly so they always take final precedence.
	if let Ok(v) = std::env::var("CRAWL_DOMAINS") {
		if !v.is_empty() {
			s.domains = Some(v);
		}
	}
	if let Ok(v) = std::env::var("CRAWL_PROBE_ID") {
		if !v.is_empty() {
			s.probe_id = v;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_RUN_ID") {
		if !v.is_empty() {
			s.run_id = v;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_CONCURRENCY") {
		if let Ok(n) = v.parse::<u32>() {
			s.concurrency = n;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_USER_AGENT") {
		if !v.is_empty() {
			s.user_agent = v;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_EXCLUDE_TLDS") {
		if !v.is_empty() {
			s.exclude_tlds = parse_tld_list(&v);
		}
	}
	if let Ok(v) = std::env::var("CRAWL_INGEST_URL") {
		if !v.is_empty() {
			s.ingest_url = Some(v);
		}
	}
	if let Ok(v) = std::env::var("CRAWL_BATCH_MAX_EDGES") {
		if let Ok(n) = v.parse::<u32>() {
			s.batch_max_edges = n;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_BATCH_FLUSH_SEC") {
		if let Ok(n) = v.parse::<u64>() {
			s.batch_flush_sec = n;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_SPOOL_DIR") {
		if !v.is_empty() {
			s.spool_dir = v;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_MTLS_CERT") {
		if !v.is_empty() {
			s.mtls_cert = Some(v);
		}
	}
	if let Ok(v) = std::env::var("CRAWL_MTLS_KEY") {
		if !v.is_empty() {
			s.mtls_key = Some(v);
		}
	}
	if let Ok(v) = std::env::var("CRAWL_MTLS_CA") {
		if !v.is_empty() {
			s.mtls_ca = Some(v);
		}
	}
	if let Ok(v) = std::env::var("REDIS_ADDR") {
		if !v.is_empty() {
			s.redis_addr = Some(v);
		}
	}
	if let Ok(v) = std::env::var("REDIS_QUEUE_ADDR") {
		if !v.is_empty() {
			s.redis_queue_addr = Some(v);
		}
	}
	if let Ok(v) = std::env::var("REDIS_QUEUE_KEY") {
		if !v.is_empty() {
			s.redis_queue_key = v;
		}
	}
	if let Ok(v) = std::env::var("CRAWL_LOG_LEVEL") {
		if !v.is_empty() {
			s.log_level = Some(v);
		}
	}

	validate(&s)?;

	Ok(s)
}

/// Fatal validation: missing/invalid `domains` path or malformed `ingest`
/// URL are configuration errors per the error taxonomy.
fn validate(s: &Settings) -> Result<()> {
	if let Some(path) = &s.domains {
		if path.trim().is_empty() {
			anyhow::bail!("CRAWL_DOMAINS is set but empty");
		}
	}
	if let Some(url) = &s.ingest_url {
		url::Url::parse(url).with_context(|| format!("invalid ingest URL: {url}"))?;
	}
	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::env;

	fn clear_env() {
		for k in [
			"CRAWL_DOMAINS",
			"CRAWL_PROBE_ID",
			"CRAWL_RUN_ID",
			"CRAWL_CONCURRENCY",
			"CRAWL_USER_AGENT",
			"CRAWL_EXCLUDE_TLDS",
			"CRAWL_INGEST_URL",
			"CRAWL_BATCH_MAX_EDGES",
			"CRAWL_BATCH_FLUSH_SEC",
			"CRAWL_SPOOL_DIR",
			"CRAWL_MTLS_CERT",
			"CRAWL_MTLS_KEY",
			"CRAWL_MTLS_CA",
			"REDIS_ADDR",
			"REDIS_QUEUE_ADDR",
			"REDIS_QUEUE_KEY",
			"CRAWL_LOG_LEVEL",
		] {
			unsafe { env::remove_var(k) };
		}
	}

	#[test]
	fn test_load_defaults_and_env_overlay() {
		clear_env();

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.concurrency, d.concurrency);
		assert_eq!(s.batch_max_edges, d.batch_max_edges);
		assert_eq!(s.spool_dir, d.spool_dir);

		unsafe { env::set_var("CRAWL_CONCURRENCY", "64") };
		unsafe { env::set_var("CRAWL_EXCLUDE_TLDS", "gov, mil,.int") };
		unsafe { env::set_var("CRAWL_INGEST_URL", "https://sink.example/batch") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.concurrency, 64);
		assert_eq!(s2.exclude_tlds, vec!["gov", "mil", "int"]);
		assert_eq!(s2.ingest_url.as_deref(), Some("https://sink.example/batch"));

		clear_env();
	}

	#[test]
	fn test_invalid_ingest_url_rejected() {
		clear_env();
		unsafe { env::set_var("CRAWL_INGEST_URL", "not a url") };
		let result = load();
		assert!(result.is_err());
		clear_env();
	}

	#[test]
	fn test_parse_tld_list_trims_and_lowercases() {
		assert_eq!(
			parse_tld_list(" GOV, .Mil ,, int"),
			vec!["gov", "mil", "int"]
		);
	}
}
