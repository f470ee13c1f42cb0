//! Integration test for the robots cache's https-then-http fallback fetch
//! against a real (plaintext) HTTP server: the https attempt fails fast
//! since the fixture never speaks TLS, and the cache falls back to http.

#[cfg(feature = "integration-tests")]
mod tests {
	use vanopticon_prober::robots::{allowed, skip_by_tld, RobotsCache};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn https_failure_falls_back_to_http_and_parses_policy() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/robots.txt"))
			.respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"))
			.mount(&server)
			.await;

		let host = server.address().to_string();
		let cache = RobotsCache::new();
		let data = cache.get(&host).await;

		assert!(allowed(&data, "prober", "/"));
		assert!(!allowed(&data, "prober", "/private/secret"));
	}

	#[tokio::test]
	async fn not_found_caches_allow_all() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/robots.txt"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let host = server.address().to_string();
		let cache = RobotsCache::new();
		let data = cache.get(&host).await;

		assert!(allowed(&data, "prober", "/anything"));
	}

	#[test]
	fn tld_exclusion_is_independent_of_network_access() {
		let excluded = vec!["gov".to_string()];
		assert!(skip_by_tld("agency.gov", &excluded));
		assert!(!skip_by_tld("agency.com", &excluded));
	}
}
