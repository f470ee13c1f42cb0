//! Integration test: the resilient HTTP client's per-host circuit breaker
//! trips after repeated 503s from a real server and rejects calls locally
//! (no further requests reach the server) until the open timeout elapses.

#[cfg(feature = "integration-tests")]
mod tests {
	use std::sync::Arc;

	use vanopticon_prober::circuit_breaker::CircuitBreakerMap;
	use vanopticon_prober::http_client::{HttpClientError, ResilientHttpClient};
	use wiremock::matchers::method;
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn repeated_5xx_trips_the_breaker_for_that_host() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;

		let breakers = Arc::new(CircuitBreakerMap::new());
		let client = ResilientHttpClient::new(breakers, "test-agent/1.0").unwrap();
		let url = server.uri();
		let host = server.address().to_string();

		// Five consecutive 503s meet threshold=5, failure_ratio=0.6 (5/5).
		for _ in 0..5 {
			let resp = client.get(&url, &host).await.expect("503 is not a transport error");
			assert_eq!(resp.status(), 503);
		}

		let result = client.get(&url, &host).await;
		assert!(matches!(result, Err(HttpClientError::BreakerOpen(_))));
	}

	#[tokio::test]
	async fn four_xx_responses_never_trip_the_breaker() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let breakers = Arc::new(CircuitBreakerMap::new());
		let client = ResilientHttpClient::new(breakers, "test-agent/1.0").unwrap();
		let url = server.uri();
		let host = server.address().to_string();

		for _ in 0..10 {
			let resp = client.get(&url, &host).await.expect("request should succeed at the transport level");
			assert_eq!(resp.status(), 404);
		}
	}
}
