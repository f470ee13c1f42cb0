//! Integration tests for the batch emitter's POST-then-spool-then-replay
//! path against a real HTTP server (no sink configured vs. a flaky one).

#[cfg(feature = "integration-tests")]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use vanopticon_prober::emitter::{Emitter, EmitterConfig};
	use vanopticon_prober::model::{Batch, DomainNode};
	use vanopticon_prober::observability::MetricsRegistry;
	use wiremock::matchers::method;
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn contribution(host: &str) -> Batch {
		let now = chrono::Utc::now();
		let mut batch = Batch::new("p1", "r1");
		batch.nodes_domain.push(DomainNode {
			host: host.to_string(),
			apex: host.to_string(),
			first_seen: now,
			last_seen: now,
		});
		batch
	}

	#[tokio::test]
	async fn successful_post_delivers_without_spooling() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let dir = tempfile::tempdir().unwrap();
		let metrics = Arc::new(MetricsRegistry::new());
		let emitter = Emitter::new(
			"p1",
			"r1",
			EmitterConfig {
				ingest_url: Some(format!("{}/ingest", server.uri())),
				spool_dir: dir.path().to_path_buf(),
				..Default::default()
			},
			metrics,
		)
		.unwrap();

		emitter.append(contribution("a.example")).await;
		emitter.flush().await;

		let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
		assert!(files.is_empty(), "successful POST must not leave a spool file");
	}

	#[tokio::test]
	async fn sink_outage_then_recovery_drains_the_spool() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;

		let dir = tempfile::tempdir().unwrap();
		let metrics = Arc::new(MetricsRegistry::new());
		let http = reqwest::Client::builder()
			.timeout(Duration::from_millis(500))
			.build()
			.unwrap();
		let emitter = Emitter::with_client(
			"p1",
			"r1",
			EmitterConfig {
				ingest_url: Some(format!("{}/ingest", server.uri())),
				spool_dir: dir.path().to_path_buf(),
				..Default::default()
			},
			metrics.clone(),
			http,
		)
		.unwrap();

		// Three independent host pipelines each produce one batch; the sink
		// is down for all three, so three spool files should land on disk.
		for host in ["a.example", "b.example", "c.example"] {
			emitter.append(contribution(host)).await;
			emitter.flush().await;
		}

		let spooled: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.collect();
		assert_eq!(spooled.len(), 3, "every failed flush should produce a spool file");

		// Recovery: the sink now answers 2xx, and drain() replays every file.
		server.reset().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		emitter.drain().await;

		let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
		assert!(remaining.is_empty(), "drain() must replay and delete every spool file on success");
	}
}
