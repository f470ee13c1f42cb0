//! Integration test: dialing a server that presents a self-signed leaf
//! certificate must surface as a TLS handshake failure, not a silently
//! accepted connection, since the inspector verifies against the native
//! trust store rather than `dangerous()` skip-verification.

#[cfg(feature = "integration-tests")]
mod tests {
	use std::sync::Arc;

	use rcgen::generate_simple_self_signed;
	use tokio::net::TcpListener;
	use tokio_rustls::rustls::{self, Certificate, PrivateKey};
	use tokio_rustls::TlsAcceptor;

	use tokio_util::sync::CancellationToken;
	use vanopticon_prober::tls_inspect::{TlsInspectError, TlsInspector};

	fn self_signed_server_config() -> Arc<rustls::ServerConfig> {
		let cert = generate_simple_self_signed(vec!["localhost".into()]).unwrap();
		let cert_der = Certificate(cert.serialize_der().unwrap());
		let key_der = PrivateKey(cert.serialize_private_key_der());

		let cfg = rustls::ServerConfig::builder()
			.with_safe_defaults()
			.with_no_client_auth()
			.with_single_cert(vec![cert_der], key_der)
			.unwrap();
		Arc::new(cfg)
	}

	#[tokio::test]
	async fn self_signed_cert_is_rejected_as_a_handshake_failure() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let acceptor = TlsAcceptor::from(self_signed_server_config());
		tokio::spawn(async move {
			if let Ok((stream, _)) = listener.accept().await {
				// The client is expected to abort before finishing the
				// handshake; ignore the resulting accept error.
				let _ = acceptor.accept(stream).await;
			}
		});

		let inspector = TlsInspector::new();
		let shutdown = CancellationToken::new();
		let result = inspector
			.fetch_cert_at(&addr.to_string(), "localhost", &shutdown)
			.await;

		assert!(
			matches!(result, Err(TlsInspectError::Handshake(_))),
			"expected a handshake failure for an untrusted self-signed cert, got {:?}",
			result
		);
	}
}
