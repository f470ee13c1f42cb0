use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::*;

use crate::model::CertNode;

const DIAL_BUDGET: Duration = Duration::from_secs(8);

#[derive(Debug, thiserror::Error)]
pub enum TlsInspectError {
	#[error("dial timed out after {0:?}")]
	Timeout(Duration),
	#[error("cancelled")]
	Cancelled,
	#[error("tcp connect failed: {0}")]
	Connect(#[source] std::io::Error),
	#[error("tls handshake failed: {0}")]
	Handshake(#[source] std::io::Error),
	#[error("invalid server name: {0}")]
	InvalidServerName(String),
	#[error("failed to parse leaf certificate: {0}")]
	CertParse(String),
}

/// Loads the platform/native trust roots once; shared across inspections via
/// `Arc` in `TlsInspector`.
fn native_root_store() -> RootCertStore {
	let mut store = RootCertStore::empty();
	if let Ok(certs) = rustls_native_certs::load_native_certs() {
		for cert in certs {
			let _ = store.add(&tokio_rustls::rustls::Certificate(cert.0));
		}
	}
	store
}

#[derive(Clone)]
pub struct TlsInspector {
	connector: TlsConnector,
}

impl TlsInspector {
	pub fn new() -> Self {
		let root_store = native_root_store();
		let config = ClientConfig::builder()
			.with_safe_defaults()
			.with_root_certificates(root_store)
			.with_no_client_auth();
		Self {
			connector: TlsConnector::from(Arc::new(config)),
		}
	}

	/// Opens a TCP connection to `host:443`, performs a TLS handshake with
	/// SNI = `host` and default certificate verification, and extracts leaf
	/// certificate metadata. Returns `Ok(None)` if the peer presents no
	/// certificates. Races the dial+handshake against both the 8s budget and
	/// `shutdown`, so a root cancellation interrupts an in-flight handshake
	/// instead of waiting for it to finish.
	pub async fn fetch_cert(
		&self,
		host: &str,
		shutdown: &CancellationToken,
	) -> Result<Option<CertNode>, TlsInspectError> {
		let addr = format!("{host}:443");
		self.fetch_cert_at(&addr, host, shutdown).await
	}

	/// Same as `fetch_cert` but against an explicit `addr` (`host:port`) while
	/// still presenting `sni_host` as the SNI/verification name. `fetch_cert`
	/// is a thin wrapper over this with `addr = "{host}:443"`; exposed
	/// separately so tests can dial a local fixture listener instead of the
	/// fixed port 443.
	pub async fn fetch_cert_at(
		&self,
		addr: &str,
		sni_host: &str,
		shutdown: &CancellationToken,
	) -> Result<Option<CertNode>, TlsInspectError> {
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => {
				tracing::debug!(addr, sni_host, "TLS inspection cancelled");
				Err(TlsInspectError::Cancelled)
			}
			budget = tokio::time::timeout(DIAL_BUDGET, self.fetch_cert_inner(addr, sni_host)) => {
				match budget {
					Ok(result) => result,
					Err(_) => Err(TlsInspectError::Timeout(DIAL_BUDGET)),
				}
			}
		}
	}

	async fn fetch_cert_inner(
		&self,
		addr: &str,
		sni_host: &str,
	) -> Result<Option<CertNode>, TlsInspectError> {
		let tcp = TcpStream::connect(addr).await.map_err(TlsInspectError::Connect)?;

		let server_name = ServerName::try_from(sni_host)
			.map_err(|_| TlsInspectError::InvalidServerName(sni_host.to_string()))?;

		let tls_stream = self
			.connector
			.connect(server_name, tcp)
			.await
			.map_err(TlsInspectError::Handshake)?;

		let (_, session) = tls_stream.get_ref();
		let certs = match session.peer_certificates() {
			Some(certs) if !certs.is_empty() => certs,
			_ => return Ok(None),
		};

		let leaf_der = &certs[0].0;
		parse_leaf_cert(leaf_der).map(Some)
	}
}

impl Default for TlsInspector {
	fn default() -> Self {
		Self::new()
	}
}

fn parse_leaf_cert(der: &[u8]) -> Result<CertNode, TlsInspectError> {
	let (_, cert) = X509Certificate::from_der(der).map_err(|e| TlsInspectError::CertParse(e.to_string()))?;

	let spki_sha256 = spki_sha256(&cert);
	let subject_cn = first_common_name(cert.subject());
	let issuer_cn = first_common_name(cert.issuer());
	let not_before = asn1_time_to_utc(cert.validity().not_before);
	let not_after = asn1_time_to_utc(cert.validity().not_after);

	Ok(CertNode {
		spki_sha256,
		subject_cn,
		issuer_cn,
		not_before,
		not_after,
	})
}

/// Base64 of SHA-256 over the leaf certificate's `SubjectPublicKeyInfo` DER.
fn spki_sha256(cert: &X509Certificate<'_>) -> String {
	let spki_der = cert.public_key().raw;
	let digest = Sha256::digest(spki_der);
	base64::engine::general_purpose::STANDARD.encode(digest)
}

fn first_common_name(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
	name.iter_common_name()
		.next()
		.and_then(|cn| cn.as_str().ok())
		.map(|s| s.to_string())
}

fn asn1_time_to_utc(t: x509_parser::time::ASN1Time) -> DateTime<Utc> {
	DateTime::from_timestamp(t.timestamp(), 0).unwrap_or_else(Utc::now)
}

pub(crate) fn is_cert_expired(cert: &CertNode, at: DateTime<Utc>) -> bool {
	at > cert.not_after
}

pub(crate) fn is_self_signed(subject_cn: &Option<String>, issuer_cn: &Option<String>) -> bool {
	match (subject_cn, issuer_cn) {
		(Some(s), Some(i)) => s == i,
		_ => false,
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn sample_cert(subject: &str, issuer: &str, not_after_year: i32) -> CertNode {
		CertNode {
			spki_sha256: "deadbeef".to_string(),
			subject_cn: Some(subject.to_string()),
			issuer_cn: Some(issuer.to_string()),
			not_before: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
			not_after: Utc.with_ymd_and_hms(not_after_year, 1, 1, 0, 0, 0).unwrap(),
		}
	}

	#[test]
	fn is_self_signed_when_subject_equals_issuer() {
		let cert = sample_cert("example.com", "example.com", 2030);
		assert!(is_self_signed(&cert.subject_cn, &cert.issuer_cn));
	}

	#[test]
	fn is_self_signed_false_for_ca_issued_cert() {
		let cert = sample_cert("example.com", "Let's Encrypt", 2030);
		assert!(!is_self_signed(&cert.subject_cn, &cert.issuer_cn));
	}

	#[test]
	fn is_cert_expired_compares_against_not_after() {
		let cert = sample_cert("example.com", "ca", 2021);
		let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
		assert!(is_cert_expired(&cert, now));

		let future_cert = sample_cert("example.com", "ca", 2099);
		assert!(!is_cert_expired(&future_cert, now));
	}
}
