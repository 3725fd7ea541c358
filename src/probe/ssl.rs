//! TLS certificate probe implementation.
//!
//! Completes the handshake whatever the chain looks like, reads the leaf
//! certificate and grades it against the target's expiry warning horizon.
//! Chain trust against the webpki roots is recorded in the metadata only.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::{ProbeError, ProbeReport, Verdict};
use crate::db::Target;

/// Host and port to handshake with: the URL when set, else hostname and port.
pub fn tls_endpoint(target: &Target) -> Result<(String, u16), ProbeError> {
    if let Ok(url) = url::Url::parse(&target.url) {
        if let Some(host) = url.host_str() {
            let host = host.trim_matches(|c| c == '[' || c == ']').to_string();
            return Ok((host, url.port().unwrap_or(443)));
        }
    }
    if target.hostname.is_empty() {
        return Err(ProbeError::Config("hostname or url is required".to_string()));
    }
    let port = if target.port == 0 { 443 } else { target.port };
    Ok((target.hostname.clone(), port))
}

/// Grade a certificate's validity window. Returns whole days left and the verdict.
pub fn assess_validity(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    warn_days: i64,
) -> (i64, Verdict) {
    let days_left = (not_after - now).num_days();
    if now > not_after {
        let verdict = Verdict::Failed(format!("SSL certificate expired on {}", not_after.to_rfc2822()));
        return (days_left, verdict);
    }
    if now < not_before {
        let verdict = Verdict::Failed(format!("SSL certificate not valid until {}", not_before.to_rfc2822()));
        return (days_left, verdict);
    }
    if days_left <= warn_days {
        return (days_left, Verdict::Warning(format!("SSL certificate expires in {} days", days_left)));
    }
    (days_left, Verdict::Healthy)
}

fn tls_error(e: impl std::fmt::Display) -> ProbeError {
    ProbeError::Network(format!("SSL error: {}", e))
}

fn asn1_to_utc(time: x509_parser::time::ASN1Time) -> Result<DateTime<Utc>, ProbeError> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| tls_error("certificate validity date out of range"))
}

/// Accepts any certificate chain so expired or untrusted leaves can still be
/// graded. Handshake signatures are verified as usual.
#[derive(Debug)]
struct ChainRecorder {
    webpki: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    chain_error: Mutex<Option<String>>,
}

impl ChainRecorder {
    fn new() -> Result<Self, ProbeError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(tls_error)?;
        Ok(Self {
            webpki,
            provider,
            chain_error: Mutex::new(None),
        })
    }

    /// Why the chain is not trusted, if it isn't.
    fn chain_error(&self) -> Option<String> {
        self.chain_error.lock().ok().and_then(|slot| slot.clone())
    }
}

impl ServerCertVerifier for ChainRecorder {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(e) = self
            .webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            if let Ok(mut slot) = self.chain_error.lock() {
                *slot = Some(e.to_string());
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Handshake with the endpoint and grade its leaf certificate.
pub async fn run_ssl_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    let (host, port) = tls_endpoint(target)?;

    let verifier = Arc::new(ChainRecorder::new()?);
    let config = ClientConfig::builder_with_provider(verifier.provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_no_client_auth();
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| ProbeError::Config(format!("invalid server name {}: {}", host, e)))?;

    let start = Instant::now();
    let sock = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(tls_error)?;
    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector.connect(server_name, sock).await.map_err(tls_error)?;
    let elapsed = start.elapsed();

    let report = ProbeReport::healthy(elapsed);
    let Some(leaf) = stream.get_ref().1.peer_certificates().and_then(|certs| certs.first()) else {
        return Ok(report
            .with_metadata(json!({ "hostname": host }))
            .failed("No SSL certificate found"));
    };

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| tls_error(format!("failed to parse certificate: {}", e)))?;
    let validity = cert.validity();
    let valid_from = asn1_to_utc(validity.not_before)?;
    let valid_to = asn1_to_utc(validity.not_after)?;

    let (days_left, verdict) = assess_validity(valid_from, valid_to, Utc::now(), target.ssl_warn_days);
    let chain_error = verifier.chain_error();
    let mut report = report.with_metadata(json!({
        "hostname": host,
        "issuer": cert.issuer().to_string(),
        "subject": cert.subject().to_string(),
        "valid_from": valid_from.to_rfc3339(),
        "valid_to": valid_to.to_rfc3339(),
        "days_until_expiry": days_left,
        "serial_number": cert.raw_serial_as_string(),
        "authorized": chain_error.is_none(),
        "authorization_error": chain_error,
    }));
    report.verdict = verdict;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckStatus, TargetType};
    use crate::probe::{Checker, ProbeChecker};
    use chrono::Duration as ChronoDuration;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    /// Self-signed for 127.0.0.1, valid 2020-01-01 to 2021-01-01.
    const EXPIRED_CERT: &[u8] = include_bytes!("testdata/expired_cert.der");
    const EXPIRED_KEY: &[u8] = include_bytes!("testdata/expired_key.der");
    /// Self-signed for 127.0.0.1, valid 2025-01-01 to 2099-12-31.
    const SELF_SIGNED_CERT: &[u8] = include_bytes!("testdata/selfsigned_cert.der");
    const SELF_SIGNED_KEY: &[u8] = include_bytes!("testdata/selfsigned_key.der");

    /// Serve TLS handshakes on a loopback port with the given certificate.
    async fn serve_tls(cert: &'static [u8], key: &'static [u8]) -> u16 {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert.to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec())),
            )
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(sock).await {
                        let _ = tls.shutdown().await;
                    }
                });
            }
        });
        port
    }

    fn ssl_target(port: u16) -> Target {
        Target {
            id: 4,
            target_type: TargetType::Ssl,
            url: format!("https://127.0.0.1:{}/", port),
            ssl_warn_days: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_assess_validity() {
        let now = Utc::now();
        let from = now - ChronoDuration::days(60);

        let (days, verdict) = assess_validity(from, now + ChronoDuration::days(90), now, 30);
        assert_eq!(days, 90);
        assert_eq!(verdict, Verdict::Healthy);

        let (days, verdict) = assess_validity(from, now + ChronoDuration::days(12) + ChronoDuration::hours(1), now, 30);
        assert_eq!(days, 12);
        assert_eq!(verdict, Verdict::Warning("SSL certificate expires in 12 days".to_string()));

        let expired_at = now - ChronoDuration::days(2);
        let (_, verdict) = assess_validity(from, expired_at, now, 30);
        assert_eq!(
            verdict,
            Verdict::Failed(format!("SSL certificate expired on {}", expired_at.to_rfc2822()))
        );

        let (_, verdict) = assess_validity(now + ChronoDuration::days(1), now + ChronoDuration::days(90), now, 30);
        assert!(matches!(verdict, Verdict::Failed(msg) if msg.starts_with("SSL certificate not valid until")));
    }

    #[test]
    fn test_tls_endpoint() {
        let from_url = Target {
            url: "https://status.example.org:8443/".to_string(),
            ..Default::default()
        };
        assert_eq!(tls_endpoint(&from_url).unwrap(), ("status.example.org".to_string(), 8443));

        let from_host = Target {
            hostname: "example.org".to_string(),
            ..Default::default()
        };
        assert_eq!(tls_endpoint(&from_host).unwrap(), ("example.org".to_string(), 443));

        assert!(tls_endpoint(&Target::default()).is_err());
    }

    #[tokio::test]
    async fn test_ssl_probe_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Target {
            target_type: crate::db::TargetType::Ssl,
            hostname: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let err = run_ssl_probe(&target).await.unwrap_err();
        assert!(err.to_string().starts_with("SSL error:"));
    }

    #[tokio::test]
    async fn test_expired_certificate_is_graded_down() {
        let port = serve_tls(EXPIRED_CERT, EXPIRED_KEY).await;
        let target = ssl_target(port);

        let report = run_ssl_probe(&target).await.unwrap();
        let expected_end = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(
            report.verdict,
            Verdict::Failed(format!("SSL certificate expired on {}", expected_end.to_rfc2822()))
        );
        assert_eq!(report.metadata["hostname"], "127.0.0.1");
        assert!(report.metadata["issuer"].as_str().unwrap().contains("expired.waypost.test"));
        assert_eq!(report.metadata["valid_to"], expected_end.to_rfc3339());
        assert!(report.metadata["days_until_expiry"].as_i64().unwrap() < 0);
        assert_eq!(report.metadata["authorized"], false);

        let outcome = ProbeChecker::new().check(&target).await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert!(outcome.error_message.starts_with("SSL certificate expired on"));
        assert!(outcome.metadata["serial_number"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_untrusted_valid_certificate_is_up() {
        let port = serve_tls(SELF_SIGNED_CERT, SELF_SIGNED_KEY).await;
        let target = ssl_target(port);

        let outcome = ProbeChecker::new().check(&target).await;
        assert_eq!(outcome.status, CheckStatus::Up, "{}", outcome.error_message);
        assert!(outcome.metadata["subject"].as_str().unwrap().contains("selfsigned.waypost.test"));
        assert!(outcome.metadata["days_until_expiry"].as_i64().unwrap() > 30);
        assert_eq!(outcome.metadata["authorized"], false);
        assert!(outcome.metadata["authorization_error"].as_str().is_some());
    }
}
