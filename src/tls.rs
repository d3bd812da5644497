//! rustls client configuration for DoT connections.
//!
//! What a server's certificate must prove depends on how the server was
//! configured. A hostname demands web-PKI chain and name validation; pinned
//! digests demand a matching certificate (on top of chain validation when a
//! hostname is also present); an opportunistic server with neither is
//! probed without verification, which is also what the explicit self-signed
//! test override selects.

use std::sync::Arc;
use std::sync::OnceLock;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::dot::session_cache::DnsTlsSessionCache;
use crate::server::DnsServer;

/// ALPN identifier for DNS-over-TLS (RFC 7858).
const ALPN_DOT: &[u8] = b"dot";

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

/// One web-PKI verifier over the bundled roots serves every strict server.
fn webpki_verifier() -> Arc<WebPkiServerVerifier> {
    static INSTANCE: OnceLock<Arc<WebPkiServerVerifier>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let roots = Arc::new(rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            });
            WebPkiServerVerifier::builder_with_provider(roots, crypto_provider())
                .build()
                .unwrap()
        })
        .clone()
}

/// The SNI / verification name used when connecting to `server`.
pub fn server_name(server: &DnsServer) -> std::io::Result<ServerName<'static>> {
    if server.hostname.is_empty() {
        Ok(ServerName::from(server.addr.ip()))
    } else {
        ServerName::try_from(server.hostname.clone()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid server name: {}", server.hostname),
            )
        })
    }
}

/// What to require of the certificate a DoT server presents.
#[derive(Debug)]
enum CertPolicy {
    /// No verification: opportunistic probing, or the test override.
    AcceptAny,
    /// Chain and name validation against the web PKI.
    WebPki,
    /// The certificate's SHA-256 digest must match one of the pins.
    /// `chain_validate` additionally requires web-PKI validation, for
    /// servers configured with both a hostname and pins.
    Pinned {
        pins: Vec<Vec<u8>>,
        chain_validate: bool,
    },
}

#[derive(Debug)]
struct DotServerVerifier {
    policy: CertPolicy,
    algorithms: WebPkiSupportedAlgorithms,
}

impl DotServerVerifier {
    fn for_server(server: &DnsServer, insecure_test_override: bool) -> Arc<Self> {
        let policy = if insecure_test_override {
            CertPolicy::AcceptAny
        } else if !server.fingerprints.is_empty() {
            CertPolicy::Pinned {
                pins: server.fingerprints.clone(),
                chain_validate: server.explicitly_configured(),
            }
        } else if server.explicitly_configured() {
            CertPolicy::WebPki
        } else {
            CertPolicy::AcceptAny
        };
        Arc::new(DotServerVerifier {
            policy,
            algorithms: crypto_provider().signature_verification_algorithms,
        })
    }

    fn check_pins(pins: &[Vec<u8>], end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, end_entity.as_ref());
        if pins.iter().any(|pin| pin.as_slice() == digest.as_ref()) {
            return Ok(());
        }
        debug!(
            "certificate digest {:02x?} matches none of the {} configured pin(s)",
            digest.as_ref(),
            pins.len()
        );
        Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        ))
    }
}

impl ServerCertVerifier for DotServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.policy {
            CertPolicy::AcceptAny => Ok(ServerCertVerified::assertion()),
            CertPolicy::WebPki => webpki_verifier().verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
            CertPolicy::Pinned {
                pins,
                chain_validate,
            } => {
                if *chain_validate {
                    webpki_verifier().verify_server_cert(
                        end_entity,
                        intermediates,
                        server_name,
                        ocsp_response,
                        now,
                    )?;
                }
                Self::check_pins(pins, end_entity)?;
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds the client config for one DoT server, wiring session resumption
/// through the per-server cache.
pub fn create_dot_client_config(
    server: &DnsServer,
    session_cache: Arc<DnsTlsSessionCache>,
    insecure_test_override: bool,
) -> rustls::ClientConfig {
    let verifier = DotServerVerifier::for_server(server, insecure_test_override);
    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_DOT.to_vec()];
    config.enable_sni = server.explicitly_configured();
    config.resumption = Resumption::store(session_cache);
    config
}

/// Parses configured digest pins ("ab:cd:..." or bare hex, spaces allowed)
/// into bytes. Anything that is not a hex digest is a configuration error.
pub fn parse_fingerprints(fingerprints: &[String]) -> std::io::Result<Vec<Vec<u8>>> {
    fingerprints.iter().map(|f| parse_fingerprint(f)).collect()
}

fn parse_fingerprint(raw: &str) -> std::io::Result<Vec<u8>> {
    let bad = || {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("fingerprint is not a hex digest: {}", raw),
        )
    };
    let mut out = Vec::new();
    let mut pending: Option<u8> = None;
    for b in raw.bytes() {
        if b == b':' || b == b' ' {
            continue;
        }
        let Some(value) = hex_value(b) else {
            return Err(bad());
        };
        match pending.take() {
            Some(high) => out.push(high << 4 | value),
            None => pending = Some(value),
        }
    }
    if out.is_empty() || pending.is_some() {
        return Err(bad());
    }
    Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
