//! SPKI certificate pinning layered on top of regular webpki validation.
//!
//! Pins use the `sha256/<base64>` form: the SHA-256 digest of the
//! certificate's DER-encoded SubjectPublicKeyInfo. A handshake succeeds only
//! when the chain validates against the bundled roots *and* at least one
//! certificate in the presented chain matches a configured pin.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use thiserror::Error;

const PIN_PREFIX: &str = "sha256/";

#[derive(Debug, Error)]
pub enum PinError {
    #[error("invalid certificate pin: {0}")]
    InvalidPin(String),
    #[error("cannot parse certificate: {0}")]
    Certificate(String),
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls verifier setup failed: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    digests: Vec<[u8; 32]>,
}

impl PinSet {
    /// Parses pins separated by newlines, commas or whitespace.
    pub fn parse(text: &str) -> Result<Self, PinError> {
        let mut digests = Vec::new();
        for pin in text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|pin| !pin.is_empty())
        {
            let encoded = pin
                .strip_prefix(PIN_PREFIX)
                .ok_or_else(|| PinError::InvalidPin(pin.to_string()))?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|_| PinError::InvalidPin(pin.to_string()))?;
            let digest: [u8; 32] = bytes
                .try_into()
                .map_err(|_| PinError::InvalidPin(pin.to_string()))?;
            if !digests.contains(&digest) {
                digests.push(digest);
            }
        }
        Ok(Self { digests })
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn matches_der(&self, cert_der: &[u8]) -> bool {
        spki_sha256(cert_der)
            .map(|digest| self.digests.contains(&digest))
            .unwrap_or(false)
    }
}

/// Pin string for a DER certificate, in the form accepted by [`PinSet::parse`].
pub fn spki_pin(cert_der: &[u8]) -> Result<String, PinError> {
    let digest = spki_sha256(cert_der)?;
    Ok(format!("{PIN_PREFIX}{}", STANDARD.encode(digest)))
}

fn spki_sha256(cert_der: &[u8]) -> Result<[u8; 32], PinError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|err| PinError::Certificate(err.to_string()))?;
    Ok(Sha256::digest(cert.public_key().raw).into())
}

pub(crate) fn pinned_tls_config(pins: &PinSet) -> Result<ClientConfig, PinError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()?;
    let verifier = PinnedVerifier {
        inner,
        pins: pins.clone(),
    };
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

#[derive(Debug)]
struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: PinSet,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;
        let pinned = std::iter::once(end_entity)
            .chain(intermediates.iter())
            .any(|cert| self.pins.matches_der(cert.as_ref()));
        if pinned {
            Ok(verified)
        } else {
            tracing::warn!(
                target: "kiosk_core::pinning",
                server = ?server_name,
                "certificate chain does not match any configured pin"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.der().to_vec(), key_pair.public_key_der())
    }

    #[test]
    fn pin_is_sha256_of_public_key_info() {
        let (cert_der, spki_der) = self_signed();
        let expected = format!("sha256/{}", STANDARD.encode(Sha256::digest(&spki_der)));
        assert_eq!(spki_pin(&cert_der).unwrap(), expected);
    }

    #[test]
    fn parsed_pins_match_their_certificate_only() {
        let (cert_der, _) = self_signed();
        let (other_der, _) = self_signed();
        let pins = PinSet::parse(&spki_pin(&cert_der).unwrap()).unwrap();

        assert_eq!(pins.len(), 1);
        assert!(pins.matches_der(&cert_der));
        assert!(!pins.matches_der(&other_der));
    }

    #[test]
    fn parses_mixed_separators_and_dedups() {
        let pin = format!("sha256/{}", STANDARD.encode([7u8; 32]));
        let text = format!("{pin}\n{pin}, sha256/{}", STANDARD.encode([9u8; 32]));
        let pins = PinSet::parse(&text).unwrap();
        assert_eq!(pins.len(), 2);
        assert!(PinSet::parse("  \n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_pins() {
        assert!(matches!(
            PinSet::parse("md5/abcd"),
            Err(PinError::InvalidPin(_))
        ));
        assert!(matches!(
            PinSet::parse("sha256/not-base64!"),
            Err(PinError::InvalidPin(_))
        ));
        let short = format!("sha256/{}", STANDARD.encode([1u8; 16]));
        assert!(matches!(PinSet::parse(&short), Err(PinError::InvalidPin(_))));
    }

    #[test]
    fn builds_pinned_tls_config() {
        let pin = format!("sha256/{}", STANDARD.encode([3u8; 32]));
        let pins = PinSet::parse(&pin).unwrap();
        assert!(pinned_tls_config(&pins).is_ok());
    }
}
