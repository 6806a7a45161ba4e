//! Certificate verification strategies for the Custom TLS Dialer
//! (§4.5 step 8).
//!
//! Two distinct verifiers, never one verifier with a bypass flag: a
//! standard chain verifier for the common case, and a legacy pinned
//! verifier that intentionally bypasses IP-SAN and basic-constraints
//! checks — gated behind an explicit pinned certificate and never
//! reachable as a general fallback (§9 Open Question 3).

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Standard chain verification against a root store and the dial host
/// as the DNS name. A thin wrapper over rustls's own webpki verifier.
#[derive(Debug)]
pub struct ChainVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ChainVerifier {
    pub fn new(roots: RootCertStore) -> Result<Self, RustlsError> {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| RustlsError::General(e.to_string()))?;
        Ok(ChainVerifier { inner })
    }
}

impl ServerCertVerifier for ChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Legacy pinned-certificate verifier: accepts the peer iff its leaf
/// certificate is byte-equal (raw DER) to the pinned certificate. Chain
/// validity, IP SANs, and basic constraints are deliberately not
/// checked — this is intentional for a narrow legacy case and must
/// never be used as a general fallback (§9).
#[derive(Debug)]
pub struct LegacyPinnedVerifier {
    pinned_der: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl LegacyPinnedVerifier {
    pub fn new(pinned_der: Vec<u8>, provider: Arc<CryptoProvider>) -> Self {
        LegacyPinnedVerifier { pinned_der, provider }
    }
}

impl ServerCertVerifier for LegacyPinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        if end_entity.as_ref() == self.pinned_der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(RustlsError::General("peer certificate does not match the pinned certificate".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
