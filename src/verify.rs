use rustls_pki_types::{
    CertificateDer, ServerName, SignatureVerificationAlgorithm, TrustAnchor, UnixTime,
};
use tracing::debug;
use webpki::{EndEntityCert, KeyUsage};

use crate::crypto;
use crate::error::ConnectionError;
use crate::network::CertificateVerify;

/// Checks the server's chain against `trust_anchors`, the leaf against
/// `server_name`, and the CertificateVerify signature against the leaf key.
pub fn verify_server(
    certificates: &[Vec<u8>],
    trust_anchors: &[TrustAnchor<'_>],
    server_name: &str,
    certificate_verify: &CertificateVerify,
    transcript_hash: &[u8; 32],
) -> Result<(), ConnectionError> {
    let (leaf, intermediates) = certificates.split_first().ok_or_else(|| {
        ConnectionError::Protocol("server sent an empty certificate chain".to_string())
    })?;
    let leaf = CertificateDer::from(leaf.as_slice());
    let intermediates: Vec<CertificateDer<'_>> = intermediates
        .iter()
        .map(|cert| CertificateDer::from(cert.as_slice()))
        .collect();

    let end_entity = EndEntityCert::try_from(&leaf)?;
    end_entity.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        trust_anchors,
        &intermediates,
        UnixTime::now(),
        KeyUsage::server_auth(),
        None,
        None,
    )?;

    let name = ServerName::try_from(server_name)?;
    end_entity.verify_is_valid_for_subject_name(&name)?;

    let algorithm = signature_algorithm(certificate_verify.scheme).ok_or_else(|| {
        ConnectionError::Protocol(format!(
            "unsupported CertificateVerify scheme 0x{:04x}",
            certificate_verify.scheme
        ))
    })?;
    let message =
        crypto::certificate_verify_content(crypto::SERVER_CERTIFICATE_VERIFY, transcript_hash);
    end_entity.verify_signature(algorithm, &message, &certificate_verify.signature)?;

    debug!(server_name, "server chain and signature verified");
    Ok(())
}

fn signature_algorithm(scheme: u16) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    match scheme {
        0x0403 => Some(webpki::ring::ECDSA_P256_SHA256),
        0x0503 => Some(webpki::ring::ECDSA_P384_SHA384),
        0x0804 => Some(webpki::ring::RSA_PSS_2048_8192_SHA256_LEGACY_KEY),
        0x0805 => Some(webpki::ring::RSA_PSS_2048_8192_SHA384_LEGACY_KEY),
        0x0806 => Some(webpki::ring::RSA_PSS_2048_8192_SHA512_LEGACY_KEY),
        0x0807 => Some(webpki::ring::ED25519),
        // PKCS#1 v1.5 is not allowed in TLS 1.3 CertificateVerify
        _ => None,
    }
}
