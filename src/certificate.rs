//! Ephemeral client identity: a P-256 key and a self-signed certificate for it.

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use rand_core::{OsRng, RngCore};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use x509_parser::error::X509Error;
use x509_parser::nom;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::Config;
use crate::error::CryptoError;

const SERIAL_BYTES: usize = 16;

/// The key pair and the DER certificate presented to servers that ask for one.
pub struct Identity {
    signing_key: SigningKey,
    certificate_der: Vec<u8>,
}

impl Identity {
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn parsed(&self) -> Result<X509Certificate<'_>, CryptoError> {
        parse(&self.certificate_der)
    }

    /// ECDSA-SHA256 over `message`, DER encoded as TLS expects.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, p256::ecdsa::Error> {
        let signature: Signature = self.signing_key.try_sign(message)?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// Generates a fresh key and a certificate signed by it, valid from now for
/// `config.validity`.
pub fn generate(config: &Config) -> Result<Identity, CryptoError> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let secret_key = SecretKey::from_pkcs8_der(&key_pair.serialize_der())?;

    let mut serial = [0; SERIAL_BYTES];
    OsRng.try_fill_bytes(&mut serial)?;

    let mut subject = DistinguishedName::new();
    subject.push(DnType::OrganizationName, config.organization.as_str());
    subject.push(DnType::CommonName, config.common_name.as_str());

    // encoded times carry whole seconds only
    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::nanoseconds(now.nanosecond().into());

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.distinguished_name = subject;
    params.not_before = not_before;
    params.not_after = not_before + config.validity;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let certificate = params.self_signed(&key_pair)?;
    let identity = Identity {
        signing_key: SigningKey::from(&secret_key),
        certificate_der: certificate.der().to_vec(),
    };

    // a certificate we can't read back is as good as none
    {
        let parsed = identity.parsed()?;
        debug!(
            subject = %parsed.subject(),
            serial = %parsed.raw_serial_as_string(),
            "generated self-signed certificate"
        );
    }

    Ok(identity)
}

pub fn parse(der: &[u8]) -> Result<X509Certificate<'_>, CryptoError> {
    match X509Certificate::from_der(der) {
        Ok((_, certificate)) => Ok(certificate),
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => Err(err.into()),
        Err(nom::Err::Incomplete(_)) => Err(X509Error::InvalidCertificate.into()),
    }
}
