use derive_more::{Display, From};

use crate::network::Alert;

#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "crypto failure: {}", _0)]
    CryptoFailure(CryptoError),
    #[display(fmt = "connection failure: {}", _0)]
    ConnectionFailure(ConnectionError),
    #[display(fmt = "index failure: peer presented no certificates")]
    #[from(ignore)]
    IndexFailure,
    #[display(fmt = "write failure: {}", _0)]
    OutputError(std::io::Error),
}

impl std::error::Error for Error {}

/// Failures while producing or inspecting certificates.
#[derive(Debug, Display, From)]
pub enum CryptoError {
    RandError(rand_core::Error),
    RcgenError(rcgen::Error),
    Pkcs8Error(p256::pkcs8::Error),
    X509Error(x509_parser::error::X509Error),
}

impl std::error::Error for CryptoError {}

/// Failures while dialing or completing the TLS handshake.
#[derive(Debug, Display, From)]
pub enum ConnectionError {
    IoError(std::io::Error),
    AesError(aes_gcm::aead::Error),
    HkdfInvalidLength(hkdf::InvalidLength),
    HkdfInvalidPrkLength(hkdf::InvalidPrkLength),
    HmacInvalidLength(hmac::digest::InvalidLength),
    SignatureError(p256::ecdsa::Error),
    #[display(fmt = "peer sent alert: {}", _0)]
    Alert(Alert),
    #[display(fmt = "malformed {}", _0)]
    #[from(ignore)]
    Decode(&'static str),
    #[display(fmt = "protocol violation: {}", _0)]
    #[from(ignore)]
    Protocol(String),
    #[display(fmt = "server Finished did not verify")]
    #[from(ignore)]
    BadFinished,
    #[display(fmt = "peer verification failed: {:?}", _0)]
    Verification(webpki::Error),
    #[display(fmt = "invalid server name: {}", _0)]
    InvalidServerName(rustls_pki_types::InvalidDnsNameError),
}

impl std::error::Error for ConnectionError {}
