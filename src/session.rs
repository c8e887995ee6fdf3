use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};

use hmac::Mac;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::certificate::Identity;
use crate::config::Config;
use crate::crypto::{self, ApplicationKeys, SymmetricKey};
use crate::error::ConnectionError;
use crate::network::{
    self, CertificateRequest, Handshake, HandshakeBuffer, RecordType, ECDSA_SECP256R1_SHA256,
};
use crate::verify;

/// What the handshake settled on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub version: u16,
    pub cipher_suite: u16,
    /// DER, leaf first, exactly as the server sent them.
    pub peer_certificates: Vec<Vec<u8>>,
}

pub struct TlsSession {
    stream: TcpStream,
    application_keys: ApplicationKeys,
    state: ConnectionState,
}

impl TlsSession {
    pub fn connect(config: &Config, identity: &Identity) -> Result<Self, ConnectionError> {
        let mut stream = TcpStream::connect(&config.address)?;
        debug!(address = %config.address, "tcp connected");

        let mut handshake_hasher = Sha256::new();

        let private_key = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key);

        let mut client_random = [0; 32];
        OsRng.fill_bytes(&mut client_random);
        let mut session_id = [0; 32];
        OsRng.fill_bytes(&mut session_id);

        let client_hello_payload = network::client_hello_packet(
            &client_random,
            &session_id,
            &config.server_name,
            public_key.as_bytes(),
        );
        network::write_record(&mut stream, RecordType::Handshake, &client_hello_payload)?;
        handshake_hasher.update(&client_hello_payload);
        trace!(len = client_hello_payload.len(), "sent ClientHello");

        let mut buffer = HandshakeBuffer::default();
        let server_hello_payload = Self::read_plaintext_handshake(&mut stream, &mut buffer)?;
        let server_hello = match network::parse_handshake(&server_hello_payload)? {
            Handshake::ServerHello(server_hello) => server_hello,
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "expected ServerHello, got {:?}",
                    other
                )))
            }
        };
        if !buffer.is_empty() {
            return Err(ConnectionError::Protocol(
                "unencrypted handshake data after ServerHello".to_string(),
            ));
        }
        handshake_hasher.update(&server_hello_payload);

        let cipher_suite = server_hello.cipher_suite;
        debug!(?cipher_suite, "received ServerHello");
        let server_handshake_public_key = PublicKey::from(server_hello.server_public_key);
        let shared_secret = private_key.diffie_hellman(&server_handshake_public_key);
        if !shared_secret.was_contributory() {
            return Err(ConnectionError::Protocol(
                "server key share is a low-order point".to_string(),
            ));
        }
        // Copy because finalize() moves the hasher
        let hello_hash: [u8; 32] = handshake_hasher.clone().finalize().into();

        let mut handshake_keys =
            crypto::derive_handshake_keys(cipher_suite, shared_secret.as_bytes(), &hello_hash)?;

        let mut certificate_request: Option<CertificateRequest> = None;
        let mut peer_certificates: Option<Vec<Vec<u8>>> = None;
        let mut server_verified = false;
        loop {
            let (record, handshake_hash) = Self::read_wrapped_handshake(
                &mut stream,
                &mut handshake_keys.server_handshake_key,
                &mut buffer,
                &mut handshake_hasher,
            )?;
            match record {
                Handshake::EncryptedExtensions => {}
                Handshake::CertificateRequest(request) => {
                    debug!(
                        schemes = ?request.signature_schemes,
                        "server requested a client certificate"
                    );
                    certificate_request = Some(request);
                }
                Handshake::Certificate(cert_message) => {
                    debug!(
                        count = cert_message.certificates.len(),
                        "received server certificates"
                    );
                    peer_certificates = Some(cert_message.certificates);
                }
                Handshake::CertificateVerify(certificate_verify) => {
                    if config.verify_peer {
                        let certificates = peer_certificates.as_deref().ok_or_else(|| {
                            ConnectionError::Protocol(
                                "CertificateVerify before Certificate".to_string(),
                            )
                        })?;
                        verify::verify_server(
                            certificates,
                            &config.trust_anchors,
                            &config.server_name,
                            &certificate_verify,
                            &handshake_hash,
                        )?;
                        server_verified = true;
                    }
                }
                Handshake::Finished(finished) => {
                    let correct_finished_hash =
                        crypto::hmac(&handshake_keys.server_finished_key, &handshake_hash)?;
                    if correct_finished_hash
                        .verify_slice(&finished.signature)
                        .is_err()
                    {
                        return Err(ConnectionError::BadFinished);
                    }
                    break;
                }
                Handshake::ServerHello(_) => {
                    return Err(ConnectionError::Protocol(
                        "got another ServerHello".to_string(),
                    ))
                }
            }
        }

        if config.verify_peer && !server_verified {
            return Err(ConnectionError::Protocol(
                "server never proved possession of its certificate".to_string(),
            ));
        }
        if !config.verify_peer {
            debug!("server certificate chain was not verified");
        }

        let server_finished_hash: [u8; 32] = handshake_hasher.clone().finalize().into();
        let application_keys = crypto::derive_application_keys(
            cipher_suite,
            &handshake_keys.handshake_secret,
            &server_finished_hash,
        )?;

        // This is not part of the handshake hash
        network::write_record(&mut stream, RecordType::ChangeCipherSpec, b"\x01")?;

        if let Some(request) = certificate_request {
            Self::send_client_certificate(
                &mut stream,
                &mut handshake_keys.client_handshake_key,
                &mut handshake_hasher,
                &request,
                identity,
            )?;
        }

        let handshake_hash: [u8; 32] = handshake_hasher.finalize().into();
        let client_finished_hash =
            crypto::hmac(&handshake_keys.client_finished_key, &handshake_hash)?
                .finalize()
                .into_bytes();
        let client_finished_payload = network::client_finished_packet(&client_finished_hash);
        Self::write_wrapped_record(
            &mut stream,
            &mut handshake_keys.client_handshake_key,
            RecordType::Handshake,
            &client_finished_payload,
        )?;
        debug!("handshake complete");

        Ok(Self {
            stream,
            application_keys,
            state: ConnectionState {
                version: server_hello.version,
                cipher_suite: cipher_suite.id(),
                peer_certificates: peer_certificates.unwrap_or_default(),
            },
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.clone()
    }

    /// Sends close_notify and shuts the socket down.
    pub fn close(mut self) -> Result<(), ConnectionError> {
        Self::write_wrapped_record(
            &mut self.stream,
            &mut self.application_keys.client_key,
            RecordType::Alert,
            &network::close_notify_alert(),
        )?;
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != ErrorKind::NotConnected => return Err(err.into()),
            _ => {}
        }
        debug!("connection closed");
        Ok(())
    }

    fn send_client_certificate(
        stream: &mut impl Write,
        key: &mut SymmetricKey,
        hasher: &mut Sha256,
        request: &CertificateRequest,
        identity: &Identity,
    ) -> Result<(), ConnectionError> {
        let accepts_ecdsa = request
            .signature_schemes
            .contains(&ECDSA_SECP256R1_SHA256);
        let certificates = if accepts_ecdsa {
            vec![identity.certificate_der()]
        } else {
            warn!("server does not accept ecdsa_secp256r1_sha256, sending no certificate");
            Vec::new()
        };

        let certificate_payload =
            network::client_certificate_packet(&request.context, &certificates);
        Self::write_wrapped_record(stream, key, RecordType::Handshake, &certificate_payload)?;
        hasher.update(&certificate_payload);
        if !accepts_ecdsa {
            return Ok(());
        }

        let handshake_hash: [u8; 32] = hasher.clone().finalize().into();
        let signature = identity.sign(&crypto::certificate_verify_content(
            crypto::CLIENT_CERTIFICATE_VERIFY,
            &handshake_hash,
        ))?;
        let certificate_verify_payload =
            network::client_certificate_verify_packet(ECDSA_SECP256R1_SHA256, &signature);
        Self::write_wrapped_record(
            stream,
            key,
            RecordType::Handshake,
            &certificate_verify_payload,
        )?;
        hasher.update(&certificate_verify_payload);
        debug!("sent client certificate");
        Ok(())
    }

    fn read_plaintext_handshake(
        stream: &mut impl Read,
        buffer: &mut HandshakeBuffer,
    ) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(message) = buffer.next_message() {
                return Ok(message);
            }
            match network::read_record(stream)? {
                (RecordType::Handshake, _, payload) => buffer.extend(&payload),
                (RecordType::Alert, _, payload) => {
                    return Err(ConnectionError::Alert(network::parse_alert(&payload)))
                }
                (record_type, _, _) => {
                    return Err(ConnectionError::Protocol(format!(
                        "unexpected record type {:?} before ServerHello",
                        record_type
                    )))
                }
            }
        }
    }

    /// Returns the next encrypted handshake message together with the
    /// transcript hash up to, but not including, that message.
    fn read_wrapped_handshake(
        stream: &mut impl Read,
        key: &mut SymmetricKey,
        buffer: &mut HandshakeBuffer,
        hasher: &mut Sha256,
    ) -> Result<(Handshake, [u8; 32]), ConnectionError> {
        loop {
            if let Some(handshake_payload) = buffer.next_message() {
                let hash: [u8; 32] = hasher.clone().finalize().into();
                let handshake = network::parse_handshake(&handshake_payload)?;
                hasher.update(&handshake_payload);
                trace!(msg_type = handshake_payload[0], "received handshake message");
                return Ok((handshake, hash));
            }

            match network::read_record(stream)? {
                (RecordType::ApplicationData, record_header, payload) => {
                    let mut decrypted_payload = key.decrypt(&record_header, payload)?;

                    // strip the zero padding; the last non-zero byte is the real type
                    while decrypted_payload.last() == Some(&0) {
                        decrypted_payload.pop();
                    }
                    let record_type_byte = decrypted_payload.pop().ok_or_else(|| {
                        ConnectionError::Protocol("encrypted record has no content type".to_string())
                    })?;

                    match network::record_type_from_byte(record_type_byte) {
                        Some(RecordType::Handshake) => buffer.extend(&decrypted_payload),
                        Some(RecordType::Alert) => {
                            return Err(ConnectionError::Alert(network::parse_alert(
                                &decrypted_payload,
                            )))
                        }
                        _ => {
                            return Err(ConnectionError::Protocol(format!(
                                "expected handshake record. Got: 0x{:02x}",
                                record_type_byte
                            )))
                        }
                    }
                }
                // middlebox compatibility, carries no data
                (RecordType::ChangeCipherSpec, _, _) => {}
                (RecordType::Alert, _, payload) => {
                    return Err(ConnectionError::Alert(network::parse_alert(&payload)))
                }
                (record_type, _, _) => {
                    return Err(ConnectionError::Protocol(format!(
                        "unexpected record type {:?}",
                        record_type
                    )))
                }
            }
        }
    }

    fn write_wrapped_record(
        stream: &mut impl Write,
        key: &mut SymmetricKey,
        record_type: RecordType,
        record: &[u8],
    ) -> Result<(), ConnectionError> {
        let payload = [
            record,
            // Wrapped record type
            &[network::record_type_byte(record_type)],
        ]
        .concat();

        // encrypted_payload should be 16 bytes longer than payload for the AEAD tag
        let record_header =
            network::make_record_header(RecordType::ApplicationData, payload.len() as u16 + 16);
        let encrypted_payload = key.encrypt(&record_header, payload)?;

        network::write_record(stream, RecordType::ApplicationData, &encrypted_payload)?;

        Ok(())
    }
}
