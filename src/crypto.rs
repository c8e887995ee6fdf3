use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::ConnectionError;
use crate::network::CipherSuite;

pub const SERVER_CERTIFICATE_VERIFY: &str = "TLS 1.3, server CertificateVerify";
pub const CLIENT_CERTIFICATE_VERIFY: &str = "TLS 1.3, client CertificateVerify";

pub struct HandshakeKeys {
    pub handshake_secret: Vec<u8>,
    pub client_handshake_key: SymmetricKey,
    pub client_finished_key: Vec<u8>,
    pub server_handshake_key: SymmetricKey,
    pub server_finished_key: Vec<u8>,
}

pub struct ApplicationKeys {
    pub client_key: SymmetricKey,
}

pub struct SymmetricKey {
    cipher_suite: CipherSuite,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    seq: u64,
}

impl SymmetricKey {
    pub fn decrypt(
        &mut self,
        record_data: &[u8],
        mut wrapper: Vec<u8>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let iv = xor_iv(&self.iv, self.seq);
        let nonce = Nonce::from_slice(&iv);
        self.seq += 1;

        match self.cipher_suite {
            CipherSuite::TlsAes128GcmSha256 => {
                let key = aes_gcm::Key::<Aes128Gcm>::from_slice(&self.key);
                Aes128Gcm::new(key).decrypt_in_place(nonce, record_data, &mut wrapper)?;
            }
            CipherSuite::TlsChacha20Poly1305Sha256 => {
                let key = chacha20poly1305::Key::from_slice(&self.key);
                ChaCha20Poly1305::new(key).decrypt_in_place(nonce, record_data, &mut wrapper)?;
            }
        }
        Ok(wrapper)
    }

    pub fn encrypt(
        &mut self,
        record_data: &[u8],
        mut wrapper: Vec<u8>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let iv = xor_iv(&self.iv, self.seq);
        let nonce = Nonce::from_slice(&iv);
        self.seq += 1;

        match self.cipher_suite {
            CipherSuite::TlsAes128GcmSha256 => {
                let key = aes_gcm::Key::<Aes128Gcm>::from_slice(&self.key);
                Aes128Gcm::new(key).encrypt_in_place(nonce, record_data, &mut wrapper)?;
            }
            CipherSuite::TlsChacha20Poly1305Sha256 => {
                let key = chacha20poly1305::Key::from_slice(&self.key);
                ChaCha20Poly1305::new(key).encrypt_in_place(nonce, record_data, &mut wrapper)?;
            }
        }
        Ok(wrapper)
    }
}

/// Per-record nonce: the static IV with the sequence number XORed into its
/// low-order bytes.
pub fn xor_iv(iv: &[u8], seq: u64) -> Vec<u8> {
    let mut nonce = iv.to_vec();
    let offset = nonce.len() - 8;
    for (byte, seq_byte) in nonce[offset..].iter_mut().zip(seq.to_be_bytes()) {
        *byte ^= seq_byte;
    }
    nonce
}

pub fn derive_handshake_keys(
    cipher_suite: CipherSuite,
    shared_secret: &[u8],
    hello_hash: &[u8; 32],
) -> Result<HandshakeKeys, ConnectionError> {
    let zeros = [0; 32];

    let (_, early_secret) = Hkdf::<Sha256>::extract(Some(&zeros), &zeros);
    let derived_secret = derive_secret(&early_secret)?;
    let (handshake_secret_data, handshake_secret) =
        Hkdf::<Sha256>::extract(Some(&derived_secret[..]), shared_secret);

    let client_handshake_secret = Hkdf::<Sha256>::from_prk(&hkdf_expand_label(
        &handshake_secret,
        "c hs traffic",
        hello_hash,
        32,
    )?)?;
    let client_handshake_key = derive_symmetric_key(cipher_suite, &client_handshake_secret)?;
    let client_finished_key = hkdf_expand_label(&client_handshake_secret, "finished", &[], 32)?;

    let server_handshake_secret = Hkdf::<Sha256>::from_prk(&hkdf_expand_label(
        &handshake_secret,
        "s hs traffic",
        hello_hash,
        32,
    )?)?;
    let server_handshake_key = derive_symmetric_key(cipher_suite, &server_handshake_secret)?;
    let server_finished_key = hkdf_expand_label(&server_handshake_secret, "finished", &[], 32)?;

    Ok(HandshakeKeys {
        handshake_secret: handshake_secret_data.to_vec(),
        client_handshake_key,
        client_finished_key,
        server_handshake_key,
        server_finished_key,
    })
}

pub fn derive_application_keys(
    cipher_suite: CipherSuite,
    handshake_secret: &[u8],
    handshake_hash: &[u8; 32],
) -> Result<ApplicationKeys, ConnectionError> {
    let zeros = [0; 32];

    let handshake_secret = Hkdf::<Sha256>::from_prk(handshake_secret)?;
    let derived_secret = derive_secret(&handshake_secret)?;
    let (_, master_secret) = Hkdf::<Sha256>::extract(Some(&derived_secret[..]), &zeros);

    let client_secret = Hkdf::<Sha256>::from_prk(&hkdf_expand_label(
        &master_secret,
        "c ap traffic",
        handshake_hash,
        32,
    )?)?;

    // nothing is read after the handshake, so the server direction is never derived
    Ok(ApplicationKeys {
        client_key: derive_symmetric_key(cipher_suite, &client_secret)?,
    })
}

/// Derive-Secret(secret, "derived", "")
fn derive_secret(secret: &Hkdf<Sha256>) -> Result<Vec<u8>, ConnectionError> {
    let empty_hash = Sha256::new().finalize();
    hkdf_expand_label(secret, "derived", &empty_hash, 32)
}

fn derive_symmetric_key(
    cipher_suite: CipherSuite,
    secret: &Hkdf<Sha256>,
) -> Result<SymmetricKey, ConnectionError> {
    let key_length = match cipher_suite {
        CipherSuite::TlsAes128GcmSha256 => 16,
        CipherSuite::TlsChacha20Poly1305Sha256 => 32,
    };
    let key = hkdf_expand_label(secret, "key", &[], key_length)?;
    let iv = hkdf_expand_label(secret, "iv", &[], 12)?;
    Ok(SymmetricKey {
        cipher_suite,
        key,
        iv,
        seq: 0,
    })
}

fn hkdf_expand_label(
    secret: &Hkdf<Sha256>,
    label: &str,
    context: &[u8],
    length: u16,
) -> Result<Vec<u8>, ConnectionError> {
    let mut key = vec![0; length.into()];
    let full_label = [b"tls13 " as &[u8], label.as_bytes()].concat();
    secret.expand_multi_info(
        &[
            &length.to_be_bytes(),
            &(full_label.len() as u8).to_be_bytes(),
            &full_label,
            &(context.len() as u8).to_be_bytes(),
            context,
        ],
        &mut key,
    )?;
    Ok(key)
}

pub fn hmac(key: &[u8], msg: &[u8]) -> Result<Hmac<Sha256>, ConnectionError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)?;
    mac.update(msg);
    Ok(mac)
}

/// The string a CertificateVerify signature covers.
pub fn certificate_verify_content(context: &str, transcript_hash: &[u8]) -> Vec<u8> {
    [
        &[0x20u8; 64] as &[u8],
        context.as_bytes(),
        b"\x00",
        transcript_hash,
    ]
    .concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 8448, section 3
    const EARLY_SECRET: &str = "33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a";
    const DERIVED_SECRET: &str = "6f2615a108c702c5678f54fc9dbab69716c076189c48250cebeac3576c3611ba";

    #[test]
    fn early_secret_matches_rfc8448() {
        let zeros = [0; 32];
        let (prk, early_secret) = Hkdf::<Sha256>::extract(Some(&zeros), &zeros);
        assert_eq!(hex::encode(prk), EARLY_SECRET);
        assert_eq!(hex::encode(derive_secret(&early_secret).unwrap()), DERIVED_SECRET);
    }

    #[test]
    fn hmac_matches_rfc4231() {
        let mac = hmac(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn nonce_mixes_in_sequence_number() {
        let iv = [0xff; 12];
        assert_eq!(xor_iv(&iv, 0), iv.to_vec());
        let nonce = xor_iv(&iv, 0x0102);
        assert_eq!(&nonce[..10], &[0xff; 10]);
        assert_eq!(&nonce[10..], &[0xfe, 0xfd]);
    }

    #[test]
    fn sealed_records_open_with_matching_key() {
        for cipher_suite in [
            CipherSuite::TlsAes128GcmSha256,
            CipherSuite::TlsChacha20Poly1305Sha256,
        ] {
            let keys = derive_handshake_keys(cipher_suite, &[3; 32], &[4; 32]).unwrap();
            let mut sender = derive_symmetric_key(
                cipher_suite,
                &Hkdf::<Sha256>::from_prk(&keys.handshake_secret).unwrap(),
            )
            .unwrap();
            let mut receiver = derive_symmetric_key(
                cipher_suite,
                &Hkdf::<Sha256>::from_prk(&keys.handshake_secret).unwrap(),
            )
            .unwrap();

            let header = b"\x17\x03\x03\x00\x15";
            let sealed = sender.encrypt(header, b"hello".to_vec()).unwrap();
            assert_eq!(sealed.len(), 5 + 16);
            assert_eq!(receiver.decrypt(header, sealed).unwrap(), b"hello");

            // the second record uses a fresh nonce
            let sealed = sender.encrypt(header, b"hello".to_vec()).unwrap();
            let mut stale = derive_symmetric_key(
                cipher_suite,
                &Hkdf::<Sha256>::from_prk(&keys.handshake_secret).unwrap(),
            )
            .unwrap();
            assert!(stale.decrypt(header, sealed.clone()).is_err());
            assert_eq!(receiver.decrypt(header, sealed).unwrap(), b"hello");
        }
    }

    #[test]
    fn client_and_server_traffic_keys_differ() {
        let keys = derive_handshake_keys(CipherSuite::TlsAes128GcmSha256, &[3; 32], &[4; 32])
            .unwrap();
        assert_ne!(keys.client_handshake_key.key, keys.server_handshake_key.key);
        assert_ne!(keys.client_finished_key, keys.server_finished_key);

        let app = derive_application_keys(
            CipherSuite::TlsAes128GcmSha256,
            &keys.handshake_secret,
            &[5; 32],
        )
        .unwrap();
        assert_ne!(app.client_key.key, keys.client_handshake_key.key);
        assert_ne!(app.client_key.key, keys.server_handshake_key.key);
    }

    #[test]
    fn certificate_verify_content_layout() {
        let content = certificate_verify_content(CLIENT_CERTIFICATE_VERIFY, &[9; 32]);
        assert_eq!(content.len(), 64 + CLIENT_CERTIFICATE_VERIFY.len() + 1 + 32);
        assert!(content[..64].iter().all(|b| *b == 0x20));
        assert_eq!(
            &content[64..64 + CLIENT_CERTIFICATE_VERIFY.len()],
            CLIENT_CERTIFICATE_VERIFY.as_bytes()
        );
        assert_eq!(&content[content.len() - 32..], &[9; 32]);
        assert_eq!(content[64 + CLIENT_CERTIFICATE_VERIFY.len()], 0);
    }
}
