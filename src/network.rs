use std::io::{Read, Write};
use std::net::IpAddr;

use derive_more::Display;

use crate::error::ConnectionError;

pub const TLS13: u16 = 0x0304;
pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;

const X25519: u16 = 0x001d;

// SHA-256("HelloRetryRequest"), sent in place of the server random
const HELLO_RETRY_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

#[derive(Debug)]
pub enum Handshake {
    ServerHello(ServerHello),
    EncryptedExtensions,
    CertificateRequest(CertificateRequest),
    Certificate(CertificateMessage),
    CertificateVerify(CertificateVerify),
    Finished(Finished),
}

#[derive(Debug)]
pub struct ServerHello {
    pub server_public_key: [u8; 32],
    pub cipher_suite: CipherSuite,
    pub version: u16,
}

#[derive(Debug)]
pub struct CertificateRequest {
    pub context: Vec<u8>,
    pub signature_schemes: Vec<u16>,
}

#[derive(Debug)]
pub struct CertificateMessage {
    pub certificates: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct CertificateVerify {
    pub scheme: u16,
    pub signature: Vec<u8>,
}

#[derive(Debug)]
pub struct Finished {
    pub signature: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    TlsAes128GcmSha256,
    TlsChacha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn id(self) -> u16 {
        match self {
            CipherSuite::TlsAes128GcmSha256 => 0x1301,
            CipherSuite::TlsChacha20Poly1305Sha256 => 0x1303,
        }
    }

    fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(CipherSuite::TlsAes128GcmSha256),
            0x1303 => Some(CipherSuite::TlsChacha20Poly1305Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Display, PartialEq, Eq)]
#[display(fmt = "{} {}", severity, description)]
pub struct Alert {
    pub severity: &'static str,
    pub description: &'static str,
}

/// Bounds-checked cursor over a handshake structure.
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ConnectionError> {
        if self.buf.len() < len {
            return Err(ConnectionError::Decode(self.what));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ConnectionError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ConnectionError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Result<usize, ConnectionError> {
        let bytes = self.take(3)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize)
    }

    fn vec_u8(&mut self) -> Result<&'a [u8], ConnectionError> {
        let len = self.u8()?.into();
        self.take(len)
    }

    fn vec_u16(&mut self) -> Result<&'a [u8], ConnectionError> {
        let len = self.u16()?.into();
        self.take(len)
    }

    fn vec_u24(&mut self) -> Result<&'a [u8], ConnectionError> {
        let len = self.u24()?;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub fn write_record(
    stream: &mut impl Write,
    record_type: RecordType,
    payload: &[u8],
) -> std::io::Result<()> {
    let record = [
        &make_record_header(record_type, payload.len() as u16),
        payload,
    ]
    .concat();
    stream.write_all(&record)?;
    stream.flush()
}

pub fn make_record_header(record_type: RecordType, payload_len: u16) -> Vec<u8> {
    [
        &[record_type_byte(record_type)] as &[u8],
        b"\x03\x03",
        &payload_len.to_be_bytes(),
    ]
    .concat()
}

pub fn record_type_byte(record_type: RecordType) -> u8 {
    match record_type {
        RecordType::ChangeCipherSpec => 0x14,
        RecordType::Alert => 0x15,
        RecordType::Handshake => 0x16,
        RecordType::ApplicationData => 0x17,
    }
}

pub fn record_type_from_byte(byte: u8) -> Option<RecordType> {
    match byte {
        0x14 => Some(RecordType::ChangeCipherSpec),
        0x15 => Some(RecordType::Alert),
        0x16 => Some(RecordType::Handshake),
        0x17 => Some(RecordType::ApplicationData),
        _ => None,
    }
}

fn handshake_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    [
        &[msg_type] as &[u8],
        &(body.len() as u32).to_be_bytes()[1..],
        body,
    ]
    .concat()
}

pub fn client_hello_packet(
    client_random: &[u8],
    session_id: &[u8],
    server_name: &str,
    client_public_key: &[u8],
) -> Vec<u8> {
    // IP literals are not permitted in SNI
    let ext_server_name = if server_name.parse::<IpAddr>().is_ok() {
        Vec::new()
    } else {
        let server_name_bytes = server_name.as_bytes();
        [
            // assigned value for ext "server name"
            b"\x00\x00" as &[u8],
            // length of "server name" ext data
            &(server_name_bytes.len() as u16 + 5).to_be_bytes(),
            // length of first (and only) list entry
            &(server_name_bytes.len() as u16 + 3).to_be_bytes(),
            // list entry is type 0x00 "DNS hostname"
            b"\x00",
            // length of hostname
            &(server_name_bytes.len() as u16).to_be_bytes(),
            server_name_bytes,
        ]
        .concat()
    };

    let ext_key_share = [
        b"\x00\x33\x00\x26\x00\x24\x00\x1d\x00\x20" as &[u8],
        client_public_key,
    ]
    .concat();

    let exts = [
        &ext_server_name as &[u8],
        // Supported Groups: x25519 only, we never answer a HelloRetryRequest
        b"\x00\x0a\x00\x04\x00\x02\x00\x1d",
        // Signature Algorithms
        b"\x00\x0d\x00\x14\x00\x12\x04\x03\x08\x04\x04\x01\x05\x03\x08\x05",
        b"\x05\x01\x08\x06\x06\x01\x08\x07",
        &ext_key_share,
        // PSK Key Exchange Modes
        b"\x00\x2d\x00\x02\x01\x01",
        // Supported Versions
        b"\x00\x2b\x00\x03\x02\x03\x04",
    ]
    .concat();

    let hello_message = [
        // Client Version
        b"\x03\x03" as &[u8],
        client_random,
        &[session_id.len() as u8],
        session_id,
        // Cipher Suites
        b"\x00\x04\x13\x01\x13\x03",
        // Compression Methods
        b"\x01\x00",
        &(exts.len() as u16).to_be_bytes(),
        &exts,
    ]
    .concat();

    handshake_message(0x01, &hello_message)
}

pub fn client_certificate_packet(context: &[u8], certificates: &[&[u8]]) -> Vec<u8> {
    let entries: Vec<u8> = certificates
        .iter()
        .flat_map(|cert| {
            [
                &(cert.len() as u32).to_be_bytes()[1..],
                *cert,
                // no per-certificate extensions
                b"\x00\x00",
            ]
            .concat()
        })
        .collect();

    let body = [
        &[context.len() as u8] as &[u8],
        context,
        &(entries.len() as u32).to_be_bytes()[1..],
        &entries,
    ]
    .concat();

    handshake_message(0x0b, &body)
}

pub fn client_certificate_verify_packet(scheme: u16, signature: &[u8]) -> Vec<u8> {
    let body = [
        &scheme.to_be_bytes() as &[u8],
        &(signature.len() as u16).to_be_bytes(),
        signature,
    ]
    .concat();
    handshake_message(0x0f, &body)
}

pub fn client_finished_packet(verify_data: &[u8]) -> Vec<u8> {
    handshake_message(0x14, verify_data)
}

pub fn close_notify_alert() -> Vec<u8> {
    // warning, close_notify
    vec![0x01, 0x00]
}

pub fn read_record(
    stream: &mut impl Read,
) -> Result<(RecordType, [u8; 5], Vec<u8>), ConnectionError> {
    let mut record_header = [0; 5];
    stream.read_exact(&mut record_header)?;

    let record_type = record_type_from_byte(record_header[0]).ok_or_else(|| {
        ConnectionError::Protocol(format!("unknown record type 0x{:02x}", record_header[0]))
    })?;
    let length = u16::from_be_bytes([record_header[3], record_header[4]]);

    let mut payload = vec![0; length.into()];
    stream.read_exact(&mut payload)?;

    Ok((record_type, record_header, payload))
}

/// Reassembles handshake messages that may be split across, or packed into,
/// records.
#[derive(Debug, Default)]
pub struct HandshakeBuffer {
    pending: Vec<u8>,
}

impl HandshakeBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Removes the next complete message, header included.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([0, self.pending[1], self.pending[2], self.pending[3]]) as usize;
        if self.pending.len() < len + 4 {
            return None;
        }
        Some(self.pending.drain(..len + 4).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn parse_handshake(message: &[u8]) -> Result<Handshake, ConnectionError> {
    let mut reader = Reader::new(message, "handshake header");
    let msg_type = reader.u8()?;
    let body = reader.vec_u24()?;

    match msg_type {
        0x02 => Ok(Handshake::ServerHello(parse_server_hello(body)?)),
        0x08 => Ok(Handshake::EncryptedExtensions),
        0x0b => Ok(Handshake::Certificate(parse_certificate_message(body)?)),
        0x0d => Ok(Handshake::CertificateRequest(parse_certificate_request(
            body,
        )?)),
        0x0f => {
            let mut reader = Reader::new(body, "CertificateVerify");
            let scheme = reader.u16()?;
            let signature = reader.vec_u16()?.to_vec();
            Ok(Handshake::CertificateVerify(CertificateVerify {
                scheme,
                signature,
            }))
        }
        0x14 => Ok(Handshake::Finished(Finished {
            signature: body.to_vec(),
        })),
        _ => Err(ConnectionError::Protocol(format!(
            "unexpected handshake type: 0x{:02x}",
            msg_type
        ))),
    }
}

fn parse_server_hello(body: &[u8]) -> Result<ServerHello, ConnectionError> {
    let mut reader = Reader::new(body, "ServerHello");
    let _legacy_version = reader.u16()?;

    let mut server_random = [0; 32];
    server_random.copy_from_slice(reader.take(32)?);
    if server_random == HELLO_RETRY_RANDOM {
        return Err(ConnectionError::Protocol(
            "server sent HelloRetryRequest".to_string(),
        ));
    }

    let _session_id = reader.vec_u8()?;
    let cipher_suite_id = reader.u16()?;
    let _compression = reader.u8()?;

    let cipher_suite = CipherSuite::from_id(cipher_suite_id).ok_or_else(|| {
        ConnectionError::Protocol(format!(
            "unexpected cipher suite: 0x{:04x}",
            cipher_suite_id
        ))
    })?;

    let mut version = None;
    let mut server_public_key = None;

    // a TLS 1.2 ServerHello may omit the extensions block entirely
    if !reader.is_empty() {
        let mut exts = Reader::new(reader.vec_u16()?, "ServerHello extensions");
        while !exts.is_empty() {
            let ext_type = exts.u16()?;
            let ext_payload = exts.vec_u16()?;

            if ext_type == 0x002b {
                // Supported versions
                version = Some(Reader::new(ext_payload, "supported_versions").u16()?);
            } else if ext_type == 0x0033 {
                // Key share
                let mut key_share = Reader::new(ext_payload, "key_share");
                let group = key_share.u16()?;
                if group != X25519 {
                    return Err(ConnectionError::Protocol(format!(
                        "expected x25519 key share, got group 0x{:04x}",
                        group
                    )));
                }
                let key: [u8; 32] = key_share
                    .vec_u16()?
                    .try_into()
                    .map_err(|_| ConnectionError::Decode("x25519 public key"))?;
                server_public_key = Some(key);
            }
        }
    }

    if version != Some(TLS13) {
        return Err(ConnectionError::Protocol(
            "server doesn't support TLSv1.3".to_string(),
        ));
    }
    let server_public_key = server_public_key.ok_or_else(|| {
        ConnectionError::Protocol("ServerHello is missing a key share".to_string())
    })?;

    Ok(ServerHello {
        server_public_key,
        cipher_suite,
        version: TLS13,
    })
}

fn parse_certificate_request(body: &[u8]) -> Result<CertificateRequest, ConnectionError> {
    let mut reader = Reader::new(body, "CertificateRequest");
    let context = reader.vec_u8()?.to_vec();

    let mut signature_schemes = Vec::new();
    let mut exts = Reader::new(reader.vec_u16()?, "CertificateRequest extensions");
    while !exts.is_empty() {
        let ext_type = exts.u16()?;
        let ext_payload = exts.vec_u16()?;
        if ext_type == 0x000d {
            let mut schemes = Reader::new(
                Reader::new(ext_payload, "signature_algorithms").vec_u16()?,
                "signature_algorithms",
            );
            while !schemes.is_empty() {
                signature_schemes.push(schemes.u16()?);
            }
        }
    }

    Ok(CertificateRequest {
        context,
        signature_schemes,
    })
}

fn parse_certificate_message(body: &[u8]) -> Result<CertificateMessage, ConnectionError> {
    let mut reader = Reader::new(body, "Certificate");
    let _context = reader.vec_u8()?;

    let mut entries = Reader::new(reader.vec_u24()?, "certificate list");
    let mut certificates = Vec::new();
    while !entries.is_empty() {
        certificates.push(entries.vec_u24()?.to_vec());
        // OCSP staples and SCTs are ignored
        let _extensions = entries.vec_u16()?;
    }
    Ok(CertificateMessage { certificates })
}

pub fn parse_alert(payload: &[u8]) -> Alert {
    let severity = match payload.first() {
        Some(0x01) => "warning",
        Some(0x02) => "fatal",
        _ => "unknown level",
    };
    let description = match payload.get(1) {
        Some(0x00) => "Close Notify",
        Some(0x0a) => "Unexpected Message",
        Some(0x14) => "Bad Record Mac",
        Some(0x15) => "Decryption Failed",
        Some(0x16) => "Record Overflow",
        Some(0x1e) => "Decompression Failure",
        Some(0x28) => "Handshake Failure",
        Some(0x29) => "No Certificate",
        Some(0x2a) => "Bad Certificate",
        Some(0x2b) => "Unsupported Certificate",
        Some(0x2c) => "Certificate Revoked",
        Some(0x2d) => "Certificate Expired",
        Some(0x2e) => "Certificate Unknown",
        Some(0x2f) => "Illegal Parameter",
        Some(0x30) => "Unknown CA",
        Some(0x31) => "Access Denied",
        Some(0x32) => "Decode Error",
        Some(0x33) => "Decrypt Error",
        Some(0x3c) => "Export Restriction",
        Some(0x46) => "Protocol Version",
        Some(0x47) => "Insufficient Security",
        Some(0x50) => "Internal Error",
        Some(0x56) => "Inappropriate Fallback",
        Some(0x5a) => "User Canceled",
        Some(0x64) => "No Renegotiation",
        Some(0x6d) => "Missing Extension",
        Some(0x6e) => "Unsupported Extension",
        Some(0x6f) => "Certificate Unobtainable",
        Some(0x70) => "Unrecognised Name",
        Some(0x71) => "Bad Certificate Status Response",
        Some(0x72) => "Bad Certificate Hash Value",
        Some(0x73) => "Unknown PSK Identity",
        Some(0x74) => "Certificate Required",
        Some(0x78) => "No Application Protocol",
        _ => "(unrecognized alert)",
    };
    Alert {
        severity,
        description,
    }
}
