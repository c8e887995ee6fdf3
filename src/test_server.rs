//! In-process TLS 1.3 server the handshake tests dial instead of the real host.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{ring, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    DigitallySignedStruct, DistinguishedName, ServerConfig, ServerConnection, SignatureScheme,
    StreamOwned,
};

use crate::config::Config;

pub const ISSUER_ORGANIZATION: &str = "Loopback Test Authority";
pub const PEER_LABEL: &str = "Loopback";

pub fn config(address: SocketAddr) -> Config {
    Config {
        address: address.to_string(),
        server_name: "localhost".to_string(),
        peer_label: PEER_LABEL.to_string(),
        ..Config::default()
    }
}

/// How the single connection ended, as seen by the server.
#[derive(Debug)]
pub struct Outcome {
    /// The client's Finished verified.
    pub handshake_complete: bool,
    /// The client sent close_notify before hanging up.
    pub clean_close: bool,
    pub peer_certificates: Option<Vec<Vec<u8>>>,
}

pub struct TestServer {
    pub address: SocketAddr,
    /// Self-signed authority that issued the server's leaf.
    pub authority: CertificateDer<'static>,
    handle: JoinHandle<Outcome>,
}

impl TestServer {
    /// Accepts a single connection. With `request_client_cert` the server
    /// demands a client certificate and checks its CertificateVerify.
    pub fn start(request_client_cert: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let (config, authority) = server_config(request_client_cert);
        let config = Arc::new(config);

        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let connection = ServerConnection::new(config).unwrap();
            let mut stream = StreamOwned::new(connection, socket);
            // runs the handshake, then waits for close_notify or a hang-up
            let mut received = Vec::new();
            let clean_close = stream.read_to_end(&mut received).is_ok();
            Outcome {
                handshake_complete: !stream.conn.is_handshaking(),
                clean_close,
                peer_certificates: stream
                    .conn
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|cert| cert.to_vec()).collect()),
            }
        });

        Self {
            address,
            authority,
            handle,
        }
    }

    /// Client config that checks the peer and trusts only this server's
    /// authority.
    pub fn verifying_config(&self) -> Config {
        let anchor = webpki::anchor_from_trusted_cert(&self.authority)
            .unwrap()
            .to_owned();
        Config {
            verify_peer: true,
            trust_anchors: vec![anchor],
            ..config(self.address)
        }
    }

    /// Waits for the client to go away.
    pub fn finish(self) -> Outcome {
        self.handle.join().unwrap()
    }
}

fn server_config(request_client_cert: bool) -> (ServerConfig, CertificateDer<'static>) {
    let provider = Arc::new(ring::default_provider());

    let mut authority_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
    authority_params.distinguished_name = rcgen::DistinguishedName::new();
    authority_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "Loopback Root");
    authority_params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, ISSUER_ORGANIZATION);
    authority_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    authority_params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::DigitalSignature,
    ];
    let authority_key = rcgen::KeyPair::generate().unwrap();
    let authority = authority_params.self_signed(&authority_key).unwrap();

    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "localhost");
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let certificate = params
        .signed_by(&key_pair, &authority, &authority_key)
        .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap();
    let builder = if request_client_cert {
        builder.with_client_cert_verifier(Arc::new(AnyClientCertificate {
            algorithms: provider.signature_verification_algorithms,
        }))
    } else {
        builder.with_no_client_auth()
    };
    let mut config = builder
        .with_single_cert(vec![certificate.der().clone()], key)
        .unwrap();
    // nothing may arrive after the server Finished, so a hang-up is always a clean FIN
    config.send_tls13_tickets = 0;
    (config, authority.der().clone())
}

/// Takes any certificate but still checks the client signed the transcript
/// with its key.
#[derive(Debug)]
struct AnyClientCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyClientCertificate {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not offered".to_string()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
