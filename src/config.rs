use rustls_pki_types::TrustAnchor;
use time::Duration;

const SERVER_ADDRESS: &str = "google.com:443";
const SERVER_NAME: &str = "google.com";
const PEER_LABEL: &str = "Google";
const COMMON_NAME: &str = "Skibidi";
const ORGANIZATION: &str = "Sigma Baby gronk Inc.";
const VALIDITY_HOURS: i64 = 24;

/// Everything a run needs to know, gathered in one place so tests can point
/// the dialer somewhere else.
#[derive(Clone, Debug)]
pub struct Config {
    /// `host:port` to dial.
    pub address: String,
    /// Sent as SNI and, when `verify_peer` is set, checked against the leaf.
    pub server_name: String,
    /// Name printed in the "Connected to" line.
    pub peer_label: String,
    pub common_name: String,
    pub organization: String,
    pub validity: Duration,
    /// Off by default: the server's chain is accepted without any checks.
    pub verify_peer: bool,
    /// Roots the chain must lead to when `verify_peer` is set.
    pub trust_anchors: Vec<TrustAnchor<'static>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: SERVER_ADDRESS.to_string(),
            server_name: SERVER_NAME.to_string(),
            peer_label: PEER_LABEL.to_string(),
            common_name: COMMON_NAME.to_string(),
            organization: ORGANIZATION.to_string(),
            validity: Duration::hours(VALIDITY_HOURS),
            verify_peer: false,
            trust_anchors: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        }
    }
}
