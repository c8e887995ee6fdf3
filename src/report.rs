use std::io::Write;

use crate::certificate;
use crate::config::Config;
use crate::error::{CryptoError, Error};
use crate::session::ConnectionState;

/// Organization attributes from the issuer of the peer's leaf certificate.
pub fn issuer_organization(state: &ConnectionState) -> Result<Vec<String>, Error> {
    let leaf = state.peer_certificates.first().ok_or(Error::IndexFailure)?;
    let certificate = certificate::parse(leaf)?;

    let organizations = certificate
        .issuer()
        .iter_organization()
        .map(|attr| attr.as_str().map(str::to_string))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CryptoError::from)?;
    Ok(organizations)
}

pub fn report(state: &ConnectionState, config: &Config, out: &mut impl Write) -> Result<(), Error> {
    let issuer = issuer_organization(state)?;

    writeln!(
        out,
        "Connected to {} using TLSv{}",
        config.peer_label, state.version
    )?;
    writeln!(out, "Cipher Suite: {}", state.cipher_suite)?;
    writeln!(out, "Issuer: [{}]", issuer.join(" "))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(peer_certificates: Vec<Vec<u8>>) -> ConnectionState {
        ConnectionState {
            version: 0x0304,
            cipher_suite: 0x1301,
            peer_certificates,
        }
    }

    #[test]
    fn empty_chain_is_an_index_failure() {
        let mut out = Vec::new();
        let result = report(&state(Vec::new()), &Config::default(), &mut out);
        assert!(matches!(result, Err(Error::IndexFailure)));
        assert!(out.is_empty());
    }

    #[test]
    fn unparsable_leaf_is_a_crypto_failure() {
        let mut out = Vec::new();
        let result = report(&state(vec![b"junk".to_vec()]), &Config::default(), &mut out);
        assert!(matches!(result, Err(Error::CryptoFailure(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn prints_version_suite_and_issuer() {
        let identity = certificate::generate(&Config::default()).unwrap();
        let state = state(vec![identity.certificate_der().to_vec(), b"ignored".to_vec()]);

        let mut out = Vec::new();
        report(&state, &Config::default(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Connected to Google using TLSv772\n\
             Cipher Suite: 4865\n\
             Issuer: [Sigma Baby gronk Inc.]\n"
        );
    }

    #[test]
    fn issuer_without_organization_prints_empty_list() {
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "no org");
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let leaf = params.self_signed(&key_pair).unwrap().der().to_vec();

        assert_eq!(issuer_organization(&state(vec![leaf])).unwrap(), Vec::<String>::new());
    }
}
