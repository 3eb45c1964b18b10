//! TLS configuration for the decoy server.
//!
//! The decoy server only needs to get far enough to parse a ClientHello, but
//! rustls still insists on a complete server configuration. This module
//! builds that configuration, restricted to the FIPS policy when asked, and
//! holds the placeholder certificate it is configured with.

use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{CipherSuite, NamedGroup, ServerConfig};

use crate::error::ConfigError;

/// Subject of the placeholder certificate. It is never shown to a client.
const PLACEHOLDER_SUBJECT: &str = "sni-proxy.invalid";

/// Cipher suites allowed in FIPS mode.
const FIPS_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
];

/// Key exchange groups allowed in FIPS mode.
const FIPS_KX_GROUPS: &[NamedGroup] = &[NamedGroup::secp256r1, NamedGroup::secp384r1];

/// Builds decoy server configs under a fixed TLS policy.
#[derive(Debug, Clone)]
pub struct TlsConfigFactory {
    provider: Arc<CryptoProvider>,
    placeholder: Arc<CertifiedKey>,
    fips: bool,
}

impl TlsConfigFactory {
    /// Create a factory, generating the placeholder certificate.
    pub fn new(fips: bool) -> Result<Self, ConfigError> {
        let provider = Arc::new(crypto_provider(fips));
        let placeholder = placeholder_key(&provider)?;

        Ok(Self {
            provider,
            placeholder,
            fips,
        })
    }

    /// Whether the restricted FIPS policy is in force.
    pub fn fips(&self) -> bool {
        self.fips
    }

    /// The certificate every decoy server is configured with.
    pub fn placeholder(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.placeholder)
    }

    /// Build a server config that picks certificates through `resolver`.
    pub fn server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<ServerConfig, rustls::Error> {
        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider));
        let builder = if self.fips {
            builder.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        } else {
            builder.with_safe_default_protocol_versions()?
        };

        Ok(builder.with_no_client_auth().with_cert_resolver(resolver))
    }
}

/// The ring provider, narrowed to FIPS-approved algorithms when `fips` is set.
fn crypto_provider(fips: bool) -> CryptoProvider {
    let base = ring::default_provider();
    if !fips {
        return base;
    }

    CryptoProvider {
        cipher_suites: base
            .cipher_suites
            .iter()
            .copied()
            .filter(|suite| FIPS_CIPHER_SUITES.contains(&suite.suite()))
            .collect(),
        kx_groups: base
            .kx_groups
            .iter()
            .copied()
            .filter(|group| FIPS_KX_GROUPS.contains(&group.name()))
            .collect(),
        ..base
    }
}

/// Generate the self-signed placeholder certificate and load its key.
fn placeholder_key(provider: &CryptoProvider) -> Result<Arc<CertifiedKey>, ConfigError> {
    let generated = rcgen::generate_simple_self_signed(vec![PLACEHOLDER_SUBJECT.to_string()])?;

    let cert = CertificateDer::from(generated.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));
    let signing_key = provider.key_provider.load_private_key(key)?;

    Ok(Arc::new(CertifiedKey::new(vec![cert], signing_key)))
}
