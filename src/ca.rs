//! Certificate authority and per-host leaf issuance.
//!
//! A decrypting tunnel needs to present the client a certificate for the
//! host it asked for, signed by a CA the client already trusts. The
//! embedding program supplies that CA (or lets the proxy generate and
//! persist one), and [`LeafIssuer`] turns it into ready
//! [`ServerConfig`]s, minted lazily per host and cached.

use crate::action::TlsConfigFactory;
use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity, one year.
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Not-before backdating to absorb clock skew.
const NOT_BEFORE_OFFSET: i64 = 60;
/// Cached leaves are dropped well before they expire.
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;

/// A root certificate authority able to sign per-host leaf certificates.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Use a caller-supplied CA certificate and private key, both PEM.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse CA certificate: {e}")))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode CA PEM: {e}")))?;
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Load `ca_cert.pem`/`ca_key.pem` from `dir`, generating and persisting
  /// a fresh CA there when none exists yet.
  pub async fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();
    if !dir.exists() {
      fs::create_dir_all(dir).await?;
    }
    let cert_path = dir.join("ca_cert.pem");
    let key_path = dir.join("ca_key.pem");

    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      return Self::from_pem(&cert_pem, &key_pem);
    }

    let (cert_pem, key_pem) = Self::generate_pem()?;
    fs::write(&cert_path, &cert_pem).await?;
    fs::write(&key_path, &key_pem).await?;
    tracing::info!(path = %cert_path.display(), "generated new proxy CA");
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Generate a fresh self-signed CA, returning `(cert_pem, key_pem)`.
  pub fn generate_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "waylay proxy CA");
    dn.push(DnType::OrganizationName, "waylay");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {e}")))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {e}")))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// The CA certificate in PEM form, for installation in a client trust
  /// store.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// The CA certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Mint a leaf certificate for `host` (bare host, no port), returning the
  /// chain `[leaf, ca]` and the leaf private key.
  pub fn issue(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP literals get an IP SAN; clients differ in which SAN kind they
    // check for numeric targets, so a DNS SAN rides along when possible.
    let ip_host = host.trim_start_matches('[').trim_end_matches(']');
    params.subject_alt_names = if let Ok(ip) = ip_host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid host name: {host}"))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {e}")))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {host}: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority").finish_non_exhaustive()
  }
}

/// Mints and caches per-host TLS server configurations backed by a
/// [`CertificateAuthority`].
pub struct LeafIssuer {
  ca: CertificateAuthority,
  configs: Cache<String, Arc<ServerConfig>>,
}

impl LeafIssuer {
  /// Wrap a certificate authority with a leaf cache.
  pub fn new(ca: CertificateAuthority) -> Self {
    let configs = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();
    Self { ca, configs }
  }

  /// The wrapped certificate authority.
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// A TLS server configuration presenting a leaf for `host`. Ports are
  /// stripped, so `example.com:443` and `example.com` share one leaf.
  pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let bare = strip_port(host).to_string();
    if let Some(config) = self.configs.get(&bare).await {
      return Ok(config);
    }
    let (chain, key) = self.ca.issue(&bare)?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::certificate(format!("failed to build server config: {e}")))?;
    let config = Arc::new(config);
    self.configs.insert(bare, config.clone()).await;
    Ok(config)
  }

  /// A [`TlsConfigFactory`] asking this issuer for a leaf per tunnel, the
  /// default configuration source for decrypted tunnels.
  pub fn config_factory(self: &Arc<Self>) -> TlsConfigFactory {
    let issuer = self.clone();
    Arc::new(move |_req, host| {
      let issuer = issuer.clone();
      Box::pin(async move { issuer.server_config(&host).await })
    })
  }
}

impl std::fmt::Debug for LeafIssuer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafIssuer").finish_non_exhaustive()
  }
}

fn strip_port(host: &str) -> &str {
  if let Some(end) = host.find(']') {
    // Bracketed IPv6, with or without a port.
    &host[..=end]
  } else if host.matches(':').count() > 1 {
    // Bare IPv6 literal, the colons are address groups.
    host
  } else {
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_ports_but_not_ipv6_groups() {
    assert_eq!(strip_port("example.com:443"), "example.com");
    assert_eq!(strip_port("example.com"), "example.com");
    assert_eq!(strip_port("[::1]:443"), "[::1]");
    assert_eq!(strip_port("::1"), "::1");
  }

  #[tokio::test]
  async fn generates_and_reloads_ca() {
    let dir = tempfile::tempdir().unwrap();
    let ca1 = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
    let ca2 = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
    assert!(ca1.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    assert_eq!(ca1.ca_cert_pem(), ca2.ca_cert_pem());
  }

  #[tokio::test]
  async fn issues_chain_of_two() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
    let (chain, _key) = ca.issue("example.com").unwrap();
    assert_eq!(chain.len(), 2);
  }

  #[tokio::test]
  async fn from_pem_round_trips() {
    let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
    assert!(ca.issue("example.com").is_ok());
  }

  #[tokio::test]
  async fn leaf_configs_are_cached_per_bare_host() {
    let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
    let issuer = LeafIssuer::new(ca);
    let a = issuer.server_config("example.com:443").await.unwrap();
    let b = issuer.server_config("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let c = issuer.server_config("other.example").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
  }

  #[tokio::test]
  async fn issues_for_ip_literals() {
    let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
    let issuer = LeafIssuer::new(ca);
    assert!(issuer.server_config("127.0.0.1:8443").await.is_ok());
  }
}
