// src/ca.rs - interception CA and per-host leaf certificates
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use once_cell::sync::OnceCell;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, RsaKeySize, SanType, PKCS_RSA_SHA256,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

use crate::error::{Error, Result};

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
const BACKDATE: Duration = Duration::hours(1);

pub const HTTP1_ALPN: &[u8] = b"http/1.1";

/// RSA-2048 for the CA and the shared leaf key; there is no fallback.
fn generate_key() -> Result<KeyPair> {
    Ok(KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)?)
}

fn serial() -> rcgen::SerialNumber {
    rcgen::SerialNumber::from(rand::random::<u64>())
}

/// Long-lived root that signs every leaf.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    dir: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").field("dir", &self.dir).finish()
    }
}

impl CertificateAuthority {
    /// Loads the persisted root from `dir`, creating it when either file is
    /// missing. Present but unreadable material is an error.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let ca = Self::load(dir, &cert_path, &key_path)?;
            info!("Loaded interception CA from {}", dir.display());
            return Ok(ca);
        }

        let ca = Self::generate(dir, &cert_path, &key_path)?;
        info!("Generated new interception CA in {}", dir.display());
        Ok(ca)
    }

    fn load(dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| Error::certificate(format!("Failed to decode CA certificate: {}", e)))?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            dir: dir.to_path_buf(),
        })
    }

    fn generate(dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Tunscope Interception CA");
        dn.push(DnType::OrganizationName, "Tunscope");
        dn.push(DnType::LocalityName, "Local");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key = generate_key()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();

        fs::write(cert_path, cert_pem.as_bytes())?;
        let mut key_file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(key_path)?;
        key_file.write_all(key.serialize_pem().as_bytes())?;

        let cert_der = cert.der().clone();
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|e| Error::certificate(format!("Failed to create issuer: {}", e)))?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            dir: dir.to_path_buf(),
        })
    }

    /// Root certificate for installation into the host trust store.
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// A leaf ready to terminate TLS for one hostname.
#[derive(Debug)]
pub struct LeafCertificate {
    pub cert_der: CertificateDer<'static>,
    /// Leaf followed by the CA.
    pub chain: Vec<CertificateDer<'static>>,
    pub server_config: Arc<ServerConfig>,
}

/// Issues and caches leaves. All leaves share one key pair.
pub struct LeafIssuer {
    ca: Arc<CertificateAuthority>,
    leaf_key: KeyPair,
    cache: DashMap<String, Arc<OnceCell<Arc<LeafCertificate>>>>,
    generated: AtomicU64,
}

impl std::fmt::Debug for LeafIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafIssuer")
            .field("cached", &self.cache.len())
            .field("generated", &self.generated_count())
            .finish()
    }
}

impl LeafIssuer {
    pub fn new(ca: Arc<CertificateAuthority>) -> Result<Self> {
        Ok(Self {
            ca,
            leaf_key: generate_key()?,
            cache: DashMap::new(),
            generated: AtomicU64::new(0),
        })
    }

    /// Number of leaves actually generated, as opposed to served from cache.
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::Acquire)
    }

    /// Returns the leaf for `host`, generating it at most once even under
    /// concurrent first use. Blocks while generating.
    pub fn issue(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let cell = self
            .cache
            .entry(host.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let leaf = cell.get_or_try_init(|| self.generate(&host))?;
        Ok(leaf.clone())
    }

    fn generate(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(serial());
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => {
                let name = host
                    .try_into()
                    .map_err(|_| Error::certificate(format!("Invalid domain name: {}", host)))?;
                vec![SanType::DnsName(name)]
            }
        };

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&self.leaf_key, &self.ca.issuer)?;
        let cert_der = cert.der().clone();
        let chain = vec![cert_der.clone(), self.ca.cert_der.clone()];

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.serialize_der()));
        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key)?;
        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

        self.generated.fetch_add(1, Ordering::AcqRel);
        counter!("tunscope_leaf_certs_issued_total").increment(1);
        debug!("Issued leaf certificate for {}", host);

        Ok(Arc::new(LeafCertificate {
            cert_der,
            chain,
            server_config: Arc::new(config),
        }))
    }
}
