//! Connection and TLS configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::conn_info::TlsVersion;
use crate::error::{Error, Result};
use crate::transport::tcp::SocketOptions;
use crate::version::HttpVersion;

/// Default number of bytes requested per `recv()`.
pub const DEFAULT_BLOCKSIZE: usize = 16384;

/// URL scheme of the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: Option<u16>,
    pub scheme: Scheme,
    /// Socket-level timeout applied to connect, recv and send.
    pub timeout: Option<Duration>,
    pub source_address: Option<SocketAddr>,
    pub blocksize: usize,
    pub socket_options: SocketOptions,
    pub disabled_versions: HashSet<HttpVersion>,
    pub tls: TlsConfig,
}

impl ConnectionConfig {
    /// Plain-HTTP configuration for `host` with defaults everywhere else.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            scheme: Scheme::Http,
            timeout: None,
            source_address: None,
            blocksize: DEFAULT_BLOCKSIZE,
            socket_options: SocketOptions::default(),
            disabled_versions: HashSet::new(),
            tls: TlsConfig::default(),
        }
    }

    pub fn https(mut self) -> Self {
        self.scheme = Scheme::Https;
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source_address(mut self, addr: SocketAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    pub fn blocksize(mut self, blocksize: usize) -> Self {
        self.blocksize = blocksize.max(1);
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    /// Never negotiate `version` on this connection.
    pub fn disable(mut self, version: HttpVersion) -> Self {
        self.disabled_versions.insert(version);
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Explicit port, or the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// ALPN identifiers offered on TLS over TCP, most preferred first.
    pub fn tcp_alpn_protocols(&self) -> Vec<&'static str> {
        [HttpVersion::Http2, HttpVersion::Http11]
            .into_iter()
            .filter(|v| *v == HttpVersion::Http11 || !self.disabled_versions.contains(v))
            .map(|v| v.alpn())
            .collect()
    }
}

/// Peer certificate requirement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRequirement {
    None,
    Optional,
    Required,
}

impl CertRequirement {
    /// Resolve a policy name such as `CERT_NONE` or `required`.
    ///
    /// An absent policy resolves to [`CertRequirement::Required`].
    pub fn resolve(policy: Option<&str>) -> Result<Self> {
        let Some(policy) = policy else {
            return Ok(Self::Required);
        };
        let upper = policy.trim().to_ascii_uppercase();
        match upper.strip_prefix("CERT_").unwrap_or(&upper) {
            "NONE" => Ok(Self::None),
            "OPTIONAL" => Ok(Self::Optional),
            "REQUIRED" => Ok(Self::Required),
            _ => Err(Error::config(format!(
                "unknown certificate requirement '{}'",
                policy
            ))),
        }
    }
}

/// How the peer hostname is checked against its certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssertHostname {
    /// Verify against the hostname being connected to.
    #[default]
    Default,
    /// Skip hostname verification (the chain is still verified).
    Disabled,
    /// Verify against this name instead.
    Name(String),
}

/// TLS parameters shared by TLS-over-TCP and TLS-over-QUIC.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Verify mode of an already-configured context, if the caller has one.
    pub verify_mode: Option<CertRequirement>,
    /// Requirement policy name (`CERT_NONE`, `CERT_REQUIRED`, ...).
    pub cert_reqs: Option<String>,
    pub ca_certs: Option<PathBuf>,
    pub ca_cert_dir: Option<PathBuf>,
    /// PEM or DER encoded trust anchors.
    pub ca_cert_data: Option<Vec<u8>>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub key_password: Option<String>,
    pub assert_hostname: AssertHostname,
    /// Hex digest of the expected leaf certificate.
    pub assert_fingerprint: Option<String>,
    /// SNI override.
    pub server_hostname: Option<String>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
}

impl TlsConfig {
    /// Whether peer verification is switched off by either knob.
    pub fn is_insecure(&self) -> Result<bool> {
        if self.verify_mode == Some(CertRequirement::None) {
            return Ok(true);
        }
        Ok(CertRequirement::resolve(self.cert_reqs.as_deref())? == CertRequirement::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_cert_reqs() {
        assert_eq!(CertRequirement::resolve(None).unwrap(), CertRequirement::Required);
        assert_eq!(
            CertRequirement::resolve(Some("CERT_NONE")).unwrap(),
            CertRequirement::None
        );
        assert_eq!(CertRequirement::resolve(Some("none")).unwrap(), CertRequirement::None);
        assert_eq!(
            CertRequirement::resolve(Some("optional")).unwrap(),
            CertRequirement::Optional
        );
        assert!(CertRequirement::resolve(Some("sometimes")).is_err());
    }

    #[test]
    fn test_insecure_from_either_knob() {
        let mut tls = TlsConfig::default();
        assert!(!tls.is_insecure().unwrap());

        tls.verify_mode = Some(CertRequirement::None);
        assert!(tls.is_insecure().unwrap());

        let tls = TlsConfig {
            cert_reqs: Some("CERT_NONE".into()),
            ..Default::default()
        };
        assert!(tls.is_insecure().unwrap());

        let tls = TlsConfig {
            verify_mode: Some(CertRequirement::Required),
            cert_reqs: Some("CERT_REQUIRED".into()),
            ..Default::default()
        };
        assert!(!tls.is_insecure().unwrap());
    }

    #[test]
    fn test_effective_port_and_alpn() {
        let config = ConnectionConfig::new("example.com").https();
        assert_eq!(config.effective_port(), 443);
        assert_eq!(config.tcp_alpn_protocols(), vec!["h2", "http/1.1"]);

        let config = ConnectionConfig::new("example.com")
            .port(8080)
            .disable(HttpVersion::Http2);
        assert_eq!(config.effective_port(), 8080);
        assert_eq!(config.tcp_alpn_protocols(), vec!["http/1.1"]);
    }
}
