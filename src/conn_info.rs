//! Metadata describing a negotiated connection.

use std::net::SocketAddr;
use std::time::Duration;

use boring::x509::{X509NameRef, X509Ref, X509};

use crate::version::HttpVersion;

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    /// Map the version string reported by the TLS stack (`TLSv1.3`).
    ///
    /// Only TLS 1.1 through 1.3 are reported; anything else is `None`.
    pub fn from_protocol_str(version: &str) -> Option<Self> {
        match version {
            "TLSv1.1" => Some(Self::Tls1_1),
            "TLSv1.2" => Some(Self::Tls1_2),
            "TLSv1.3" => Some(Self::Tls1_3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls1_0 => "TLSv1",
            Self::Tls1_1 => "TLSv1.1",
            Self::Tls1_2 => "TLSv1.2",
            Self::Tls1_3 => "TLSv1.3",
        }
    }
}

/// Decoded view of an X.509 certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject RDNs as (short name, value), e.g. `("CN", "example.com")`.
    pub subject: Vec<(String, String)>,
    pub issuer: Vec<(String, String)>,
    pub serial_number: Option<String>,
    pub not_before: String,
    pub not_after: String,
    /// DNS names from the subjectAltName extension.
    pub subject_alt_names: Vec<String>,
}

impl CertificateInfo {
    /// Decode a DER certificate. Returns `None` if it does not parse.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        X509::from_der(der).ok().map(|cert| Self::from_x509(&cert))
    }

    pub fn from_x509(cert: &X509Ref) -> Self {
        let serial_number = cert
            .serial_number()
            .to_bn()
            .ok()
            .and_then(|bn| bn.to_hex_str().ok().map(|s| s.to_string()));

        let subject_alt_names = cert
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            subject: name_entries(cert.subject_name()),
            issuer: name_entries(cert.issuer_name()),
            serial_number,
            not_before: cert.not_before().to_string(),
            not_after: cert.not_after().to_string(),
            subject_alt_names,
        }
    }

    /// First common name of the subject.
    pub fn common_name(&self) -> Option<&str> {
        self.subject
            .iter()
            .find(|(k, _)| k == "CN")
            .map(|(_, v)| v.as_str())
    }
}

fn name_entries(name: &X509NameRef) -> Vec<(String, String)> {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?.to_string();
            let value = entry.data().as_utf8().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}

/// Facts about the established connection, filled as each phase completes.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub http_version: Option<HttpVersion>,
    pub certificate_der: Option<Vec<u8>>,
    pub certificate_dict: Option<CertificateInfo>,
    pub issuer_certificate_der: Option<Vec<u8>>,
    pub issuer_certificate_dict: Option<CertificateInfo>,
    pub destination_address: Option<SocketAddr>,
    pub cipher: Option<String>,
    pub tls_version: Option<TlsVersion>,
    /// Time spent resolving the host.
    pub resolution_latency: Option<Duration>,
    /// Time spent opening the socket.
    pub established_latency: Option<Duration>,
    /// Time from socket open to protocol handshake completion.
    pub tls_handshake_latency: Option<Duration>,
    /// Time from `putrequest` to the last byte of the request.
    pub request_sent_latency: Option<Duration>,
}

impl ConnectionInfo {
    /// Record the leaf and (optionally) issuer certificates.
    pub(crate) fn set_certificates(&mut self, leaf: Option<Vec<u8>>, issuer: Option<Vec<u8>>) {
        self.certificate_dict = leaf.as_deref().and_then(CertificateInfo::from_der);
        self.certificate_der = leaf;
        self.issuer_certificate_dict = issuer.as_deref().and_then(CertificateInfo::from_der);
        self.issuer_certificate_der = issuer;
    }

    /// Whether the connection is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.tls_version.is_some() || self.certificate_der.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_strings() {
        assert_eq!(TlsVersion::from_protocol_str("TLSv1.3"), Some(TlsVersion::Tls1_3));
        assert_eq!(TlsVersion::from_protocol_str("TLSv1.2"), Some(TlsVersion::Tls1_2));
        assert_eq!(TlsVersion::from_protocol_str("TLSv1.1"), Some(TlsVersion::Tls1_1));
        assert_eq!(TlsVersion::from_protocol_str("TLSv1"), None);
        assert_eq!(TlsVersion::from_protocol_str("SSLv3"), None);
    }

    #[test]
    fn test_garbage_certificate_is_ignored() {
        let mut info = ConnectionInfo::default();
        info.set_certificates(Some(vec![0x30, 0x01, 0x00]), None);
        assert!(info.certificate_der.is_some());
        assert!(info.certificate_dict.is_none());
        assert!(info.issuer_certificate_der.is_none());
        assert!(info.is_encrypted());
    }
}
