//! BoringSSL TLS connector.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::Path;

use boring::hash::{hash, MessageDigest};
use boring::pkey::PKey;
use boring::ssl::{
    SslConnector, SslContextBuilder, SslFiletype, SslMethod, SslStream, SslVerifyMode, SslVersion,
};
use boring::x509::X509;

use super::{Transport, TransportKind, TlsSessionInfo};
use crate::config::{AssertHostname, TlsConfig};
use crate::conn_info::TlsVersion;
use crate::error::{Error, Result};

/// Encode ALPN identifiers into the length-prefixed wire format.
pub fn alpn_wire_format(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

/// Load trust anchors from a bundle file, a directory of PEM files and/or
/// in-memory PEM or DER data.
///
/// Falls back to the system store when none is given.
pub fn load_trust_anchors(
    builder: &mut SslContextBuilder,
    cafile: Option<&Path>,
    capath: Option<&Path>,
    cadata: Option<&[u8]>,
) -> Result<()> {
    if cafile.is_none() && capath.is_none() && cadata.is_none() {
        builder.set_default_verify_paths()?;
        return Ok(());
    }

    if let Some(cafile) = cafile {
        builder
            .set_ca_file(cafile)
            .map_err(|e| Error::ssl(format!("Failed to load CA file {}: {}", cafile.display(), e)))?;
    }

    if let Some(capath) = capath {
        let entries = std::fs::read_dir(capath)?;
        for entry in entries.flatten() {
            let Ok(pem) = std::fs::read(entry.path()) else {
                continue;
            };
            for cert in X509::stack_from_pem(&pem).unwrap_or_default() {
                // Duplicates across files are fine.
                let _ = builder.cert_store_mut().add_cert(cert);
            }
        }
    }

    if let Some(cadata) = cadata {
        let certs = match X509::stack_from_pem(cadata) {
            Ok(certs) if !certs.is_empty() => certs,
            _ => vec![X509::from_der(cadata)
                .map_err(|e| Error::ssl(format!("Invalid CA data: {}", e)))?],
        };
        for cert in certs {
            builder.cert_store_mut().add_cert(cert)?;
        }
    }

    Ok(())
}

/// Install a client certificate chain and its private key (mutual TLS).
pub fn load_client_certificate(
    builder: &mut SslContextBuilder,
    certfile: &Path,
    keyfile: Option<&Path>,
    password: Option<&str>,
) -> Result<()> {
    builder
        .set_certificate_chain_file(certfile)
        .map_err(|e| Error::ssl(format!("Failed to load client certificate: {}", e)))?;

    let keyfile = keyfile.unwrap_or(certfile);
    match password {
        Some(password) => {
            let pem = std::fs::read(keyfile)?;
            let key = PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())
                .map_err(|e| Error::ssl(format!("Failed to decrypt client key: {}", e)))?;
            builder.set_private_key(&key)?;
        }
        None => builder
            .set_private_key_file(keyfile, SslFiletype::PEM)
            .map_err(|e| Error::ssl(format!("Failed to load client key: {}", e)))?,
    }

    builder.check_private_key()?;
    Ok(())
}

/// Compare the leaf certificate digest with a pinned hex fingerprint.
///
/// The digest is picked from the fingerprint length: md5 (32), sha1 (40)
/// or sha256 (64). Colons are ignored and case does not matter.
pub fn verify_fingerprint(cert_der: &[u8], fingerprint: &str) -> Result<()> {
    let expected: String = fingerprint
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase();

    let digest = match expected.len() {
        32 => MessageDigest::md5(),
        40 => MessageDigest::sha1(),
        64 => MessageDigest::sha256(),
        n => {
            return Err(Error::ssl(format!(
                "Fingerprint of invalid length {}: {}",
                n, fingerprint
            )))
        }
    };

    let actual = hash(digest, cert_der)?;
    let actual: String = actual.iter().map(|b| format!("{:02x}", b)).collect();

    if actual != expected {
        tracing::warn!("certificate fingerprint mismatch: expected {}, got {}", expected, actual);
        return Err(Error::ssl(format!(
            "Fingerprints did not match. Expected \"{}\", got \"{}\"",
            expected, actual
        )));
    }
    Ok(())
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls1_0 => SslVersion::TLS1,
        TlsVersion::Tls1_1 => SslVersion::TLS1_1,
        TlsVersion::Tls1_2 => SslVersion::TLS1_2,
        TlsVersion::Tls1_3 => SslVersion::TLS1_3,
    }
}

/// BoringSSL-based TLS connector for blocking TCP streams.
pub struct BoringConnector {
    connector: SslConnector,
    tls: TlsConfig,
}

impl BoringConnector {
    /// Build a connector offering `alpn_protocols`, most preferred first.
    pub fn new(tls: &TlsConfig, alpn_protocols: &[&str]) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::ssl(format!("Failed to create SSL connector: {}", e)))?;

        if tls.is_insecure()? {
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            load_trust_anchors(
                &mut builder,
                tls.ca_certs.as_deref(),
                tls.ca_cert_dir.as_deref(),
                tls.ca_cert_data.as_deref(),
            )?;
        }

        if let Some(certfile) = tls.cert_file.as_deref() {
            load_client_certificate(
                &mut builder,
                certfile,
                tls.key_file.as_deref(),
                tls.key_password.as_deref(),
            )?;
        }

        builder
            .set_min_proto_version(Some(ssl_version(tls.min_version.unwrap_or(TlsVersion::Tls1_2))))
            .map_err(|e| Error::ssl(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(ssl_version(tls.max_version.unwrap_or(TlsVersion::Tls1_3))))
            .map_err(|e| Error::ssl(format!("Failed to set max TLS version: {}", e)))?;

        builder
            .set_alpn_protos(&alpn_wire_format(alpn_protocols))
            .map_err(|e| Error::ssl(format!("Failed to set ALPN: {}", e)))?;

        Ok(Self {
            connector: builder.build(),
            tls: tls.clone(),
        })
    }

    /// Run the TLS handshake over `stream` for `host`.
    pub fn connect(&self, host: &str, stream: TcpStream) -> Result<TlsTransport> {
        let mut config = self.connector.configure()?;

        let sni = self.tls.server_hostname.as_deref().unwrap_or(host);
        match &self.tls.assert_hostname {
            AssertHostname::Default => {}
            AssertHostname::Disabled => config.set_verify_hostname(false),
            AssertHostname::Name(name) => {
                config.set_verify_hostname(false);
                config.param_mut().set_host(name)?;
            }
        }

        let stream = config
            .connect(sni, stream)
            .map_err(|e| Error::ssl(format!("TLS handshake failed: {}", e)))?;

        let transport = TlsTransport { stream };

        if let Some(fingerprint) = self.tls.assert_fingerprint.as_deref() {
            let leaf = transport
                .stream
                .ssl()
                .peer_certificate()
                .ok_or_else(|| Error::ssl("No peer certificate to match the fingerprint against"))?
                .to_der()?;
            verify_fingerprint(&leaf, fingerprint)?;
        }

        Ok(transport)
    }
}

/// TLS over TCP.
pub struct TlsTransport {
    stream: SslStream<TcpStream>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("peer", &self.stream.get_ref().peer_addr().ok())
            .finish()
    }
}

impl Transport for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            // An unclean shutdown is still end-of-stream to the caller.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            other => other,
        }
    }

    fn sendall(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown();
        let _ = self.stream.get_ref().shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().local_addr().ok()
    }

    fn tls_session(&self) -> Option<TlsSessionInfo> {
        let ssl = self.stream.ssl();
        Some(TlsSessionInfo {
            alpn: ssl.selected_alpn_protocol().map(<[u8]>::to_vec),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            version: Some(ssl.version_str().to_string()),
            peer_certificate: ssl.peer_certificate().and_then(|c| c.to_der().ok()),
            issuer_certificate: ssl
                .peer_cert_chain()
                .and_then(|chain| chain.get(1))
                .and_then(|c| c.to_der().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_wire_format() {
        assert_eq!(alpn_wire_format(&["h2", "http/1.1"]), b"\x02h2\x08http/1.1".to_vec());
        assert_eq!(alpn_wire_format(&["http/1.1"]), b"\x08http/1.1".to_vec());
        assert!(alpn_wire_format(&[]).is_empty());
    }

    #[test]
    fn test_fingerprint_digest_by_length() {
        let der = b"not really a certificate";
        let sha256: String = hash(MessageDigest::sha256(), der)
            .unwrap()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        assert!(verify_fingerprint(der, &sha256).is_ok());

        let md5: String = hash(MessageDigest::md5(), der)
            .unwrap()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert!(verify_fingerprint(der, &md5).is_ok());

        let wrong = "00".repeat(20);
        assert!(matches!(verify_fingerprint(der, &wrong), Err(Error::Ssl(_))));
        assert!(matches!(verify_fingerprint(der, "abcd"), Err(Error::Ssl(_))));
    }

    #[test]
    fn test_connector_builds_with_defaults() {
        let tls = TlsConfig::default();
        assert!(BoringConnector::new(&tls, &["h2", "http/1.1"]).is_ok());

        let insecure = TlsConfig {
            cert_reqs: Some("CERT_NONE".into()),
            ..Default::default()
        };
        assert!(BoringConnector::new(&insecure, &["http/1.1"]).is_ok());
    }
}
