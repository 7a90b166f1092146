//! TLS termination settings and client identity forwarding
//!
//! The TLS context itself (certificates, verifier, protocol policy) is
//! built by the embedding program; this module carries the resulting
//! acceptor plus the listener's client-certificate policy, and turns a
//! presented peer certificate into the `X-SSL-*` fields injected into
//! backend requests.

use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsAcceptor;
use tracing::warn;
use x509_parser::prelude::*;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// How hard the listener asks for a client certificate. Enforcement
/// happens inside the verifier the TLS context was built with; this value
/// decides whether identity headers are injected at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCertMode {
    /// No certificate wanted, nothing injected.
    Off,
    /// Certificate requested but optional.
    Request,
    /// Certificate required and verified.
    Require,
    /// Certificate required even where verification is relaxed.
    RequireStrict,
}

/// TLS side of a listener configuration.
#[derive(Clone)]
pub struct TlsSettings {
    pub acceptor: TlsAcceptor,
    pub client_cert: ClientCertMode,
    /// One static header line appended to every backend request on this
    /// listener, e.g. `X-Forwarded-Proto: https`.
    pub https_header: Option<String>,
}

/// What the handshake left behind.
pub(crate) struct TlsInfo {
    pub(crate) peer_cert: Option<CertificateDer<'static>>,
    pub(crate) cipher: Option<String>,
}

/// Client certificate fields ready for header injection.
pub(crate) struct CertFields {
    pub(crate) subject: String,
    pub(crate) issuer: String,
    pub(crate) not_before: String,
    pub(crate) not_after: String,
    pub(crate) serial: String,
    /// PEM rendering, one element per line including the BEGIN/END
    /// markers.
    pub(crate) pem: Vec<String>,
}

/// Extracts the injectable fields from a DER certificate. A certificate
/// that does not parse is logged and skipped rather than failing the
/// request.
pub(crate) fn cert_fields(der: &[u8]) -> Option<CertFields> {
    let (_, cert) = match X509Certificate::from_der(der) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "can't parse client certificate");
            return None;
        }
    };
    Some(CertFields {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.to_string(),
        not_after: cert.validity().not_after.to_string(),
        serial: cert.tbs_certificate.serial.to_string(),
        pem: pem_lines(der),
    })
}

/// Renders DER as PEM lines: BEGIN marker, base64 wrapped at 64 columns,
/// END marker.
pub(crate) fn pem_lines(der: &[u8]) -> Vec<String> {
    let encoded = STANDARD.encode(der);
    let mut out = Vec::with_capacity(encoded.len() / 64 + 3);
    out.push("-----BEGIN CERTIFICATE-----".to_string());
    let bytes = encoded.as_bytes();
    for chunk in bytes.chunks(64) {
        out.push(String::from_utf8_lossy(chunk).into_owned());
    }
    out.push("-----END CERTIFICATE-----".to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Self-signed test certificate, serial 314159,
    // subject C=CH, O=Relay Test, CN=client.example.net.
    const FIXTURE_PEM: &str = "\
MIIDTjCCAjagAwIBAgIDBMsvMA0GCSqGSIb3DQEBCwUAMD8xCzAJBgNVBAYTAkNI
MRMwEQYDVQQKDApSZWxheSBUZXN0MRswGQYDVQQDDBJjbGllbnQuZXhhbXBsZS5u
ZXQwHhcNMjYwODAxMDgxMTA0WhcNMzYwNzI5MDgxMTA0WjA/MQswCQYDVQQGEwJD
SDETMBEGA1UECgwKUmVsYXkgVGVzdDEbMBkGA1UEAwwSY2xpZW50LmV4YW1wbGUu
bmV0MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAvJ9gw2pHqA59ohbK
PbTQ5lo+IIGjfq+HMzWAl1kybDp9Mh8c0k72PUOC3TCAIZ5yaHk4KUjyobImJ03H
6DSBXHoVsMJzTP5VwoKNZBdQirdSSFTDuU7Z/SxrNRytHc7okc1XqZMM/nT7tgd/
q5EVJklMcEFVZ7IdIFM+Y00tGWRt1da0RCHtwjxBFfyklAqi/3tOHfLFp2BGle74
jtJf9h1XQNnq19laot5cCzhNlJCLYxXF/H1/iuEOoUwuheK9ReY7OoUAumdpBIcV
2uGdC0/g46R1cI+2YX+NHqd0oK8SNpASQ3RHtnsb3P0rIfOEvxopt8OP0d1UdRg5
WR8KxwIDAQABo1MwUTAdBgNVHQ4EFgQUqsl/MHJDFrQHvfhfx8qqjf5eXTwwHwYD
VR0jBBgwFoAUqsl/MHJDFrQHvfhfx8qqjf5eXTwwDwYDVR0TAQH/BAUwAwEB/zAN
BgkqhkiG9w0BAQsFAAOCAQEAe2+BSifhKiCmBcgsGW0jRDqqGDo91LPvQ8wvpN5e
KfPFNEy0GKfRfPTGr+TusJWQfFISrGpOybBcYdxbWxoL0/ZMOdgVVURrIB6GoCll
rkSNQzlNoBOH6V3tac5KulpO8NisTzOU0tegbjFAoRdVcRcx3hDDeayVyrpKd1OC
NrkGj67SaBWvf/IPzspyEQVakO6deRD6/AFMvXkIA/rJq3gh7Kd5seszJqlRteGt
easnU9Ivp5oBZZV/b+0rRRnrZrq7c8J3apouDWjp4b5Nh3ewVrCtpBz0mWQhnv6I
TVg+e6gg9HxXjaQ+uw49A1djgP5/p4yzkUGfMbrVoT/Tzg==";

    fn fixture_der() -> Vec<u8> {
        let joined: String = FIXTURE_PEM
            .lines()
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("");
        STANDARD.decode(joined).unwrap()
    }

    #[test]
    fn extracts_certificate_fields() {
        let der = fixture_der();
        let fields = cert_fields(&der).unwrap();

        assert!(fields.subject.contains("CN=client.example.net"));
        assert!(fields.subject.contains("O=Relay Test"));
        // Self-signed, so issuer mirrors the subject.
        assert!(fields.issuer.contains("CN=client.example.net"));
        assert_eq!(fields.serial, "314159");
        assert!(fields.not_before.contains("2026"));
        assert!(fields.not_after.contains("2036"));
    }

    #[test]
    fn pem_round_trips() {
        let der = fixture_der();
        let lines = pem_lines(&der);
        assert_eq!(lines.first().unwrap(), "-----BEGIN CERTIFICATE-----");
        assert_eq!(lines.last().unwrap(), "-----END CERTIFICATE-----");
        assert!(lines.iter().all(|l| l.len() <= 64));

        let body: String = lines[1..lines.len() - 1].join("");
        assert_eq!(STANDARD.decode(body).unwrap(), der);
    }

    #[test]
    fn garbage_der_is_skipped() {
        assert!(cert_fields(b"not a certificate").is_none());
    }
}
