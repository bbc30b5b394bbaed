//! TLS client options for the backend connection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::fingerprint_opt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Skip verification of the server certificate.
    pub insecure: bool,
    pub ca_cert_file: Option<PathBuf>,
    /// Client identity presented during the TLS handshake (also the identity
    /// used by the `cert` auth method unless overridden).
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn normalize(&mut self) {
        for file in [
            &mut self.ca_cert_file,
            &mut self.cert_file,
            &mut self.key_file,
        ] {
            if file.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *file = None;
            }
        }
        if self.server_name.as_deref() == Some("") {
            self.server_name = None;
        }
    }

    pub fn fingerprint_into(&self, out: &mut String) {
        out.push(if self.insecure { '1' } else { '0' });
        fingerprint_opt(out, self.ca_cert_file.as_deref().and_then(|p| p.to_str()));
        fingerprint_opt(out, self.cert_file.as_deref().and_then(|p| p.to_str()));
        fingerprint_opt(out, self.key_file.as_deref().and_then(|p| p.to_str()));
        fingerprint_opt(out, self.server_name.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_empty_entries() {
        let mut tls = TlsOptions {
            ca_cert_file: Some(PathBuf::new()),
            server_name: Some(String::new()),
            ..Default::default()
        };
        tls.normalize();
        assert!(tls.ca_cert_file.is_none());
        assert!(tls.server_name.is_none());
    }

    #[test]
    fn fingerprint_distinguishes_insecure() {
        let mut a = String::new();
        let mut b = String::new();
        TlsOptions::default().fingerprint_into(&mut a);
        TlsOptions {
            insecure: true,
            ..Default::default()
        }
        .fingerprint_into(&mut b);
        assert_ne!(a, b);
    }
}
