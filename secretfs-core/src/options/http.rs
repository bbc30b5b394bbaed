//! Backend HTTP client options.

use serde::{Deserialize, Serialize};

use super::tls::TlsOptions;
use crate::error::SecretError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    /// Base URL of the backend server, e.g. `https://vault.example.com:8200`.
    pub address: String,
    pub disable_redirects: bool,
    pub tls: TlsOptions,
}

impl HttpOptions {
    pub fn normalize(&mut self) {
        self.address = self.address.trim_end_matches('/').to_string();
        self.tls.normalize();
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        if self.address.is_empty() {
            return Err(SecretError::config("vault-url", "address must be defined"));
        }
        url::Url::parse(&self.address)
            .map_err(|e| SecretError::config("vault-url", format!("address is invalid: {e}")))?;
        Ok(())
    }

    pub fn fingerprint_into(&self, out: &mut String) {
        out.push_str(&self.address);
        out.push(if self.disable_redirects { '1' } else { '0' });
        self.tls.fingerprint_into(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_rejected() {
        let err = HttpOptions::default().validate().unwrap_err();
        assert!(err.to_string().contains("vault-url"));
    }

    #[test]
    fn invalid_url_rejected() {
        let http = HttpOptions {
            address: "not a url".to_string(),
            ..Default::default()
        };
        assert!(http.validate().is_err());
    }

    #[test]
    fn trailing_slash_normalized() {
        let mut http = HttpOptions {
            address: "https://vault.example.com:8200/".to_string(),
            ..Default::default()
        };
        http.normalize();
        assert_eq!(http.address, "https://vault.example.com:8200");
        http.validate().unwrap();
    }
}
