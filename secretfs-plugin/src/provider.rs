//! Swarm secret provider: one-shot secret fetches for the orchestrator.

use secretfs_core::options::VolumeOptions;
use secretfs_core::{Secret as _, SecretError};
use secretfs_vault::VaultSecret;
use tracing::debug;

use crate::types::GetSecretRequest;

pub struct SecretProvider {
    defaults: VolumeOptions,
}

impl SecretProvider {
    pub fn new(defaults: VolumeOptions) -> Self {
        Self { defaults }
    }

    /// Resolve options from the request labels, fetch one body through a
    /// transient handle, and return the value under the requested name. The
    /// handle is closed before returning; the response is marked
    /// non-reusable so the orchestrator asks again next time.
    pub async fn get_secret(&self, request: &GetSecretRequest) -> Result<Vec<u8>, SecretError> {
        debug!(secret = %request.secret_name, service = %request.service_name, "secret requested");

        let options = VolumeOptions::from_secret_labels(
            &request.secret_name,
            &request.secret_labels,
            &self.defaults,
        )?;

        let secret = VaultSecret::new(&options).await?;
        let result = match secret.fetch(false).await {
            Ok(body) => body
                .value(&request.secret_name)
                .map(|v| v.as_bytes().to_vec())
                .ok_or(SecretError::NotFound),
            Err(e) => Err(e),
        };
        secret.close().await;
        result
    }
}
