//! Concrete provider adapters.
//!
//! [`CloudAdapterFactory`] turns a decrypted [`Credential`] into the adapter
//! for its provider. Adapters own copies of the secret fields they need and
//! are dropped as soon as the call that built them completes.

#[cfg(feature = "aws")]
pub mod aws;
#[cfg(feature = "azure")]
pub mod azure;

use std::sync::Arc;
#[cfg(feature = "azure")]
use std::time::Duration;

use cloudlens_core::credential::{Credential, ProviderKind};
use cloudlens_core::error::ProviderError;
use cloudlens_core::provider::{AdapterFactory, ProviderAdapter};

/// Builds AWS and Azure adapters.
#[derive(Debug, Clone)]
pub struct CloudAdapterFactory {
    #[cfg(feature = "azure")]
    http: reqwest::Client,
}

impl CloudAdapterFactory {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self {
            #[cfg(feature = "azure")]
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .user_agent(concat!("cloudlens/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| ProviderError::permanent("HttpClient", e.to_string()))?,
        })
    }
}

impl AdapterFactory for CloudAdapterFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        match credential.provider() {
            #[cfg(feature = "aws")]
            ProviderKind::Aws => Ok(Arc::new(aws::AwsAdapter::from_credential(credential)?)),
            #[cfg(feature = "azure")]
            ProviderKind::Azure => Ok(Arc::new(azure::AzureAdapter::from_credential(
                self.http.clone(),
                credential,
            )?)),
            #[allow(unreachable_patterns)]
            other => Err(ProviderError::permanent(
                "Unsupported",
                format!("{} support is not compiled in", other.display_name()),
            )),
        }
    }
}

/// A field the vault guarantees for this provider, checked anyway.
#[cfg(any(feature = "aws", feature = "azure"))]
fn required<'a>(credential: &'a Credential, name: &str) -> Result<&'a str, ProviderError> {
    credential.field(name).ok_or_else(|| {
        ProviderError::permanent(
            "InvalidCredential",
            format!("{} credential is missing '{name}'", credential.provider().display_name()),
        )
    })
}
