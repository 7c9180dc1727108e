//! Tenant-scoped credential vault.
//!
//! Stores at most one credential per `(tenant_id, provider)` pair. Sensitive
//! fields are sealed individually with AES-256-GCM, and each ciphertext is
//! bound to its tenant, provider and field name through the associated data.
//! Non-sensitive fields (region, tenant and subscription ids) are stored as
//! plaintext.
//!
//! The master key is loaded once at startup and never changes for the life
//! of the process. A vault built without a key still serves listing and
//! deletion, but every read or write of a record fails with
//! [`CryptoError::KeyUnavailable`].
//!
//! Stored record layout (JSON):
//!
//! ```json
//! {
//!   "version": 1,
//!   "provider": "aws",
//!   "key_id": "9a2db2e23f1504cd",
//!   "fields": {
//!     "access_key": { "sealed": "<base64>" },
//!     "region": { "plain": "us-east-1" }
//!   },
//!   "identity": { "account_id": "123456789012", "principal": "arn:aws:iam::..." },
//!   "updated_at": "2025-09-13T10:00:00Z"
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use cloudlens_storage::{RecordKey, StorageBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::credential::{Credential, FieldValue, Identity, ProviderKind, SecretValue};
use crate::crypto::{self, EncryptionKey};
use crate::error::{CryptoError, VaultError};

const RECORD_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    version: u8,
    provider: ProviderKind,
    key_id: String,
    fields: BTreeMap<String, StoredField>,
    #[serde(default)]
    identity: Option<Identity>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoredField {
    Plain(String),
    Sealed(String),
}

/// Encrypted, tenant-scoped credential store.
pub struct CredentialVault {
    storage: Arc<dyn StorageBackend>,
    key: Option<EncryptionKey>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &self.key.as_ref().map(EncryptionKey::fingerprint))
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Create a vault over `storage`. Pass `None` to run without a key.
    pub fn new(storage: Arc<dyn StorageBackend>, key: Option<EncryptionKey>) -> Self {
        if key.is_none() {
            warn!("credential vault started without an encryption key, records are inaccessible");
        }
        Self { storage, key }
    }

    /// Whether a master key was loaded.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Fingerprint of the loaded key, if any.
    #[must_use]
    pub fn key_id(&self) -> Option<String> {
        self.key.as_ref().map(EncryptionKey::fingerprint)
    }

    fn key(&self) -> Result<&EncryptionKey, CryptoError> {
        self.key.as_ref().ok_or(CryptoError::KeyUnavailable)
    }

    /// Validate `fields` and store them, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Validation`] for malformed input,
    /// [`VaultError::Crypto`] if no key is loaded, or
    /// [`VaultError::Storage`] if the write fails.
    pub async fn put(
        &self,
        tenant_id: &str,
        provider: ProviderKind,
        fields: BTreeMap<String, String>,
    ) -> Result<(), VaultError> {
        let credential = Credential::new(tenant_id, provider, fields)?;
        self.store(&credential).await
    }

    /// Store an already-validated credential, replacing any existing record.
    ///
    /// The write is a single storage `put`, so concurrent readers observe
    /// either the old record or the new one.
    ///
    /// # Errors
    ///
    /// Same as [`Self::put`], minus validation.
    pub async fn store(&self, credential: &Credential) -> Result<(), VaultError> {
        let key = self.key()?;
        let tenant_id = credential.tenant_id();
        let provider = credential.provider();

        let mut fields = BTreeMap::new();
        for (name, value) in credential.fields() {
            let stored = match value {
                FieldValue::Plain(v) => StoredField::Plain(v.clone()),
                FieldValue::Secret(s) => {
                    let aad = field_aad(tenant_id, provider, name);
                    let sealed = crypto::encrypt(key, s.expose().as_bytes(), &aad)?;
                    StoredField::Sealed(BASE64.encode(sealed))
                }
            };
            fields.insert(name.to_owned(), stored);
        }

        let record = StoredRecord {
            version: RECORD_VERSION,
            provider,
            key_id: key.fingerprint(),
            fields,
            identity: credential.identity().cloned(),
            updated_at: credential.updated_at(),
        };
        let record_key = RecordKey::new(tenant_id, provider.as_str());
        let bytes = serde_json::to_vec(&record).map_err(|e| VaultError::Corrupted {
            key: record_key.to_string(),
            reason: format!("serialization failed: {e}"),
        })?;

        self.storage.put(&record_key, &bytes).await?;
        info!(tenant_id, provider = provider.as_str(), "credential stored");
        Ok(())
    }

    /// Fetch and decrypt the credential for `(tenant_id, provider)`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if no record exists,
    /// [`VaultError::Crypto`] if the key is missing, differs from the one the
    /// record was sealed with, or authentication fails, and
    /// [`VaultError::Corrupted`] if the record cannot be parsed.
    pub async fn get(&self, tenant_id: &str, provider: ProviderKind) -> Result<Credential, VaultError> {
        let record_key = RecordKey::new(tenant_id, provider.as_str());
        let bytes = self
            .storage
            .get(&record_key)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                tenant_id: tenant_id.to_owned(),
                provider: provider.as_str().to_owned(),
            })?;

        let key = self.key()?;
        let record: StoredRecord =
            serde_json::from_slice(&bytes).map_err(|e| VaultError::Corrupted {
                key: record_key.to_string(),
                reason: e.to_string(),
            })?;

        if record.provider != provider {
            return Err(VaultError::Corrupted {
                key: record_key.to_string(),
                reason: format!("record carries provider '{}'", record.provider),
            });
        }
        let expected = key.fingerprint();
        if record.key_id != expected {
            return Err(CryptoError::KeyMismatch {
                expected,
                actual: record.key_id,
            }
            .into());
        }

        let mut fields = BTreeMap::new();
        for (name, stored) in record.fields {
            let value = match stored {
                StoredField::Plain(v) => FieldValue::Plain(v),
                StoredField::Sealed(encoded) => {
                    let sealed = BASE64.decode(&encoded).map_err(|e| VaultError::Corrupted {
                        key: record_key.to_string(),
                        reason: format!("field '{name}' is not valid base64: {e}"),
                    })?;
                    let aad = field_aad(tenant_id, provider, &name);
                    let plaintext = crypto::decrypt(key, &sealed, &aad)?;
                    let text = std::str::from_utf8(&plaintext).map_err(|_| {
                        CryptoError::Decryption {
                            reason: format!("field '{name}' is not UTF-8"),
                        }
                    })?;
                    FieldValue::Secret(SecretValue::new(text))
                }
            };
            fields.insert(name, value);
        }

        debug!(tenant_id, provider = provider.as_str(), "credential resolved");
        Ok(Credential::from_parts(
            tenant_id.to_owned(),
            provider,
            fields,
            record.identity,
            record.updated_at,
        ))
    }

    /// Remove the credential for `(tenant_id, provider)`. Removing a missing
    /// record succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if the delete fails.
    pub async fn delete(&self, tenant_id: &str, provider: ProviderKind) -> Result<(), VaultError> {
        let record_key = RecordKey::new(tenant_id, provider.as_str());
        self.storage.delete(&record_key).await?;
        info!(tenant_id, provider = provider.as_str(), "credential deleted");
        Ok(())
    }

    /// Providers the tenant has a stored credential for. Needs no key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if listing fails.
    pub async fn providers(&self, tenant_id: &str) -> Result<Vec<ProviderKind>, VaultError> {
        let keys = self.storage.list(tenant_id).await?;
        let mut kinds: Vec<ProviderKind> = keys
            .iter()
            .filter_map(|k| match k.provider().parse::<ProviderKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    warn!(record = %k, "ignoring record with unknown provider");
                    None
                }
            })
            .collect();
        kinds.sort();
        Ok(kinds)
    }

    /// Whether a credential is stored for the pair. Needs no key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if the lookup fails.
    pub async fn contains(&self, tenant_id: &str, provider: ProviderKind) -> Result<bool, VaultError> {
        let record_key = RecordKey::new(tenant_id, provider.as_str());
        Ok(self.storage.exists(&record_key).await?)
    }

    /// Remove every credential the tenant owns. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if listing or any delete fails.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<usize, VaultError> {
        let keys = self.storage.list(tenant_id).await?;
        for key in &keys {
            self.storage.delete(key).await?;
        }
        info!(tenant_id, removed = keys.len(), "tenant credentials deleted");
        Ok(keys.len())
    }
}

fn field_aad(tenant_id: &str, provider: ProviderKind, field: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(
        tenant_id
            .len()
            .saturating_add(provider.as_str().len())
            .saturating_add(field.len())
            .saturating_add(2),
    );
    aad.extend_from_slice(tenant_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(provider.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(field.as_bytes());
    aad
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cloudlens_storage::MemoryBackend;

    use super::*;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG";

    fn aws_fields() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("access_key".to_owned(), "AKIAEXAMPLE".to_owned()),
            ("secret_key".to_owned(), SECRET.to_owned()),
            ("region".to_owned(), "eu-west-1".to_owned()),
        ])
    }

    fn vault_with(backend: &MemoryBackend, key: Option<EncryptionKey>) -> CredentialVault {
        CredentialVault::new(Arc::new(backend.clone()), key)
    }

    #[tokio::test]
    async fn put_then_get_returns_plaintext() {
        let backend = MemoryBackend::new();
        let vault = vault_with(&backend, Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();

        let cred = vault.get("u1", ProviderKind::Aws).await.unwrap();
        assert_eq!(cred.field("secret_key"), Some(SECRET));
        assert_eq!(cred.field("access_key"), Some("AKIAEXAMPLE"));
        assert_eq!(cred.field("region"), Some("eu-west-1"));
    }

    #[tokio::test]
    async fn secrets_never_reach_storage_in_plaintext() {
        let backend = MemoryBackend::new();
        let vault = vault_with(&backend, Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();

        let raw = backend
            .get(&RecordKey::new("u1", "aws"))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains(SECRET));
        assert!(!text.contains("AKIAEXAMPLE"));
        assert!(text.contains("eu-west-1"));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let vault = vault_with(&MemoryBackend::new(), Some(EncryptionKey::generate()));
        let err = vault.get("u1", ProviderKind::Azure).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[tokio::test]
    async fn second_put_replaces_first() {
        let vault = vault_with(&MemoryBackend::new(), Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();
        let mut updated = aws_fields();
        updated.insert("secret_key".into(), "rotated".into());
        vault.put("u1", ProviderKind::Aws, updated).await.unwrap();

        let cred = vault.get("u1", ProviderKind::Aws).await.unwrap();
        assert_eq!(cred.field("secret_key"), Some("rotated"));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let vault = vault_with(&MemoryBackend::new(), Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();
        assert!(matches!(
            vault.get("u2", ProviderKind::Aws).await,
            Err(VaultError::NotFound { .. })
        ));
        assert!(vault.providers("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copied_record_does_not_decrypt_for_other_tenant() {
        let backend = MemoryBackend::new();
        let vault = vault_with(&backend, Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();

        let raw = backend
            .get(&RecordKey::new("u1", "aws"))
            .await
            .unwrap()
            .unwrap();
        backend.put(&RecordKey::new("u2", "aws"), &raw).await.unwrap();

        let err = vault.get("u2", ProviderKind::Aws).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Crypto(CryptoError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn keyless_vault_refuses_reads_and_writes() {
        let backend = MemoryBackend::new();
        let keyed = vault_with(&backend, Some(EncryptionKey::generate()));
        keyed.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();

        let keyless = vault_with(&backend, None);
        assert!(!keyless.has_key());
        assert!(matches!(
            keyless.get("u1", ProviderKind::Aws).await,
            Err(VaultError::Crypto(CryptoError::KeyUnavailable))
        ));
        assert!(matches!(
            keyless.put("u1", ProviderKind::Aws, aws_fields()).await,
            Err(VaultError::Crypto(CryptoError::KeyUnavailable))
        ));
        assert_eq!(keyless.providers("u1").await.unwrap(), vec![ProviderKind::Aws]);
    }

    #[tokio::test]
    async fn wrong_key_reports_mismatch() {
        let backend = MemoryBackend::new();
        vault_with(&backend, Some(EncryptionKey::from_bytes([1; 32])))
            .put("u1", ProviderKind::Aws, aws_fields())
            .await
            .unwrap();

        let other = vault_with(&backend, Some(EncryptionKey::from_bytes([2; 32])));
        let err = other.get("u1", ProviderKind::Aws).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Crypto(CryptoError::KeyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_record_is_corrupted() {
        let backend = MemoryBackend::new();
        backend
            .put(&RecordKey::new("u1", "aws"), b"not json")
            .await
            .unwrap();
        let vault = vault_with(&backend, Some(EncryptionKey::generate()));
        assert!(matches!(
            vault.get("u1", ProviderKind::Aws).await,
            Err(VaultError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_delete_tenant_clears_all() {
        let vault = vault_with(&MemoryBackend::new(), Some(EncryptionKey::generate()));
        vault.put("u1", ProviderKind::Aws, aws_fields()).await.unwrap();
        vault
            .put(
                "u1",
                ProviderKind::Azure,
                BTreeMap::from([
                    ("tenant_id".to_owned(), "t".to_owned()),
                    ("client_id".to_owned(), "c".to_owned()),
                    ("client_secret".to_owned(), "s".to_owned()),
                    ("subscription_id".to_owned(), "sub".to_owned()),
                ]),
            )
            .await
            .unwrap();

        vault.delete("u1", ProviderKind::Aws).await.unwrap();
        vault.delete("u1", ProviderKind::Aws).await.unwrap();
        assert_eq!(vault.providers("u1").await.unwrap(), vec![ProviderKind::Azure]);

        assert_eq!(vault.delete_tenant("u1").await.unwrap(), 1);
        assert!(!vault.contains("u1", ProviderKind::Azure).await.unwrap());
    }

    #[tokio::test]
    async fn identity_round_trips_with_record() {
        let vault = vault_with(&MemoryBackend::new(), Some(EncryptionKey::generate()));
        let identity = Identity {
            account_id: "123456789012".into(),
            principal: "arn:aws:iam::123456789012:user/ops".into(),
            display_name: None,
        };
        let cred = Credential::new("u1", ProviderKind::Aws, aws_fields())
            .unwrap()
            .with_identity(identity.clone());
        vault.store(&cred).await.unwrap();

        let loaded = vault.get("u1", ProviderKind::Aws).await.unwrap();
        assert_eq!(loaded.identity(), Some(&identity));
    }
}
