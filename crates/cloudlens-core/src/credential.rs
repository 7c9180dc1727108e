//! Provider kinds and the decrypted credential model.
//!
//! A [`Credential`] is the plaintext view of one tenant's connection to one
//! provider. It exists only transiently: built from request input before
//! validation, or returned by [`crate::vault::CredentialVault::get`] for the
//! duration of a single provider call. Sensitive field values are held in
//! [`SecretValue`], which wipes itself on drop and never prints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;

/// Longest accepted value for any single credential field.
pub const MAX_FIELD_LEN: usize = 4096;

/// Substrings that mark a field name as sensitive.
const SENSITIVE_MARKERS: &[&str] = &["secret", "key", "password", "token"];

/// A supported cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
}

impl ProviderKind {
    /// Every provider, in display order.
    pub const ALL: [Self; 2] = [Self::Aws, Self::Azure];

    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
        }
    }

    /// Name for human-facing messages.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
        }
    }

    /// Fields that must be present and non-empty.
    #[must_use]
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Aws => &["access_key", "secret_key"],
            Self::Azure => &["tenant_id", "client_id", "client_secret", "subscription_id"],
        }
    }

    /// Optional fields and the value used when they are omitted, if any.
    #[must_use]
    pub fn optional_fields(self) -> &'static [(&'static str, Option<&'static str>)] {
        match self {
            Self::Aws => &[("region", Some("us-east-1"))],
            Self::Azure => &[("resource_group", None)],
        }
    }

    fn accepts(self, field: &str) -> bool {
        self.required_fields().contains(&field)
            || self.optional_fields().iter().any(|(name, _)| *name == field)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            other => Err(VaultError::Validation {
                reason: format!("unknown provider '{other}'"),
            }),
        }
    }
}

/// Whether a field's value must be encrypted at rest.
#[must_use]
pub fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A decrypted secret. Wiped on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Never log the result.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([REDACTED])")
    }
}

/// One credential field after classification.
#[derive(Clone, PartialEq, Eq)]
pub enum FieldValue {
    Plain(String),
    Secret(SecretValue),
}

impl FieldValue {
    /// Borrow the underlying value regardless of sensitivity.
    #[must_use]
    pub fn expose(&self) -> &str {
        match self {
            Self::Plain(v) => v,
            Self::Secret(s) => s.expose(),
        }
    }

    #[must_use]
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(v) => f.debug_tuple("Plain").field(v).finish(),
            Self::Secret(s) => f.debug_tuple("Secret").field(s).finish(),
        }
    }
}

/// The account a credential was verified against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Provider account or subscription id.
    pub account_id: String,
    /// ARN, client id, or equivalent principal name.
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Plaintext credential for one `(tenant, provider)` pair.
#[derive(Clone)]
pub struct Credential {
    tenant_id: String,
    provider: ProviderKind,
    fields: BTreeMap<String, FieldValue>,
    identity: Option<Identity>,
    updated_at: DateTime<Utc>,
}

impl Credential {
    /// Validate raw input fields and classify them.
    ///
    /// Values are trimmed, missing optional fields take their defaults, and
    /// fields the provider does not know are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Validation`] if the tenant id is empty, a
    /// required field is missing or blank, a field is unknown, or a value
    /// exceeds [`MAX_FIELD_LEN`].
    pub fn new(
        tenant_id: impl Into<String>,
        provider: ProviderKind,
        input: BTreeMap<String, String>,
    ) -> Result<Self, VaultError> {
        let tenant_id = tenant_id.into();
        if tenant_id.trim().is_empty() {
            return Err(VaultError::Validation {
                reason: "tenant id must not be empty".to_owned(),
            });
        }

        let mut fields = BTreeMap::new();
        for (name, mut raw) in input {
            if !provider.accepts(&name) {
                raw.zeroize();
                return Err(VaultError::Validation {
                    reason: format!("unexpected field '{name}' for {provider}"),
                });
            }
            let mut value = raw.trim().to_owned();
            raw.zeroize();
            if value.len() > MAX_FIELD_LEN {
                value.zeroize();
                return Err(VaultError::Validation {
                    reason: format!("field '{name}' exceeds {MAX_FIELD_LEN} bytes"),
                });
            }
            if value.is_empty() {
                continue;
            }
            let field = classify(&name, value);
            fields.insert(name, field);
        }

        let missing: Vec<&str> = provider
            .required_fields()
            .iter()
            .copied()
            .filter(|name| !fields.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(VaultError::Validation {
                reason: format!("missing required fields: {}", missing.join(", ")),
            });
        }

        for (name, default) in provider.optional_fields() {
            if let Some(default) = default {
                fields
                    .entry((*name).to_owned())
                    .or_insert_with(|| classify(name, (*default).to_owned()));
            }
        }

        Ok(Self {
            tenant_id,
            provider,
            fields,
            identity: None,
            updated_at: Utc::now(),
        })
    }

    /// Reassemble a credential from already-validated parts.
    pub(crate) fn from_parts(
        tenant_id: String,
        provider: ProviderKind,
        fields: BTreeMap<String, FieldValue>,
        identity: Option<Identity>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            provider,
            fields,
            identity,
            updated_at,
        }
    }

    /// Attach the identity echoed by the provider during validation.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Look up a field value. Never log the result of a secret field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(FieldValue::expose)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("tenant_id", &self.tenant_id)
            .field("provider", &self.provider)
            .field("fields", &self.fields)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

fn classify(name: &str, value: String) -> FieldValue {
    if is_sensitive(name) {
        FieldValue::Secret(SecretValue::new(value))
    } else {
        FieldValue::Plain(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn aws_input() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("access_key".to_owned(), " AKIAEXAMPLE ".to_owned()),
            ("secret_key".to_owned(), "wJalrXUtnFEMI".to_owned()),
        ])
    }

    #[test]
    fn sensitivity_follows_field_name() {
        assert!(is_sensitive("secret_key"));
        assert!(is_sensitive("access_key"));
        assert!(is_sensitive("client_secret"));
        assert!(is_sensitive("API_TOKEN"));
        assert!(!is_sensitive("region"));
        assert!(!is_sensitive("tenant_id"));
        assert!(!is_sensitive("subscription_id"));
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("AWS".parse::<ProviderKind>().unwrap(), ProviderKind::Aws);
        assert_eq!(" azure".parse::<ProviderKind>().unwrap(), ProviderKind::Azure);
        assert!("gcp".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn aws_defaults_region_and_trims_values() {
        let cred = Credential::new("u1", ProviderKind::Aws, aws_input()).unwrap();
        assert_eq!(cred.field("access_key"), Some("AKIAEXAMPLE"));
        assert_eq!(cred.field("region"), Some("us-east-1"));
        let secrets: Vec<&str> = cred
            .fields()
            .filter(|(_, v)| v.is_secret())
            .map(|(k, _)| k)
            .collect();
        assert_eq!(secrets, vec!["access_key", "secret_key"]);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut input = aws_input();
        input.remove("secret_key");
        let err = Credential::new("u1", ProviderKind::Aws, input).unwrap_err();
        assert!(err.to_string().contains("secret_key"));
    }

    #[test]
    fn blank_required_field_counts_as_missing() {
        let mut input = aws_input();
        input.insert("secret_key".into(), "   ".into());
        assert!(Credential::new("u1", ProviderKind::Aws, input).is_err());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut input = aws_input();
        input.insert("session_token".into(), "x".into());
        let err = Credential::new("u1", ProviderKind::Aws, input).unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
    }

    #[test]
    fn azure_requires_all_four_fields() {
        let input = BTreeMap::from([
            ("tenant_id".to_owned(), "t".to_owned()),
            ("client_id".to_owned(), "c".to_owned()),
            ("client_secret".to_owned(), "s".to_owned()),
        ]);
        let err = Credential::new("u1", ProviderKind::Azure, input).unwrap_err();
        assert!(err.to_string().contains("subscription_id"));
    }

    #[test]
    fn azure_resource_group_is_optional_without_default() {
        let mut input = BTreeMap::from([
            ("tenant_id".to_owned(), "t".to_owned()),
            ("client_id".to_owned(), "c".to_owned()),
            ("client_secret".to_owned(), "s".to_owned()),
            ("subscription_id".to_owned(), "sub".to_owned()),
        ]);
        let cred = Credential::new("u1", ProviderKind::Azure, input.clone()).unwrap();
        assert_eq!(cred.field("resource_group"), None);

        input.insert("resource_group".into(), "rg-prod".into());
        let cred = Credential::new("u1", ProviderKind::Azure, input).unwrap();
        assert_eq!(cred.field("resource_group"), Some("rg-prod"));
    }

    #[test]
    fn debug_never_prints_secrets() {
        let cred = Credential::new("u1", ProviderKind::Aws, aws_input()).unwrap();
        let debug = format!("{cred:?}");
        assert!(!debug.contains("wJalrXUtnFEMI"));
        assert!(!debug.contains("AKIAEXAMPLE"));
        assert!(debug.contains("us-east-1"));
    }
}
