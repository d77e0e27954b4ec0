//! Trust material for a single signing authority.
//!
//! A [`TrustRoot`] is built once per provider (normally from a trusted-root
//! document fetched by a [`TrustRootProvider`]) and then shared read-only by
//! every verification. There is no way to mutate one after construction.

use crate::api::{TimeRange, TrustedRootDocument};
use crate::{AttestationError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::DateTime;
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use x509_parser::prelude::*;

/// Inclusive window of Unix seconds. A missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ValidityWindow {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ValidityWindow {
    pub const UNBOUNDED: Self = Self {
        start: None,
        end: None,
    };

    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: i64) -> bool {
        self.start.map_or(true, |s| time >= s) && self.end.map_or(true, |e| time <= e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    /// DER-encoded self-signed anchors
    pub root_certs: Vec<Vec<u8>>,
    /// DER-encoded intermediates the authority vouches for
    pub intermediate_certs: Vec<Vec<u8>>,
    pub validity: ValidityWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransparencyLogKey {
    pub log_id: Vec<u8>,
    /// DER-encoded SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
    pub validity: ValidityWindow,
}

impl TransparencyLogKey {
    /// Build a log key whose ID is the SHA-256 of the DER public key, which is
    /// how Rekor derives log IDs.
    pub fn from_public_key(public_key: Vec<u8>, validity: ValidityWindow) -> Self {
        let log_id = Sha256::digest(&public_key).to_vec();
        Self {
            log_id,
            public_key,
            validity,
        }
    }

    /// First four bytes of the log ID, used as the key hint in checkpoints
    pub fn key_hint(&self) -> Option<[u8; 4]> {
        self.log_id.get(..4).and_then(|h| h.try_into().ok())
    }
}

/// A key used to sign bundles that carry no certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedSigningKey {
    pub hint: String,
    /// DER-encoded SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
    pub validity: ValidityWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRoot {
    provider_name: String,
    certificate_authorities: Vec<CertificateAuthority>,
    transparency_log_keys: Vec<TransparencyLogKey>,
    signing_keys: Vec<TrustedSigningKey>,
}

impl TrustRoot {
    /// Create a trust root, checking that every certificate and key decodes
    pub fn new(
        provider_name: impl Into<String>,
        certificate_authorities: Vec<CertificateAuthority>,
        transparency_log_keys: Vec<TransparencyLogKey>,
    ) -> Result<Self> {
        let provider_name = provider_name.into();

        for ca in &certificate_authorities {
            if ca.root_certs.is_empty() {
                return Err(AttestationError::InvalidTrustRoot(format!(
                    "{}: certificate authority has no root certificate",
                    provider_name
                )));
            }
            for der in ca.root_certs.iter().chain(&ca.intermediate_certs) {
                X509Certificate::from_der(der).map_err(|e| {
                    AttestationError::InvalidTrustRoot(format!(
                        "{}: failed to parse certificate: {}",
                        provider_name, e
                    ))
                })?;
            }
        }

        for key in &transparency_log_keys {
            if key.log_id.is_empty() {
                return Err(AttestationError::InvalidTrustRoot(format!(
                    "{}: transparency log key has an empty log ID",
                    provider_name
                )));
            }
            check_spki(&provider_name, &key.public_key)?;
        }

        Ok(Self {
            provider_name,
            certificate_authorities,
            transparency_log_keys,
            signing_keys: Vec::new(),
        })
    }

    /// Add keys for public-key bundles
    pub fn with_signing_keys(mut self, keys: Vec<TrustedSigningKey>) -> Result<Self> {
        for key in &keys {
            check_spki(&self.provider_name, &key.public_key)?;
        }
        self.signing_keys = keys;
        Ok(self)
    }

    /// Import a Sigstore `trusted_root.json` document.
    ///
    /// Certificate chains in the document are ordered leaf-most first, so the
    /// last certificate of each chain is taken as the root.
    pub fn from_trusted_root_json(provider_name: impl Into<String>, json: &str) -> Result<Self> {
        let provider_name = provider_name.into();
        let document: TrustedRootDocument = serde_json::from_str(json).map_err(|e| {
            AttestationError::InvalidTrustRoot(format!(
                "{}: failed to parse trusted root: {}",
                provider_name, e
            ))
        })?;

        let mut authorities = Vec::new();
        for ca in &document.certificate_authorities {
            let mut certs = ca
                .cert_chain
                .certificates
                .iter()
                .map(|c| decode_b64(&provider_name, &c.raw_bytes))
                .collect::<Result<Vec<_>>>()?;
            let Some(root) = certs.pop() else {
                continue;
            };
            authorities.push(CertificateAuthority {
                root_certs: vec![root],
                intermediate_certs: certs,
                validity: parse_time_range(&provider_name, ca.valid_for.as_ref())?,
            });
        }

        let mut log_keys = Vec::new();
        for tlog in &document.tlogs {
            let Some(raw) = &tlog.public_key.raw_bytes else {
                continue;
            };
            log_keys.push(TransparencyLogKey {
                log_id: decode_b64(&provider_name, &tlog.log_id.key_id)?,
                public_key: decode_b64(&provider_name, raw)?,
                validity: parse_time_range(&provider_name, tlog.public_key.valid_for.as_ref())?,
            });
        }

        debug!(
            "Loaded trust root for {}: {} certificate authorities, {} log keys",
            provider_name,
            authorities.len(),
            log_keys.len()
        );

        Self::new(provider_name, authorities, log_keys)
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn certificate_authorities(&self) -> &[CertificateAuthority] {
        &self.certificate_authorities
    }

    pub fn transparency_log_keys(&self) -> &[TransparencyLogKey] {
        &self.transparency_log_keys
    }

    pub fn signing_keys(&self) -> &[TrustedSigningKey] {
        &self.signing_keys
    }

    pub fn log_key(&self, log_id: &[u8]) -> Option<&TransparencyLogKey> {
        self.transparency_log_keys
            .iter()
            .find(|key| key.log_id == log_id)
    }

    pub fn signing_key(&self, hint: &str) -> Option<&TrustedSigningKey> {
        self.signing_keys.iter().find(|key| key.hint == hint)
    }
}

fn check_spki(provider_name: &str, der: &[u8]) -> Result<()> {
    SubjectPublicKeyInfo::from_der(der).map_err(|e| {
        AttestationError::InvalidTrustRoot(format!(
            "{}: failed to parse public key: {}",
            provider_name, e
        ))
    })?;
    Ok(())
}

fn decode_b64(provider_name: &str, data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data).map_err(|e| {
        AttestationError::InvalidTrustRoot(format!("{}: invalid base64: {}", provider_name, e))
    })
}

fn parse_time_range(provider_name: &str, range: Option<&TimeRange>) -> Result<ValidityWindow> {
    let Some(range) = range else {
        return Ok(ValidityWindow::UNBOUNDED);
    };

    let parse = |value: &Option<String>| -> Result<Option<i64>> {
        value
            .as_deref()
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.timestamp())
                    .map_err(|e| {
                        AttestationError::InvalidTrustRoot(format!(
                            "{}: invalid timestamp '{}': {}",
                            provider_name, s, e
                        ))
                    })
            })
            .transpose()
    };

    Ok(ValidityWindow::new(parse(&range.start)?, parse(&range.end)?))
}

/// Source of parsed trust material, one root per provider.
///
/// Implementations typically fetch and validate a trusted-root document from a
/// distribution service; that happens once at startup, outside verification.
#[async_trait]
pub trait TrustRootProvider: Send + Sync {
    async fn trust_root(&self, provider: &str) -> Result<TrustRoot>;

    /// Get the provider type name for logging
    fn provider_type(&self) -> &'static str;
}

/// Trust roots that are already in memory
#[derive(Debug, Default, Clone)]
pub struct StaticTrustRoots {
    roots: HashMap<String, TrustRoot>,
}

impl StaticTrustRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: TrustRoot) -> Self {
        self.roots.insert(root.provider_name().to_string(), root);
        self
    }
}

#[async_trait]
impl TrustRootProvider for StaticTrustRoots {
    async fn trust_root(&self, provider: &str) -> Result<TrustRoot> {
        self.roots.get(provider).cloned().ok_or_else(|| {
            AttestationError::InvalidTrustRoot(format!("no trust root for provider '{}'", provider))
        })
    }

    fn provider_type(&self) -> &'static str {
        "Static"
    }
}
