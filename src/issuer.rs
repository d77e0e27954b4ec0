use crate::bundle::{AttestationBundle, SignerMaterial};
use crate::identity::LeafIdentity;
use crate::{AttestationError, Result};
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Provider a bundle belongs to, resolved once from the leaf certificate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IssuerId(String);

impl IssuerId {
    pub fn provider(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssuerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps OIDC issuer URLs to provider names.
///
/// Matching is exact string equality. There is no fallback provider: an
/// issuer nobody configured is rejected, otherwise a signer could pick the
/// trust root their certificate is checked against.
#[derive(Debug, Clone, Default)]
pub struct IssuerResolver {
    issuers: BTreeMap<String, String>,
}

impl IssuerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an issuer URL for a provider. One URL may only belong to one
    /// provider.
    pub fn with_issuer(mut self, issuer: impl Into<String>, provider: impl Into<String>) -> Result<Self> {
        let issuer = issuer.into();
        let provider = provider.into();

        if issuer.is_empty() {
            return Err(AttestationError::Config(format!(
                "provider '{}' lists an empty issuer",
                provider
            )));
        }

        if let Some(existing) = self.issuers.get(&issuer) {
            if *existing != provider {
                return Err(AttestationError::Config(format!(
                    "issuer '{}' is claimed by both '{}' and '{}'",
                    issuer, existing, provider
                )));
            }
        }

        self.issuers.insert(issuer, provider);
        Ok(self)
    }

    pub fn resolve_issuer_url(&self, issuer: &str) -> Result<IssuerId> {
        self.issuers
            .get(issuer)
            .map(|provider| IssuerId(provider.clone()))
            .ok_or_else(|| AttestationError::UnrecognizedIssuer(issuer.to_string()))
    }

    /// Resolve the provider for a bundle from its leaf certificate
    pub fn resolve(&self, bundle: &AttestationBundle) -> Result<IssuerId> {
        self.resolve_with_selection(bundle, None)
    }

    /// Resolve the provider for a bundle.
    ///
    /// Public-key bundles carry no issuer and only resolve to `preselected`.
    /// For certificate bundles the certificate decides; a preselection that
    /// disagrees with it is a rejection.
    pub fn resolve_with_selection(
        &self,
        bundle: &AttestationBundle,
        preselected: Option<&str>,
    ) -> Result<IssuerId> {
        match &bundle.signer {
            SignerMaterial::PublicKey { hint } => {
                let provider = preselected.ok_or_else(|| {
                    AttestationError::UnrecognizedIssuer(format!(
                        "bundle signed with key '{}' has no issuer and no provider was selected",
                        hint
                    ))
                })?;
                Ok(IssuerId(provider.to_string()))
            }
            SignerMaterial::CertificateChain(chain) => {
                let leaf = chain
                    .first()
                    .ok_or_else(|| AttestationError::malformed("Certificate chain is empty"))?;
                let identity = LeafIdentity::from_der(leaf)?;

                if identity.issuer.is_empty() {
                    return Err(AttestationError::UnrecognizedIssuer(
                        "leaf certificate has no OIDC issuer extension".into(),
                    ));
                }

                let issuer_id = self.resolve_issuer_url(&identity.issuer)?;
                debug!("Issuer {} resolved to provider {}", identity.issuer, issuer_id);

                match preselected {
                    Some(selected) if selected != issuer_id.provider() => {
                        Err(AttestationError::UnrecognizedIssuer(format!(
                            "issuer '{}' belongs to provider '{}', not the selected '{}'",
                            identity.issuer, issuer_id, selected
                        )))
                    }
                    _ => Ok(issuer_id),
                }
            }
        }
    }
}
