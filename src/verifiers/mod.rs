pub mod chain;
pub mod tlog;

use crate::bundle::AttestationBundle;
use crate::issuer::{IssuerId, IssuerResolver};
use crate::trust_root::{TrustRoot, TrustRootProvider};
use crate::{AttestationError, Result};
use chain::{ChainRules, ValidatedChain};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Kind of signing authority a provider represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// The public Sigstore instance (Fulcio + Rekor)
    PublicGood,
    /// GitHub's own Sigstore instance
    #[serde(rename = "github")]
    GitHub,
    /// A self-hosted or enterprise instance
    Private,
}

impl ProviderKind {
    pub fn default_rules(self) -> ChainRules {
        match self {
            Self::PublicGood | Self::GitHub | Self::Private => ChainRules::default(),
        }
    }
}

/// Configuration for one provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// OIDC issuer URLs whose certificates this provider verifies
    #[serde(default)]
    pub issuers: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the kind's default
    #[serde(default)]
    pub require_transparency_log: Option<bool>,
    #[serde(default)]
    pub tlog_threshold: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            issuers: Vec::new(),
            enabled: true,
            require_transparency_log: None,
            tlog_threshold: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuers.push(issuer.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_tlog_threshold(mut self, threshold: usize) -> Self {
        self.tlog_threshold = Some(threshold);
        self
    }

    pub fn rules(&self) -> ChainRules {
        let mut rules = self.kind.default_rules();
        if let Some(required) = self.require_transparency_log {
            rules.require_transparency_log = required;
        }
        if self.tlog_threshold.is_some() {
            rules.tlog_threshold = self.tlog_threshold;
        }
        rules
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl VerifierConfig {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self { providers }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AttestationError::Config(format!("Failed to parse verifier config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(AttestationError::Config("provider with an empty name".into()));
            }
            if seen.contains(&provider.name.as_str()) {
                return Err(AttestationError::Config(format!(
                    "provider '{}' is configured twice",
                    provider.name
                )));
            }
            if provider.tlog_threshold == Some(0) {
                return Err(AttestationError::Config(format!(
                    "provider '{}' has a transparency log threshold of 0",
                    provider.name
                )));
            }
            seen.push(provider.name.as_str());
        }
        Ok(())
    }

    /// Issuer table built from every provider, disabled ones included, so an
    /// issuer of a disabled provider is reported as disabled rather than
    /// unrecognized.
    pub fn resolver(&self) -> Result<IssuerResolver> {
        self.providers.iter().try_fold(IssuerResolver::new(), |resolver, provider| {
            provider
                .issuers
                .iter()
                .try_fold(resolver, |r, issuer| r.with_issuer(issuer.as_str(), provider.name.as_str()))
        })
    }
}

/// A trust root bound to the rules of the provider it belongs to
#[derive(Debug, Clone)]
pub struct Verifier {
    provider: String,
    kind: ProviderKind,
    trust_root: Arc<TrustRoot>,
    rules: ChainRules,
}

impl Verifier {
    pub fn new(provider: impl Into<String>, kind: ProviderKind, trust_root: Arc<TrustRoot>, rules: ChainRules) -> Self {
        Self {
            provider: provider.into(),
            kind,
            trust_root,
            rules,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn trust_root(&self) -> &TrustRoot {
        &self.trust_root
    }

    pub fn rules(&self) -> &ChainRules {
        &self.rules
    }

    /// Validate certificate path, log entries and envelope signature
    pub fn verify(&self, bundle: &AttestationBundle) -> Result<ValidatedChain> {
        debug!("Verifying bundle with {} ({:?}) verifier", self.provider, self.kind);
        chain::validate(bundle, &self.trust_root, &self.rules)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Ready(Arc<Verifier>),
    Disabled,
    Unavailable(String),
}

/// Provider name to verifier, built once at startup and shared read-only
#[derive(Debug, Clone)]
pub struct VerifierRegistry {
    resolver: IssuerResolver,
    slots: HashMap<String, Slot>,
}

impl VerifierRegistry {
    /// Build from trust roots that were loaded ahead of time.
    ///
    /// `roots` holds the outcome of loading each provider's trust root; a
    /// failed or missing load leaves that provider unavailable.
    pub fn from_roots(
        config: &VerifierConfig,
        mut roots: BTreeMap<String, std::result::Result<TrustRoot, String>>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = config.resolver()?;
        let mut slots = HashMap::new();

        for provider in &config.providers {
            let slot = if !provider.enabled {
                Slot::Disabled
            } else {
                match roots.remove(&provider.name) {
                    Some(Ok(root)) => Slot::Ready(Arc::new(Verifier::new(
                        provider.name.as_str(),
                        provider.kind,
                        Arc::new(root),
                        provider.rules(),
                    ))),
                    Some(Err(reason)) => Slot::Unavailable(reason),
                    None => Slot::Unavailable("no trust root was loaded".into()),
                }
            };
            slots.insert(provider.name.clone(), slot);
        }

        Ok(Self { resolver, slots })
    }

    /// Load a trust root for every enabled provider, once
    pub async fn load(config: &VerifierConfig, provider: &dyn TrustRootProvider) -> Result<Self> {
        let mut roots = BTreeMap::new();

        for p in config.providers.iter().filter(|p| p.enabled) {
            debug!("Loading trust root for {} via {}", p.name, provider.provider_type());
            let root = match provider.trust_root(&p.name).await {
                Ok(root) => Ok(root),
                Err(e) => {
                    warn!("Failed to load trust root for {}: {}", p.name, e);
                    Err(e.to_string())
                }
            };
            roots.insert(p.name.clone(), root);
        }

        Self::from_roots(config, roots)
    }

    pub fn resolver(&self) -> &IssuerResolver {
        &self.resolver
    }

    /// Pick the verifier for a resolved issuer
    pub fn choose_verifier(&self, issuer: &IssuerId) -> Result<Arc<Verifier>> {
        match self.slots.get(issuer.provider()) {
            Some(Slot::Ready(verifier)) => Ok(Arc::clone(verifier)),
            Some(Slot::Disabled) => Err(AttestationError::ProviderDisabled(issuer.to_string())),
            Some(Slot::Unavailable(reason)) => Err(AttestationError::ProviderUnavailable {
                provider: issuer.to_string(),
                reason: reason.clone(),
            }),
            None => Err(AttestationError::UnrecognizedIssuer(format!(
                "provider '{}' is not configured",
                issuer
            ))),
        }
    }
}
