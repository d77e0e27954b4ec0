use thiserror::Error;

pub mod api;
pub mod bundle;
pub mod crypto;
pub mod identity;
pub mod issuer;
pub mod policy;
pub mod trust_root;
pub mod verifiers;
pub mod verify;

// Re-export commonly used types
pub use bundle::{parse_bundle, AttestationBundle, LogEntry, Statement};
pub use identity::LeafIdentity;
pub use issuer::{IssuerId, IssuerResolver};
pub use policy::{Matcher, Policy};
pub use trust_root::{TrustRoot, TrustRootProvider, ValidityWindow};
pub use verifiers::{ProviderConfig, ProviderKind, Verifier, VerifierConfig, VerifierRegistry};
pub use verify::{
    AggregateOutcome, AggregateResult, Cancellation, Outcome, VerificationMode,
    VerificationOrchestrator, VerificationResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("Leaf certificate issuer is not recognized: {0}")]
    UnrecognizedIssuer(String),

    #[error("Provider '{0}' is disabled")]
    ProviderDisabled(String),

    #[error("Provider '{provider}' is not available: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Certificate chain is not trusted: {0}")]
    ChainNotTrusted(String),

    #[error(
        "Certificate was not valid at signing time {signing_time} (valid {not_before}..={not_after})"
    )]
    CertificateExpired {
        signing_time: i64,
        not_before: i64,
        not_after: i64,
    },

    #[error("Transparency log proof invalid: {0}")]
    LogProofInvalid(String),

    #[error("Transparency log entry missing: {0}")]
    LogEntryMissing(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Policy mismatch on {field}: expected {expected}, found {actual}")]
    PolicyMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid trust root: {0}")]
    InvalidTrustRoot(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Verification cancelled")]
    Cancelled,

    #[error("No attestations found")]
    NoAttestations,
}

/// Coarse grouping of [`AttestationError`] used by callers deciding what to do
/// with a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorCategory {
    Malformed,
    Selection,
    Cryptographic,
    Policy,
    Operational,
}

impl AttestationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedBundle(_) | Self::NoAttestations => ErrorCategory::Malformed,
            Self::UnrecognizedIssuer(_) | Self::ProviderDisabled(_) => ErrorCategory::Selection,
            Self::ChainNotTrusted(_)
            | Self::CertificateExpired { .. }
            | Self::LogProofInvalid(_)
            | Self::LogEntryMissing(_)
            | Self::SignatureInvalid(_) => ErrorCategory::Cryptographic,
            Self::PolicyMismatch { .. } | Self::InvalidPolicy(_) => ErrorCategory::Policy,
            Self::ProviderUnavailable { .. }
            | Self::InvalidTrustRoot(_)
            | Self::Config(_)
            | Self::Cancelled => ErrorCategory::Operational,
        }
    }

    /// Only a trust root that failed to load is worth retrying; every other
    /// failure is a verdict on the bundle itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBundle(msg.into())
    }

    pub(crate) fn policy_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::PolicyMismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<serde_json::Error> for AttestationError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedBundle(format!("JSON error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, AttestationError>;

// ===== Convenience entry point =====

/// Verify every bundle for an artifact against a registry in one call.
///
/// # Arguments
/// * `registry` - Verifiers built from the provider configuration and trust roots
/// * `artifact_digest` - Digest of the artifact, `sha256:<hex>` or bare SHA-256 hex
/// * `bundles` - Raw serialized bundles, one per attestation
/// * `policy` - Identity and statement constraints
/// * `mode` - Whether all or any of the bundles must verify
pub fn verify_artifact<B: AsRef<[u8]>>(
    registry: std::sync::Arc<VerifierRegistry>,
    artifact_digest: &str,
    bundles: &[B],
    policy: &Policy,
    mode: VerificationMode,
) -> Result<AggregateResult> {
    if bundles.is_empty() {
        return Err(AttestationError::NoAttestations);
    }

    let orchestrator = VerificationOrchestrator::new(registry);
    Ok(orchestrator.verify_artifact(artifact_digest, bundles, policy, mode))
}
