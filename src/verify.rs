use crate::bundle::{parse_bundle_with_options, ParseOptions};
use crate::identity::LeafIdentity;
use crate::policy::Policy;
use crate::verifiers::chain::VerifiedStatement;
use crate::verifiers::VerifierRegistry;
use crate::{AttestationError, Result};
use log::{debug, warn};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

/// How many bundles must verify for the artifact to pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMode {
    RequireAll,
    RequireAny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Verified,
    Rejected(AttestationError),
}

impl Outcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    pub fn rejection(&self) -> Option<&AttestationError> {
        match self {
            Self::Verified => None,
            Self::Rejected(e) => Some(e),
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Verified => {
                let mut s = serializer.serialize_struct("Outcome", 1)?;
                s.serialize_field("status", "verified")?;
                s.end()
            }
            Self::Rejected(e) => {
                let mut s = serializer.serialize_struct("Outcome", 3)?;
                s.serialize_field("status", "rejected")?;
                s.serialize_field("category", &e.category())?;
                s.serialize_field("reason", &e.to_string())?;
                s.end()
            }
        }
    }
}

/// Result for one bundle. Identity and statement are present once chain
/// validation established them, even if policy later rejected the bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub bundle_index: usize,
    pub verified_identity: Option<LeafIdentity>,
    pub statement: Option<VerifiedStatement>,
    pub outcome: Outcome,
}

impl VerificationResult {
    fn rejected(bundle_index: usize, error: AttestationError) -> Self {
        Self {
            bundle_index,
            verified_identity: None,
            statement: None,
            outcome: Outcome::Rejected(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateOutcome {
    AllVerified,
    PartiallyVerified,
    NoneVerified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub artifact_digest: String,
    pub mode: VerificationMode,
    pub outcome: AggregateOutcome,
    /// One entry per input bundle, in input order
    pub results: Vec<VerificationResult>,
}

impl AggregateResult {
    fn new(artifact_digest: &str, mode: VerificationMode, results: Vec<VerificationResult>) -> Self {
        let verified = results.iter().filter(|r| r.outcome.is_verified()).count();
        let outcome = if verified == 0 {
            AggregateOutcome::NoneVerified
        } else if verified == results.len() {
            AggregateOutcome::AllVerified
        } else {
            AggregateOutcome::PartiallyVerified
        };

        Self {
            artifact_digest: artifact_digest.to_string(),
            mode,
            outcome,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        match self.mode {
            VerificationMode::RequireAll => self.outcome == AggregateOutcome::AllVerified,
            VerificationMode::RequireAny => self.outcome != AggregateOutcome::NoneVerified,
        }
    }

    pub fn verified(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter().filter(|r| r.outcome.is_verified())
    }
}

/// Cooperative cancellation flag, checked before each bundle starts
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs parse, issuer resolution, verifier selection, chain validation and
/// policy evaluation for every bundle of an artifact. A bundle's failure is
/// recorded in its own result and never stops the others.
#[derive(Debug, Clone)]
pub struct VerificationOrchestrator {
    registry: Arc<VerifierRegistry>,
    preselected_provider: Option<String>,
    parse_options: ParseOptions,
}

impl VerificationOrchestrator {
    pub fn new(registry: Arc<VerifierRegistry>) -> Self {
        Self {
            registry,
            preselected_provider: None,
            parse_options: ParseOptions::default(),
        }
    }

    /// Provider to use for bundles signed with a key instead of a certificate
    pub fn with_preselected_provider(mut self, provider: impl Into<String>) -> Self {
        self.preselected_provider = Some(provider.into());
        self
    }

    pub fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.parse_options = options;
        self
    }

    pub fn verify_artifact<B: AsRef<[u8]>>(
        &self,
        artifact_digest: &str,
        bundles: &[B],
        policy: &Policy,
        mode: VerificationMode,
    ) -> AggregateResult {
        self.verify_artifact_cancellable(artifact_digest, bundles, policy, mode, &Cancellation::new())
    }

    pub fn verify_artifact_cancellable<B: AsRef<[u8]>>(
        &self,
        artifact_digest: &str,
        bundles: &[B],
        policy: &Policy,
        mode: VerificationMode,
        cancellation: &Cancellation,
    ) -> AggregateResult {
        debug!("Verifying {} bundles for {}", bundles.len(), artifact_digest);

        let results = bundles
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                if cancellation.is_cancelled() {
                    debug!("Bundle {}: not started, verification cancelled", index);
                    return VerificationResult::rejected(index, AttestationError::Cancelled);
                }
                self.verify_bundle(index, raw.as_ref(), artifact_digest, policy)
            })
            .collect();

        AggregateResult::new(artifact_digest, mode, results)
    }

    /// Verify bundles concurrently on blocking worker threads
    pub async fn verify_artifact_parallel(
        &self,
        artifact_digest: &str,
        bundles: Vec<Vec<u8>>,
        policy: &Policy,
        mode: VerificationMode,
    ) -> AggregateResult {
        self.verify_artifact_parallel_cancellable(artifact_digest, bundles, policy, mode, &Cancellation::new())
            .await
    }

    /// Parallel run that skips bundles whose worker starts after cancellation
    pub async fn verify_artifact_parallel_cancellable(
        &self,
        artifact_digest: &str,
        bundles: Vec<Vec<u8>>,
        policy: &Policy,
        mode: VerificationMode,
        cancellation: &Cancellation,
    ) -> AggregateResult {
        debug!("Verifying {} bundles in parallel for {}", bundles.len(), artifact_digest);

        let count = bundles.len();
        let mut tasks = JoinSet::new();

        for (index, raw) in bundles.into_iter().enumerate() {
            let orchestrator = self.clone();
            let policy = policy.clone();
            let digest = artifact_digest.to_string();
            let cancellation = cancellation.clone();
            tasks.spawn_blocking(move || {
                if cancellation.is_cancelled() {
                    debug!("Bundle {}: not started, verification cancelled", index);
                    return VerificationResult::rejected(index, AttestationError::Cancelled);
                }
                orchestrator.verify_bundle(index, &raw, &digest, &policy)
            });
        }

        let mut slots: Vec<Option<VerificationResult>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    let index = result.bundle_index;
                    slots[index] = Some(result);
                }
                Err(e) => warn!("Verification task did not complete: {}", e),
            }
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| VerificationResult::rejected(index, AttestationError::Cancelled))
            })
            .collect();

        AggregateResult::new(artifact_digest, mode, results)
    }

    fn verify_bundle(&self, index: usize, raw: &[u8], artifact_digest: &str, policy: &Policy) -> VerificationResult {
        let mut verified_identity = None;
        let mut statement = None;

        let outcome = match self.run_pipeline(
            index,
            raw,
            artifact_digest,
            policy,
            &mut verified_identity,
            &mut statement,
        ) {
            Ok(()) => {
                debug!("Bundle {}: verified", index);
                Outcome::Verified
            }
            Err(e) => {
                debug!("Bundle {}: rejected: {}", index, e);
                Outcome::Rejected(e)
            }
        };

        VerificationResult {
            bundle_index: index,
            verified_identity,
            statement,
            outcome,
        }
    }

    fn run_pipeline(
        &self,
        index: usize,
        raw: &[u8],
        artifact_digest: &str,
        policy: &Policy,
        verified_identity: &mut Option<LeafIdentity>,
        statement: &mut Option<VerifiedStatement>,
    ) -> Result<()> {
        let bundle = parse_bundle_with_options(raw, &self.parse_options)?;
        debug!("Bundle {}: parsed {:?} bundle", index, bundle.version);

        let issuer = self
            .registry
            .resolver()
            .resolve_with_selection(&bundle, self.preselected_provider.as_deref())?;
        debug!("Bundle {}: issuer resolved to {}", index, issuer);

        let verifier = self.registry.choose_verifier(&issuer)?;
        let validated = verifier.verify(&bundle)?;
        debug!(
            "Bundle {}: chain validated, signed at {:?}",
            index, validated.signing_time
        );

        let identity = verified_identity.insert(validated.identity);
        let statement = statement.insert(validated.statement);

        policy.evaluate(identity)?;
        policy.evaluate_statement(statement.statement.as_ref(), artifact_digest)
    }
}
