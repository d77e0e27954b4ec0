//! Identity and statement policy.
//!
//! A [`Policy`] only ever runs against material that already passed chain
//! validation. Fields are checked in a fixed order and the first mismatch is
//! reported; an unset field places no constraint.

use crate::bundle::Statement;
use crate::identity::{extension_name, oids, LeafIdentity};
use crate::{AttestationError, Result};
use globset::Glob;
use log::trace;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

const GITHUB_URL: &str = "https://github.com";
const GITHUB_HOSTED_RUNNER: &str = "github-hosted";

/// How a policy value is compared against a certificate value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Exact(String),
    /// Shell-style glob; `*` may span `/`
    Glob(String),
    /// Regular expression anchored to the whole value
    Regex(String),
}

impl Matcher {
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        Self::Glob(pattern.into())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex(pattern.into())
    }

    fn pattern(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Glob(p) | Self::Regex(p) => p,
        }
    }

    fn is_empty(&self) -> bool {
        self.pattern().is_empty()
    }

    /// Whether `value` satisfies the matcher. A pattern that does not compile
    /// is an error, never a match.
    pub fn matches(&self, value: &str) -> Result<bool> {
        match self {
            Self::Exact(expected) => Ok(expected == value),
            Self::Glob(pattern) => {
                let glob = Glob::new(pattern).map_err(|e| {
                    AttestationError::InvalidPolicy(format!("invalid glob '{}': {}", pattern, e))
                })?;
                Ok(glob.compile_matcher().is_match(value))
            }
            Self::Regex(pattern) => {
                let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    AttestationError::InvalidPolicy(format!("invalid regex '{}': {}", pattern, e))
                })?;
                Ok(re.is_match(value))
            }
        }
    }

    /// Check the pattern compiles without matching anything
    pub fn validate(&self) -> Result<()> {
        self.matches("").map(|_| ())
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{}", v),
            Self::Glob(p) => write!(f, "glob '{}'", p),
            Self::Regex(p) => write!(f, "regex '{}'", p),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// OIDC issuer URL, compared exactly
    pub expected_issuer: Option<String>,
    /// Pattern for the subject alternative name
    pub subject: Option<Matcher>,
    /// Fulcio extension OID to expected value
    pub extensions: BTreeMap<String, Matcher>,
    /// Required in-toto predicate type, compared exactly
    pub predicate_type: Option<String>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    pub fn with_subject(mut self, matcher: Matcher) -> Self {
        self.subject = Some(matcher);
        self
    }

    pub fn with_extension(mut self, oid: impl Into<String>, matcher: Matcher) -> Self {
        self.extensions.insert(oid.into(), matcher);
        self
    }

    pub fn with_predicate_type(mut self, predicate_type: impl Into<String>) -> Self {
        self.predicate_type = Some(predicate_type.into());
        self
    }

    /// Require the source repository to belong to a GitHub owner
    pub fn with_owner(self, owner: &str) -> Self {
        self.with_extension(
            oids::SOURCE_REPOSITORY_OWNER_URI,
            Matcher::exact(format!("{}/{}", GITHUB_URL, owner)),
        )
    }

    /// Require a GitHub source repository, as `owner/repo`
    pub fn with_repository(self, repository: &str) -> Self {
        self.with_extension(
            oids::SOURCE_REPOSITORY_URI,
            Matcher::exact(format!("{}/{}", GITHUB_URL, repository)),
        )
    }

    /// Constrain the workflow that signed, which is what the SAN names
    pub fn with_signer_workflow(self, matcher: Matcher) -> Self {
        self.with_subject(matcher)
    }

    /// Reject attestations built on self-hosted runners
    pub fn hosted_runners_only(self) -> Self {
        self.with_extension(oids::RUNNER_ENVIRONMENT, Matcher::exact(GITHUB_HOSTED_RUNNER))
    }

    /// Compile every pattern up front so a bad policy fails before any bundle
    pub fn validate(&self) -> Result<()> {
        if let Some(subject) = &self.subject {
            subject.validate()?;
        }
        for matcher in self.extensions.values() {
            matcher.validate()?;
        }
        Ok(())
    }

    /// Check a verified identity: issuer, then SAN, then extensions in
    /// ascending OID order.
    pub fn evaluate(&self, identity: &LeafIdentity) -> Result<()> {
        if let Some(issuer) = self.expected_issuer.as_deref().filter(|i| !i.is_empty()) {
            if issuer != identity.issuer {
                return Err(AttestationError::policy_mismatch("issuer", issuer, &identity.issuer));
            }
        }

        if let Some(subject) = self.subject.as_ref().filter(|m| !m.is_empty()) {
            if !subject.matches(&identity.subject_alternative_name)? {
                return Err(AttestationError::policy_mismatch(
                    "subject alternative name",
                    subject.to_string(),
                    &identity.subject_alternative_name,
                ));
            }
        }

        for (oid, matcher) in self.extensions.iter().filter(|(_, m)| !m.is_empty()) {
            let field = match extension_name(oid) {
                Some(name) => format!("{} ({})", name, oid),
                None => oid.clone(),
            };
            let Some(actual) = identity.extension(oid) else {
                return Err(AttestationError::policy_mismatch(field, matcher.to_string(), "<absent>"));
            };
            if !matcher.matches(actual)? {
                return Err(AttestationError::policy_mismatch(field, matcher.to_string(), actual));
            }
            trace!("Extension {} matched", oid);
        }

        Ok(())
    }

    /// Check the verified statement: predicate type, then that a subject
    /// carries the artifact digest (`alg:hex`, or bare hex for SHA-256).
    pub fn evaluate_statement(&self, statement: Option<&Statement>, artifact_digest: &str) -> Result<()> {
        let Some(statement) = statement else {
            return Err(AttestationError::policy_mismatch(
                "statement",
                "in-toto statement",
                "<absent>",
            ));
        };

        if let Some(expected) = self.predicate_type.as_deref().filter(|p| !p.is_empty()) {
            if expected != statement.predicate_type {
                return Err(AttestationError::policy_mismatch(
                    "predicate type",
                    expected,
                    &statement.predicate_type,
                ));
            }
        }

        let (algorithm, digest) = split_digest(artifact_digest)?;
        if !statement.has_subject_digest(algorithm, digest) {
            let actual = statement
                .subjects
                .iter()
                .filter_map(|s| s.digest.get(algorithm).map(|d| format!("{}:{}", algorithm, d)))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(AttestationError::policy_mismatch(
                "subject digest",
                format!("{}:{}", algorithm, digest.to_ascii_lowercase()),
                if actual.is_empty() { "<absent>".to_string() } else { actual },
            ));
        }

        Ok(())
    }
}

/// Split `alg:hex`; bare hex is SHA-256
pub fn split_digest(artifact_digest: &str) -> Result<(&str, &str)> {
    let (algorithm, digest) = artifact_digest
        .split_once(':')
        .unwrap_or(("sha256", artifact_digest));

    if algorithm.is_empty() || digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AttestationError::InvalidPolicy(format!(
            "artifact digest '{}' is not of the form alg:hex",
            artifact_digest
        )));
    }
    Ok((algorithm, digest))
}
