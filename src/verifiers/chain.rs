//! Certificate path, transparency log and envelope signature validation for
//! one bundle against one trust root.

use super::tlog::{self, SignedEnvelope, TlogRules, VerifiedLogEntry};
use crate::bundle::{AttestationBundle, Envelope, SignerMaterial, Statement};
use crate::crypto::{dsse_pae, verify_certificate_signature, verify_with_spki, verify_with_spki_der};
use crate::identity::LeafIdentity;
use crate::trust_root::{CertificateAuthority, TrustRoot, ValidityWindow};
use crate::{AttestationError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, trace};
use serde::{Serialize, Serializer};
use x509_parser::prelude::*;

/// Longest intermediate run tried between a leaf and a root
const MAX_CHAIN_DEPTH: usize = 8;

/// Per-provider validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRules {
    pub require_transparency_log: bool,
    /// Log entries that must verify; `None` means all of them
    pub tlog_threshold: Option<usize>,
}

impl Default for ChainRules {
    fn default() -> Self {
        Self {
            require_transparency_log: true,
            tlog_threshold: None,
        }
    }
}

/// Envelope content after its signature has been checked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedStatement {
    pub payload_type: String,
    #[serde(serialize_with = "serialize_base64")]
    pub payload: Vec<u8>,
    pub statement: Option<Statement>,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChain {
    pub identity: LeafIdentity,
    /// Earliest log-proven integration time, absent only for key-signed
    /// bundles allowed to skip the log
    pub signing_time: Option<i64>,
    pub log_entries: Vec<VerifiedLogEntry>,
    pub statement: VerifiedStatement,
}

/// Validate a bundle against a trust root
pub fn validate(
    bundle: &AttestationBundle,
    trust_root: &TrustRoot,
    rules: &ChainRules,
) -> Result<ValidatedChain> {
    match &bundle.signer {
        SignerMaterial::CertificateChain(chain) => validate_certificate(bundle, chain, trust_root, rules),
        SignerMaterial::PublicKey { hint } => validate_public_key(bundle, hint, trust_root, rules),
    }
}

fn validate_certificate(
    bundle: &AttestationBundle,
    chain: &[Vec<u8>],
    trust_root: &TrustRoot,
    rules: &ChainRules,
) -> Result<ValidatedChain> {
    let (leaf_der, bundle_intermediates) = chain
        .split_first()
        .ok_or_else(|| AttestationError::malformed("Certificate chain is empty"))?;

    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| AttestationError::malformed(format!("Failed to parse leaf certificate: {}", e)))?;

    check_leaf_profile(&leaf)?;

    let bundle_intermediates = parse_all(bundle_intermediates)
        .map_err(|e| AttestationError::malformed(format!("Failed to parse chain certificate: {}", e)))?;

    let (authority, path) = build_path(&leaf, &bundle_intermediates, trust_root)?;
    debug!(
        "Certificate path of length {} closes in a {} certificate authority",
        path.len() + 1,
        trust_root.provider_name()
    );

    // An entry may be missing only when there is nothing left to prove a
    // signing time with; certificates always need one.
    if bundle.tlog_entries.is_empty() {
        return Err(AttestationError::LogEntryMissing(
            "certificate-signed bundle has no log-proven signing time".into(),
        ));
    }

    let entries = tlog::verify_log_entries(
        &bundle.tlog_entries,
        trust_root,
        &SignedEnvelope {
            envelope: &bundle.envelope,
            verifier: leaf_der,
        },
        &tlog_rules(rules),
    )?;

    for entry in &entries {
        let time = entry.integrated_time;
        check_certificate_time(&leaf, time)?;
        for cert in &path {
            check_certificate_time(cert, time)?;
        }
        if !authority.validity.contains(time) {
            return Err(AttestationError::ChainNotTrusted(format!(
                "certificate authority was not valid at signing time {}",
                time
            )));
        }
    }

    verify_envelope(&bundle.envelope, |sig, message| {
        verify_with_spki(leaf.public_key(), sig, message)
    })?;

    let identity = LeafIdentity::from_certificate(&leaf)?;
    Ok(ValidatedChain {
        identity,
        signing_time: entries.iter().map(|e| e.integrated_time).min(),
        log_entries: entries,
        statement: verified_statement(bundle),
    })
}

fn validate_public_key(
    bundle: &AttestationBundle,
    hint: &str,
    trust_root: &TrustRoot,
    rules: &ChainRules,
) -> Result<ValidatedChain> {
    let key = trust_root.signing_key(hint).ok_or_else(|| {
        AttestationError::ChainNotTrusted(format!(
            "no signing key '{}' in the {} trust root",
            hint,
            trust_root.provider_name()
        ))
    })?;

    if bundle.tlog_entries.is_empty() && key.validity != ValidityWindow::UNBOUNDED {
        return Err(AttestationError::LogEntryMissing(format!(
            "key '{}' has a validity window but the bundle has no log-proven signing time",
            hint
        )));
    }

    let entries = tlog::verify_log_entries(
        &bundle.tlog_entries,
        trust_root,
        &SignedEnvelope {
            envelope: &bundle.envelope,
            verifier: &key.public_key,
        },
        &tlog_rules(rules),
    )?;

    for entry in &entries {
        check_window(&key.validity, entry.integrated_time)?;
    }

    verify_envelope(&bundle.envelope, |sig, message| {
        verify_with_spki_der(&key.public_key, sig, message)
    })?;

    Ok(ValidatedChain {
        identity: LeafIdentity::from_key_hint(hint),
        signing_time: entries.iter().map(|e| e.integrated_time).min(),
        log_entries: entries,
        statement: verified_statement(bundle),
    })
}

fn tlog_rules(rules: &ChainRules) -> TlogRules {
    TlogRules {
        required: rules.require_transparency_log,
        threshold: rules.tlog_threshold,
    }
}

fn verified_statement(bundle: &AttestationBundle) -> VerifiedStatement {
    VerifiedStatement {
        payload_type: bundle.envelope.payload_type.clone(),
        payload: bundle.envelope.payload.clone(),
        statement: bundle.statement.clone(),
    }
}

/// At least one envelope signature must verify over the DSSE PAE
fn verify_envelope<F>(envelope: &Envelope, verify: F) -> Result<()>
where
    F: Fn(&[u8], &[u8]) -> Result<()>,
{
    let pae = dsse_pae(&envelope.payload_type, &envelope.payload);
    let mut last_error = None;

    for signature in &envelope.signatures {
        match verify(&signature.sig, &pae) {
            Ok(()) => {
                trace!("DSSE signature verified");
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(AttestationError::SignatureInvalid(msg)) => {
            AttestationError::SignatureInvalid(format!("DSSE envelope: {}", msg))
        }
        Some(other) => other,
        None => AttestationError::SignatureInvalid("DSSE envelope has no signatures".into()),
    })
}

fn check_leaf_profile(leaf: &X509Certificate) -> Result<()> {
    if leaf.is_ca() {
        return Err(AttestationError::ChainNotTrusted(
            "leaf certificate is a CA certificate".into(),
        ));
    }

    match leaf.extended_key_usage() {
        Ok(Some(eku)) if !eku.value.code_signing => Err(AttestationError::ChainNotTrusted(
            "leaf certificate is not valid for code signing".into(),
        )),
        Ok(_) => Ok(()),
        Err(e) => Err(AttestationError::ChainNotTrusted(format!(
            "leaf certificate has an invalid extended key usage: {}",
            e
        ))),
    }
}

fn check_certificate_time(cert: &X509Certificate, time: i64) -> Result<()> {
    let validity = cert.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();

    if time < not_before || time > not_after {
        return Err(AttestationError::CertificateExpired {
            signing_time: time,
            not_before,
            not_after,
        });
    }
    Ok(())
}

fn check_window(window: &ValidityWindow, time: i64) -> Result<()> {
    if window.contains(time) {
        return Ok(());
    }
    Err(AttestationError::CertificateExpired {
        signing_time: time,
        not_before: window.start.unwrap_or(i64::MIN),
        not_after: window.end.unwrap_or(i64::MAX),
    })
}

fn parse_all(ders: &[Vec<u8>]) -> std::result::Result<Vec<X509Certificate<'_>>, X509Error> {
    ders.iter()
        .map(|der| X509Certificate::from_der(der).map(|(_, cert)| cert).map_err(|e| match e {
            x509_parser::nom::Err::Error(e) | x509_parser::nom::Err::Failure(e) => e,
            x509_parser::nom::Err::Incomplete(_) => X509Error::InvalidCertificate,
        }))
        .collect()
}

/// Find a certificate authority whose roots anchor the leaf.
///
/// Returns the authority and the chain certificates above the leaf, root last.
fn build_path<'a>(
    leaf: &X509Certificate<'_>,
    bundle_intermediates: &[X509Certificate<'a>],
    trust_root: &'a TrustRoot,
) -> Result<(&'a CertificateAuthority, Vec<X509Certificate<'a>>)> {
    for authority in trust_root.certificate_authorities() {
        let roots = parse_all(&authority.root_certs)
            .map_err(|e| AttestationError::InvalidTrustRoot(format!("root certificate: {}", e)))?;
        let mut pool = bundle_intermediates.to_vec();
        pool.extend(
            parse_all(&authority.intermediate_certs).map_err(|e| {
                AttestationError::InvalidTrustRoot(format!("intermediate certificate: {}", e))
            })?,
        );

        let mut used = Vec::new();
        if let Some(root) = find_path(leaf, &pool, &roots, &mut used) {
            let mut path: Vec<X509Certificate<'a>> =
                used.iter().map(|i| pool[*i].clone()).collect();
            path.push(roots[root].clone());
            return Ok((authority, path));
        }
        trace!("No path through this certificate authority");
    }

    Err(AttestationError::ChainNotTrusted(format!(
        "no certificate authority of {} issued this certificate",
        trust_root.provider_name()
    )))
}

/// Depth-first search from `current` to any root. Pool indices of the
/// intermediates used are left in `used`, leaf-most first.
fn find_path(
    current: &X509Certificate<'_>,
    pool: &[X509Certificate<'_>],
    roots: &[X509Certificate<'_>],
    used: &mut Vec<usize>,
) -> Option<usize> {
    if let Some(root) = roots.iter().position(|root| issued_by(current, root, used.len())) {
        return Some(root);
    }

    if used.len() >= MAX_CHAIN_DEPTH {
        return None;
    }

    for (i, candidate) in pool.iter().enumerate() {
        if used.contains(&i) || !issued_by(current, candidate, used.len()) {
            continue;
        }
        used.push(i);
        if let Some(root) = find_path(candidate, pool, roots, used) {
            return Some(root);
        }
        used.pop();
    }

    None
}

/// `intermediates_below` counts the non-leaf certificates already between
/// the leaf and `issuer`
fn issued_by(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>, intermediates_below: usize) -> bool {
    cert.issuer().as_raw() == issuer.subject().as_raw()
        && may_issue(issuer, intermediates_below)
        && verify_certificate_signature(cert, issuer.public_key()).is_ok()
}

/// basicConstraints CA with room left in its path length, and keyCertSign
/// when key usage is present
fn may_issue(issuer: &X509Certificate<'_>, intermediates_below: usize) -> bool {
    let path_len = match issuer.basic_constraints() {
        Ok(Some(bc)) if bc.value.ca => bc.value.path_len_constraint,
        _ => return false,
    };
    if path_len.is_some_and(|limit| intermediates_below > limit as usize) {
        trace!("Path length constraint {:?} exceeded", path_len);
        return false;
    }

    match issuer.key_usage() {
        Ok(Some(ku)) => ku.value.key_cert_sign(),
        Ok(None) => true,
        Err(_) => false,
    }
}
