//! Transparency log entry verification.
//!
//! An entry is accepted only when every piece of evidence it carries checks
//! out against the log key named by its log ID:
//! - the signed entry timestamp (SET), which is what authenticates the
//!   integrated time used as the signing instant
//! - the RFC 6962 inclusion proof and the checkpoint that signs its root
//! - the entry body, which must commit to the envelope payload and record
//!   the bundle's own signature and signer

use crate::bundle::{Envelope, InclusionProof, LogEntry};
use crate::crypto::verify_with_spki_der;
use crate::trust_root::{TransparencyLogKey, TrustRoot};
use crate::{AttestationError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;

/// RFC 6962 domain separator for leaf nodes
const LEAF_PREFIX: u8 = 0x00;

/// RFC 6962 domain separator for interior nodes
const NODE_PREFIX: u8 = 0x01;

const SIGNATURE_LINE_PREFIX: &str = "\u{2014} ";

/// How many log entries a bundle must prove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlogRules {
    /// Fail with `LogEntryMissing` when the bundle has no entries
    pub required: bool,
    /// Entries that must verify; `None` means all of them
    pub threshold: Option<usize>,
}

impl Default for TlogRules {
    fn default() -> Self {
        Self {
            required: true,
            threshold: None,
        }
    }
}

/// What a log entry must have recorded about the bundle
#[derive(Debug, Clone, Copy)]
pub struct SignedEnvelope<'a> {
    pub envelope: &'a Envelope,
    /// DER of the signing certificate, or of the trusted public key for
    /// key-signed bundles
    pub verifier: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLogEntry {
    pub log_id: Vec<u8>,
    pub log_index: i64,
    /// Log-proven time the entry was integrated, in Unix seconds
    pub integrated_time: i64,
}

/// Verify a bundle's log entries against the trust root.
///
/// Returns the entries that verified; at least `threshold` (default all) must.
pub fn verify_log_entries(
    entries: &[LogEntry],
    trust_root: &TrustRoot,
    signed: &SignedEnvelope<'_>,
    rules: &TlogRules,
) -> Result<Vec<VerifiedLogEntry>> {
    if entries.is_empty() {
        if rules.required {
            return Err(AttestationError::LogEntryMissing(format!(
                "provider '{}' requires a transparency log entry",
                trust_root.provider_name()
            )));
        }
        return Ok(Vec::new());
    }

    let needed = rules.threshold.unwrap_or(entries.len()).max(1);
    if needed > entries.len() {
        return Err(AttestationError::LogEntryMissing(format!(
            "{} verified log entries required, bundle has {}",
            needed,
            entries.len()
        )));
    }

    let mut verified = Vec::new();
    let mut first_error = None;

    for entry in entries {
        match verify_log_entry(entry, trust_root, signed) {
            Ok(v) => verified.push(v),
            Err(e) => {
                debug!("Log entry {} failed verification: {}", entry.log_index, e);
                first_error.get_or_insert(e);
            }
        }
    }

    if verified.len() < needed {
        return Err(first_error.unwrap_or_else(|| {
            AttestationError::LogProofInvalid(format!(
                "{} of {} required log entries verified",
                verified.len(),
                needed
            ))
        }));
    }

    Ok(verified)
}

/// Verify one log entry
pub fn verify_log_entry(
    entry: &LogEntry,
    trust_root: &TrustRoot,
    signed: &SignedEnvelope<'_>,
) -> Result<VerifiedLogEntry> {
    let key = trust_root.log_key(&entry.log_id).ok_or_else(|| {
        AttestationError::LogProofInvalid(format!("Unknown log ID: {}", hex::encode(&entry.log_id)))
    })?;

    if entry.integrated_time <= 0 {
        return Err(AttestationError::LogProofInvalid(format!(
            "Entry {} has no integrated time",
            entry.log_index
        )));
    }

    if !key.validity.contains(entry.integrated_time) {
        return Err(AttestationError::LogProofInvalid(format!(
            "Log key {} was not valid at integrated time {}",
            hex::encode(&entry.log_id),
            entry.integrated_time
        )));
    }

    verify_set(entry, key)?;

    if let Some(proof) = &entry.inclusion_proof {
        verify_entry_inclusion(entry, proof, key)?;
    }

    verify_body_binding(entry, signed)?;

    debug!(
        "Transparency log entry verified at index {} with timestamp {}",
        entry.log_index, entry.integrated_time
    );

    Ok(VerifiedLogEntry {
        log_id: entry.log_id.clone(),
        log_index: entry.log_index,
        integrated_time: entry.integrated_time,
    })
}

#[derive(Serialize)]
struct SetPayload {
    body: String,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: String,
    #[serde(rename = "logIndex")]
    log_index: i64,
}

/// Canonical JSON the log signs for a SET. Field order is the sorted key
/// order, so plain serialization is already canonical.
pub fn set_signing_payload(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = SetPayload {
        body: BASE64.encode(&entry.canonicalized_body),
        integrated_time: entry.integrated_time,
        log_id: hex::encode(&entry.log_id),
        log_index: entry.log_index,
    };
    serde_json::to_vec(&payload)
        .map_err(|e| AttestationError::LogProofInvalid(format!("Failed to encode SET payload: {}", e)))
}

fn verify_set(entry: &LogEntry, key: &TransparencyLogKey) -> Result<()> {
    let set = entry.signed_entry_timestamp.as_ref().ok_or_else(|| {
        AttestationError::LogProofInvalid(format!(
            "Entry {} has no signed entry timestamp",
            entry.log_index
        ))
    })?;

    let message = set_signing_payload(entry)?;
    verify_with_spki_der(&key.public_key, set, &message)
        .map_err(|e| AttestationError::LogProofInvalid(format!("SET verification failed: {}", e)))?;

    trace!("SET verified for entry {}", entry.log_index);
    Ok(())
}

fn verify_entry_inclusion(
    entry: &LogEntry,
    proof: &InclusionProof,
    key: &TransparencyLogKey,
) -> Result<()> {
    if proof.log_index != entry.log_index {
        return Err(AttestationError::LogProofInvalid(format!(
            "Inclusion proof index {} does not match entry index {}",
            proof.log_index, entry.log_index
        )));
    }

    let leaf = compute_leaf_hash(&entry.canonicalized_body);
    verify_inclusion_proof(
        proof.log_index as u64,
        proof.tree_size as u64,
        &leaf,
        &proof.hashes,
        &proof.root_hash,
    )?;

    let checkpoint = proof.checkpoint.as_deref().ok_or_else(|| {
        AttestationError::LogProofInvalid("Inclusion proof has no checkpoint".into())
    })?;
    verify_checkpoint(checkpoint, proof, key)
}

/// Compute RFC 6962 leaf hash
pub fn compute_leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute RFC 6962 interior node hash
pub fn compute_node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Verify a Merkle audit path (RFC 9162 section 2.1.3.2)
pub fn verify_inclusion_proof(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &[u8; 32],
    proof_hashes: &[[u8; 32]],
    expected_root: &[u8; 32],
) -> Result<()> {
    if leaf_index >= tree_size {
        return Err(AttestationError::LogProofInvalid(format!(
            "Leaf index {} is out of range for tree size {}",
            leaf_index, tree_size
        )));
    }

    let mut index = leaf_index;
    let mut last = tree_size - 1;
    let mut current = *leaf_hash;

    for sibling in proof_hashes {
        if last == 0 {
            return Err(AttestationError::LogProofInvalid(
                "Inclusion proof is longer than the tree height".into(),
            ));
        }

        if index & 1 == 1 || index == last {
            current = compute_node_hash(sibling, &current);
            if index & 1 == 0 {
                while index & 1 == 0 && index != 0 {
                    index >>= 1;
                    last >>= 1;
                }
            }
        } else {
            current = compute_node_hash(&current, sibling);
        }

        index >>= 1;
        last >>= 1;
    }

    if last != 0 {
        return Err(AttestationError::LogProofInvalid(
            "Inclusion proof is shorter than the tree height".into(),
        ));
    }

    if current != *expected_root {
        return Err(AttestationError::LogProofInvalid(
            "Merkle inclusion proof verification failed: root hash mismatch".into(),
        ));
    }

    trace!("Merkle inclusion proof verified");
    Ok(())
}

/// Verify a checkpoint (signed note) against the proof it accompanies
fn verify_checkpoint(checkpoint: &str, proof: &InclusionProof, key: &TransparencyLogKey) -> Result<()> {
    let split = checkpoint.find("\n\n").ok_or_else(|| {
        AttestationError::LogProofInvalid("Checkpoint has no signature block".into())
    })?;
    let body = &checkpoint[..split + 1];
    let signatures = &checkpoint[split + 2..];

    let mut lines = body.lines();
    let _origin = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| AttestationError::LogProofInvalid("Checkpoint missing origin".into()))?;
    let size: i64 = lines
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| AttestationError::LogProofInvalid("Checkpoint missing tree size".into()))?;
    let root = lines
        .next()
        .and_then(|l| BASE64.decode(l).ok())
        .ok_or_else(|| AttestationError::LogProofInvalid("Checkpoint missing root hash".into()))?;

    if size != proof.tree_size {
        return Err(AttestationError::LogProofInvalid(format!(
            "Checkpoint tree size {} does not match proof tree size {}",
            size, proof.tree_size
        )));
    }
    if root != proof.root_hash {
        return Err(AttestationError::LogProofInvalid(format!(
            "Checkpoint root hash mismatch: expected {}, got {}",
            hex::encode(proof.root_hash),
            hex::encode(&root)
        )));
    }

    let hint = key
        .key_hint()
        .ok_or_else(|| AttestationError::LogProofInvalid("Log ID too short for a key hint".into()))?;

    for line in signatures.lines() {
        let Some(rest) = line.strip_prefix(SIGNATURE_LINE_PREFIX) else {
            continue;
        };
        let Some((_name, encoded)) = rest.rsplit_once(' ') else {
            continue;
        };
        let Ok(raw) = BASE64.decode(encoded) else {
            continue;
        };
        if raw.len() <= 4 || raw[..4] != hint {
            continue;
        }

        return verify_with_spki_der(&key.public_key, &raw[4..], body.as_bytes()).map_err(|e| {
            AttestationError::LogProofInvalid(format!("Checkpoint signature verification failed: {}", e))
        });
    }

    Err(AttestationError::LogProofInvalid(
        "No checkpoint signature from the log key".into(),
    ))
}

/// The entry body must commit to the SHA-256 of the envelope payload and
/// record one of the envelope's signatures together with the bundle's signer.
/// Otherwise a valid entry for some other signature could be replayed.
fn verify_body_binding(entry: &LogEntry, signed: &SignedEnvelope<'_>) -> Result<()> {
    let body: Value = serde_json::from_slice(&entry.canonicalized_body)
        .map_err(|e| AttestationError::LogProofInvalid(format!("Log entry body is not JSON: {}", e)))?;

    let kind = entry
        .kind
        .as_deref()
        .or_else(|| body.get("kind").and_then(Value::as_str))
        .unwrap_or_default();

    let spec = body.get("spec");
    let (hash_pointer, signatures, sig_field, verifier_field) = match kind {
        "dsse" => (
            "/payloadHash/value",
            spec.and_then(|s| s.get("signatures")),
            "signature",
            "verifier",
        ),
        "intoto" => (
            "/content/payloadHash/value",
            spec.and_then(|s| s.pointer("/content/envelope/signatures")),
            "sig",
            "publicKey",
        ),
        other => {
            return Err(AttestationError::LogProofInvalid(format!(
                "Unsupported log entry kind: {}",
                other
            )))
        }
    };

    let recorded = spec
        .and_then(|s| s.pointer(hash_pointer))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AttestationError::LogProofInvalid("Log entry body records no payload hash".into())
        })?;

    let actual = hex::encode(Sha256::digest(&signed.envelope.payload));
    if !recorded.eq_ignore_ascii_case(&actual) {
        return Err(AttestationError::LogProofInvalid(format!(
            "Log entry records payload hash {}, envelope payload hashes to {}",
            recorded, actual
        )));
    }

    let signatures = signatures.and_then(Value::as_array).ok_or_else(|| {
        AttestationError::LogProofInvalid("Log entry body records no signatures".into())
    })?;

    for pair in signatures {
        let (Some(sig), Some(verifier)) = (
            pair.get(sig_field).and_then(Value::as_str),
            pair.get(verifier_field).and_then(Value::as_str),
        ) else {
            continue;
        };
        let Ok(sig) = BASE64.decode(sig) else {
            continue;
        };
        if decode_verifier(verifier)? != signed.verifier {
            continue;
        }
        if signed
            .envelope
            .signatures
            .iter()
            .any(|s| same_signature(&sig, &s.sig))
        {
            trace!("Entry {} records the bundle signature", entry.log_index);
            return Ok(());
        }
    }

    Err(AttestationError::LogProofInvalid(format!(
        "Log entry {} does not record the bundle's signature and signer",
        entry.log_index
    )))
}

/// Base64 of a PEM block or of raw DER, decoded to DER
fn decode_verifier(encoded: &str) -> Result<Vec<u8>> {
    let raw = BASE64.decode(encoded).map_err(|e| {
        AttestationError::LogProofInvalid(format!("Log entry verifier is not base64: {}", e))
    })?;
    if !raw.starts_with(b"-----BEGIN") {
        return Ok(raw);
    }
    let (_, pem) = parse_x509_pem(&raw).map_err(|e| {
        AttestationError::LogProofInvalid(format!("Log entry verifier is not PEM: {:?}", e))
    })?;
    Ok(pem.contents)
}

// intoto entries keep the envelope's base64 signature text, encoded once more
fn same_signature(recorded: &[u8], sig: &[u8]) -> bool {
    recorded == sig || BASE64.decode(recorded).is_ok_and(|inner| inner == sig)
}
