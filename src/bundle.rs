use crate::api::{self, Attestation, SigstoreBundle, IN_TOTO_PAYLOAD_TYPE};
use crate::{AttestationError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Bundle format version, derived from the declared media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BundleVersion {
    V0_1,
    V0_2,
    V0_3,
}

impl BundleVersion {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            api::MEDIA_TYPE_BUNDLE_V01 => Some(Self::V0_1),
            api::MEDIA_TYPE_BUNDLE_V02 => Some(Self::V0_2),
            api::MEDIA_TYPE_BUNDLE_V03 | api::MEDIA_TYPE_BUNDLE_V03_ALT => Some(Self::V0_3),
            _ => None,
        }
    }
}

/// Structural requirements applied while decoding
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Reject bundles that carry no transparency log entry
    pub require_tlog_entries: bool,
}

/// A decoded, structurally valid attestation bundle. Nothing in here has been
/// cryptographically checked yet.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationBundle {
    pub media_type: String,
    pub version: BundleVersion,
    pub signer: SignerMaterial,
    pub tlog_entries: Vec<LogEntry>,
    pub envelope: Envelope,
    /// In-toto statement decoded from the envelope payload, when the payload
    /// type declares one
    pub statement: Option<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignerMaterial {
    /// DER certificates, leaf first
    CertificateChain(Vec<Vec<u8>>),
    /// Reference to a key the verifier already holds
    PublicKey { hint: String },
}

impl AttestationBundle {
    pub fn leaf_certificate(&self) -> Option<&[u8]> {
        match &self.signer {
            SignerMaterial::CertificateChain(chain) => chain.first().map(Vec::as_slice),
            SignerMaterial::PublicKey { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub log_index: i64,
    pub log_id: Vec<u8>,
    pub kind: Option<String>,
    pub kind_version: Option<String>,
    pub integrated_time: i64,
    pub canonicalized_body: Vec<u8>,
    pub signed_entry_timestamp: Option<Vec<u8>>,
    pub inclusion_proof: Option<InclusionProof>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InclusionProof {
    pub log_index: i64,
    pub tree_size: i64,
    pub root_hash: [u8; 32],
    pub hashes: Vec<[u8; 32]>,
    pub checkpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeSignature {
    pub keyid: Option<String>,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub statement_type: String,
    pub subjects: Vec<Subject>,
    pub predicate_type: String,
    pub predicate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subject {
    pub name: String,
    /// Algorithm name to lowercase hex digest
    pub digest: BTreeMap<String, String>,
}

impl Statement {
    /// Decode an in-toto statement (v0.1 or v1)
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let statement: Value = serde_json::from_slice(payload)
            .map_err(|e| AttestationError::malformed(format!("Failed to parse statement: {}", e)))?;

        let statement_type = statement
            .get("_type")
            .and_then(Value::as_str)
            .ok_or_else(|| AttestationError::malformed("Statement missing _type"))?;
        if !statement_type.starts_with("https://in-toto.io/Statement/v") {
            return Err(AttestationError::malformed(format!(
                "Not an in-toto statement: {}",
                statement_type
            )));
        }

        let predicate_type = statement
            .get("predicateType")
            .and_then(Value::as_str)
            .ok_or_else(|| AttestationError::malformed("Missing predicateType"))?;

        let subjects = statement
            .get("subject")
            .and_then(Value::as_array)
            .ok_or_else(|| AttestationError::malformed("No subjects in statement"))?;
        if subjects.is_empty() {
            return Err(AttestationError::malformed("Statement has an empty subject list"));
        }

        let subjects = subjects
            .iter()
            .map(parse_subject)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            statement_type: statement_type.to_string(),
            subjects,
            predicate_type: predicate_type.to_string(),
            predicate: statement.get("predicate").cloned().unwrap_or(Value::Null),
        })
    }

    /// Whether any subject declares `digest` under `algorithm`
    pub fn has_subject_digest(&self, algorithm: &str, digest: &str) -> bool {
        self.subjects.iter().any(|subject| {
            subject
                .digest
                .get(algorithm)
                .is_some_and(|d| d.eq_ignore_ascii_case(digest))
        })
    }
}

fn parse_subject(subject: &Value) -> Result<Subject> {
    let name = subject
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let digest = subject
        .get("digest")
        .and_then(Value::as_object)
        .ok_or_else(|| AttestationError::malformed("Statement subject missing digest"))?
        .iter()
        .map(|(alg, value)| {
            value
                .as_str()
                .map(|v| (alg.clone(), v.to_ascii_lowercase()))
                .ok_or_else(|| AttestationError::malformed(format!("Digest '{}' is not a string", alg)))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(Subject { name, digest })
}

/// Parse a serialized bundle with default options
pub fn parse_bundle(raw: &[u8]) -> Result<AttestationBundle> {
    parse_bundle_with_options(raw, &ParseOptions::default())
}

/// Parse and structurally validate a serialized bundle.
///
/// Accepts a bare Sigstore bundle or the `{"bundle": ...}` wrapper used by the
/// attestations API. Either the whole bundle decodes or the call fails with
/// `MalformedBundle`.
pub fn parse_bundle_with_options(raw: &[u8], options: &ParseOptions) -> Result<AttestationBundle> {
    let value: Value = serde_json::from_slice(raw)?;
    let bundle = unwrap_bundle(value)?;

    let version = BundleVersion::from_media_type(&bundle.media_type).ok_or_else(|| {
        AttestationError::malformed(format!("Unsupported media type: {}", bundle.media_type))
    })?;
    trace!("Parsing bundle with media type {}", bundle.media_type);

    if bundle.message_signature.is_some() {
        return Err(AttestationError::malformed(
            "Message signature bundles carry no attestation statement",
        ));
    }

    let material = bundle
        .verification_material
        .as_ref()
        .ok_or_else(|| AttestationError::malformed("Bundle missing verification material"))?;

    let signer = decode_signer(material, version)?;

    let tlog_entries = material
        .tlog_entries
        .iter()
        .map(decode_log_entry)
        .collect::<Result<Vec<_>>>()?;

    if options.require_tlog_entries && tlog_entries.is_empty() {
        return Err(AttestationError::malformed("Bundle has no transparency log entries"));
    }

    if version == BundleVersion::V0_1
        && tlog_entries
            .iter()
            .any(|entry| entry.signed_entry_timestamp.is_none())
    {
        return Err(AttestationError::malformed(
            "v0.1 bundle entries must carry an inclusion promise",
        ));
    }

    let dsse = bundle
        .dsse_envelope
        .as_ref()
        .ok_or_else(|| AttestationError::malformed("Bundle has no DSSE envelope"))?;
    let envelope = decode_envelope(dsse)?;

    let statement = if envelope.payload_type == IN_TOTO_PAYLOAD_TYPE {
        Some(Statement::from_payload(&envelope.payload)?)
    } else {
        None
    };

    debug!(
        "Parsed {:?} bundle with {} tlog entries and {} signatures",
        version,
        tlog_entries.len(),
        envelope.signatures.len()
    );

    Ok(AttestationBundle {
        media_type: bundle.media_type,
        version,
        signer,
        tlog_entries,
        envelope,
        statement,
    })
}

/// Split a JSON-lines document into one slice per non-blank line
pub fn split_json_lines(raw: &[u8]) -> Vec<&[u8]> {
    raw.split(|b| *b == b'\n')
        .map(|line| line.trim_ascii())
        .filter(|line| !line.is_empty())
        .collect()
}

fn unwrap_bundle(value: Value) -> Result<SigstoreBundle> {
    if value.get("mediaType").is_none() && value.get("bundle").is_some() {
        let attestation: Attestation = serde_json::from_value(value)?;
        return attestation
            .bundle
            .ok_or_else(|| AttestationError::malformed("Attestation has no inline bundle"));
    }
    Ok(serde_json::from_value(value)?)
}

fn decode_signer(material: &api::VerificationMaterial, version: BundleVersion) -> Result<SignerMaterial> {
    let present = [
        material.certificate.is_some(),
        material.x509_certificate_chain.is_some(),
        material.public_key.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    if present != 1 {
        return Err(AttestationError::malformed(format!(
            "Verification material must hold exactly one of certificate, certificate chain or public key (found {})",
            present
        )));
    }

    if let Some(cert) = &material.certificate {
        return Ok(SignerMaterial::CertificateChain(vec![decode_b64(
            &cert.raw_bytes,
            "certificate",
        )?]));
    }

    if let Some(chain) = &material.x509_certificate_chain {
        if version == BundleVersion::V0_3 {
            return Err(AttestationError::malformed(
                "v0.3 bundles must use a single certificate, not a chain",
            ));
        }
        if chain.certificates.is_empty() {
            return Err(AttestationError::malformed("Certificate chain is empty"));
        }
        let certs = chain
            .certificates
            .iter()
            .map(|c| decode_b64(&c.raw_bytes, "certificate"))
            .collect::<Result<Vec<_>>>()?;
        return Ok(SignerMaterial::CertificateChain(certs));
    }

    match &material.public_key {
        Some(key) if !key.hint.is_empty() => Ok(SignerMaterial::PublicKey {
            hint: key.hint.clone(),
        }),
        _ => Err(AttestationError::malformed("Public key material has no hint")),
    }
}

fn decode_log_entry(entry: &api::TlogEntry) -> Result<LogEntry> {
    if entry.log_index < 0 {
        return Err(AttestationError::malformed("Negative log index"));
    }

    let log_id = decode_b64(&entry.log_id.key_id, "log ID")?;
    if log_id.is_empty() {
        return Err(AttestationError::malformed("Empty log ID"));
    }

    let canonicalized_body = decode_b64(&entry.canonicalized_body, "canonicalized body")?;
    if canonicalized_body.is_empty() {
        return Err(AttestationError::malformed("Log entry has no canonicalized body"));
    }

    let signed_entry_timestamp = entry
        .inclusion_promise
        .as_ref()
        .map(|p| decode_b64(&p.signed_entry_timestamp, "signed entry timestamp"))
        .transpose()?;

    let inclusion_proof = entry
        .inclusion_proof
        .as_ref()
        .map(decode_inclusion_proof)
        .transpose()?;

    Ok(LogEntry {
        log_index: entry.log_index,
        log_id,
        kind: entry.kind_version.as_ref().map(|kv| kv.kind.clone()),
        kind_version: entry.kind_version.as_ref().map(|kv| kv.version.clone()),
        integrated_time: entry.integrated_time,
        canonicalized_body,
        signed_entry_timestamp,
        inclusion_proof,
    })
}

fn decode_inclusion_proof(proof: &api::InclusionProof) -> Result<InclusionProof> {
    if proof.tree_size <= 0 || proof.log_index < 0 {
        return Err(AttestationError::malformed(format!(
            "Inclusion proof has invalid index {} for tree size {}",
            proof.log_index, proof.tree_size
        )));
    }

    let root_hash = decode_hash(&proof.root_hash, "root hash")?;
    let hashes = proof
        .hashes
        .iter()
        .map(|h| decode_hash(h, "proof hash"))
        .collect::<Result<Vec<_>>>()?;

    Ok(InclusionProof {
        log_index: proof.log_index,
        tree_size: proof.tree_size,
        root_hash,
        hashes,
        checkpoint: proof.checkpoint.as_ref().map(|c| c.envelope.clone()),
    })
}

fn decode_envelope(dsse: &api::DsseEnvelope) -> Result<Envelope> {
    if dsse.payload_type.is_empty() {
        return Err(AttestationError::malformed("DSSE envelope has no payload type"));
    }

    let payload = decode_b64(&dsse.payload, "payload")?;
    if payload.is_empty() {
        return Err(AttestationError::malformed("DSSE envelope has an empty payload"));
    }

    if dsse.signatures.is_empty() {
        return Err(AttestationError::malformed("DSSE envelope has no signatures"));
    }

    let signatures = dsse
        .signatures
        .iter()
        .map(|s| {
            let sig = decode_b64(&s.sig, "signature")?;
            if sig.is_empty() {
                return Err(AttestationError::malformed("DSSE signature is empty"));
            }
            Ok(EnvelopeSignature {
                keyid: s.keyid.clone().filter(|k| !k.is_empty()),
                sig,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Envelope {
        payload_type: dsse.payload_type.clone(),
        payload,
        signatures,
    })
}

fn decode_b64(data: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| AttestationError::malformed(format!("Failed to decode {}: {}", what, e)))
}

fn decode_hash(data: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = decode_b64(data, what)?;
    bytes.as_slice().try_into().map_err(|_| {
        AttestationError::malformed(format!("{} must be 32 bytes, got {}", what, bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn statement_payload() -> String {
        BASE64.encode(
            json!({
                "_type": "https://in-toto.io/Statement/v1",
                "subject": [{"name": "app.tgz", "digest": {"sha256": "ABCDEF"}}],
                "predicateType": "https://slsa.dev/provenance/v1",
                "predicate": {"buildDefinition": {}}
            })
            .to_string(),
        )
    }

    fn bundle_json() -> Value {
        json!({
            "mediaType": api::MEDIA_TYPE_BUNDLE_V03_ALT,
            "verificationMaterial": {
                "certificate": {"rawBytes": BASE64.encode(b"not-a-real-cert")},
                "tlogEntries": [{
                    "logIndex": "7",
                    "logId": {"keyId": BASE64.encode([1u8; 32])},
                    "kindVersion": {"kind": "dsse", "version": "0.0.1"},
                    "integratedTime": "1704070800",
                    "inclusionPromise": {"signedEntryTimestamp": BASE64.encode(b"set")},
                    "canonicalizedBody": BASE64.encode(b"{}")
                }]
            },
            "dsseEnvelope": {
                "payload": statement_payload(),
                "payloadType": IN_TOTO_PAYLOAD_TYPE,
                "signatures": [{"sig": BASE64.encode(b"sig"), "keyid": ""}]
            }
        })
    }

    #[test]
    fn test_parse_well_formed_bundle() {
        let bundle = parse_bundle(bundle_json().to_string().as_bytes()).unwrap();
        assert_eq!(bundle.version, BundleVersion::V0_3);
        assert_eq!(bundle.leaf_certificate(), Some(&b"not-a-real-cert"[..]));
        assert_eq!(bundle.tlog_entries.len(), 1);
        assert_eq!(bundle.tlog_entries[0].log_index, 7);
        assert_eq!(bundle.tlog_entries[0].kind.as_deref(), Some("dsse"));
        assert_eq!(bundle.envelope.signatures[0].keyid, None);

        let statement = bundle.statement.unwrap();
        assert_eq!(statement.predicate_type, "https://slsa.dev/provenance/v1");
        assert!(statement.has_subject_digest("sha256", "abcdef"));
    }

    #[test]
    fn test_parse_unwraps_api_attestation() {
        let wrapped = json!({"bundle": bundle_json(), "bundle_url": null});
        assert!(parse_bundle(wrapped.to_string().as_bytes()).is_ok());

        let url_only = json!({"bundle": null, "bundle_url": "https://example.com/b"});
        let err = parse_bundle(url_only.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, AttestationError::MalformedBundle(_)));
    }

    #[test]
    fn test_parse_rejects_unsupported_media_type() {
        let mut bundle = bundle_json();
        bundle["mediaType"] = json!("application/vnd.example+json");
        let err = parse_bundle(bundle.to_string().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Unsupported media type"));
    }

    #[test]
    fn test_parse_rejects_both_certificate_and_key() {
        let mut bundle = bundle_json();
        bundle["verificationMaterial"]["publicKey"] = json!({"hint": "key-1"});
        let err = parse_bundle(bundle.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, AttestationError::MalformedBundle(_)));
    }

    #[test]
    fn test_parse_rejects_chain_in_v03() {
        let mut bundle = bundle_json();
        let material = bundle["verificationMaterial"].as_object_mut().unwrap();
        material.remove("certificate");
        material.insert(
            "x509CertificateChain".into(),
            json!({"certificates": [{"rawBytes": BASE64.encode(b"leaf")}]}),
        );
        assert!(parse_bundle(bundle.to_string().as_bytes()).is_err());

        bundle["mediaType"] = json!(api::MEDIA_TYPE_BUNDLE_V02);
        let parsed = parse_bundle(bundle.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.version, BundleVersion::V0_2);
    }

    #[test]
    fn test_parse_requires_tlog_entries_when_asked() {
        let mut bundle = bundle_json();
        bundle["verificationMaterial"]["tlogEntries"] = json!([]);
        let raw = bundle.to_string();

        assert!(parse_bundle(raw.as_bytes()).is_ok());
        let options = ParseOptions {
            require_tlog_entries: true,
        };
        assert!(parse_bundle_with_options(raw.as_bytes(), &options).is_err());
    }

    #[test]
    fn test_parse_rejects_message_signature_bundle() {
        let mut bundle = bundle_json();
        bundle["messageSignature"] = json!({"messageDigest": {}, "signature": "AA=="});
        assert!(parse_bundle(bundle.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_statement() {
        let mut bundle = bundle_json();
        bundle["dsseEnvelope"]["payload"] = json!(BASE64.encode(b"{\"_type\":\"other\"}"));
        assert!(parse_bundle(bundle.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in [&b""[..], b"{", b"[]", b"null", b"{\"mediaType\":5}", &[0xff, 0xfe]] {
            let err = parse_bundle(raw).unwrap_err();
            assert!(matches!(err, AttestationError::MalformedBundle(_)), "{:?}", raw);
        }
    }

    #[test]
    fn test_split_json_lines() {
        let raw = b"{\"a\":1}\n\n  {\"b\":2}  \r\n";
        let lines = split_json_lines(raw);
        assert_eq!(lines, vec![&b"{\"a\":1}"[..], &b"{\"b\":2}"[..]]);
    }
}
