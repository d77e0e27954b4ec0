//! Wire types for Sigstore bundles and trusted-root documents.
//!
//! These mirror the protobuf JSON mapping, so 64-bit integers may arrive either
//! as JSON numbers or as strings.

use serde::{Deserialize, Deserializer};

pub const MEDIA_TYPE_BUNDLE_V01: &str = "application/vnd.dev.sigstore.bundle+json;version=0.1";
pub const MEDIA_TYPE_BUNDLE_V02: &str = "application/vnd.dev.sigstore.bundle+json;version=0.2";
pub const MEDIA_TYPE_BUNDLE_V03: &str = "application/vnd.dev.sigstore.bundle+json;version=0.3";
pub const MEDIA_TYPE_BUNDLE_V03_ALT: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";

pub const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Attestation as returned by the attestations API: a bundle wrapped in an
/// object. Only the inline bundle is read here; fetching `bundle_url` belongs
/// to the caller.
#[derive(Debug, Deserialize, Clone)]
pub struct Attestation {
    pub bundle: Option<SigstoreBundle>,
    pub bundle_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SigstoreBundle {
    pub media_type: String,
    pub verification_material: Option<VerificationMaterial>,
    pub dsse_envelope: Option<DsseEnvelope>,
    pub message_signature: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMaterial {
    pub certificate: Option<RawBytes>,
    pub x509_certificate_chain: Option<CertificateChain>,
    pub public_key: Option<PublicKeyIdentifier>,
    #[serde(default)]
    pub tlog_entries: Vec<TlogEntry>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawBytes {
    pub raw_bytes: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CertificateChain {
    #[serde(default)]
    pub certificates: Vec<RawBytes>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublicKeyIdentifier {
    #[serde(default)]
    pub hint: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TlogEntry {
    #[serde(deserialize_with = "int64")]
    pub log_index: i64,
    pub log_id: LogId,
    pub kind_version: Option<KindVersion>,
    #[serde(default, deserialize_with = "int64")]
    pub integrated_time: i64,
    pub inclusion_promise: Option<InclusionPromise>,
    pub inclusion_proof: Option<InclusionProof>,
    #[serde(default)]
    pub canonicalized_body: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LogId {
    pub key_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KindVersion {
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InclusionPromise {
    pub signed_entry_timestamp: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    #[serde(deserialize_with = "int64")]
    pub log_index: i64,
    pub root_hash: String,
    #[serde(deserialize_with = "int64")]
    pub tree_size: i64,
    #[serde(default)]
    pub hashes: Vec<String>,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Checkpoint {
    pub envelope: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    pub payload: String,
    pub payload_type: String,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Signature {
    pub sig: String,
    pub keyid: Option<String>,
}

// ===== Trusted root documents =====

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrustedRootDocument {
    pub media_type: Option<String>,
    #[serde(default)]
    pub tlogs: Vec<TransparencyLogInstance>,
    #[serde(default)]
    pub certificate_authorities: Vec<CertificateAuthorityDocument>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransparencyLogInstance {
    pub base_url: Option<String>,
    pub hash_algorithm: Option<String>,
    pub public_key: PublicKeyDocument,
    pub log_id: LogId,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDocument {
    pub raw_bytes: Option<String>,
    pub key_details: Option<String>,
    pub valid_for: Option<TimeRange>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthorityDocument {
    pub uri: Option<String>,
    #[serde(default)]
    pub cert_chain: CertificateChain,
    pub valid_for: Option<TimeRange>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Int64Repr {
    Number(i64),
    Text(String),
}

fn int64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Int64Repr::deserialize(deserializer)? {
        Int64Repr::Number(n) => Ok(n),
        Int64Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
