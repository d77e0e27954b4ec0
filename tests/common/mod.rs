//! Test fixtures: a throwaway certificate authority and transparency log that
//! produce fully signed bundles.

#![allow(dead_code)]

use attestation_verification::trust_root::{
    CertificateAuthority, TransparencyLogKey, TrustedSigningKey, ValidityWindow,
};
use attestation_verification::verifiers::tlog::{compute_leaf_hash, compute_node_hash};
use attestation_verification::TrustRoot;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, CustomExtension,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const ISSUER_A: &str = "https://issuer-a.example";
pub const ISSUER_B: &str = "https://issuer-b.example";
pub const WORKFLOW_SAN: &str =
    "https://github.com/acme/widget/.github/workflows/release.yml@refs/heads/main";

/// 2024-01-01T00:00:00Z and 2024-01-02T00:00:00Z, the leaf validity window
pub const LEAF_NOT_BEFORE: i64 = 1_704_067_200;
pub const LEAF_NOT_AFTER: i64 = 1_704_153_600;
pub const SIGNED_AT: i64 = LEAF_NOT_BEFORE + 3600;

pub const MEDIA_TYPE_V03: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";
pub const IN_TOTO: &str = "application/vnd.in-toto+json";

const OID_FULCIO_ISSUER: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 8];
const OID_SOURCE_REPOSITORY_URI: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 12];
const OID_SOURCE_REPOSITORY_OWNER_URI: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 16];
const OID_RUNNER_ENVIRONMENT: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 11];

pub const ARTIFACT: &[u8] = b"widget-1.0.0.tgz contents";

pub fn artifact_digest() -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(ARTIFACT)))
}

fn signing_key(key_pair: &KeyPair) -> SigningKey {
    SigningKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap()
}

fn spki_der(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_public_key_der().unwrap().as_bytes().to_vec()
}

fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// DER UTF8String, as Fulcio encodes its v2 extensions
fn der_utf8(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = vec![0x0c];
    if bytes.len() < 0x80 {
        out.push(bytes.len() as u8);
    } else {
        out.push(0x81);
        out.push(bytes.len() as u8);
    }
    out.extend_from_slice(bytes);
    out
}

fn ca_params(common_name: &str, path_len: Option<u8>) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Fixture Signing Authority");
    params.distinguished_name = dn;
    params.not_before = date_time_ymd(2020, 1, 1);
    params.not_after = date_time_ymd(2040, 1, 1);
    params.is_ca = match path_len {
        Some(n) => IsCa::Ca(BasicConstraints::Constrained(n)),
        None => IsCa::Ca(BasicConstraints::Unconstrained),
    };
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

/// Identity written into a leaf certificate
#[derive(Debug, Clone)]
pub struct LeafSpec {
    pub issuer: Option<String>,
    pub san: String,
    pub repository: Option<String>,
    pub runner_environment: Option<String>,
    pub not_before: (i32, u8, u8),
    pub not_after: (i32, u8, u8),
    pub code_signing: bool,
}

impl LeafSpec {
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: Some(issuer.to_string()),
            san: WORKFLOW_SAN.to_string(),
            repository: Some("acme/widget".to_string()),
            runner_environment: Some("github-hosted".to_string()),
            not_before: (2024, 1, 1),
            not_after: (2024, 1, 2),
            code_signing: true,
        }
    }

    pub fn without_issuer(mut self) -> Self {
        self.issuer = None;
        self
    }
}

pub struct Leaf {
    pub der: Vec<u8>,
    pub key: SigningKey,
}

/// A root CA, an intermediate and a transparency log key
pub struct Authority {
    pub name: String,
    root: Certificate,
    root_key: KeyPair,
    intermediate: Certificate,
    intermediate_key: KeyPair,
    log_key: SigningKey,
    log_public_key: Vec<u8>,
}

impl Authority {
    pub fn new(name: &str) -> Self {
        let root_key = KeyPair::generate().unwrap();
        let root = ca_params(&format!("{} Root", name), None)
            .self_signed(&root_key)
            .unwrap();

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate = ca_params(&format!("{} Intermediate", name), Some(0))
            .signed_by(&intermediate_key, &root, &root_key)
            .unwrap();

        let log_key = signing_key(&KeyPair::generate().unwrap());

        Self {
            name: name.to_string(),
            root,
            root_key,
            intermediate,
            intermediate_key,
            log_public_key: spki_der(&log_key),
            log_key,
        }
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.root.der().to_vec()
    }

    pub fn intermediate_der(&self) -> Vec<u8> {
        self.intermediate.der().to_vec()
    }

    pub fn log_key(&self) -> TransparencyLogKey {
        TransparencyLogKey::from_public_key(self.log_public_key.clone(), ValidityWindow::UNBOUNDED)
    }

    pub fn trust_root(&self) -> TrustRoot {
        self.trust_root_with_ca_window(ValidityWindow::UNBOUNDED)
    }

    pub fn trust_root_with_ca_window(&self, validity: ValidityWindow) -> TrustRoot {
        let ca = CertificateAuthority {
            root_certs: vec![self.root_der()],
            intermediate_certs: vec![self.intermediate_der()],
            validity,
        };
        TrustRoot::new(self.name.as_str(), vec![ca], vec![self.log_key()]).unwrap()
    }

    /// Trust root whose authority also lists `extra` as intermediates
    pub fn trust_root_with_intermediates(&self, extra: &[&SubCa]) -> TrustRoot {
        let mut intermediate_certs = vec![self.intermediate_der()];
        intermediate_certs.extend(extra.iter().map(|ca| ca.der()));
        let ca = CertificateAuthority {
            root_certs: vec![self.root_der()],
            intermediate_certs,
            validity: ValidityWindow::UNBOUNDED,
        };
        TrustRoot::new(self.name.as_str(), vec![ca], vec![self.log_key()]).unwrap()
    }

    /// A further CA, signed by the root or by the path-length-0 intermediate
    pub fn sub_ca(&self, under_root: bool, key_cert_sign: bool) -> SubCa {
        let key = KeyPair::generate().unwrap();
        let mut params = ca_params(&format!("{} Sub", self.name), None);
        if !key_cert_sign {
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        }
        let cert = if under_root {
            params.signed_by(&key, &self.root, &self.root_key)
        } else {
            params.signed_by(&key, &self.intermediate, &self.intermediate_key)
        }
        .unwrap();
        SubCa { cert, key }
    }

    /// Trust root that also trusts `key` for key-signed bundles
    pub fn trust_root_with_signing_key(&self, hint: &str, key: &Leaf, validity: ValidityWindow) -> TrustRoot {
        let public_key = spki_der(&key.key);
        self.trust_root()
            .with_signing_keys(vec![TrustedSigningKey {
                hint: hint.to_string(),
                public_key,
                validity,
            }])
            .unwrap()
    }

    pub fn issue_leaf(&self, spec: &LeafSpec) -> Leaf {
        issue_leaf(spec, &self.intermediate, &self.intermediate_key)
    }

    pub fn issue_leaf_under(&self, ca: &SubCa, spec: &LeafSpec) -> Leaf {
        issue_leaf(spec, &ca.cert, &ca.key)
    }

    /// A key pair to sign with directly, no certificate
    pub fn bare_key(&self) -> Leaf {
        Leaf {
            der: Vec::new(),
            key: signing_key(&KeyPair::generate().unwrap()),
        }
    }

    pub fn bundle<'a>(&'a self, leaf: &'a Leaf) -> BundleBuilder<'a> {
        BundleBuilder::new(self, leaf)
    }
}

/// A certificate authority below the root, not part of the default trust root
pub struct SubCa {
    cert: Certificate,
    key: KeyPair,
}

impl SubCa {
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }
}

fn issue_leaf(spec: &LeafSpec, issuer: &Certificate, issuer_key: &KeyPair) -> Leaf {
    let leaf_key = KeyPair::generate().unwrap();

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.not_before = date_time_ymd(spec.not_before.0, spec.not_before.1, spec.not_before.2);
    params.not_after = date_time_ymd(spec.not_after.0, spec.not_after.1, spec.not_after.2);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = if spec.code_signing {
        vec![ExtendedKeyUsagePurpose::CodeSigning]
    } else {
        vec![ExtendedKeyUsagePurpose::ServerAuth]
    };
    params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(spec.san.as_str()).unwrap())];

    let mut extensions = Vec::new();
    if let Some(oidc_issuer) = &spec.issuer {
        extensions.push(CustomExtension::from_oid_content(OID_FULCIO_ISSUER, der_utf8(oidc_issuer)));
    }
    if let Some(repository) = &spec.repository {
        let owner = repository.split('/').next().unwrap_or_default();
        extensions.push(CustomExtension::from_oid_content(
            OID_SOURCE_REPOSITORY_URI,
            der_utf8(&format!("https://github.com/{}", repository)),
        ));
        extensions.push(CustomExtension::from_oid_content(
            OID_SOURCE_REPOSITORY_OWNER_URI,
            der_utf8(&format!("https://github.com/{}", owner)),
        ));
    }
    if let Some(runner) = &spec.runner_environment {
        extensions.push(CustomExtension::from_oid_content(OID_RUNNER_ENVIRONMENT, der_utf8(runner)));
    }
    params.custom_extensions = extensions;

    let cert = params.signed_by(&leaf_key, issuer, issuer_key).unwrap();

    Leaf {
        der: cert.der().to_vec(),
        key: signing_key(&leaf_key),
    }
}

/// Builds a signed bundle. Defaults produce a bundle that verifies.
pub struct BundleBuilder<'a> {
    authority: &'a Authority,
    leaf: &'a Leaf,
    key_hint: Option<String>,
    integrated_time: i64,
    subject_digest: String,
    predicate_type: String,
    entries: usize,
    with_inclusion_proof: bool,
    with_set: bool,
    corrupt_set: bool,
    corrupt_envelope_signature: bool,
    corrupt_checkpoint: bool,
    unrelated_body: bool,
    log_key_override: Option<SigningKey>,
}

impl<'a> BundleBuilder<'a> {
    fn new(authority: &'a Authority, leaf: &'a Leaf) -> Self {
        Self {
            authority,
            leaf,
            key_hint: None,
            integrated_time: SIGNED_AT,
            subject_digest: hex::encode(Sha256::digest(ARTIFACT)),
            predicate_type: "https://slsa.dev/provenance/v1".to_string(),
            entries: 1,
            with_inclusion_proof: true,
            with_set: true,
            corrupt_set: false,
            corrupt_envelope_signature: false,
            corrupt_checkpoint: false,
            unrelated_body: false,
            log_key_override: None,
        }
    }

    /// Sign with a trust-root key instead of the leaf certificate
    pub fn key_hint(mut self, hint: &str) -> Self {
        self.key_hint = Some(hint.to_string());
        self
    }

    pub fn integrated_time(mut self, time: i64) -> Self {
        self.integrated_time = time;
        self
    }

    pub fn subject_digest(mut self, digest: &str) -> Self {
        self.subject_digest = digest.to_string();
        self
    }

    pub fn predicate_type(mut self, predicate_type: &str) -> Self {
        self.predicate_type = predicate_type.to_string();
        self
    }

    pub fn entries(mut self, entries: usize) -> Self {
        self.entries = entries;
        self
    }

    pub fn without_inclusion_proof(mut self) -> Self {
        self.with_inclusion_proof = false;
        self
    }

    pub fn without_set(mut self) -> Self {
        self.with_set = false;
        self
    }

    pub fn corrupt_set(mut self) -> Self {
        self.corrupt_set = true;
        self
    }

    pub fn corrupt_envelope_signature(mut self) -> Self {
        self.corrupt_envelope_signature = true;
        self
    }

    pub fn corrupt_checkpoint(mut self) -> Self {
        self.corrupt_checkpoint = true;
        self
    }

    /// Log entry body that records some other payload
    pub fn unrelated_body(mut self) -> Self {
        self.unrelated_body = true;
        self
    }

    /// Sign log material with a key the trust root does not know
    pub fn foreign_log_key(mut self) -> Self {
        self.log_key_override = Some(signing_key(&KeyPair::generate().unwrap()));
        self
    }

    pub fn payload(&self) -> Vec<u8> {
        json!({
            "_type": "https://in-toto.io/Statement/v1",
            "subject": [{"name": "widget-1.0.0.tgz", "digest": {"sha256": self.subject_digest}}],
            "predicateType": self.predicate_type,
            "predicate": {"buildDefinition": {"buildType": "https://example.com/build/v1"}}
        })
        .to_string()
        .into_bytes()
    }

    pub fn build_json(&self) -> Value {
        let payload = self.payload();
        let pae = dsse_pae(IN_TOTO, &payload);
        let mut sig = sign(&self.leaf.key, &pae);
        if self.corrupt_envelope_signature {
            sig = sign(&self.leaf.key, b"something else");
        }

        let log_key = self.log_key_override.as_ref().unwrap_or(&self.authority.log_key);
        let log_id = self.authority.log_key().log_id;

        let verifier = match &self.key_hint {
            Some(_) => pem("PUBLIC KEY", &spki_der(&self.leaf.key)),
            None => pem("CERTIFICATE", &self.leaf.der),
        };
        let recorded = json!([{"signature": BASE64.encode(&sig), "verifier": BASE64.encode(verifier)}]);

        let entries: Vec<Value> = (0..self.entries)
            .map(|i| self.log_entry(i, &payload, &recorded, log_key, &log_id))
            .collect();

        let material = match &self.key_hint {
            Some(hint) => json!({"publicKey": {"hint": hint}, "tlogEntries": entries}),
            None => json!({
                "certificate": {"rawBytes": BASE64.encode(&self.leaf.der)},
                "tlogEntries": entries
            }),
        };

        json!({
            "mediaType": MEDIA_TYPE_V03,
            "verificationMaterial": material,
            "dsseEnvelope": {
                "payload": BASE64.encode(&payload),
                "payloadType": IN_TOTO,
                "signatures": [{"sig": BASE64.encode(&sig), "keyid": ""}]
            }
        })
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_json().to_string().into_bytes()
    }

    fn log_entry(
        &self,
        offset: usize,
        payload: &[u8],
        signatures: &Value,
        log_key: &SigningKey,
        log_id: &[u8],
    ) -> Value {
        let hashed = if self.unrelated_body {
            hex::encode(Sha256::digest(b"another payload"))
        } else {
            hex::encode(Sha256::digest(payload))
        };
        let body = json!({
            "apiVersion": "0.0.1",
            "kind": "dsse",
            "spec": {
                "payloadHash": {"algorithm": "sha256", "value": hashed},
                "signatures": signatures
            }
        })
        .to_string()
        .into_bytes();

        // Every entry sits at index 1 of its own two-leaf tree
        let log_index: i64 = 1;
        let sibling = compute_leaf_hash(format!("neighbour-{}", offset).as_bytes());
        let root = compute_node_hash(&sibling, &compute_leaf_hash(&body));

        let set_payload = format!(
            r#"{{"body":"{}","integratedTime":{},"logID":"{}","logIndex":{}}}"#,
            BASE64.encode(&body),
            self.integrated_time,
            hex::encode(log_id),
            log_index
        );
        let mut set = sign(log_key, set_payload.as_bytes());
        if self.corrupt_set {
            set = sign(log_key, b"not the entry");
        }

        let mut entry = json!({
            "logIndex": log_index.to_string(),
            "logId": {"keyId": BASE64.encode(log_id)},
            "kindVersion": {"kind": "dsse", "version": "0.0.1"},
            "integratedTime": self.integrated_time.to_string(),
            "canonicalizedBody": BASE64.encode(&body)
        });

        if self.with_set {
            entry["inclusionPromise"] = json!({"signedEntryTimestamp": BASE64.encode(&set)});
        }

        if self.with_inclusion_proof {
            let checkpoint_root = if self.corrupt_checkpoint { [0u8; 32] } else { root };
            entry["inclusionProof"] = json!({
                "logIndex": log_index.to_string(),
                "rootHash": BASE64.encode(root),
                "treeSize": (log_index + 1).to_string(),
                "hashes": [BASE64.encode(sibling)],
                "checkpoint": {"envelope": checkpoint(log_key, log_id, log_index + 1, &checkpoint_root)}
            });
        }

        entry
    }
}

/// Signed note over `origin / size / root`
fn checkpoint(log_key: &SigningKey, log_id: &[u8], size: i64, root: &[u8; 32]) -> String {
    let origin = "fixture.log.example - 1";
    let body = format!("{}\n{}\n{}\n", origin, size, BASE64.encode(root));
    let mut signed = log_id[..4].to_vec();
    signed.extend(sign(log_key, body.as_bytes()));
    format!("{}\n\u{2014} {} {}\n", body, origin, BASE64.encode(signed))
}

fn pem(label: &str, der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(line).unwrap());
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

fn dsse_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = format!("DSSEv1 {} {} {} ", payload_type.len(), payload_type, payload.len()).into_bytes();
    pae.extend_from_slice(payload);
    pae
}
