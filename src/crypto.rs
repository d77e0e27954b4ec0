//! Public-key signature checks shared by the chain, log and envelope
//! verifiers.
//!
//! Supported keys: ECDSA P-256 (SHA-256), ECDSA P-384 (SHA-384) and Ed25519.
//! ECDSA signatures may be DER or fixed-size.

use crate::{AttestationError, Result};
use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey as Ed25519VerifyingKey};
use log::trace;
use p256::ecdsa::{
    signature::Verifier as P256Verifier, Signature as P256Signature,
    VerifyingKey as P256VerifyingKey,
};
use p384::ecdsa::{Signature as P384Signature, VerifyingKey as P384VerifyingKey};
use x509_parser::prelude::*;

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

/// Work out which algorithm a SubjectPublicKeyInfo describes
pub fn key_algorithm(spki: &SubjectPublicKeyInfo) -> Result<KeyAlgorithm> {
    match spki.algorithm.algorithm.to_id_string().as_str() {
        OID_EC_PUBLIC_KEY => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string())
                .ok_or_else(|| {
                    AttestationError::SignatureInvalid("EC key missing curve parameters".into())
                })?;
            match curve.as_str() {
                OID_CURVE_P256 => Ok(KeyAlgorithm::EcdsaP256),
                OID_CURVE_P384 => Ok(KeyAlgorithm::EcdsaP384),
                other => Err(AttestationError::SignatureInvalid(format!(
                    "Unsupported EC curve: {}",
                    other
                ))),
            }
        }
        OID_ED25519 => Ok(KeyAlgorithm::Ed25519),
        other => Err(AttestationError::SignatureInvalid(format!(
            "Unsupported public key algorithm: {}",
            other
        ))),
    }
}

/// Verify `signature` over `message` with a DER-encoded SubjectPublicKeyInfo
pub fn verify_with_spki_der(spki_der: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der).map_err(|e| {
        AttestationError::SignatureInvalid(format!("Failed to parse public key: {}", e))
    })?;
    verify_with_spki(&spki, signature, message)
}

/// Verify `signature` over `message` with a parsed SubjectPublicKeyInfo
pub fn verify_with_spki(
    spki: &SubjectPublicKeyInfo,
    signature: &[u8],
    message: &[u8],
) -> Result<()> {
    let key_bytes: &[u8] = spki.subject_public_key.data.as_ref();

    match key_algorithm(spki)? {
        KeyAlgorithm::EcdsaP256 => {
            let verifying_key = P256VerifyingKey::from_sec1_bytes(key_bytes).map_err(|e| {
                AttestationError::SignatureInvalid(format!("Failed to parse P-256 public key: {}", e))
            })?;
            let signature = P256Signature::from_der(signature)
                .or_else(|_| P256Signature::from_slice(signature))
                .map_err(|e| {
                    AttestationError::SignatureInvalid(format!("Failed to parse P-256 signature: {}", e))
                })?;
            verifying_key.verify(message, &signature).map_err(|e| {
                AttestationError::SignatureInvalid(format!("P-256 signature verification failed: {}", e))
            })?;
            trace!("P-256 ECDSA signature verified");
        }
        KeyAlgorithm::EcdsaP384 => {
            let verifying_key = P384VerifyingKey::from_sec1_bytes(key_bytes).map_err(|e| {
                AttestationError::SignatureInvalid(format!("Failed to parse P-384 public key: {}", e))
            })?;
            let signature = P384Signature::from_der(signature)
                .or_else(|_| P384Signature::from_slice(signature))
                .map_err(|e| {
                    AttestationError::SignatureInvalid(format!("Failed to parse P-384 signature: {}", e))
                })?;

            use p384::ecdsa::signature::Verifier;
            verifying_key.verify(message, &signature).map_err(|e| {
                AttestationError::SignatureInvalid(format!("P-384 signature verification failed: {}", e))
            })?;
            trace!("P-384 ECDSA signature verified");
        }
        KeyAlgorithm::Ed25519 => {
            let key: &[u8; 32] = key_bytes.try_into().map_err(|_| {
                AttestationError::SignatureInvalid(format!(
                    "Invalid Ed25519 public key length: {} (expected 32)",
                    key_bytes.len()
                ))
            })?;
            let verifying_key = Ed25519VerifyingKey::from_bytes(key).map_err(|e| {
                AttestationError::SignatureInvalid(format!("Failed to parse Ed25519 public key: {}", e))
            })?;
            let signature = Ed25519Signature::from_slice(signature).map_err(|e| {
                AttestationError::SignatureInvalid(format!("Invalid Ed25519 signature: {}", e))
            })?;

            use ed25519_dalek::Verifier;
            verifying_key.verify(message, &signature).map_err(|e| {
                AttestationError::SignatureInvalid(format!("Ed25519 signature verification failed: {}", e))
            })?;
            trace!("Ed25519 signature verified");
        }
    }

    Ok(())
}

/// Check that `cert` was signed by the holder of `issuer_spki`.
///
/// The certificate's declared signature algorithm has to agree with the
/// issuer key: P-256 keys sign with SHA-256, P-384 keys with SHA-384.
pub fn verify_certificate_signature(
    cert: &X509Certificate,
    issuer_spki: &SubjectPublicKeyInfo,
) -> Result<()> {
    let declared = cert.signature_algorithm.algorithm.to_id_string();
    let expected = match key_algorithm(issuer_spki)? {
        KeyAlgorithm::EcdsaP256 => OID_ECDSA_WITH_SHA256,
        KeyAlgorithm::EcdsaP384 => OID_ECDSA_WITH_SHA384,
        KeyAlgorithm::Ed25519 => OID_ED25519,
    };
    if declared != expected {
        return Err(AttestationError::SignatureInvalid(format!(
            "Certificate signature algorithm {} does not match issuer key ({})",
            declared, expected
        )));
    }

    verify_with_spki(
        issuer_spki,
        cert.signature_value.data.as_ref(),
        cert.tbs_certificate.as_ref(),
    )
}

/// DSSE pre-authentication encoding:
/// `"DSSEv1" SP LEN(type) SP type SP LEN(body) SP body`
pub fn dsse_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload_type.len() + payload.len() + 32);

    pae.extend_from_slice(b"DSSEv1");
    pae.push(b' ');
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);

    pae
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsse_pae() {
        let pae = dsse_pae("application/vnd.in-toto+json", b"{}");
        assert_eq!(pae, b"DSSEv1 28 application/vnd.in-toto+json 2 {}".to_vec());
    }

    #[test]
    fn test_dsse_pae_empty_payload() {
        assert_eq!(dsse_pae("t", b""), b"DSSEv1 1 t 0 ".to_vec());
    }

    #[test]
    fn test_rejects_unparseable_key() {
        let err = verify_with_spki_der(&[0x30, 0x00], b"sig", b"msg").unwrap_err();
        assert!(matches!(err, AttestationError::SignatureInvalid(_)));
    }
}
