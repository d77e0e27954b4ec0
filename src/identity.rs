use crate::{AttestationError, Result};
use log::trace;
use serde::Serialize;
use std::collections::BTreeMap;
use x509_parser::prelude::*;

/// Fulcio certificate extension OIDs (`1.3.6.1.4.1.57264.1.*`)
pub mod oids {
    pub const FULCIO_PREFIX: &str = "1.3.6.1.4.1.57264.1.";

    /// Deprecated raw-string form of the OIDC issuer
    pub const ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
    pub const GITHUB_WORKFLOW_TRIGGER_V1: &str = "1.3.6.1.4.1.57264.1.2";
    pub const GITHUB_WORKFLOW_SHA_V1: &str = "1.3.6.1.4.1.57264.1.3";
    pub const GITHUB_WORKFLOW_NAME_V1: &str = "1.3.6.1.4.1.57264.1.4";
    pub const GITHUB_WORKFLOW_REPOSITORY_V1: &str = "1.3.6.1.4.1.57264.1.5";
    pub const GITHUB_WORKFLOW_REF_V1: &str = "1.3.6.1.4.1.57264.1.6";

    pub const ISSUER: &str = "1.3.6.1.4.1.57264.1.8";
    pub const BUILD_SIGNER_URI: &str = "1.3.6.1.4.1.57264.1.9";
    pub const BUILD_SIGNER_DIGEST: &str = "1.3.6.1.4.1.57264.1.10";
    pub const RUNNER_ENVIRONMENT: &str = "1.3.6.1.4.1.57264.1.11";
    pub const SOURCE_REPOSITORY_URI: &str = "1.3.6.1.4.1.57264.1.12";
    pub const SOURCE_REPOSITORY_DIGEST: &str = "1.3.6.1.4.1.57264.1.13";
    pub const SOURCE_REPOSITORY_REF: &str = "1.3.6.1.4.1.57264.1.14";
    pub const SOURCE_REPOSITORY_IDENTIFIER: &str = "1.3.6.1.4.1.57264.1.15";
    pub const SOURCE_REPOSITORY_OWNER_URI: &str = "1.3.6.1.4.1.57264.1.16";
    pub const SOURCE_REPOSITORY_OWNER_IDENTIFIER: &str = "1.3.6.1.4.1.57264.1.17";
    pub const BUILD_CONFIG_URI: &str = "1.3.6.1.4.1.57264.1.18";
    pub const BUILD_CONFIG_DIGEST: &str = "1.3.6.1.4.1.57264.1.19";
    pub const BUILD_TRIGGER: &str = "1.3.6.1.4.1.57264.1.20";
    pub const RUN_INVOCATION_URI: &str = "1.3.6.1.4.1.57264.1.21";
    pub const SOURCE_REPOSITORY_VISIBILITY: &str = "1.3.6.1.4.1.57264.1.22";

    /// Legacy extensions hold the raw value instead of a DER UTF8String
    pub(crate) fn is_raw_string(oid: &str) -> bool {
        matches!(
            oid,
            ISSUER_V1
                | GITHUB_WORKFLOW_TRIGGER_V1
                | GITHUB_WORKFLOW_SHA_V1
                | GITHUB_WORKFLOW_NAME_V1
                | GITHUB_WORKFLOW_REPOSITORY_V1
                | GITHUB_WORKFLOW_REF_V1
        )
    }
}

/// Read-only view of who signed, taken from the leaf certificate.
///
/// Never built from caller input: the only constructors read a certificate or
/// a trust-root key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafIdentity {
    /// OIDC issuer URL, empty when the certificate carries none
    pub issuer: String,
    pub subject_alternative_name: String,
    /// Fulcio extensions by dotted OID
    pub extensions: BTreeMap<String, String>,
}

impl LeafIdentity {
    pub fn from_der(cert_der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(cert_der).map_err(|e| {
            AttestationError::malformed(format!("Failed to parse certificate: {}", e))
        })?;
        Self::from_certificate(&cert)
    }

    pub fn from_certificate(cert: &X509Certificate) -> Result<Self> {
        let mut extensions = BTreeMap::new();
        let mut subject_alternative_name = None;

        for ext in cert.extensions() {
            let oid = ext.oid.to_id_string();

            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                subject_alternative_name = san.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => Some(uri.to_string()),
                    GeneralName::RFC822Name(email) => Some(email.to_string()),
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                });
                continue;
            }

            if oid.starts_with(oids::FULCIO_PREFIX) {
                let value = decode_extension_value(&oid, ext.value)?;
                trace!("Fulcio extension {} = {}", oid, value);
                extensions.insert(oid, value);
            }
        }

        let issuer = extensions
            .get(oids::ISSUER)
            .or_else(|| extensions.get(oids::ISSUER_V1))
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            issuer,
            subject_alternative_name: subject_alternative_name.unwrap_or_default(),
            extensions,
        })
    }

    /// Identity of a bundle signed with a trust-root key rather than a
    /// certificate: no issuer, the key hint stands in for the subject.
    pub fn from_key_hint(hint: &str) -> Self {
        Self {
            issuer: String::new(),
            subject_alternative_name: hint.to_string(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn extension(&self, oid: &str) -> Option<&str> {
        self.extensions.get(oid).map(String::as_str)
    }

    pub fn source_repository_uri(&self) -> Option<&str> {
        self.extension(oids::SOURCE_REPOSITORY_URI)
    }

    pub fn source_repository_ref(&self) -> Option<&str> {
        self.extension(oids::SOURCE_REPOSITORY_REF)
    }

    pub fn build_signer_uri(&self) -> Option<&str> {
        self.extension(oids::BUILD_SIGNER_URI)
    }

    pub fn runner_environment(&self) -> Option<&str> {
        self.extension(oids::RUNNER_ENVIRONMENT)
    }
}

/// Human-readable name of a Fulcio extension, for diagnostics
pub fn extension_name(oid: &str) -> Option<&'static str> {
    let name = match oid {
        oids::ISSUER | oids::ISSUER_V1 => "issuer",
        oids::BUILD_SIGNER_URI => "build signer URI",
        oids::BUILD_SIGNER_DIGEST => "build signer digest",
        oids::RUNNER_ENVIRONMENT => "runner environment",
        oids::SOURCE_REPOSITORY_URI => "source repository URI",
        oids::SOURCE_REPOSITORY_DIGEST => "source repository digest",
        oids::SOURCE_REPOSITORY_REF => "source repository ref",
        oids::SOURCE_REPOSITORY_IDENTIFIER => "source repository identifier",
        oids::SOURCE_REPOSITORY_OWNER_URI => "source repository owner URI",
        oids::SOURCE_REPOSITORY_OWNER_IDENTIFIER => "source repository owner identifier",
        oids::BUILD_CONFIG_URI => "build config URI",
        oids::BUILD_CONFIG_DIGEST => "build config digest",
        oids::BUILD_TRIGGER => "build trigger",
        oids::RUN_INVOCATION_URI => "run invocation URI",
        oids::SOURCE_REPOSITORY_VISIBILITY => "source repository visibility",
        _ => return None,
    };
    Some(name)
}

fn decode_extension_value(oid: &str, value: &[u8]) -> Result<String> {
    if oids::is_raw_string(oid) {
        return String::from_utf8(value.to_vec()).map_err(|_| {
            AttestationError::malformed(format!("Extension {} is not valid UTF-8", oid))
        });
    }

    let (_, object) = x509_parser::der_parser::der::parse_der_utf8string(value).map_err(|e| {
        AttestationError::malformed(format!("Extension {} is not a UTF8String: {}", oid, e))
    })?;
    object
        .as_str()
        .map(str::to_string)
        .map_err(|e| AttestationError::malformed(format!("Extension {} is not a UTF8String: {}", oid, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_der_utf8_extension() {
        let mut value = vec![0x0c, 24];
        value.extend_from_slice(b"https://issuer.example/a");
        assert_eq!(
            decode_extension_value(oids::ISSUER, &value).unwrap(),
            "https://issuer.example/a"
        );
    }

    #[test]
    fn test_decode_legacy_raw_extension() {
        assert_eq!(
            decode_extension_value(oids::ISSUER_V1, b"https://legacy.example").unwrap(),
            "https://legacy.example"
        );
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let value = [0x04, 0x02, b'h', b'i'];
        assert!(decode_extension_value(oids::SOURCE_REPOSITORY_URI, &value).is_err());
    }

    #[test]
    fn test_key_hint_identity_has_no_issuer() {
        let identity = LeafIdentity::from_key_hint("release-key");
        assert!(identity.issuer.is_empty());
        assert_eq!(identity.subject_alternative_name, "release-key");
        assert!(identity.extensions.is_empty());
    }

    #[test]
    fn test_extension_names() {
        assert_eq!(extension_name(oids::BUILD_TRIGGER), Some("build trigger"));
        assert_eq!(extension_name("2.5.29.17"), None);
    }
}
