//
// Copyright 2024 The ImageGate Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Trust configuration types: which images a rule covers and which
//! attestors/attestations must verify them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::conditions::AnyAllConditions;

fn default_true() -> bool {
    true
}

/// One trust spec inside a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerification {
    /// Image reference globs this spec applies to.
    #[serde(default)]
    pub image_references: Vec<String>,

    /// Signature trust configurations. Every set must reach its quorum.
    #[serde(default)]
    pub attestors: Vec<AttestorSet>,

    /// Attestation (in-toto statement) requirements.
    #[serde(default)]
    pub attestations: Vec<Attestation>,

    /// Alternate repository where signatures are stored.
    #[serde(default)]
    pub repository: Option<String>,

    /// Annotations the signature payload must carry.
    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,

    /// PEM bundle of trusted root certificates.
    #[serde(default)]
    pub roots: Option<String>,

    /// Pin the resolved digest into the admitted resource.
    #[serde(default = "default_true")]
    pub mutate_digest: bool,
}

impl Default for ImageVerification {
    fn default() -> Self {
        ImageVerification {
            image_references: Vec::new(),
            attestors: Vec::new(),
            attestations: Vec::new(),
            repository: None,
            annotations: None,
            roots: None,
            mutate_digest: true,
        }
    }
}

/// A quorum of attestors. A `count` of `None` (or zero) requires every entry
/// to verify.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestorSet {
    #[serde(default)]
    pub count: Option<u32>,

    #[serde(default)]
    pub entries: Vec<Attestor>,
}

impl AttestorSet {
    /// The effective quorum: `count` when positive, otherwise the number of
    /// entries.
    pub fn required_count(&self) -> usize {
        match self.count {
            Some(count) if count > 0 => count as usize,
            _ => self.entries.len(),
        }
    }
}

/// One trust unit: exactly one of `keys`, `certificates`, `keyless` or a
/// nested `attestor` set is expected; [`Attestor::kind`] resolves them in
/// that precedence. An entry with none set is the sentinel used to fetch
/// attestations without a key check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestor {
    /// Attestor-level repository override.
    #[serde(default)]
    pub repository: Option<String>,

    /// Attestor-level annotation override.
    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,

    /// Static PEM public keys, a secret-backed key, or a KMS key.
    #[serde(default)]
    pub keys: Option<StaticKeyAttestor>,

    /// An X.509 certificate (with optional chain).
    #[serde(default)]
    pub certificates: Option<CertificateAttestor>,

    /// A keyless (OIDC) identity.
    #[serde(default)]
    pub keyless: Option<KeylessAttestor>,

    /// A nested attestor set, verified recursively with its own quorum.
    #[serde(default)]
    pub attestor: Option<Box<AttestorSet>>,
}

impl Attestor {
    /// The trust material as a sum type, so callers can exhaustively switch
    /// over it instead of probing fields.
    pub fn kind(&self) -> Option<AttestorKind<'_>> {
        if let Some(keys) = &self.keys {
            Some(AttestorKind::Keys(keys))
        } else if let Some(certificates) = &self.certificates {
            Some(AttestorKind::Certificates(certificates))
        } else if let Some(keyless) = &self.keyless {
            Some(AttestorKind::Keyless(keyless))
        } else {
            self.attestor.as_deref().map(AttestorKind::Nested)
        }
    }
}

/// Borrowed view of an attestor's trust material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttestorKind<'a> {
    Keys(&'a StaticKeyAttestor),
    Certificates(&'a CertificateAttestor),
    Keyless(&'a KeylessAttestor),
    Nested(&'a AttestorSet),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticKeyAttestor {
    /// One or more concatenated PEM public key blocks.
    #[serde(default)]
    pub public_keys: String,

    #[serde(default)]
    pub secret: Option<SecretReference>,

    #[serde(default)]
    pub kms: Option<String>,

    #[serde(default)]
    pub rekor: Option<Rekor>,

    #[serde(default)]
    pub signature_algorithm: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAttestor {
    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub certificate_chain: Option<String>,

    #[serde(default)]
    pub rekor: Option<Rekor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeylessAttestor {
    #[serde(default)]
    pub rekor: Option<Rekor>,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub roots: Option<String>,

    #[serde(default)]
    pub additional_extensions: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rekor {
    pub url: String,
}

/// A predicate-typed claim about an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub predicate_type: String,

    #[serde(default)]
    pub attestors: Vec<AttestorSet>,

    /// Conditions evaluated against each statement's predicate body.
    #[serde(default)]
    pub conditions: Vec<AnyAllConditions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_count_defaults_to_entry_count() {
        let set = AttestorSet {
            count: None,
            entries: vec![Attestor::default(), Attestor::default()],
        };
        assert_eq!(set.required_count(), 2);

        let set = AttestorSet {
            count: Some(0),
            entries: vec![Attestor::default(), Attestor::default()],
        };
        assert_eq!(set.required_count(), 2);

        let set = AttestorSet {
            count: Some(1),
            entries: vec![Attestor::default(), Attestor::default()],
        };
        assert_eq!(set.required_count(), 1);
    }

    #[test]
    fn attestor_kind_resolves_keys() {
        let attestor: Attestor = serde_json::from_value(serde_json::json!({
            "keys": {"publicKeys": "pem", "signatureAlgorithm": "sha256"},
            "repository": "ghcr.io/org/signatures"
        }))
        .unwrap();

        assert_eq!(attestor.repository.as_deref(), Some("ghcr.io/org/signatures"));
        match attestor.kind() {
            Some(AttestorKind::Keys(keys)) => {
                assert_eq!(keys.public_keys, "pem");
                assert_eq!(keys.signature_algorithm.as_deref(), Some("sha256"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn attestor_kind_resolves_nested_sets() {
        let attestor: Attestor = serde_json::from_value(serde_json::json!({
            "attestor": {
                "count": 1,
                "entries": [{"keyless": {"issuer": "https://accounts.example.com", "subject": "dev@example.com"}}]
            }
        }))
        .unwrap();

        match attestor.kind() {
            Some(AttestorKind::Nested(set)) => {
                assert_eq!(set.count, Some(1));
                assert!(matches!(
                    set.entries[0].kind(),
                    Some(AttestorKind::Keyless(_))
                ));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn keys_take_precedence_over_keyless() {
        let attestor: Attestor = serde_json::from_value(serde_json::json!({
            "keys": {"publicKeys": "pem"},
            "keyless": {"issuer": "https://accounts.example.com"}
        }))
        .unwrap();
        assert!(matches!(attestor.kind(), Some(AttestorKind::Keys(_))));
    }

    #[test]
    fn empty_attestor_has_no_kind() {
        let attestor: Attestor = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(attestor.kind().is_none());
    }

    #[test]
    fn mutate_digest_defaults_on() {
        let iv: ImageVerification =
            serde_json::from_value(serde_json::json!({"imageReferences": ["*"]})).unwrap();
        assert!(iv.mutate_digest);
    }
}
