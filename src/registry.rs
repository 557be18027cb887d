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

//! The registry capability consumed by the engine.
//!
//! The engine never talks to an OCI registry directly: signature
//! verification, attestation fetching and descriptor resolution are performed
//! by an implementation of [`RegistryClient`]. The cryptographic details
//! (key, certificate and keyless flows) live entirely behind this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a [`RegistryClient`] implementation.
///
/// The engine only distinguishes the *network* class from everything else:
/// network failures are transient and become a rule `error`, any other
/// failure is a verification verdict and becomes a rule `fail`.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("network failure reaching registry: {source}")]
    Network {
        #[from]
        source: std::io::Error,
    },

    #[error("signature verification failed: {reason}")]
    SignatureMismatch { reason: String },

    #[error("cannot fetch attestations: {reason}")]
    AttestationFetch { reason: String },

    #[error("cannot resolve descriptor for {image}: {reason}")]
    Descriptor { image: String, reason: String },
}

impl RegistryError {
    pub fn is_network(&self) -> bool {
        matches!(self, RegistryError::Network { .. })
    }
}

/// Flat option record handed to the registry client for one verification
/// attempt. Built from a single trust entry plus the surrounding
/// [`ImageVerification`](crate::policy::ImageVerification) spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyOptions {
    /// Image under verification, e.g. `ghcr.io/org/app:v1`.
    pub image_ref: String,

    /// Alternate repository where signatures are stored.
    pub repository: Option<String>,

    /// Annotations the signature payload must carry.
    pub annotations: HashMap<String, String>,

    /// PEM bundle of trusted root certificates.
    pub roots: Option<String>,

    /// Verification key: inline PEM, `k8s://<namespace>/<name>` for
    /// secret-backed keys, or a KMS URI.
    pub key: Option<String>,

    pub cert: Option<String>,
    pub cert_chain: Option<String>,

    pub rekor_url: Option<String>,
    pub signature_algorithm: Option<String>,

    /// Keyless identity requirements.
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub additional_extensions: HashMap<String, String>,

    /// When set, `fetch_attestations` retrieves in-toto statements of this
    /// predicate type instead of plain signatures.
    pub predicate_type: Option<String>,
    pub fetch_attestations: bool,
}

/// Outcome of a successful signature verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureResponse {
    /// Digest of the verified image, e.g. `sha256:ab…`.
    pub digest: String,
}

/// Outcome of an attestation fetch: the decoded in-toto statements plus the
/// digest of the subject image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttestationResponse {
    pub statements: Vec<Value>,
    pub digest: String,
}

/// A resolved image descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub digest: String,
}

/// Registry abilities that have to be implemented by a registry client.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Verify the signature of `opts.image_ref` against the trust material
    /// in `opts`. Returns the resolved digest on success.
    async fn verify_signature(
        &self,
        opts: &VerifyOptions,
    ) -> std::result::Result<SignatureResponse, RegistryError>;

    /// Fetch (and, when trust material is present in `opts`, verify) the
    /// in-toto attestation statements attached to `opts.image_ref`.
    async fn fetch_attestations(
        &self,
        opts: &VerifyOptions,
    ) -> std::result::Result<AttestationResponse, RegistryError>;

    /// Resolve the manifest descriptor of an image reference.
    async fn fetch_image_descriptor(
        &self,
        image_ref: &str,
    ) -> std::result::Result<Descriptor, RegistryError>;
}
