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

//! The errors that can be raised by imagegate

use thiserror::Error;

use crate::registry::RegistryError;

pub type Result<T> = std::result::Result<T, ImageGateError>;

#[derive(Error, Debug)]
pub enum ImageGateError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("image reference not valid: {reference}")]
    ImageReferenceNotValid { reference: String },

    #[error("failed to extract images: {reason}")]
    ImageExtraction { reason: String },

    #[error("failed to load context entry {entry}: {reason}")]
    ContextLoad { entry: String, reason: String },

    #[error("variable {variable} could not be resolved")]
    UnresolvedVariable { variable: String },

    #[error("{message}")]
    QuorumNotMet { message: String, network: bool },

    #[error("nested attestor depth limit exceeded at {path}")]
    NestedAttestorTooDeep { path: String },

    #[error("attestations not found for predicate type {predicate_type}")]
    PredicateNotFound { predicate_type: String },

    #[error("attestation checks failed for {image} and predicate {predicate_type}")]
    AttestationChecksFailed {
        image: String,
        predicate_type: String,
    },

    #[error("malformed in-toto statement: {reason}")]
    MalformedStatement { reason: String },

    #[error("malformed {key} annotation: {reason}")]
    MalformedAnnotation { key: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl ImageGateError {
    /// Whether the error is operational (transient infrastructure trouble)
    /// rather than a verification verdict. Operational failures surface as a
    /// rule `error` status instead of a policy `fail`.
    pub fn is_operational(&self) -> bool {
        match self {
            ImageGateError::Registry(e) => e.is_network(),
            ImageGateError::QuorumNotMet { network, .. } => *network,
            ImageGateError::MalformedStatement { .. } => true,
            ImageGateError::Cancelled => true,
            _ => false,
        }
    }
}
