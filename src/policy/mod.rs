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

//! Declarative policy model.
//!
//! Policies arrive fully formed (there is no CRUD surface); these types are
//! the serde projection of the admission policy document consumed by the
//! engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod conditions;
pub mod image_verify;

pub use conditions::{AnyAllConditions, Condition, ConditionOperator};
pub use image_verify::{
    Attestation, Attestor, AttestorKind, AttestorSet, CertificateAttestor, ImageVerification,
    KeylessAttestor, Rekor, SecretReference, StaticKeyAttestor,
};

/// Annotation controlling which workload controllers receive auto-generated
/// rules. `"none"` disables autogeneration for the policy.
pub const AUTOGEN_CONTROLLERS_ANNOTATION: &str = "imagegate.dev/autogen-controllers";

/// A policy: a named, declarative set of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    pub spec: PolicySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub apply_rules: ApplyRules,
}

/// How many rules may apply to a single admission request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyRules {
    #[default]
    All,
    One,
}

/// A single policy rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    #[serde(default, rename = "match")]
    pub match_resources: ResourceFilter,

    #[serde(default)]
    pub exclude: ResourceFilter,

    /// Context entries loaded before variable substitution.
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    /// Custom image extractors; when empty the standard pod-shaped
    /// extraction applies.
    #[serde(default)]
    pub image_extractors: Vec<ImageExtractor>,

    #[serde(default)]
    pub verify_images: Vec<ImageVerification>,
}

/// Resource selection filter used by both `match` and `exclude`. Empty
/// vectors match (respectively exclude) nothing in that dimension; all
/// entries are classic `*`/`?` globs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    #[serde(default)]
    pub kinds: Vec<String>,

    #[serde(default)]
    pub names: Vec<String>,

    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl ResourceFilter {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.names.is_empty() && self.namespaces.is_empty()
    }
}

/// A named value made available to variable substitution.
///
/// Only `variable` entries are supported: ConfigMap and API-call lookups
/// require cluster connectivity and are resolved by the caller before the
/// engine runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub name: String,

    #[serde(default)]
    pub variable: Option<VariableDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    /// Literal value.
    #[serde(default)]
    pub value: Option<Value>,

    /// Dotted context path to resolve when no literal value is given.
    #[serde(default)]
    pub path: Option<String>,

    /// Fallback when the path does not resolve.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Locates image references in resources the standard extraction does not
/// understand. `path` is an RFC 6901 pointer where `*` segments iterate
/// arrays; `value` names the field holding the image when the target is an
/// object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageExtractor {
    pub name: String,
    pub path: String,

    #[serde(default)]
    pub value: Option<String>,
}
