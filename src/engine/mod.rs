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

//! The image verification engine.
//!
//! [`verify_and_patch_images`] is the per-admission entry point: it walks
//! the policy's rules, verifies the images each rule selects against its
//! trust configurations, and aggregates verdicts and digest patches into an
//! [`EngineResponse`].

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::context::EvalContext;
use crate::errors::Result;
use crate::images::{self, ImageInfo, ImageMap};
use crate::policy::{ApplyRules, ContextEntry, Policy, Rule};
use crate::registry::RegistryClient;
use crate::resource::Resource;
use crate::variables;
use crate::wildcard;

pub mod autogen;
pub mod filter;
mod image_verifier;
pub mod metadata;
pub mod response;

pub use metadata::{is_image_verified, ImageVerificationMetadata, IMAGE_VERIFY_ANNOTATION};
pub use response::{EngineResponse, RuleResponse, RuleStatus, RuleType};

use image_verifier::ImageVerifier;
use response::RuleStatus as Status;

/// Per-admission evaluation context. Created by the caller for a single
/// orchestration pass and discarded afterwards; the embedded
/// [`EvalContext`] is not thread-safe.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub policy: Policy,
    pub new_resource: Resource,
    pub old_resource: Option<Resource>,
    pub json_context: EvalContext,
    images: ImageMap,
}

impl PolicyContext {
    pub fn new(policy: Policy, new_resource: Resource, old_resource: Option<Resource>) -> Self {
        let operation = if old_resource.is_some() {
            "UPDATE"
        } else {
            "CREATE"
        };
        let json_context = EvalContext::new(&new_resource, old_resource.as_ref(), operation);
        let images = images::extract_images(&new_resource);
        PolicyContext {
            policy,
            new_resource,
            old_resource,
            json_context,
            images,
        }
    }

    /// The grouped image map extracted from the new resource.
    pub fn images(&self) -> &ImageMap {
        &self.images
    }
}

/// Verify the images of an admission resource against every applicable rule
/// of the policy.
///
/// Operational failures never abort the evaluation: they are folded into
/// per-rule `error` responses, and a complete [`EngineResponse`] is always
/// produced together with the per-image verification metadata.
pub async fn verify_and_patch_images(
    cancel: &CancellationToken,
    client: &dyn RegistryClient,
    policy_context: &mut PolicyContext,
) -> (EngineResponse, ImageVerificationMetadata) {
    let start = Instant::now();
    let mut resp = EngineResponse::default();
    let mut ivm = ImageVerificationMetadata::default();

    let span = info_span!(
        "verify_images",
        policy = %policy_context.policy.name,
        kind = %policy_context.new_resource.kind(),
        namespace = %policy_context.new_resource.namespace(),
        name = %policy_context.new_resource.name(),
    );

    async {
        policy_context.json_context.checkpoint();

        let apply_rules = policy_context.policy.spec.apply_rules;
        let rules = autogen::compute_rules(&policy_context.policy);

        for rule in &rules {
            if rule.verify_images.is_empty() {
                continue;
            }
            if !filter::rule_matches(rule, &policy_context.new_resource) {
                continue;
            }
            debug!(rule = %rule.name, ?apply_rules, "processing image verification rule");

            process_rule(cancel, client, policy_context, rule, &mut resp, &mut ivm)
                .instrument(info_span!("rule", name = %rule.name))
                .await;

            if apply_rules == ApplyRules::One && resp.rules_applied_count > 0 {
                break;
            }
        }

        policy_context.json_context.restore();
    }
    .instrument(span)
    .await;

    resp.processing_time = start.elapsed();
    debug!(
        elapsed = ?resp.processing_time,
        applied = resp.rules_applied_count,
        successful = resp.is_successful(),
        "processed image verification rules"
    );
    (resp, ivm)
}

async fn process_rule(
    cancel: &CancellationToken,
    client: &dyn RegistryClient,
    policy_context: &mut PolicyContext,
    rule: &Rule,
    resp: &mut EngineResponse,
    ivm: &mut ImageVerificationMetadata,
) {
    let images = if rule.image_extractors.is_empty() {
        Ok(policy_context.images().clone())
    } else {
        images::extract_custom_images(&policy_context.new_resource, &rule.image_extractors)
    };
    let images = match images {
        Ok(images) => images,
        Err(err) => {
            resp.add(RuleResponse::new(
                &rule.name,
                Status::Error,
                format!("failed to extract images: {err}"),
            ));
            return;
        }
    };

    let (matched, image_refs) = matching_images(&images, rule);
    if matched.is_empty() {
        resp.add(RuleResponse::new(
            &rule.name,
            Status::Skip,
            format!(
                "skip run verification as image in resource not found in imageRefs '{image_refs}'"
            ),
        ));
        return;
    }

    // Discard mutations left behind by the previous rule before loading
    // this rule's context entries.
    policy_context.json_context.reset();
    if let Err(err) = load_context(&mut policy_context.json_context, &rule.context) {
        resp.add(RuleResponse::new(
            &rule.name,
            Status::Error,
            format!("failed to load context: {err}"),
        ));
        return;
    }

    let rule_copy = match substitute_rule(&policy_context.json_context, rule) {
        Ok(rule_copy) => rule_copy,
        Err(err) => {
            resp.add(RuleResponse::new(
                &rule.name,
                Status::Error,
                format!("failed to substitute variables: {err}"),
            ));
            return;
        }
    };

    let mut verifier = ImageVerifier {
        client,
        policy_context,
        rule: &rule_copy,
        resp,
        ivm,
        cancel,
    };
    for iv_spec in &rule_copy.verify_images {
        verifier.verify(iv_spec, &matched).await;
    }
}

/// Select the images the rule applies to, together with the joined glob
/// list for diagnostics. An occurrence matching several trust specs is
/// selected once.
fn matching_images(images: &ImageMap, rule: &Rule) -> (Vec<ImageInfo>, String) {
    let mut image_refs: Vec<String> = Vec::new();
    for iv_spec in &rule.verify_images {
        image_refs.extend(iv_spec.image_references.iter().cloned());
    }

    let mut matched = Vec::new();
    for group in images.values() {
        for info in group.values() {
            let image = info.reference();
            if rule
                .verify_images
                .iter()
                .any(|iv_spec| wildcard::matches_any(&iv_spec.image_references, &image))
            {
                matched.push(info.clone());
            }
        }
    }
    (matched, image_refs.join(","))
}

// Variable entries resolve without cluster I/O; anything else must be
// resolved by the caller before the engine runs.
fn load_context(ctx: &mut EvalContext, entries: &[ContextEntry]) -> Result<()> {
    for entry in entries {
        let variable = entry.variable.as_ref().ok_or_else(|| {
            crate::errors::ImageGateError::ContextLoad {
                entry: entry.name.clone(),
                reason: "only variable context entries are supported".to_string(),
            }
        })?;

        let value = match (&variable.value, &variable.path) {
            (Some(value), _) => Some(value.clone()),
            (None, Some(path)) => ctx.resolve(path),
            (None, None) => None,
        };
        let value = value.or_else(|| variable.default.clone()).ok_or_else(|| {
            crate::errors::ImageGateError::ContextLoad {
                entry: entry.name.clone(),
                reason: "no value, path result, or default".to_string(),
            }
        })?;

        ctx.add_variable(&entry.name, value)?;
    }
    Ok(())
}

// Attestation conditions are substituted later, per statement, against the
// predicate body; strip them before rule-level substitution and reattach
// the originals afterwards.
fn substitute_rule(ctx: &EvalContext, rule: &Rule) -> Result<Rule> {
    let mut stripped = rule.clone();
    for iv_spec in &mut stripped.verify_images {
        iv_spec.attestations = Vec::new();
    }

    let mut substituted = variables::substitute_all_in_rule(ctx, &stripped)?;

    for (iv_spec, original) in substituted
        .verify_images
        .iter_mut()
        .zip(&rule.verify_images)
    {
        iv_spec.attestations = original.attestations.clone();
    }
    Ok(substituted)
}
