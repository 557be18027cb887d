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

//! Per-image verification: quorum evaluation over attestor sets, attestation
//! checks against in-toto statements, and digest pinning.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{ImageGateError, Result};
use crate::images::ImageInfo;
use crate::policy::{
    Attestation, Attestor, AttestorKind, AttestorSet, ImageVerification, Rule, StaticKeyAttestor,
};
use crate::registry::{
    AttestationResponse, Descriptor, RegistryClient, SignatureResponse, VerifyOptions,
};
use crate::variables;

use super::metadata::{is_image_verified, ImageVerificationMetadata, IMAGE_VERIFY_ANNOTATION};
use super::response::{EngineResponse, RuleResponse, RuleStatus};
use super::PolicyContext;

// Hostile policies could nest attestor sets arbitrarily deep; in practice
// nesting stays at one or two levels.
const MAX_NESTED_ATTESTOR_DEPTH: usize = 10;

/// Applies one substituted rule to the matched images, recording verdicts
/// and patches on the shared response.
pub(crate) struct ImageVerifier<'a> {
    pub(crate) client: &'a dyn RegistryClient,
    pub(crate) policy_context: &'a mut PolicyContext,
    pub(crate) rule: &'a Rule,
    pub(crate) resp: &'a mut EngineResponse,
    pub(crate) ivm: &'a mut ImageVerificationMetadata,
    pub(crate) cancel: &'a CancellationToken,
}

impl ImageVerifier<'_> {
    /// Verify each matched image against one trust spec. Rule results and
    /// digest patches are added to the shared response and metadata.
    pub(crate) async fn verify(&mut self, iv_spec: &ImageVerification, matched: &[ImageInfo]) {
        for info in matched {
            let mut image_info = info.clone();
            let image = image_info.reference();

            if self.image_verify_annotation_changed() {
                let msg = format!("{IMAGE_VERIFY_ANNOTATION} annotation cannot be changed");
                info!(reason = %msg, "image verification failed");
                let rule_resp = self.rule_response(RuleStatus::Fail, msg);
                self.resp.add(rule_resp);
                continue;
            }

            if let Ok(false) = self
                .policy_context
                .json_context
                .has_changed(&image_info.pointer)
            {
                debug!(%image, "no change in image, skipping check");
                continue;
            }

            if let Ok(true) = is_image_verified(&self.policy_context.new_resource, &image) {
                info!(%image, "image was previously verified, skipping check");
                continue;
            }

            let (mut rule_resp, digest) = self.verify_image(iv_spec, &mut image_info).await;

            if iv_spec.mutate_digest {
                match self.handle_mutate_digest(digest, &mut image_info).await {
                    Err(err) => {
                        rule_resp = Some(self.rule_response(
                            RuleStatus::Error,
                            format!("failed to update digest: {err}"),
                        ));
                    }
                    Ok(Some((patch, resolved))) => {
                        let mut resp = rule_resp.unwrap_or_else(|| {
                            self.rule_response(
                                RuleStatus::Pass,
                                "mutated image digest".to_string(),
                            )
                        });
                        resp.patches.push(patch);
                        image_info.digest = Some(resolved);
                        rule_resp = Some(resp);
                    }
                    Ok(None) => {}
                }
            }

            if let Some(rule_resp) = rule_resp {
                if !iv_spec.attestors.is_empty() || !iv_spec.attestations.is_empty() {
                    let verified = rule_resp.status == RuleStatus::Pass;
                    self.ivm.add(&image_info.reference(), verified);
                }
                self.resp.add(rule_resp);
            }
        }
    }

    /// Run signature verification, then attestation checks, for one image.
    /// Returns no response when the spec carries neither attestors nor
    /// attestations.
    async fn verify_image(
        &mut self,
        iv_spec: &ImageVerification,
        image_info: &mut ImageInfo,
    ) -> (Option<RuleResponse>, Option<String>) {
        if iv_spec.attestors.is_empty() && iv_spec.attestations.is_empty() {
            return (None, None);
        }

        let image = image_info.reference();
        debug!(
            %image,
            attestors = iv_spec.attestors.len(),
            attestations = iv_spec.attestations.len(),
            "verifying image signatures"
        );

        if let Err(err) = self.policy_context.json_context.add_image_info(image_info) {
            let msg = format!("failed to add image to context {image}: {err}");
            return (Some(self.rule_response(RuleStatus::Error, msg)), None);
        }

        if !iv_spec.attestors.is_empty() {
            let signature = match self
                .verify_attestors(&iv_spec.attestors, iv_spec, image_info)
                .await
            {
                Ok(signature) => signature,
                Err(err) => return (Some(self.registry_error_response(&image, &err)), None),
            };

            if iv_spec.attestations.is_empty() {
                let msg = format!("verified image signatures for {image}");
                return (
                    Some(self.rule_response(RuleStatus::Pass, msg)),
                    Some(signature.digest),
                );
            }

            if image_info.digest.is_none() {
                image_info.digest = Some(signature.digest);
            }
        }

        let (rule_resp, digest) = self.verify_attestations(iv_spec, image_info).await;
        (Some(rule_resp), digest)
    }

    /// Every attestor set must reach its quorum; the last set's signature
    /// response carries the digest consumed by callers.
    async fn verify_attestors(
        &self,
        attestors: &[AttestorSet],
        iv_spec: &ImageVerification,
        image_info: &ImageInfo,
    ) -> Result<SignatureResponse> {
        let mut response = None;
        for (i, set) in attestors.iter().enumerate() {
            let path = format!(".attestors[{i}]");
            debug!(%path, "verifying attestors");
            response = Some(
                self.verify_attestor_set(set.clone(), iv_spec, image_info, path, 0)
                    .await?,
            );
        }
        response.ok_or_else(|| ImageGateError::QuorumNotMet {
            message: "no attestor sets to verify".to_string(),
            network: false,
        })
    }

    /// Quorum verification over one attestor set, recursing into nested
    /// sets. Short-circuits with the most recent signature response once the
    /// required count is reached; otherwise returns the combined error list.
    fn verify_attestor_set<'s>(
        &'s self,
        set: AttestorSet,
        iv_spec: &'s ImageVerification,
        image_info: &'s ImageInfo,
        path: String,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<SignatureResponse>> + Send + 's>> {
        Box::pin(async move {
            if depth >= MAX_NESTED_ATTESTOR_DEPTH {
                return Err(ImageGateError::NestedAttestorTooDeep { path });
            }

            let set = expand_static_keys(&set);
            let required_count = set.required_count();
            let image = image_info.reference();
            let mut verified_count = 0usize;
            let mut errors: Vec<String> = Vec::new();
            let mut network = false;

            for (i, entry) in set.entries.iter().enumerate() {
                let attestor_path = format!("{path}.entries[{i}]");
                debug!(path = %attestor_path, "verifying attestor set entry");

                let outcome: std::result::Result<SignatureResponse, (String, bool)> =
                    match entry.kind() {
                        Some(AttestorKind::Nested(nested)) => self
                            .verify_attestor_set(
                                nested.clone(),
                                iv_spec,
                                image_info,
                                format!("{attestor_path}.attestor"),
                                depth + 1,
                            )
                            .await
                            .map_err(|err| (err.to_string(), err.is_operational())),
                        _ => {
                            let (opts, sub_path) =
                                build_options_and_path(entry, iv_spec, &image, None);
                            self.verify_signature_checked(&opts).await.map_err(|err| {
                                (
                                    format!("{attestor_path}{sub_path}: {err}"),
                                    err.is_operational(),
                                )
                            })
                        }
                    };

                match outcome {
                    Ok(signature) => {
                        verified_count += 1;
                        if verified_count >= required_count {
                            debug!(
                                verified_count,
                                required_count, "image attestors verification succeeded"
                            );
                            return Ok(signature);
                        }
                    }
                    Err((message, operational)) => {
                        network |= operational;
                        errors.push(message);
                    }
                }
            }

            let message = if errors.is_empty() {
                format!(
                    "image attestors verification failed, verifiedCount: {verified_count}, requiredCount: {required_count}"
                )
            } else {
                errors.join("; ")
            };
            info!(
                verified_count,
                required_count,
                errors = %message,
                "image attestors verification failed"
            );
            Err(ImageGateError::QuorumNotMet { message, network })
        })
    }

    /// Check every attestation requirement against the statements fetched
    /// from the registry.
    async fn verify_attestations(
        &mut self,
        iv_spec: &ImageVerification,
        image_info: &mut ImageInfo,
    ) -> (RuleResponse, Option<String>) {
        let mut image = image_info.reference();

        for (i, attestation) in iv_spec.attestations.iter().enumerate() {
            let path = format!(".attestations[{i}]");

            if attestation.predicate_type.is_empty() {
                let msg = format!("{path}: missing predicateType");
                return (self.rule_response(RuleStatus::Fail, msg), None);
            }

            // An attestation without attestors still fetches statements so
            // its conditions can run; the sentinel entry carries no trust
            // material and the registry skips the key check.
            let sentinel;
            let attestor_sets = if attestation.attestors.is_empty() {
                sentinel = vec![AttestorSet {
                    count: None,
                    entries: vec![Attestor::default()],
                }];
                &sentinel
            } else {
                &attestation.attestors
            };

            for (j, set) in attestor_sets.iter().enumerate() {
                let attestor_path = format!("{path}.attestors[{j}]");
                let required_count = set.required_count();
                let mut verified_count = 0usize;

                for (entry_index, entry) in set.entries.iter().enumerate() {
                    let entry_path = format!("{attestor_path}.entries[{entry_index}]");
                    let (opts, sub_path) =
                        build_options_and_path(entry, iv_spec, &image, Some(attestation));

                    let fetched = match self.fetch_attestations_checked(&opts).await {
                        Ok(fetched) => fetched,
                        Err(err) => {
                            return (self.registry_error_response(&image, &err), None);
                        }
                    };

                    if image_info.digest.is_none() {
                        image_info.digest = Some(fetched.digest.clone());
                        image = image_info.reference();
                    }

                    if let Err(err) =
                        self.check_attestation_statements(&fetched.statements, attestation, image_info)
                    {
                        let status = if err.is_operational() {
                            RuleStatus::Error
                        } else {
                            RuleStatus::Fail
                        };
                        let msg = format!("{entry_path}{sub_path}: {err}");
                        return (self.rule_response(status, msg), None);
                    }

                    verified_count += 1;
                    if verified_count >= required_count {
                        debug!(
                            verified_count,
                            required_count, "image attestations verification succeeded"
                        );
                        break;
                    }
                }

                if verified_count < required_count {
                    let msg = format!(
                        "image attestations verification failed, verifiedCount: {verified_count}, requiredCount: {required_count}"
                    );
                    return (self.rule_response(RuleStatus::Fail, msg), None);
                }
            }

            debug!(
                %path,
                %image,
                predicate_type = %attestation.predicate_type,
                "attestation checks passed"
            );
        }

        let msg = format!("verified image attestations for {image}");
        debug!(%msg);
        (
            self.rule_response(RuleStatus::Pass, msg),
            image_info.digest.clone(),
        )
    }

    /// Select the statements of the attestation's predicate type and run its
    /// conditions against each predicate body.
    fn check_attestation_statements(
        &mut self,
        statements: &[Value],
        attestation: &Attestation,
        image_info: &ImageInfo,
    ) -> Result<()> {
        let (by_predicate, types) = build_statement_map(statements)?;
        debug!(predicates = ?types, image = %image_info, "checking attestations");

        let matching = by_predicate
            .get(attestation.predicate_type.as_str())
            .ok_or_else(|| {
                info!(
                    predicate_type = %attestation.predicate_type,
                    predicates = ?types,
                    image = %image_info,
                    "no attestations found for predicate"
                );
                ImageGateError::PredicateNotFound {
                    predicate_type: attestation.predicate_type.clone(),
                }
            })?;

        for statement in matching {
            if !self.check_conditions(attestation, statement)? {
                return Err(ImageGateError::AttestationChecksFailed {
                    image: image_info.reference(),
                    predicate_type: attestation.predicate_type.clone(),
                });
            }
        }
        Ok(())
    }

    /// Evaluate the attestation's condition tree against one statement's
    /// predicate, under a context checkpoint.
    fn check_conditions(&mut self, attestation: &Attestation, statement: &Value) -> Result<bool> {
        if attestation.conditions.is_empty() {
            return Ok(true);
        }

        let predicate =
            statement
                .get("predicate")
                .cloned()
                .ok_or_else(|| ImageGateError::MalformedStatement {
                    reason: "statement has no predicate".to_string(),
                })?;
        if !predicate.is_object() {
            return Err(ImageGateError::MalformedStatement {
                reason: "predicate is not an object".to_string(),
            });
        }

        let mut ctx = self.policy_context.json_context.scoped();
        ctx.add_json_object(predicate)?;

        let conditions = variables::substitute_all_in_conditions(&ctx, &attestation.conditions)?;
        Ok(variables::evaluate_any_all_conditions(&ctx, &conditions))
    }

    /// Emit a digest-pinning patch for an image admitted without one. Reuses
    /// a digest already resolved by verification, falling back to a
    /// descriptor fetch.
    async fn handle_mutate_digest(
        &self,
        digest: Option<String>,
        image_info: &mut ImageInfo,
    ) -> Result<Option<(Value, String)>> {
        if image_info.digest.is_some() {
            return Ok(None);
        }

        let digest = match digest {
            Some(digest) if !digest.is_empty() => digest,
            _ => {
                self.fetch_image_descriptor_checked(&image_info.reference())
                    .await?
                    .digest
            }
        };

        let patch = make_replace_digest_patch(image_info, &digest);
        debug!(image = %image_info, %patch, "adding digest patch");
        Ok(Some((patch, digest)))
    }

    /// Network failures and cancellation become a rule `error`; anything
    /// else is a verification `fail`.
    fn registry_error_response(&self, image: &str, err: &ImageGateError) -> RuleResponse {
        let msg = format!("failed to verify image {image}: {err}");
        let status = if err.is_operational() {
            RuleStatus::Error
        } else {
            RuleStatus::Fail
        };
        self.rule_response(status, msg)
    }

    fn rule_response(&self, status: RuleStatus, message: String) -> RuleResponse {
        RuleResponse::new(&self.rule.name, status, message)
    }

    fn image_verify_annotation_changed(&self) -> bool {
        let Some(old_resource) = &self.policy_context.old_resource else {
            return false;
        };
        if self.policy_context.new_resource.as_value().is_null() {
            return false;
        }

        let new_value = self
            .policy_context
            .new_resource
            .annotation(IMAGE_VERIFY_ANNOTATION);
        let old_value = old_resource.annotation(IMAGE_VERIFY_ANNOTATION);
        let changed = new_value != old_value;
        if changed {
            info!(
                ?old_value,
                ?new_value,
                key = IMAGE_VERIFY_ANNOTATION,
                "annotation mismatch"
            );
        }
        changed
    }

    async fn verify_signature_checked(&self, opts: &VerifyOptions) -> Result<SignatureResponse> {
        if self.cancel.is_cancelled() {
            return Err(ImageGateError::Cancelled);
        }
        Ok(self.client.verify_signature(opts).await?)
    }

    async fn fetch_attestations_checked(&self, opts: &VerifyOptions) -> Result<AttestationResponse> {
        if self.cancel.is_cancelled() {
            return Err(ImageGateError::Cancelled);
        }
        Ok(self.client.fetch_attestations(opts).await?)
    }

    async fn fetch_image_descriptor_checked(&self, image_ref: &str) -> Result<Descriptor> {
        if self.cancel.is_cancelled() {
            return Err(ImageGateError::Cancelled);
        }
        Ok(self.client.fetch_image_descriptor(image_ref).await?)
    }
}

/// Split multi-key PEM bundles into one attestor per key so quorum counts
/// are meaningful. The set's `count` is preserved unchanged.
pub(crate) fn expand_static_keys(set: &AttestorSet) -> AttestorSet {
    let mut entries = Vec::new();
    for entry in &set.entries {
        if let Some(keys) = &entry.keys {
            let pems = split_pem(&keys.public_keys);
            if pems.len() > 1 {
                for pem in pems {
                    entries.push(Attestor {
                        keys: Some(StaticKeyAttestor {
                            public_keys: pem,
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                }
                continue;
            }
        }
        entries.push(entry.clone());
    }
    AttestorSet {
        count: set.count,
        entries,
    }
}

// Splits on the PEM terminator, keeping it with each preceding block and
// dropping any trailing remainder.
fn split_pem(pem: &str) -> Vec<String> {
    const TERMINATOR: &str = "-----END PUBLIC KEY-----";
    let mut keys = Vec::new();
    let mut rest = pem;
    while let Some(at) = rest.find(TERMINATOR) {
        let end = at + TERMINATOR.len();
        keys.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    keys
}

/// Project a trust entry into the flat option record the registry client
/// accepts, plus the diagnostic path suffix for error messages. Exactly one
/// of keys/certificates/keyless is consumed, in that precedence.
pub(crate) fn build_options_and_path(
    attestor: &Attestor,
    iv_spec: &ImageVerification,
    image: &str,
    attestation: Option<&Attestation>,
) -> (VerifyOptions, &'static str) {
    let mut opts = VerifyOptions {
        image_ref: image.to_string(),
        repository: iv_spec.repository.clone(),
        annotations: iv_spec.annotations.clone().unwrap_or_default(),
        roots: iv_spec.roots.clone(),
        ..Default::default()
    };

    if let Some(attestation) = attestation {
        opts.predicate_type = Some(attestation.predicate_type.clone());
        opts.fetch_attestations = true;
    }

    let mut path = "";
    match attestor.kind() {
        Some(AttestorKind::Keys(keys)) => {
            path = ".keys";
            if !keys.public_keys.is_empty() {
                opts.key = Some(keys.public_keys.clone());
            } else if let Some(secret) = &keys.secret {
                opts.key = Some(format!("k8s://{}/{}", secret.namespace, secret.name));
            } else if let Some(kms) = &keys.kms {
                opts.key = Some(kms.clone());
            }
            if let Some(rekor) = &keys.rekor {
                opts.rekor_url = Some(rekor.url.clone());
            }
            opts.signature_algorithm = keys.signature_algorithm.clone();
        }
        Some(AttestorKind::Certificates(certificates)) => {
            path = ".certificates";
            opts.cert = certificates.certificate.clone();
            opts.cert_chain = certificates.certificate_chain.clone();
            if let Some(rekor) = &certificates.rekor {
                opts.rekor_url = Some(rekor.url.clone());
            }
        }
        Some(AttestorKind::Keyless(keyless)) => {
            path = ".keyless";
            if let Some(rekor) = &keyless.rekor {
                opts.rekor_url = Some(rekor.url.clone());
            }
            opts.roots = keyless.roots.clone();
            opts.issuer = keyless.issuer.clone();
            opts.subject = keyless.subject.clone();
            opts.additional_extensions = keyless.additional_extensions.clone().unwrap_or_default();
        }
        Some(AttestorKind::Nested(_)) | None => {}
    }

    if let Some(repository) = &attestor.repository {
        opts.repository = Some(repository.clone());
    }
    if let Some(annotations) = &attestor.annotations {
        opts.annotations = annotations.clone();
    }

    (opts, path)
}

/// The JSON-Patch `replace` pinning a resolved digest at the image's stored
/// location.
fn make_replace_digest_patch(image_info: &ImageInfo, digest: &str) -> Value {
    json!({
        "op": "replace",
        "path": image_info.pointer,
        "value": format!("{}@{digest}", image_info.reference()),
    })
}

/// Group statements by `predicateType`, preserving input order, and list the
/// types seen. Statements without the field are malformed.
fn build_statement_map(
    statements: &[Value],
) -> Result<(HashMap<&str, Vec<&Value>>, Vec<&str>)> {
    let mut by_predicate: HashMap<&str, Vec<&Value>> = HashMap::new();
    let mut types = Vec::new();
    for statement in statements {
        let predicate_type = statement
            .get("predicateType")
            .and_then(Value::as_str)
            .ok_or_else(|| ImageGateError::MalformedStatement {
                reason: "statement has no predicateType".to_string(),
            })?;
        by_predicate.entry(predicate_type).or_default().push(statement);
        types.push(predicate_type);
    }
    Ok((by_predicate, types))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PolicyContext;
    use crate::mock_client::test::MockRegistryClient;
    use crate::policy::Policy;
    use crate::resource::Resource;
    use serde_json::json;

    const KEY_A: &str = "-----BEGIN PUBLIC KEY-----\naaa\n-----END PUBLIC KEY-----";
    const KEY_B: &str = "-----BEGIN PUBLIC KEY-----\nbbb\n-----END PUBLIC KEY-----";
    const KEY_C: &str = "-----BEGIN PUBLIC KEY-----\nccc\n-----END PUBLIC KEY-----";

    fn keys_attestor(pem: &str) -> Attestor {
        Attestor {
            keys: Some(StaticKeyAttestor {
                public_keys: pem.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn nested_attestor(set: AttestorSet) -> Attestor {
        Attestor {
            attestor: Some(Box::new(set)),
            ..Default::default()
        }
    }

    fn image_info() -> ImageInfo {
        ImageInfo::parse("ghcr.io/org/app:v1", "/spec/containers/0/image").unwrap()
    }

    fn policy_context() -> PolicyContext {
        let resource = Resource::new(json!({
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {"containers": [{"name": "app", "image": "ghcr.io/org/app:v1"}]}
        }));
        PolicyContext::new(Policy::default(), resource, None)
    }

    #[test]
    fn split_pem_keeps_terminators_and_drops_the_tail() {
        let bundle = format!("{KEY_A}\n{KEY_B}\n");
        let keys = split_pem(&bundle);
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with("-----END PUBLIC KEY-----"));
        assert!(keys[1].starts_with('\n'));
        assert!(keys[1].contains("bbb"));

        assert!(split_pem("no pem here").is_empty());
    }

    #[test]
    fn expand_static_keys_splits_bundles_and_preserves_count() {
        let set = AttestorSet {
            count: Some(2),
            entries: vec![keys_attestor(&format!("{KEY_A}\n{KEY_B}"))],
        };

        let expanded = expand_static_keys(&set);
        assert_eq!(expanded.count, Some(2));
        assert_eq!(expanded.entries.len(), 2);
        for entry in &expanded.entries {
            let keys = entry.keys.as_ref().expect("expanded entry must hold keys");
            assert_eq!(split_pem(&keys.public_keys).len(), 1);
        }
    }

    #[test]
    fn expand_static_keys_is_idempotent() {
        let set = AttestorSet {
            count: None,
            entries: vec![
                keys_attestor(&format!("{KEY_A}\n{KEY_B}\n{KEY_C}")),
                Attestor::default(),
            ],
        };

        let once = expand_static_keys(&set);
        let twice = expand_static_keys(&once);
        assert_eq!(once, twice);
        assert_eq!(once.entries.len(), 4);
    }

    #[test]
    fn options_builder_key_precedence() {
        let iv_spec = ImageVerification::default();

        let (opts, path) = build_options_and_path(&keys_attestor(KEY_A), &iv_spec, "img", None);
        assert_eq!(path, ".keys");
        assert_eq!(opts.key.as_deref(), Some(KEY_A));

        let secret_attestor = Attestor {
            keys: Some(StaticKeyAttestor {
                secret: Some(crate::policy::SecretReference {
                    name: "cosign-key".to_string(),
                    namespace: "security".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (opts, _) = build_options_and_path(&secret_attestor, &iv_spec, "img", None);
        assert_eq!(opts.key.as_deref(), Some("k8s://security/cosign-key"));

        let kms_attestor = Attestor {
            keys: Some(StaticKeyAttestor {
                kms: Some("awskms:///alias/signer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (opts, _) = build_options_and_path(&kms_attestor, &iv_spec, "img", None);
        assert_eq!(opts.key.as_deref(), Some("awskms:///alias/signer"));
    }

    #[test]
    fn options_builder_attestor_overrides_and_attestation_fields() {
        let iv_spec = ImageVerification {
            repository: Some("ghcr.io/org/sigs".to_string()),
            annotations: Some(HashMap::from([("env".to_string(), "prod".to_string())])),
            ..Default::default()
        };
        let attestor = Attestor {
            repository: Some("ghcr.io/org/alt-sigs".to_string()),
            annotations: Some(HashMap::from([("team".to_string(), "sec".to_string())])),
            keyless: Some(crate::policy::KeylessAttestor {
                issuer: Some("https://accounts.example.com".to_string()),
                subject: Some("release@example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let attestation = Attestation {
            predicate_type: "https://slsa.dev/provenance/v1".to_string(),
            ..Default::default()
        };

        let (opts, path) =
            build_options_and_path(&attestor, &iv_spec, "img", Some(&attestation));
        assert_eq!(path, ".keyless");
        assert_eq!(opts.repository.as_deref(), Some("ghcr.io/org/alt-sigs"));
        assert_eq!(opts.annotations.get("team").map(String::as_str), Some("sec"));
        assert!(opts.annotations.get("env").is_none());
        assert_eq!(opts.issuer.as_deref(), Some("https://accounts.example.com"));
        assert!(opts.fetch_attestations);
        assert_eq!(
            opts.predicate_type.as_deref(),
            Some("https://slsa.dev/provenance/v1")
        );
    }

    #[test]
    fn digest_patch_targets_the_image_pointer() {
        let info = image_info();
        let patch = make_replace_digest_patch(&info, "sha256:abcd");
        assert_eq!(
            patch,
            json!({
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "ghcr.io/org/app:v1@sha256:abcd",
            })
        );
    }

    #[test]
    fn statement_map_groups_by_predicate_preserving_order() {
        let statements = vec![
            json!({"predicateType": "vuln", "predicate": {"id": 1}}),
            json!({"predicateType": "provenance", "predicate": {"id": 2}}),
            json!({"predicateType": "vuln", "predicate": {"id": 3}}),
        ];
        let (by_predicate, types) = build_statement_map(&statements).unwrap();
        assert_eq!(types, vec!["vuln", "provenance", "vuln"]);
        let vulns = &by_predicate["vuln"];
        assert_eq!(vulns[0]["predicate"]["id"], 1);
        assert_eq!(vulns[1]["predicate"]["id"], 3);
    }

    #[test]
    fn statement_without_predicate_type_is_malformed() {
        let statements = vec![json!({"predicate": {}})];
        assert!(matches!(
            build_statement_map(&statements).unwrap_err(),
            ImageGateError::MalformedStatement { .. }
        ));
    }

    #[tokio::test]
    async fn quorum_short_circuits_after_required_count() {
        let client = MockRegistryClient {
            digest: "sha256:abcd".to_string(),
            ..Default::default()
        };
        let mut pctx = policy_context();
        let mut resp = EngineResponse::default();
        let mut ivm = ImageVerificationMetadata::default();
        let rule = Rule::default();
        let cancel = CancellationToken::new();
        let verifier = ImageVerifier {
            client: &client,
            policy_context: &mut pctx,
            rule: &rule,
            resp: &mut resp,
            ivm: &mut ivm,
            cancel: &cancel,
        };

        let set = AttestorSet {
            count: Some(1),
            entries: vec![keys_attestor(KEY_A), keys_attestor(KEY_B)],
        };
        let iv_spec = ImageVerification::default();
        let info = image_info();

        let signature = verifier
            .verify_attestor_set(set, &iv_spec, &info, ".attestors[0]".to_string(), 0)
            .await
            .unwrap();
        assert_eq!(signature.digest, "sha256:abcd");
        assert_eq!(client.signature_calls(), 1);
    }

    #[tokio::test]
    async fn quorum_failure_combines_entry_errors_with_paths() {
        let client = MockRegistryClient {
            digest: "sha256:abcd".to_string(),
            valid_keys: vec![KEY_C.to_string()],
            ..Default::default()
        };
        let mut pctx = policy_context();
        let mut resp = EngineResponse::default();
        let mut ivm = ImageVerificationMetadata::default();
        let rule = Rule::default();
        let cancel = CancellationToken::new();
        let verifier = ImageVerifier {
            client: &client,
            policy_context: &mut pctx,
            rule: &rule,
            resp: &mut resp,
            ivm: &mut ivm,
            cancel: &cancel,
        };

        let set = AttestorSet {
            count: None,
            entries: vec![keys_attestor(KEY_A), keys_attestor(KEY_B)],
        };
        let iv_spec = ImageVerification::default();
        let info = image_info();

        let err = verifier
            .verify_attestor_set(set, &iv_spec, &info, ".attestors[0]".to_string(), 0)
            .await
            .unwrap_err();
        match err {
            ImageGateError::QuorumNotMet { message, network } => {
                assert!(!network);
                assert!(message.contains(".attestors[0].entries[0].keys:"));
                assert!(message.contains(".attestors[0].entries[1].keys:"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_sets_recurse_with_their_own_quorum() {
        let client = MockRegistryClient {
            digest: "sha256:abcd".to_string(),
            valid_keys: vec![KEY_B.to_string()],
            ..Default::default()
        };
        let mut pctx = policy_context();
        let mut resp = EngineResponse::default();
        let mut ivm = ImageVerificationMetadata::default();
        let rule = Rule::default();
        let cancel = CancellationToken::new();
        let verifier = ImageVerifier {
            client: &client,
            policy_context: &mut pctx,
            rule: &rule,
            resp: &mut resp,
            ivm: &mut ivm,
            cancel: &cancel,
        };

        let nested = AttestorSet {
            count: Some(1),
            entries: vec![keys_attestor(KEY_A), keys_attestor(KEY_B)],
        };
        let set = AttestorSet {
            count: None,
            entries: vec![nested_attestor(nested)],
        };
        let iv_spec = ImageVerification::default();
        let info = image_info();

        let signature = verifier
            .verify_attestor_set(set, &iv_spec, &info, ".attestors[0]".to_string(), 0)
            .await
            .unwrap();
        assert_eq!(signature.digest, "sha256:abcd");
        assert_eq!(client.signature_calls(), 2);
    }

    #[tokio::test]
    async fn nested_depth_is_bounded() {
        let client = MockRegistryClient::default();
        let mut pctx = policy_context();
        let mut resp = EngineResponse::default();
        let mut ivm = ImageVerificationMetadata::default();
        let rule = Rule::default();
        let cancel = CancellationToken::new();
        let verifier = ImageVerifier {
            client: &client,
            policy_context: &mut pctx,
            rule: &rule,
            resp: &mut resp,
            ivm: &mut ivm,
            cancel: &cancel,
        };

        let mut set = AttestorSet {
            count: None,
            entries: vec![keys_attestor(KEY_A)],
        };
        for _ in 0..(MAX_NESTED_ATTESTOR_DEPTH + 1) {
            set = AttestorSet {
                count: None,
                entries: vec![nested_attestor(set)],
            };
        }
        let iv_spec = ImageVerification::default();
        let info = image_info();

        let err = verifier
            .verify_attestor_set(set, &iv_spec, &info, String::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageGateError::QuorumNotMet { .. }
        ));
        assert_eq!(client.signature_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_operational() {
        let client = MockRegistryClient::default();
        let mut pctx = policy_context();
        let mut resp = EngineResponse::default();
        let mut ivm = ImageVerificationMetadata::default();
        let rule = Rule::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let verifier = ImageVerifier {
            client: &client,
            policy_context: &mut pctx,
            rule: &rule,
            resp: &mut resp,
            ivm: &mut ivm,
            cancel: &cancel,
        };

        let set = AttestorSet {
            count: None,
            entries: vec![keys_attestor(KEY_A)],
        };
        let iv_spec = ImageVerification::default();
        let info = image_info();

        let err = verifier
            .verify_attestor_set(set, &iv_spec, &info, String::new(), 0)
            .await
            .unwrap_err();
        assert!(err.is_operational());
        assert_eq!(client.signature_calls(), 0);
    }
}
