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

//! The image-verify annotation: the per-image verification record written to
//! admitted resources and protected from tampering by the engine.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::errors::{ImageGateError, Result};
use crate::resource::Resource;

/// Annotation recording verification state per image reference. Compared
/// between old and new resources on UPDATE; any change fails the rule.
pub const IMAGE_VERIFY_ANNOTATION: &str = "imagegate.dev/verify-images";

/// Accumulates the per-image `verified` bit for later annotation
/// materialization. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageVerificationMetadata {
    verified: BTreeMap<String, bool>,
}

impl ImageVerificationMetadata {
    pub fn add(&mut self, image: &str, verified: bool) {
        self.verified.insert(image.to_string(), verified);
    }

    pub fn is_verified(&self, image: &str) -> bool {
        self.verified.get(image).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.verified.is_empty()
    }

    pub fn merge(&mut self, other: &ImageVerificationMetadata) {
        for (image, verified) in &other.verified {
            self.verified.insert(image.clone(), *verified);
        }
    }

    /// JSON patches materializing the accumulated bits onto the resource's
    /// image-verify annotation, merged over any value already present.
    pub fn annotation_patches(&self, resource: &Resource) -> Result<Vec<Value>> {
        if self.verified.is_empty() {
            return Ok(Vec::new());
        }

        let existing = parse_verified_annotation(resource)?;
        let mut merged = existing.clone();
        for (image, verified) in &self.verified {
            merged.insert(image.clone(), *verified);
        }

        let mut patches = Vec::new();
        if resource.pointer("/metadata/annotations").is_none() {
            patches.push(json!({
                "op": "add",
                "path": "/metadata/annotations",
                "value": {},
            }));
        }

        let op = if resource.annotation(IMAGE_VERIFY_ANNOTATION).is_some() {
            "replace"
        } else {
            "add"
        };
        patches.push(json!({
            "op": op,
            "path": format!("/metadata/annotations/{}", escape_pointer_token(IMAGE_VERIFY_ANNOTATION)),
            "value": serde_json::to_string(&merged)?,
        }));
        Ok(patches)
    }
}

/// Whether the resource's image-verify annotation already records this image
/// as verified.
pub fn is_image_verified(resource: &Resource, image: &str) -> Result<bool> {
    let verified = parse_verified_annotation(resource)?;
    Ok(verified.get(image).copied().unwrap_or(false))
}

fn parse_verified_annotation(resource: &Resource) -> Result<BTreeMap<String, bool>> {
    let Some(raw) = resource.annotation(IMAGE_VERIFY_ANNOTATION) else {
        return Ok(BTreeMap::new());
    };
    serde_json::from_str(&raw).map_err(|err| ImageGateError::MalformedAnnotation {
        key: IMAGE_VERIFY_ANNOTATION.to_string(),
        reason: err.to_string(),
    })
}

// RFC 6901 token escaping: the annotation key contains a '/'.
fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
