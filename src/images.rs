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

//! Image discovery: locating image references inside admission resources and
//! carrying their JSON locations for later mutation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ImageGateError, Result};
use crate::policy::ImageExtractor;
use crate::resource::Resource;

/// Container kind → container name → image. `BTreeMap` keeps iteration
/// deterministic so responses and patches appear in a stable order.
pub type ImageMap = BTreeMap<String, BTreeMap<String, ImageInfo>>;

/// A single image occurrence in a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub registry: String,
    pub repository: String,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub digest: Option<String>,

    /// RFC 6901 pointer locating the image string in the resource. Unique
    /// per occurrence.
    pub pointer: String,
}

impl ImageInfo {
    /// Parse an image reference, normalizing it through
    /// [`oci_distribution::Reference`].
    pub fn parse(raw: &str, pointer: &str) -> Result<Self> {
        let reference: oci_distribution::Reference =
            raw.parse()
                .map_err(|_| ImageGateError::ImageReferenceNotValid {
                    reference: raw.to_string(),
                })?;

        Ok(ImageInfo {
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            tag: reference.tag().map(str::to_string),
            digest: reference.digest().map(str::to_string),
            pointer: pointer.to_string(),
        })
    }

    /// The full reference string: `registry/repository[:tag][@digest]`.
    pub fn reference(&self) -> String {
        let mut image = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            image.push(':');
            image.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            image.push('@');
            image.push_str(digest);
        }
        image
    }
}

impl std::fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reference())
    }
}

// Container list locations understood by the standard extraction: plain
// pods, pod controllers, and CronJobs.
const POD_SPEC_ROOTS: &[&str] = &[
    "/spec",
    "/spec/template/spec",
    "/spec/jobTemplate/spec/template/spec",
];

const CONTAINER_KINDS: &[&str] = &["initContainers", "containers", "ephemeralContainers"];

/// Extract the grouped image map from a pod-shaped resource.
pub fn extract_images(resource: &Resource) -> ImageMap {
    let mut images = ImageMap::new();
    for root in POD_SPEC_ROOTS {
        for kind in CONTAINER_KINDS {
            let list_pointer = format!("{root}/{kind}");
            let Some(containers) = resource.pointer(&list_pointer).and_then(Value::as_array)
            else {
                continue;
            };

            for (index, container) in containers.iter().enumerate() {
                let Some(image) = container.get("image").and_then(Value::as_str) else {
                    continue;
                };
                let name = container
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let pointer = format!("{list_pointer}/{index}/image");

                match ImageInfo::parse(image, &pointer) {
                    Ok(info) => {
                        images
                            .entry(kind.to_string())
                            .or_default()
                            .insert(name, info);
                    }
                    Err(err) => {
                        tracing::warn!(image, pointer, %err, "skipping unparseable image");
                    }
                }
            }
        }
    }
    images
}

/// Extract images using rule-declared custom extractors. Extractor paths are
/// RFC 6901 pointers where a `*` segment iterates arrays.
pub fn extract_custom_images(
    resource: &Resource,
    extractors: &[ImageExtractor],
) -> Result<ImageMap> {
    let mut images = ImageMap::new();
    for extractor in extractors {
        let group = images.entry(extractor.name.clone()).or_default();
        for (pointer, node) in expand_pointer(resource.as_value(), &extractor.path)? {
            let (image, image_pointer) = match &extractor.value {
                Some(field) => {
                    let value = node.get(field.as_str()).and_then(Value::as_str).ok_or_else(
                        || ImageGateError::ImageExtraction {
                            reason: format!("no image value at {pointer}/{field}"),
                        },
                    )?;
                    (value, format!("{pointer}/{field}"))
                }
                None => {
                    let value =
                        node.as_str()
                            .ok_or_else(|| ImageGateError::ImageExtraction {
                                reason: format!("value at {pointer} is not a string"),
                            })?;
                    (value, pointer.clone())
                }
            };

            let info = ImageInfo::parse(image, &image_pointer)?;
            group.insert(image_pointer.clone(), info);
        }
    }
    Ok(images)
}

/// Resolve a pointer that may contain `*` segments into every concrete
/// `(pointer, value)` pair it covers.
fn expand_pointer<'a>(root: &'a Value, path: &str) -> Result<Vec<(String, &'a Value)>> {
    let mut matches: Vec<(String, &Value)> = vec![(String::new(), root)];
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for (pointer, node) in matches {
            if segment == "*" {
                let Some(items) = node.as_array() else {
                    continue;
                };
                for (index, item) in items.iter().enumerate() {
                    next.push((format!("{pointer}/{index}"), item));
                }
            } else if let Some(value) = node.pointer(&format!("/{segment}")) {
                next.push((format!("{pointer}/{segment}"), value));
            }
        }
        matches = next;
    }
    if matches.len() == 1 && matches[0].0.is_empty() {
        return Err(ImageGateError::ImageExtraction {
            reason: format!("extractor path {path} is empty"),
        });
    }
    Ok(matches)
}
