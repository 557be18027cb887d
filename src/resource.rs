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

//! A thin wrapper around an unstructured Kubernetes resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An admission resource as an untyped JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(pub Value);

impl Resource {
    pub fn new(value: Value) -> Self {
        Resource(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    /// Resource annotations; missing or malformed metadata yields an empty
    /// map.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        if let Some(map) = self
            .0
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
        {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    annotations.insert(key.clone(), value.to_string());
                }
            }
        }
        annotations
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.0
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// RFC 6901 lookup into the resource document.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    fn metadata_str(&self, field: &str) -> &str {
        self.0
            .pointer(&format!("/metadata/{field}"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Resource {
        Resource::new(json!({
            "kind": "Pod",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "annotations": {"team": "platform"}
            },
            "spec": {"containers": [{"name": "app", "image": "ghcr.io/org/app:v1"}]}
        }))
    }

    #[test]
    fn accessors() {
        let pod = pod();
        assert_eq!(pod.kind(), "Pod");
        assert_eq!(pod.name(), "web");
        assert_eq!(pod.namespace(), "prod");
        assert_eq!(pod.annotation("team").as_deref(), Some("platform"));
        assert_eq!(pod.annotation("missing"), None);
        assert_eq!(
            pod.pointer("/spec/containers/0/image").and_then(Value::as_str),
            Some("ghcr.io/org/app:v1")
        );
    }

    #[test]
    fn missing_metadata_is_tolerated() {
        let resource = Resource::new(json!({"kind": "ConfigMap"}));
        assert_eq!(resource.name(), "");
        assert!(resource.annotations().is_empty());
    }
}
