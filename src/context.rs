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

//! The JSON evaluation context.
//!
//! A stack of JSON object frames with checkpoint/restore, shared by variable
//! substitution and condition evaluation. Not thread-safe: one context per
//! admission request.

use serde_json::{json, Value};

use crate::errors::{ImageGateError, Result};
use crate::images::ImageInfo;
use crate::resource::Resource;

/// Per-admission mutable evaluation context.
///
/// Frames added later shadow earlier ones during [`resolve`](Self::resolve).
/// `checkpoint` marks the current depth, `restore` pops back to (and
/// removes) the mark, and `reset` pops back while keeping the mark so the
/// same baseline can be reused across rules.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    frames: Vec<Value>,
    checkpoints: Vec<usize>,
}

impl EvalContext {
    /// Seed a context with the admission request payload.
    pub fn new(new_resource: &Resource, old_resource: Option<&Resource>, operation: &str) -> Self {
        let request = json!({
            "request": {
                "object": new_resource.as_value().clone(),
                "oldObject": old_resource.map(|r| r.as_value().clone()).unwrap_or(Value::Null),
                "operation": operation,
            }
        });
        EvalContext {
            frames: vec![request],
            checkpoints: Vec::new(),
        }
    }

    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.frames.len());
    }

    /// Drop every frame added since the last checkpoint and pop the mark.
    pub fn restore(&mut self) {
        if let Some(depth) = self.checkpoints.pop() {
            self.frames.truncate(depth);
        }
    }

    /// Drop every frame added since the last checkpoint, keeping the mark.
    pub fn reset(&mut self) {
        if let Some(depth) = self.checkpoints.last() {
            self.frames.truncate(*depth);
        }
    }

    /// Scoped checkpoint: restores on drop.
    pub fn scoped(&mut self) -> ContextGuard<'_> {
        self.checkpoint();
        ContextGuard { ctx: self }
    }

    /// Add a JSON object frame. Non-object values are rejected.
    pub fn add_json_object(&mut self, object: Value) -> Result<()> {
        if !object.is_object() {
            return Err(ImageGateError::ContextLoad {
                entry: "json object".to_string(),
                reason: "not a JSON object".to_string(),
            });
        }
        self.frames.push(object);
        Ok(())
    }

    /// Expose an image under the `image` key.
    pub fn add_image_info(&mut self, info: &ImageInfo) -> Result<()> {
        self.add_json_object(json!({
            "image": {
                "reference": info.reference(),
                "registry": info.registry,
                "repository": info.repository,
                "tag": info.tag,
                "digest": info.digest,
            }
        }))
    }

    /// Expose a named variable.
    pub fn add_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.add_json_object(json!({ name: value }))
    }

    /// Resolve a dotted path (`request.object.spec.containers[0].image`)
    /// against the context, newest frame first.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let segments = parse_path(path)?;
        self.frames
            .iter()
            .rev()
            .find_map(|frame| resolve_in(frame, &segments).cloned())
    }

    /// Whether the value at `pointer` (RFC 6901) differs between the new and
    /// old resource. Errors when either resource is absent, so callers fall
    /// back to verification.
    pub fn has_changed(&self, pointer: &str) -> Result<bool> {
        let new = self
            .resolve("request.object")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ImageGateError::ContextLoad {
                entry: "request.object".to_string(),
                reason: "resource not found in context".to_string(),
            })?;
        let old = self
            .resolve("request.oldObject")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ImageGateError::ContextLoad {
                entry: "request.oldObject".to_string(),
                reason: "old resource not found in context".to_string(),
            })?;

        Ok(new.pointer(pointer) != old.pointer(pointer))
    }
}

/// RAII checkpoint; restores the wrapped context on drop.
pub struct ContextGuard<'a> {
    ctx: &'a mut EvalContext,
}

impl std::ops::Deref for ContextGuard<'_> {
    type Target = EvalContext;

    fn deref(&self) -> &EvalContext {
        self.ctx
    }
}

impl std::ops::DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut EvalContext {
        self.ctx
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.ctx.restore();
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let (key, indexes) = match part.find('[') {
            Some(at) => part.split_at(at),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }
        for index in indexes.split(['[', ']']).filter(|s| !s.is_empty()) {
            segments.push(Segment::Index(index.parse().ok()?));
        }
    }
    Some(segments)
}

fn resolve_in<'a>(frame: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = frame;
    for segment in segments {
        current = match segment {
            Segment::Key(key) => current.get(key.as_str())?,
            Segment::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}
