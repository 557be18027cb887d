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

//! Classic `*`/`?` wildcard matching over full strings.
//!
//! Built on [`globset`] with its default separator semantics, so `*` crosses
//! `/` boundaries: `ghcr.io/org/*` matches `ghcr.io/org/team/app:v1`.

use globset::Glob;
use tracing::warn;

/// Whether `candidate` matches the wildcard `pattern`. Unparseable patterns
/// never match.
pub(crate) fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        Err(err) => {
            warn!(pattern, %err, "ignoring invalid wildcard pattern");
            false
        }
    }
}

/// Whether `candidate` matches any of `patterns`.
pub(crate) fn matches_any<S: AsRef<str>>(patterns: &[S], candidate: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| wildcard_match(pattern.as_ref(), candidate))
}
