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

//! Rule match/exclude filtering against the admission resource.

use tracing::debug;

use crate::policy::{ResourceFilter, Rule};
use crate::resource::Resource;
use crate::wildcard;

/// Whether the rule's match filter selects the resource and its exclude
/// filter does not.
pub fn rule_matches(rule: &Rule, resource: &Resource) -> bool {
    if !filter_selects(&rule.match_resources, resource) {
        debug!(rule = %rule.name, "resource does not match rule");
        return false;
    }
    if !rule.exclude.is_empty() && filter_selects(&rule.exclude, resource) {
        debug!(rule = %rule.name, "resource excluded by rule");
        return false;
    }
    true
}

// An empty dimension matches everything; a populated one requires a glob hit.
fn filter_selects(filter: &ResourceFilter, resource: &Resource) -> bool {
    if !filter.kinds.is_empty() && !wildcard::matches_any(&filter.kinds, resource.kind()) {
        return false;
    }
    if !filter.names.is_empty() && !wildcard::matches_any(&filter.names, resource.name()) {
        return false;
    }
    if !filter.namespaces.is_empty()
        && !wildcard::matches_any(&filter.namespaces, resource.namespace())
    {
        return false;
    }
    true
}
