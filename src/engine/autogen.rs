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

//! Auto-generation of controller-derived rules.
//!
//! A rule matching `Pod` also covers the workload controllers that create
//! pods: the engine derives an `autogen-` twin matching those kinds. The
//! standard image extraction already understands pod template paths, so the
//! derived rule needs no extractor changes.

use crate::policy::{Policy, Rule, AUTOGEN_CONTROLLERS_ANNOTATION};

const DEFAULT_CONTROLLERS: &[&str] = &["DaemonSet", "Deployment", "Job", "StatefulSet", "CronJob"];

/// The effective rule list for one policy: declared rules followed by their
/// auto-generated controller twins.
pub fn compute_rules(policy: &Policy) -> Vec<Rule> {
    let mut rules = policy.spec.rules.clone();

    let controllers: Vec<String> = match policy.annotations.get(AUTOGEN_CONTROLLERS_ANNOTATION) {
        Some(value) if value == "none" => return rules,
        Some(value) => value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => DEFAULT_CONTROLLERS.iter().map(|s| s.to_string()).collect(),
    };
    if controllers.is_empty() {
        return rules;
    }

    for rule in &policy.spec.rules {
        if rule.verify_images.is_empty() || !targets_pods(rule) {
            continue;
        }
        rules.push(controller_rule(rule, &controllers));
    }
    rules
}

fn targets_pods(rule: &Rule) -> bool {
    rule.match_resources.kinds.iter().any(|k| k == "Pod")
}

fn controller_rule(rule: &Rule, controllers: &[String]) -> Rule {
    let mut derived = rule.clone();
    derived.name = format!("autogen-{}", rule.name);
    derived.match_resources.kinds = controllers.to_vec();
    if derived.exclude.kinds.iter().any(|k| k == "Pod") {
        derived.exclude.kinds = controllers.to_vec();
    }
    derived
}
