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

//! Per-rule and per-policy verdict records.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Verdict of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// The rule verified successfully.
    Pass,
    /// Verification contradicted the policy.
    Fail,
    /// Transient or operational failure; retryable upstream.
    Error,
    /// The rule did not apply.
    Skip,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleStatus::Pass => write!(f, "pass"),
            RuleStatus::Fail => write!(f, "fail"),
            RuleStatus::Error => write!(f, "error"),
            RuleStatus::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    #[default]
    ImageVerify,
}

/// Result for one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub name: String,
    pub rule_type: RuleType,
    pub status: RuleStatus,
    pub message: String,

    /// JSON-Patch operations, in image discovery order.
    #[serde(default)]
    pub patches: Vec<Value>,
}

impl RuleResponse {
    pub fn new(rule_name: &str, status: RuleStatus, message: String) -> Self {
        RuleResponse {
            name: rule_name.to_string(),
            rule_type: RuleType::ImageVerify,
            status,
            message,
            patches: Vec::new(),
        }
    }
}

/// Result for the whole policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub rules: Vec<RuleResponse>,
    pub rules_applied_count: usize,
    pub rules_error_count: usize,
    pub processing_time: Duration,
}

impl EngineResponse {
    /// Record a rule response, keeping the aggregate counts in step.
    pub fn add(&mut self, response: RuleResponse) {
        self.rules_applied_count += 1;
        if response.status == RuleStatus::Error {
            self.rules_error_count += 1;
        }
        self.rules.push(response);
    }

    /// Whether no rule failed or errored.
    pub fn is_successful(&self) -> bool {
        !self
            .rules
            .iter()
            .any(|r| matches!(r.status, RuleStatus::Fail | RuleStatus::Error))
    }

    /// All patches across rules, in rule declaration order.
    pub fn patches(&self) -> Vec<Value> {
        self.rules
            .iter()
            .flat_map(|r| r.patches.iter().cloned())
            .collect()
    }
}
