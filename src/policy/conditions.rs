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

//! The any/all condition tree attached to attestations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of the condition tree. A block passes when every `all`
/// condition holds and at least one `any` condition holds; an empty list is
/// vacuously true. Blocks in a sequence are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyAllConditions {
    #[serde(default)]
    pub any: Vec<Condition>,

    #[serde(default)]
    pub all: Vec<Condition>,
}

/// A single predicate: `key <operator> value`. `key` typically holds a
/// `{{ … }}` variable resolved against the evaluation context before the
/// comparison runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub key: Value,

    pub operator: ConditionOperator,

    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    In,
    NotIn,
    AnyIn,
    AllIn,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
}

impl ConditionOperator {
    /// Apply the operator to concrete (already substituted) operands.
    /// Returns `None` when the operands do not fit the operator, e.g. a
    /// numeric comparison over non-numbers.
    pub fn apply(&self, key: &Value, value: &Value) -> Option<bool> {
        match self {
            ConditionOperator::Equals => Some(key == value),
            ConditionOperator::NotEquals => Some(key != value),
            ConditionOperator::In => membership(key, value),
            ConditionOperator::NotIn => membership(key, value).map(|m| !m),
            ConditionOperator::AnyIn => {
                let keys = key.as_array()?;
                let set = value.as_array()?;
                Some(keys.iter().any(|k| set.contains(k)))
            }
            ConditionOperator::AllIn => {
                let keys = key.as_array()?;
                let set = value.as_array()?;
                Some(keys.iter().all(|k| set.contains(k)))
            }
            ConditionOperator::GreaterThan => numeric(key, value).map(|(k, v)| k > v),
            ConditionOperator::GreaterThanOrEquals => numeric(key, value).map(|(k, v)| k >= v),
            ConditionOperator::LessThan => numeric(key, value).map(|(k, v)| k < v),
            ConditionOperator::LessThanOrEquals => numeric(key, value).map(|(k, v)| k <= v),
        }
    }
}

fn membership(key: &Value, value: &Value) -> Option<bool> {
    let set = value.as_array()?;
    Some(set.contains(key))
}

fn numeric(key: &Value, value: &Value) -> Option<(f64, f64)> {
    Some((key.as_f64()?, value.as_f64()?))
}
