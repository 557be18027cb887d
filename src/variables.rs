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

//! `{{ … }}` variable substitution over policy documents and evaluation of
//! the any/all condition tree.

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::EvalContext;
use crate::errors::{ImageGateError, Result};
use crate::policy::{AnyAllConditions, Condition, Rule};

/// Substitute every `{{ path }}` occurrence in the rule against the context.
///
/// Attestation conditions must not be substituted here: their variables
/// resolve against per-statement predicates later. Callers strip and
/// reattach them.
pub fn substitute_all_in_rule(ctx: &EvalContext, rule: &Rule) -> Result<Rule> {
    let raw = serde_json::to_value(rule)?;
    let substituted = substitute_value(ctx, raw)?;
    Ok(serde_json::from_value(substituted)?)
}

/// Substitute variables inside a condition tree.
pub fn substitute_all_in_conditions(
    ctx: &EvalContext,
    conditions: &[AnyAllConditions],
) -> Result<Vec<AnyAllConditions>> {
    let raw = serde_json::to_value(conditions)?;
    let substituted = substitute_value(ctx, raw)?;
    Ok(serde_json::from_value(substituted)?)
}

/// Evaluate a (substituted) condition tree. Blocks combine with AND; inside
/// a block every `all` condition must hold and, when present, at least one
/// `any` condition. Operator/operand mismatches evaluate to false.
pub fn evaluate_any_all_conditions(ctx: &EvalContext, conditions: &[AnyAllConditions]) -> bool {
    conditions.iter().all(|block| {
        let all = block.all.iter().all(|c| evaluate_condition(ctx, c));
        let any = block.any.is_empty() || block.any.iter().any(|c| evaluate_condition(ctx, c));
        all && any
    })
}

fn evaluate_condition(ctx: &EvalContext, condition: &Condition) -> bool {
    let key = match resolve_operand(ctx, &condition.key) {
        Ok(key) => key,
        Err(err) => {
            warn!(%err, "condition key could not be resolved");
            return false;
        }
    };
    let value = match resolve_operand(ctx, &condition.value) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "condition value could not be resolved");
            return false;
        }
    };

    match condition.operator.apply(&key, &value) {
        Some(result) => result,
        None => {
            debug!(operator = ?condition.operator, "operands do not fit the operator");
            false
        }
    }
}

fn resolve_operand(ctx: &EvalContext, operand: &Value) -> Result<Value> {
    substitute_value(ctx, operand.clone())
}

fn substitute_value(ctx: &EvalContext, value: Value) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(ctx, &s),
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| substitute_value(ctx, item))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, substitute_value(ctx, item)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn substitute_string(ctx: &EvalContext, input: &str) -> Result<Value> {
    // A string that is exactly one variable keeps the resolved value's type.
    if let Some(expr) = sole_variable(input) {
        return lookup(ctx, expr);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let expr = rest[start + 2..start + len].trim();
        let resolved = lookup(ctx, expr)?;
        match resolved {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn sole_variable(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") {
        return None;
    }
    Some(inner.trim())
}

fn lookup(ctx: &EvalContext, expr: &str) -> Result<Value> {
    ctx.resolve(expr)
        .ok_or_else(|| ImageGateError::UnresolvedVariable {
            variable: expr.to_string(),
        })
}
