//! Evaluation of conditional-logic conditions against a field snapshot.
//!
//! Empty compound lists follow the identity elements: `and([])` holds, `or([])` does not.

use crate::model::{Field, FieldIndex};
use fieldflat_rule_contract::{
    CompoundCondition, Condition, ConditionType, LogicOperator, SimpleCondition,
};
use log::warn;
use regex::RegexBuilder;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub fn evaluate_condition(condition: &Condition, fields: &[Field]) -> bool {
    let index = FieldIndex::new(fields);
    evaluate_with_index(condition, &index)
}

pub(crate) fn evaluate_with_index(condition: &Condition, index: &FieldIndex<'_>) -> bool {
    match condition {
        Condition::Compound(compound) => evaluate_compound(compound, index),
        Condition::Simple(simple) => evaluate_simple(simple, index),
    }
}

fn evaluate_compound(compound: &CompoundCondition, index: &FieldIndex<'_>) -> bool {
    match compound.operator {
        LogicOperator::And => compound
            .conditions
            .iter()
            .all(|child| evaluate_with_index(child, index)),
        LogicOperator::Or => compound
            .conditions
            .iter()
            .any(|child| evaluate_with_index(child, index)),
    }
}

fn evaluate_simple(condition: &SimpleCondition, index: &FieldIndex<'_>) -> bool {
    let Some(field_id) = condition.source_field() else {
        return true;
    };
    let Some(actual) = index.value(field_id) else {
        return matches!(condition.kind, ConditionType::IsEmpty);
    };
    let expected = condition.value_text();

    match condition.kind {
        ConditionType::Equals => actual == expected,
        ConditionType::NotEquals => actual != expected,
        ConditionType::Contains => actual.contains(expected.as_str()),
        ConditionType::NotContains => !actual.contains(expected.as_str()),
        ConditionType::StartsWith => actual.starts_with(expected.as_str()),
        ConditionType::EndsWith => actual.ends_with(expected.as_str()),
        ConditionType::GreaterThan => coerce_number(actual) > coerce_number(&expected),
        ConditionType::LessThan => coerce_number(actual) < coerce_number(&expected),
        ConditionType::GreaterOrEqual => coerce_number(actual) >= coerce_number(&expected),
        ConditionType::LessOrEqual => coerce_number(actual) <= coerce_number(&expected),
        ConditionType::IsChecked => is_checked_value(actual),
        ConditionType::IsNotChecked => !is_checked_value(actual),
        ConditionType::IsEmpty => false,
        ConditionType::IsNotEmpty => true,
        ConditionType::MatchesRegex => matches_pattern(actual, &expected),
    }
}

pub(crate) fn is_checked_value(value: &str) -> bool {
    value == "true" || value == "checked"
}

fn matches_pattern(value: &str, pattern: &str) -> bool {
    match RegexBuilder::new(pattern).size_limit(REGEX_SIZE_LIMIT).build() {
        Ok(re) => re.is_match(value),
        Err(err) => {
            warn!("invalid regex in condition {:?}: {}", pattern, err);
            false
        }
    }
}

/// Permissive string to number conversion. Blank input is zero; anything that is not a
/// decimal, exponent, hex or infinity literal is NaN, so comparisons against it fail.
pub fn coerce_number(raw: &str) -> f64 {
    let s = raw.trim();
    if s.is_empty() {
        return 0.0;
    }
    let (sign, body) = match s.as_bytes()[0] {
        b'-' => (-1.0, &s[1..]),
        b'+' => (1.0, &s[1..]),
        _ => (1.0, s),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        // Signed hex literals are NaN.
        if sign < 0.0 || s.starts_with('+') || hex.is_empty() {
            return f64::NAN;
        }
        return u64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }
    let looks_decimal = !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
        && body.bytes().any(|b| b.is_ascii_digit());
    if !looks_decimal {
        return f64::NAN;
    }
    body.parse::<f64>().map(|v| sign * v).unwrap_or(f64::NAN)
}
