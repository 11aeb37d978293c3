use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub const CONTRACT_ID: &str = "fieldflat.rule_contract";
pub const CONTRACT_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionType {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    IsChecked,
    IsNotChecked,
    IsEmpty,
    IsNotEmpty,
    StartsWith,
    EndsWith,
    MatchesRegex,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Equals => "equals",
            ConditionType::NotEquals => "notEquals",
            ConditionType::Contains => "contains",
            ConditionType::NotContains => "notContains",
            ConditionType::GreaterThan => "greaterThan",
            ConditionType::LessThan => "lessThan",
            ConditionType::GreaterOrEqual => "greaterOrEqual",
            ConditionType::LessOrEqual => "lessOrEqual",
            ConditionType::IsChecked => "isChecked",
            ConditionType::IsNotChecked => "isNotChecked",
            ConditionType::IsEmpty => "isEmpty",
            ConditionType::IsNotEmpty => "isNotEmpty",
            ConditionType::StartsWith => "startsWith",
            ConditionType::EndsWith => "endsWith",
            ConditionType::MatchesRegex => "matchesRegex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl SimpleCondition {
    pub fn new(kind: ConditionType, field_id: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind,
            field_id: Some(field_id.into()),
            value: Some(value.into()),
        }
    }

    /// Field id with blank ids treated as absent.
    pub fn source_field(&self) -> Option<&str> {
        self.field_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Textual form of the comparison value. Numbers and booleans compare through their
    /// JSON text; null and absent values are empty.
    pub fn value_text(&self) -> String {
        match &self.value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundCondition {
    pub operator: LogicOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Compound(CompoundCondition),
    Simple(SimpleCondition),
}

impl Condition {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: LogicOperator::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: LogicOperator::Or,
            conditions,
        })
    }

    /// Every field id referenced anywhere in the tree.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_fields(self, &mut out);
        out
    }
}

fn collect_fields<'a>(condition: &'a Condition, out: &mut Vec<&'a str>) {
    match condition {
        Condition::Simple(simple) => {
            if let Some(id) = simple.source_field() {
                out.push(id);
            }
        }
        Condition::Compound(compound) => {
            for child in &compound.conditions {
                collect_fields(child, out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Show,
    Hide,
    Require,
    MakeOptional,
    SetValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl RuleAction {
    pub fn new(kind: ActionType) -> Self {
        Self { kind, value: None }
    }

    pub fn value_text(&self) -> String {
        match &self.value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalLogicRule {
    pub condition: Condition,
    pub action: RuleAction,
    pub target_field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_visible: Option<bool>,
    // Keys written by newer producers survive a parse/serialize round trip.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ConditionalLogicRule {
    pub fn new(condition: Condition, action: RuleAction, target_field_id: impl Into<String>) -> Self {
        Self {
            condition,
            action,
            target_field_id: target_field_id.into(),
            is_visible: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub enum RuleParseError {
    Empty,
    Json(serde_json::Error),
}

impl fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleParseError::Empty => write!(f, "conditional logic is empty"),
            RuleParseError::Json(err) => write!(f, "invalid conditional logic: {}", err),
        }
    }
}

impl std::error::Error for RuleParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuleParseError::Json(err) => Some(err),
            RuleParseError::Empty => None,
        }
    }
}

impl From<serde_json::Error> for RuleParseError {
    fn from(value: serde_json::Error) -> Self {
        RuleParseError::Json(value)
    }
}

pub fn parse_rule(raw: &str) -> Result<ConditionalLogicRule, RuleParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RuleParseError::Empty);
    }
    Ok(serde_json::from_str(raw)?)
}

pub fn serialize_rule(rule: &ConditionalLogicRule) -> String {
    // A struct of strings, enums and JSON values always serializes.
    serde_json::to_string(rule).unwrap_or_default()
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Stable fingerprint of a rule's semantics. The cached `isVisible` flag does not take
/// part, so re-evaluating a rule never changes its fingerprint.
pub fn rule_fingerprint(rule: &ConditionalLogicRule) -> String {
    let mut canonical = rule.clone();
    canonical.is_visible = None;
    let value = serde_json::to_value(&canonical).unwrap_or(Value::Null);
    hex_sha256(value.to_string().as_bytes())
}

pub fn contract_fingerprint_sha256() -> String {
    hex_sha256(format!("{CONTRACT_ID}:{CONTRACT_VERSION}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_WHEN_CHECKED: &str = r#"{
        "condition": {"type": "isChecked", "fieldId": "agree"},
        "action": {"type": "show"},
        "targetFieldId": "details"
    }"#;

    #[test]
    fn parses_simple_rule() {
        let rule = parse_rule(SHOW_WHEN_CHECKED).expect("rule");
        assert_eq!(rule.target_field_id, "details");
        assert_eq!(rule.action.kind, ActionType::Show);
        let Condition::Simple(simple) = &rule.condition else {
            panic!("expected simple condition");
        };
        assert_eq!(simple.kind, ConditionType::IsChecked);
        assert_eq!(simple.source_field(), Some("agree"));
        assert!(rule.is_visible.is_none());
    }

    #[test]
    fn parses_nested_compound_rule() {
        let raw = r#"{
            "condition": {"operator": "or", "conditions": [
                {"type": "equals", "fieldId": "a", "value": "x"},
                {"operator": "and", "conditions": [
                    {"type": "greaterThan", "fieldId": "b", "value": 10},
                    {"type": "isNotEmpty", "fieldId": "c"}
                ]}
            ]},
            "action": {"type": "setValue", "value": "done"},
            "targetFieldId": "d"
        }"#;
        let rule = parse_rule(raw).expect("rule");
        let Condition::Compound(top) = &rule.condition else {
            panic!("expected compound");
        };
        assert_eq!(top.operator, LogicOperator::Or);
        assert_eq!(top.conditions.len(), 2);
        assert_eq!(rule.condition.referenced_fields(), vec!["a", "b", "c"]);
        assert_eq!(rule.action.value_text(), "done");
    }

    #[test]
    fn numeric_condition_values_keep_their_text() {
        let simple = SimpleCondition::new(ConditionType::GreaterThan, "b", 10);
        assert_eq!(simple.value_text(), "10");
        let simple = SimpleCondition::new(ConditionType::Equals, "b", true);
        assert_eq!(simple.value_text(), "true");
    }

    #[test]
    fn rejects_missing_keys_and_bad_json() {
        assert!(matches!(parse_rule("  "), Err(RuleParseError::Empty)));
        assert!(matches!(parse_rule("{not json"), Err(RuleParseError::Json(_))));
        let missing_target = r#"{"condition": {"type": "isEmpty"}, "action": {"type": "hide"}}"#;
        assert!(parse_rule(missing_target).is_err());
        let unknown_type = r#"{"condition": {"type": "isPurple", "fieldId": "a"},
            "action": {"type": "hide"}, "targetFieldId": "a"}"#;
        assert!(parse_rule(unknown_type).is_err());
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = r#"{"condition": {"type": "isEmpty", "fieldId": "a"},
            "action": {"type": "hide"}, "targetFieldId": "b",
            "isVisible": false, "authoredBy": "wizard"}"#;
        let rule = parse_rule(raw).expect("rule");
        assert_eq!(rule.is_visible, Some(false));
        assert_eq!(rule.extra.get("authoredBy"), Some(&Value::from("wizard")));
        let again = parse_rule(&serialize_rule(&rule)).expect("reparse");
        assert_eq!(again, rule);
    }

    #[test]
    fn fingerprint_ignores_visibility_cache() {
        let mut rule = parse_rule(SHOW_WHEN_CHECKED).expect("rule");
        let before = rule_fingerprint(&rule);
        rule.is_visible = Some(true);
        assert_eq!(rule_fingerprint(&rule), before);
        rule.target_field_id = "other".to_string();
        assert_ne!(rule_fingerprint(&rule), before);
        assert_eq!(before.len(), 64);
    }

    #[test]
    fn contract_fingerprint_is_stable_and_nonempty() {
        let a = contract_fingerprint_sha256();
        let b = contract_fingerprint_sha256();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
