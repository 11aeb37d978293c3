//! Conditional-logic rules: parsing a field's `conditionalLogic` and turning it into
//! effects on the rule's target field.

use crate::condition::evaluate_with_index;
use crate::model::{Field, FieldIndex};
use fieldflat_rule_contract::{ActionType, ConditionalLogicRule, RuleParseError, rule_fingerprint};
use log::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Visibility(bool),
    Required(bool),
    SetValue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleEffect {
    /// Field whose `conditionalLogic` produced the effect.
    pub source_field_id: String,
    pub target_field_id: String,
    pub effect: Effect,
}

/// Parses a serialized rule. Anything that is not an object with `condition`, `action`
/// and `targetFieldId` counts as no rule at all.
pub fn parse_rule(raw: &str) -> Option<ConditionalLogicRule> {
    match fieldflat_rule_contract::parse_rule(raw) {
        Ok(rule) => Some(rule),
        Err(RuleParseError::Empty) => None,
        Err(err) => {
            warn!("ignoring conditional logic: {}", err);
            None
        }
    }
}

/// Id of the field a rule acts on. A blank target means the owning field.
pub fn rule_target<'a>(rule: &'a ConditionalLogicRule, owner: &'a Field) -> &'a str {
    let target = rule.target_field_id.trim();
    if target.is_empty() {
        owner.id.as_str()
    } else {
        target
    }
}

/// True unless a show/hide rule targeting `field` says otherwise. Rules combine with AND.
pub fn evaluate_visibility(field: &Field, fields: &[Field]) -> bool {
    let index = FieldIndex::new(fields);
    let in_snapshot = fields.iter().any(|f| std::ptr::eq(f, field));
    let mut visible = true;
    for owner in fields.iter().chain((!in_snapshot).then_some(field)) {
        let Some(rule) = parse_rule(&owner.conditional_logic) else {
            continue;
        };
        if rule_target(&rule, owner) != field.id {
            continue;
        }
        if let Some(Effect::Visibility(shown)) = effect_of(&rule, &index) {
            visible &= shown;
        }
    }
    visible
}

/// Every effect the document's rules currently produce, in field order.
pub fn resolve_rule_effects(fields: &[Field]) -> Vec<RuleEffect> {
    let index = FieldIndex::new(fields);
    resolve_with_index(fields, &index)
}

pub(crate) fn resolve_with_index(fields: &[Field], index: &FieldIndex<'_>) -> Vec<RuleEffect> {
    let mut effects = Vec::new();
    for owner in fields {
        let Some(rule) = parse_rule(&owner.conditional_logic) else {
            continue;
        };
        let target = rule_target(&rule, owner);
        if index.get(target).is_none() {
            warn!(
                "rule {} on field {} targets missing field {}; dropped",
                rule_fingerprint(&rule),
                owner.id,
                target
            );
            continue;
        }
        for source in unresolved_sources(&rule, index) {
            debug!(
                "rule on field {} reads missing field {}; condition uses defaults",
                owner.id, source
            );
        }
        if let Some(effect) = effect_of(&rule, index) {
            debug!("field {} -> {}: {:?}", owner.id, target, effect);
            effects.push(RuleEffect {
                source_field_id: owner.id.clone(),
                target_field_id: target.to_string(),
                effect,
            });
        }
    }
    effects
}

/// Field ids the rule's condition reads that are absent from the snapshot.
pub(crate) fn unresolved_sources<'r>(
    rule: &'r ConditionalLogicRule,
    index: &FieldIndex<'_>,
) -> Vec<&'r str> {
    let mut missing: Vec<&str> = Vec::new();
    for id in rule.condition.referenced_fields() {
        if index.get(id).is_none() && !missing.contains(&id) {
            missing.push(id);
        }
    }
    missing
}

fn effect_of(rule: &ConditionalLogicRule, index: &FieldIndex<'_>) -> Option<Effect> {
    let holds = evaluate_with_index(&rule.condition, index);
    match rule.action.kind {
        ActionType::Show => Some(Effect::Visibility(holds)),
        ActionType::Hide => Some(Effect::Visibility(!holds)),
        ActionType::Require => holds.then_some(Effect::Required(true)),
        ActionType::MakeOptional => holds.then_some(Effect::Required(false)),
        ActionType::SetValue => holds.then(|| Effect::SetValue(rule.action.value_text())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    fn checkbox(id: &str, value: &str) -> Field {
        Field::new(id, FieldType::Checkbox).with_value(value)
    }

    fn rule(kind: &str, target: &str, action: &str) -> String {
        format!(
            r#"{{"condition":{{"type":"{}","fieldId":"agree"}},"action":{{"type":"{}","value":"auto"}},"targetFieldId":"{}"}}"#,
            kind, action, target
        )
    }

    #[test]
    fn show_rule_follows_its_condition() {
        let details = Field::new("details", FieldType::Text).with_rule(rule("isChecked", "", "show"));
        let on = vec![checkbox("agree", "true"), details.clone()];
        let off = vec![checkbox("agree", "false"), details.clone()];
        assert!(evaluate_visibility(&on[1], &on));
        assert!(!evaluate_visibility(&off[1], &off));
    }

    #[test]
    fn rules_on_other_fields_target_by_id() {
        let fields = vec![
            checkbox("agree", "true").with_rule(rule("isChecked", "notes", "hide")),
            Field::new("notes", FieldType::Text),
        ];
        assert!(!evaluate_visibility(&fields[1], &fields));
        assert!(evaluate_visibility(&fields[0], &fields));
    }

    #[test]
    fn field_outside_the_snapshot_still_reads_its_own_rule() {
        let fields = vec![checkbox("agree", "")];
        let loose = Field::new("loose", FieldType::Text).with_rule(rule("isChecked", "", "show"));
        assert!(!evaluate_visibility(&loose, &fields));
    }

    #[test]
    fn unresolved_sources_lists_missing_condition_inputs() {
        let raw = r#"{
            "condition": {"operator": "and", "conditions": [
                {"type": "isChecked", "fieldId": "agree"},
                {"type": "isNotEmpty", "fieldId": "gone"},
                {"type": "equals", "fieldId": "gone", "value": "x"}
            ]},
            "action": {"type": "show"},
            "targetFieldId": ""
        }"#;
        let rule = parse_rule(raw).expect("rule");
        let fields = vec![checkbox("agree", "true")];
        let index = FieldIndex::new(&fields);
        assert_eq!(unresolved_sources(&rule, &index), vec!["gone"]);
    }

    #[test]
    fn malformed_rules_fail_open() {
        let fields = vec![
            checkbox("agree", ""),
            Field::new("a", FieldType::Text).with_rule("{not json"),
            Field::new("b", FieldType::Text).with_rule(r#"{"condition":{"type":"isEmpty"}}"#),
            Field::new("c", FieldType::Text).with_rule(r#"[1,2,3]"#),
        ];
        for field in &fields {
            assert!(evaluate_visibility(field, &fields), "{}", field.id);
        }
        assert!(resolve_rule_effects(&fields).is_empty());
    }

    #[test]
    fn conditional_actions_only_apply_when_the_condition_holds() {
        let fields = vec![
            checkbox("agree", "checked"),
            Field::new("r", FieldType::Text).with_rule(rule("isChecked", "", "require")),
            Field::new("o", FieldType::Text).with_rule(rule("isNotChecked", "", "makeOptional")),
            Field::new("v", FieldType::Text).with_rule(rule("isChecked", "", "setValue")),
            Field::new("h", FieldType::Text).with_rule(rule("isNotChecked", "", "hide")),
        ];
        let effects = resolve_rule_effects(&fields);
        assert_eq!(
            effects,
            vec![
                RuleEffect {
                    source_field_id: "r".into(),
                    target_field_id: "r".into(),
                    effect: Effect::Required(true),
                },
                RuleEffect {
                    source_field_id: "v".into(),
                    target_field_id: "v".into(),
                    effect: Effect::SetValue("auto".into()),
                },
                RuleEffect {
                    source_field_id: "h".into(),
                    target_field_id: "h".into(),
                    effect: Effect::Visibility(true),
                },
            ]
        );
    }

    #[test]
    fn effects_on_missing_targets_are_dropped() {
        let fields = vec![checkbox("agree", "true").with_rule(rule("isChecked", "ghost", "show"))];
        assert!(resolve_rule_effects(&fields).is_empty());
    }

    #[test]
    fn multiple_rules_on_one_target_combine_with_and() {
        let fields = vec![
            checkbox("agree", "true").with_rule(rule("isChecked", "t", "show")),
            Field::new("other", FieldType::Text).with_rule(rule("isChecked", "t", "hide")),
            Field::new("t", FieldType::Text),
        ];
        assert!(!evaluate_visibility(&fields[2], &fields));
    }
}
