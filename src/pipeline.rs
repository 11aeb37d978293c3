use crate::formula::{self, FORMULA_ERROR};
use crate::logic::{self, Effect, RuleEffect};
use crate::model::{Field, FieldIndex, FieldType};
use chrono::{Local, NaiveDateTime};
use log::{debug, warn};

/// Render-local copy of a field after both passes. Never written back as is.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    pub field: Field,
    pub is_visible: bool,
    pub required: bool,
}

impl ResolvedField {
    pub fn id(&self) -> &str {
        &self.field.id
    }

    pub fn value(&self) -> &str {
        &self.field.value
    }

    /// Hidden fields and fields without a value paint nothing; checkboxes always paint.
    pub fn should_render(&self) -> bool {
        self.is_visible
            && (self.field.field_type == FieldType::Checkbox || self.field.has_value())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedFields {
    pub fields: Vec<ResolvedField>,
    pub effects: Vec<RuleEffect>,
}

impl ResolvedFields {
    pub fn get(&self, id: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|resolved| resolved.id() == id)
    }

    pub fn visible(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields.iter().filter(|resolved| resolved.is_visible)
    }
}

pub fn resolve_fields(fields: &[Field]) -> ResolvedFields {
    resolve_fields_at(fields, Local::now().naive_local())
}

/// Formula pass, then visibility pass against the post-formula snapshot.
pub fn resolve_fields_at(fields: &[Field], now: NaiveDateTime) -> ResolvedFields {
    let snapshot = formula_pass(fields, now);
    let index = FieldIndex::new(&snapshot);
    let effects = logic::resolve_with_index(&snapshot, &index);

    let mut resolved: Vec<ResolvedField> = snapshot
        .iter()
        .map(|field| ResolvedField {
            field: field.clone(),
            is_visible: true,
            required: field.required,
        })
        .collect();

    for effect in &effects {
        for target in resolved
            .iter_mut()
            .filter(|resolved| resolved.field.id == effect.target_field_id)
        {
            match &effect.effect {
                Effect::Visibility(shown) => target.is_visible &= *shown,
                Effect::Required(required) => target.required = *required,
                Effect::SetValue(value) => target.field.value = value.clone(),
            }
        }
    }
    debug!(
        "resolved {} field(s), {} visible, {} rule effect(s)",
        resolved.len(),
        resolved.iter().filter(|r| r.is_visible).count(),
        effects.len()
    );

    ResolvedFields {
        fields: resolved,
        effects,
    }
}

fn formula_pass(fields: &[Field], now: NaiveDateTime) -> Vec<Field> {
    let mut snapshot = fields.to_vec();
    for idx in 0..snapshot.len() {
        let field = &snapshot[idx];
        if field.field_type != FieldType::Formula || field.validation_rule.trim().is_empty() {
            continue;
        }
        let result = {
            let index = FieldIndex::new(&snapshot);
            formula::evaluate_with_index(&field.validation_rule, &index, now)
        };
        if result == FORMULA_ERROR {
            warn!(
                "formula field {} did not evaluate; keeping stored value",
                snapshot[idx].id
            );
            continue;
        }
        snapshot[idx].value = result;
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .expect("clock")
    }

    fn sample() -> Vec<Field> {
        vec![
            Field::new("qty", FieldType::Number).with_value("4"),
            Field::new("price", FieldType::Number).with_value("2.5"),
            Field::new("total", FieldType::Formula)
                .with_formula("${qty} * ${price}")
                .with_value("stale"),
            Field::new("doubled", FieldType::Formula).with_formula("${total} * 2"),
            Field::new("bulk_note", FieldType::Text)
                .with_value("Bulk discount applied")
                .with_rule(
                    r#"{"condition":{"type":"greaterThan","fieldId":"total","value":"5"},
                        "action":{"type":"show"},"targetFieldId":""}"#,
                ),
            Field::new("broken", FieldType::Formula)
                .with_formula("${qty} +")
                .with_value("kept"),
        ]
    }

    #[test]
    fn formulas_resolve_in_field_order() {
        let resolved = resolve_fields_at(&sample(), clock());
        assert_eq!(resolved.get("total").map(|r| r.value()), Some("10"));
        assert_eq!(resolved.get("doubled").map(|r| r.value()), Some("20"));
    }

    #[test]
    fn failing_formula_keeps_its_stored_value() {
        let resolved = resolve_fields_at(&sample(), clock());
        assert_eq!(resolved.get("broken").map(|r| r.value()), Some("kept"));
    }

    #[test]
    fn conditions_see_post_formula_values() {
        let resolved = resolve_fields_at(&sample(), clock());
        let note = resolved.get("bulk_note").expect("note");
        assert!(note.is_visible);

        let mut fields = sample();
        fields[0].value = "1".to_string();
        let resolved = resolve_fields_at(&fields, clock());
        let note = resolved.get("bulk_note").expect("note");
        assert!(!note.is_visible);
        assert!(!note.should_render());
    }

    #[test]
    fn pipeline_is_idempotent() {
        let fields = sample();
        let first = resolve_fields_at(&fields, clock());
        let second = resolve_fields_at(&fields, clock());
        assert_eq!(first, second);
    }

    #[test]
    fn input_is_not_mutated() {
        let fields = sample();
        let before = fields.clone();
        let _ = resolve_fields_at(&fields, clock());
        assert_eq!(fields, before);
    }

    #[test]
    fn require_and_set_value_apply_to_resolved_copies() {
        let fields = vec![
            Field::new("agree", FieldType::Checkbox).with_value("true"),
            Field::new("reason", FieldType::Text).with_rule(
                r#"{"condition":{"type":"isChecked","fieldId":"agree"},
                    "action":{"type":"require"},"targetFieldId":"reason"}"#,
            ),
            Field::new("plan", FieldType::Dropdown).with_rule(
                r#"{"condition":{"type":"isChecked","fieldId":"agree"},
                    "action":{"type":"setValue","value":"Pro"},"targetFieldId":"plan"}"#,
            ),
        ];
        let resolved = resolve_fields_at(&fields, clock());
        assert!(resolved.get("reason").is_some_and(|r| r.required));
        assert_eq!(resolved.get("plan").map(|r| r.value()), Some("Pro"));
        assert_eq!(resolved.effects.len(), 2);
        assert!(!fields[1].required);
    }

    #[test]
    fn unchecked_checkbox_still_renders() {
        let fields = vec![
            Field::new("box", FieldType::Checkbox),
            Field::new("empty", FieldType::Text),
        ];
        let resolved = resolve_fields_at(&fields, clock());
        assert!(resolved.fields[0].should_render());
        assert!(!resolved.fields[1].should_render());
        assert_eq!(resolved.visible().count(), 2);
    }
}
