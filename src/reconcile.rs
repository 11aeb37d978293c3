use crate::model::{Field, Signer};
use log::{debug, info};

/// What one reconciliation pass changed. A field is counted once, under the first class
/// it falls in (signature-class, then required, then stale binding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub signature_rebound: usize,
    pub required_rebound: usize,
    pub stale_rebound: usize,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.signature_rebound + self.required_rebound + self.stale_rebound
    }

    pub fn is_noop(&self) -> bool {
        self.changed() == 0
    }
}

/// Binds every signature-class field, every required field and every field pointing at
/// another signer to `signer`. Without a signer nothing changes.
pub fn reconcile_signer_bindings(fields: &mut [Field], signer: Option<&Signer>) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let Some(signer) = signer else {
        debug!("no signer; {} field(s) left unbound", fields.len());
        report.unchanged = fields.len();
        return report;
    };

    for field in fields.iter_mut() {
        let bound = field.bound_signer();
        if bound == Some(signer.id.as_str()) {
            report.unchanged += 1;
            continue;
        }
        let counter = if field.field_type.is_signature_class() {
            &mut report.signature_rebound
        } else if field.required {
            &mut report.required_rebound
        } else if bound.is_some() {
            &mut report.stale_rebound
        } else {
            report.unchanged += 1;
            continue;
        };
        *counter += 1;
        field.signer_id = Some(signer.id.clone());
    }

    if !report.is_noop() {
        info!(
            "rebound {} field(s) to signer {} ({} signature, {} required, {} stale)",
            report.changed(),
            signer.id,
            report.signature_rebound,
            report.required_rebound,
            report.stale_rebound
        );
    }
    report
}

/// Clears bindings left behind by a deleted signer. Returns how many fields changed.
pub fn unbind_deleted_signer(fields: &mut [Field], signer_id: &str) -> usize {
    let mut cleared = 0;
    for field in fields.iter_mut() {
        let bound_to_deleted = field.bound_signer() == Some(signer_id);
        if field.signer_id.is_some() && (bound_to_deleted || field.field_type.is_signature_class()) {
            field.signer_id = None;
            cleared += 1;
        }
    }
    if cleared > 0 {
        info!("unbound {} field(s) from deleted signer {}", cleared, signer_id);
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    fn bound(field: Field, signer: &str) -> Field {
        Field {
            signer_id: Some(signer.to_string()),
            ..field
        }
    }

    fn document() -> Vec<Field> {
        let mut required = Field::new("name", FieldType::Text);
        required.required = true;
        vec![
            bound(Field::new("sig", FieldType::Signature), "signer-a"),
            Field::new("init", FieldType::Initial),
            required,
            bound(Field::new("note", FieldType::Text), "signer-a"),
            Field::new("free", FieldType::Text),
        ]
    }

    #[test]
    fn rebinds_to_the_current_signer_once() {
        let signer = Signer::new("signer-b", "doc", "b@example.com");
        let mut fields = document();

        let report = reconcile_signer_bindings(&mut fields, Some(&signer));
        assert_eq!(report.signature_rebound, 2);
        assert_eq!(report.required_rebound, 1);
        assert_eq!(report.stale_rebound, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(fields[0].bound_signer(), Some("signer-b"));
        assert_eq!(fields[3].bound_signer(), Some("signer-b"));
        assert_eq!(fields[4].bound_signer(), None);

        let snapshot = fields.clone();
        let again = reconcile_signer_bindings(&mut fields, Some(&signer));
        assert!(again.is_noop());
        assert_eq!(fields, snapshot);
    }

    #[test]
    fn blank_signer_ids_count_as_unbound() {
        let signer = Signer::new("s1", "doc", "s@example.com");
        let mut fields = vec![bound(Field::new("sig", FieldType::Signature), "  ")];
        let report = reconcile_signer_bindings(&mut fields, Some(&signer));
        assert_eq!(report.signature_rebound, 1);
        assert_eq!(fields[0].bound_signer(), Some("s1"));
    }

    #[test]
    fn without_a_signer_nothing_changes() {
        let mut fields = document();
        let before = fields.clone();
        let report = reconcile_signer_bindings(&mut fields, None);
        assert!(report.is_noop());
        assert_eq!(report.unchanged, before.len());
        assert_eq!(fields, before);
    }

    #[test]
    fn deleting_a_signer_clears_signature_and_bound_fields() {
        let mut fields = vec![
            bound(Field::new("sig", FieldType::Signature), "gone"),
            bound(Field::new("note", FieldType::Text), "gone"),
            bound(Field::new("other", FieldType::Text), "someone-else"),
            Field::new("free", FieldType::Text),
        ];
        assert_eq!(unbind_deleted_signer(&mut fields, "gone"), 2);
        assert!(fields[0].signer_id.is_none());
        assert!(fields[1].signer_id.is_none());
        assert_eq!(fields[2].bound_signer(), Some("someone-else"));
        assert_eq!(unbind_deleted_signer(&mut fields, "gone"), 0);
    }
}
