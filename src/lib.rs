mod canvas;
mod condition;
mod debug;
mod error;
mod expr;
mod finalize;
mod font;
mod formula;
mod layout;
mod logic;
mod model;
mod pdf;
mod pipeline;
mod reconcile;
mod render;
mod store;
mod types;

pub use canvas::{
    Canvas, Command, DecodedImage, ImagePixels, JpegColor, Page, PaintSurface, Stroke, TextStyle,
};
pub use condition::{coerce_number, evaluate_condition};
use debug::DebugLogger;
pub use error::FieldFlatError;
pub use expr::{Expr, ExprError, MAX_DEPTH, MAX_EXPRESSION_LEN, Value, parse as parse_expression};
pub use fieldflat_rule_contract::{
    ActionType, CompoundCondition, Condition, ConditionType, ConditionalLogicRule, LogicOperator,
    RuleAction, RuleParseError, SimpleCondition, rule_fingerprint, serialize_rule,
};
pub use finalize::{
    FieldOutcome, FlattenOptions, FlattenOutput, PageOverlay, RenderCounts, flatten_pdf,
    page_sizes_from_pdf, render_overlays,
};
pub use font::{BuiltinFont, DEFAULT_FONT, FontMetrics, FontRegistry, RegisteredFont};
pub use formula::{
    FORMULA_ERROR, evaluate_formula, evaluate_formula_at, format_date_pattern, format_number,
    parse_date_text,
};
pub use layout::{
    MIN_CANVAS_EXTENT, PageSizes, page_rect_for, page_size_for, to_canvas_space, to_page_space,
    validate_pages,
};
pub use logic::{Effect, RuleEffect, evaluate_visibility, parse_rule, resolve_rule_effects, rule_target};
pub use model::{Field, FieldIndex, FieldType, Signer, SignerStatus};
pub use pdf::{OverlayEmitter, pages_to_pdf};
pub use pipeline::{ResolvedField, ResolvedFields, resolve_fields, resolve_fields_at};
pub use reconcile::{ReconcileReport, reconcile_signer_bindings, unbind_deleted_signer};
pub use render::{
    ELLIPSIS, RenderOptions, RenderOutcome, decode_data_uri_image, fit_image, fit_text,
    format_date_display, format_formula_display, format_usd, render_field,
};
pub use store::{
    InMemoryObjectStore, InMemoryRecordStore, ObjectStore, RecordStore, RetryPolicy,
    StorageError, StorageErrorKind, with_retry,
};
pub use types::{Color, DESIGN_PAGE_HEIGHT, DESIGN_PAGE_WIDTH, Pt, Rect, Size};

use chrono::{Local, NaiveDateTime};
use log::{debug, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct FieldFlat {
    render_options: RenderOptions,
    font_registry: Arc<FontRegistry>,
    retry_policy: RetryPolicy,
    clock: Option<NaiveDateTime>,
    debug: Option<DebugLogger>,
}

#[derive(Clone)]
pub struct FieldFlatBuilder {
    font_name: String,
    font_size: f32,
    padding: f32,
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    debug_path: Option<PathBuf>,
    retry_policy: RetryPolicy,
    clock: Option<NaiveDateTime>,
}

/// Paint results of [`FieldFlat::resolve_and_render_fields`]: one surface per page that
/// carries fields, in page order.
pub struct RenderSummary<S> {
    pub surfaces: Vec<(usize, S)>,
    pub outcomes: Vec<FieldOutcome>,
    pub counts: RenderCounts,
    pub effects: Vec<RuleEffect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    pub document_id: String,
    pub output_key: String,
    pub page_count: usize,
    pub painted: usize,
    pub skipped: usize,
    pub fallbacks: usize,
    pub sha256: String,
    pub reconciled: ReconcileReport,
    pub effects_persisted: usize,
}

impl FieldFlatBuilder {
    pub fn new() -> Self {
        Self {
            font_name: DEFAULT_FONT.to_string(),
            font_size: 12.0,
            padding: 4.0,
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            debug_path: None,
            retry_policy: RetryPolicy::default(),
            clock: None,
        }
    }

    pub fn default_font(mut self, name: impl Into<String>) -> Self {
        self.font_name = name.into();
        self
    }

    pub fn default_font_size(mut self, size: f32) -> Self {
        self.font_size = size;
        self
    }

    /// Left and right text inset inside a field.
    pub fn text_padding(mut self, padding: f32) -> Self {
        self.padding = padding;
        self
    }

    pub fn register_font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    /// Writes a JSON-lines trace of render and finalize events to `path`.
    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Pins `TODAY()`/`NOW()` to `now`.
    pub fn clock(mut self, now: NaiveDateTime) -> Self {
        self.clock = Some(now);
        self
    }

    pub fn build(self) -> Result<FieldFlat, FieldFlatError> {
        if self.font_name.trim().is_empty() {
            return Err(FieldFlatError::InvalidConfiguration(
                "default font name must not be empty".to_string(),
            ));
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(FieldFlatError::InvalidConfiguration(format!(
                "default font size must be > 0 (got {})",
                self.font_size
            )));
        }
        if !self.padding.is_finite() || self.padding < 0.0 {
            return Err(FieldFlatError::InvalidConfiguration(format!(
                "text padding must be >= 0 (got {})",
                self.padding
            )));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(FieldFlatError::InvalidConfiguration(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err(FieldFlatError::InvalidConfiguration(
                "retry base_delay exceeds max_delay".to_string(),
            ));
        }

        let mut registry = FontRegistry::new();
        for dir in &self.font_dirs {
            registry.register_dir(dir)?;
        }
        for file in &self.font_files {
            if registry.register_file(file)?.is_none() {
                return Err(FieldFlatError::InvalidConfiguration(format!(
                    "{} is not a .ttf/.otf font",
                    file.display()
                )));
            }
        }
        let debug = match self.debug_path {
            Some(path) => Some(DebugLogger::new(path)?),
            None => None,
        };
        Ok(FieldFlat {
            render_options: RenderOptions {
                font_name: self.font_name,
                font_size: Pt::from_f32(self.font_size),
                padding: Pt::from_f32(self.padding),
            },
            font_registry: Arc::new(registry),
            retry_policy: self.retry_policy,
            clock: self.clock,
            debug,
        })
    }
}

impl Default for FieldFlatBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldFlat {
    pub fn builder() -> FieldFlatBuilder {
        FieldFlatBuilder::new()
    }

    pub fn render_options(&self) -> &RenderOptions {
        &self.render_options
    }

    pub fn fonts(&self) -> &Arc<FontRegistry> {
        &self.font_registry
    }

    fn now(&self) -> NaiveDateTime {
        self.clock.unwrap_or_else(|| Local::now().naive_local())
    }

    fn emit_debug_summary(&self, context: &str) {
        if let Some(logger) = self.debug.as_ref() {
            logger.emit_summary(context);
            logger.flush();
        }
    }

    fn trace_outcomes(&self, outcomes: &[FieldOutcome]) {
        let Some(logger) = self.debug.as_ref() else {
            return;
        };
        for outcome in outcomes {
            let (kind, reason) = match &outcome.outcome {
                RenderOutcome::Painted => ("painted", None),
                RenderOutcome::Skipped => ("skipped", None),
                RenderOutcome::Fallback(reason) => ("fallback", Some(reason.as_str())),
            };
            logger.log_event(
                "field.render",
                json!({
                    "field_id": outcome.field_id,
                    "page": outcome.page_number,
                    "outcome": kind,
                    "reason": reason,
                }),
            );
            logger.increment(&format!("fields.{}", kind), 1);
        }
    }

    pub fn evaluate_visibility(&self, field: &Field, fields: &[Field]) -> bool {
        logic::evaluate_visibility(field, fields)
    }

    pub fn evaluate_formula(&self, expression: &str, fields: &[Field]) -> String {
        evaluate_formula_at(expression, fields, self.now())
    }

    pub fn resolve_fields(&self, fields: &[Field]) -> ResolvedFields {
        resolve_fields_at(fields, self.now())
    }

    /// Runs both passes, then paints each visible field onto the surface `surface_for`
    /// creates for its page. Every field's page is checked before any surface is made.
    pub fn resolve_and_render_fields<S, F>(
        &self,
        fields: &[Field],
        page_sizes: &PageSizes,
        mut surface_for: F,
    ) -> Result<RenderSummary<S>, FieldFlatError>
    where
        S: PaintSurface,
        F: FnMut(usize, Size) -> S,
    {
        validate_pages(fields, page_sizes)?;
        let resolved = self.resolve_fields(fields);

        let mut by_page: BTreeMap<usize, Vec<&ResolvedField>> = BTreeMap::new();
        for field in &resolved.fields {
            by_page
                .entry(field.field.page_number as usize)
                .or_default()
                .push(field);
        }

        let mut surfaces = Vec::with_capacity(by_page.len());
        let mut outcomes = Vec::with_capacity(resolved.fields.len());
        let mut counts = RenderCounts::default();
        for (page_number, page_fields) in by_page {
            let size = page_sizes
                .get(&page_number)
                .copied()
                .unwrap_or_else(Size::design_page);
            let mut surface = surface_for(page_number, size);
            for field in page_fields {
                let rect = page_rect_for(&field.field, page_sizes)?;
                let outcome = render_field(&mut surface, field, rect, &self.render_options);
                counts.record(&outcome);
                outcomes.push(FieldOutcome {
                    field_id: field.id().to_string(),
                    page_number,
                    outcome,
                });
            }
            surfaces.push((page_number, surface));
        }

        self.trace_outcomes(&outcomes);
        self.emit_debug_summary("render");
        Ok(RenderSummary {
            surfaces,
            outcomes,
            counts,
            effects: resolved.effects,
        })
    }

    /// Replaces the document's field set with `fields`, reconciled against its signer.
    /// Stored fields missing from `fields` are deleted.
    pub fn save_fields(
        &self,
        records: &dyn RecordStore,
        document_id: &str,
        mut fields: Vec<Field>,
    ) -> Result<ReconcileReport, FieldFlatError> {
        for field in &mut fields {
            field.document_id = document_id.to_string();
        }
        let signer = records.find_signer(document_id)?;
        let report = reconcile_signer_bindings(&mut fields, signer.as_ref());

        let existing = records.find_fields(document_id)?;
        for stale in existing
            .iter()
            .filter(|stored| !fields.iter().any(|field| field.id == stored.id))
        {
            records.delete_field(&stale.id)?;
        }
        for field in fields {
            if existing.iter().any(|stored| stored.id == field.id) {
                records.update_field(&field)?;
            } else {
                records.create_field(field)?;
            }
        }
        debug!("saved fields for document {}", document_id);
        Ok(report)
    }

    /// Stores `signer` as the document's only signer and rebinds its fields.
    pub fn save_signer(
        &self,
        records: &dyn RecordStore,
        signer: Signer,
    ) -> Result<ReconcileReport, FieldFlatError> {
        match records.find_signer(&signer.document_id)? {
            Some(current) if current.id == signer.id => records.update_signer(&signer)?,
            Some(current) => {
                info!(
                    "replacing signer {} with {} on document {}",
                    current.id, signer.id, signer.document_id
                );
                records.delete_signer(&current.id)?;
                records.create_signer(signer.clone())?;
            }
            None => {
                records.create_signer(signer.clone())?;
            }
        }
        self.rebind_stored_fields(records, &signer.document_id, Some(&signer))
    }

    /// Deletes the document's signer and clears the bindings it leaves behind.
    pub fn delete_signer(
        &self,
        records: &dyn RecordStore,
        document_id: &str,
    ) -> Result<usize, FieldFlatError> {
        let signer = records
            .find_signer(document_id)?
            .ok_or_else(|| FieldFlatError::MissingSigner(document_id.to_string()))?;
        records.delete_signer(&signer.id)?;

        let mut fields = records.find_fields(document_id)?;
        let before = fields.clone();
        let cleared = unbind_deleted_signer(&mut fields, &signer.id);
        write_changed(records, &before, &fields)?;
        Ok(cleared)
    }

    fn rebind_stored_fields(
        &self,
        records: &dyn RecordStore,
        document_id: &str,
        signer: Option<&Signer>,
    ) -> Result<ReconcileReport, FieldFlatError> {
        let mut fields = records.find_fields(document_id)?;
        let before = fields.clone();
        let report = reconcile_signer_bindings(&mut fields, signer);
        write_changed(records, &before, &fields)?;
        Ok(report)
    }

    /// Writes `setValue`, `require` and `makeOptional` effects back to their target fields.
    /// Visibility stays a render-time property and is never stored. Returns how many
    /// fields changed.
    pub fn persist_rule_effects(
        &self,
        records: &dyn RecordStore,
        effects: &[RuleEffect],
    ) -> Result<usize, FieldFlatError> {
        let mut targets: BTreeMap<&str, Vec<&Effect>> = BTreeMap::new();
        for effect in effects {
            if matches!(effect.effect, Effect::Visibility(_)) {
                continue;
            }
            targets
                .entry(effect.target_field_id.as_str())
                .or_default()
                .push(&effect.effect);
        }

        let mut updated = 0;
        for (target, target_effects) in targets {
            let Some(mut field) = records.find_field(target)? else {
                continue;
            };
            let before = field.clone();
            for effect in target_effects {
                match effect {
                    Effect::SetValue(value) => field.value = value.clone(),
                    Effect::Required(required) => field.required = *required,
                    Effect::Visibility(_) => {}
                }
            }
            if field != before {
                records.update_field(&field)?;
                updated += 1;
            }
        }
        if updated > 0 {
            info!("persisted rule effects on {} field(s)", updated);
        }
        Ok(updated)
    }

    /// Loads, reconciles and flattens a stored document, then stores the result under
    /// `output_key`.
    pub fn finalize_document(
        &self,
        records: &dyn RecordStore,
        objects: &dyn ObjectStore,
        document_id: &str,
        original_key: &str,
        output_key: &str,
    ) -> Result<FinalizeReport, FieldFlatError> {
        let signer = records.find_signer(document_id)?;
        let mut fields = records.find_fields(document_id)?;
        let before = fields.clone();
        let reconciled = reconcile_signer_bindings(&mut fields, signer.as_ref());
        write_changed(records, &before, &fields)?;

        let original = with_retry(&self.retry_policy, "fetch original document", || {
            objects.get(original_key)
        })?;
        let output = flatten_pdf(
            &original,
            &fields,
            Some(&self.font_registry),
            &FlattenOptions {
                render: self.render_options.clone(),
                now: Some(self.now()),
            },
        )?;
        let effects_persisted = self.persist_rule_effects(records, &output.effects)?;
        with_retry(&self.retry_policy, "store flattened document", || {
            objects.put(output_key, &output.bytes)
        })?;

        self.trace_outcomes(&output.outcomes);
        if let Some(logger) = self.debug.as_ref() {
            logger.log_event(
                "document.finalized",
                json!({
                    "document_id": document_id,
                    "output_key": output_key,
                    "pages": output.page_count,
                    "sha256": output.sha256,
                    "rule_contract": fieldflat_rule_contract::CONTRACT_ID,
                    "rule_contract_version": fieldflat_rule_contract::CONTRACT_VERSION,
                    "rule_contract_sha256": fieldflat_rule_contract::contract_fingerprint_sha256(),
                }),
            );
        }
        self.emit_debug_summary("finalize");

        Ok(FinalizeReport {
            document_id: document_id.to_string(),
            output_key: output_key.to_string(),
            page_count: output.page_count,
            painted: output.painted,
            skipped: output.skipped,
            fallbacks: output.fallbacks,
            sha256: output.sha256,
            reconciled,
            effects_persisted,
        })
    }
}

fn write_changed(
    records: &dyn RecordStore,
    before: &[Field],
    after: &[Field],
) -> Result<(), FieldFlatError> {
    for (old, new) in before.iter().zip(after) {
        if old != new {
            records.update_field(new)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lopdf::{Document, Object, Stream, dictionary};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(14, 5, 7))
            .expect("clock")
    }

    fn engine() -> FieldFlat {
        FieldFlat::builder()
            .clock(clock())
            .retry_policy(RetryPolicy::no_delay())
            .build()
            .expect("engine")
    }

    fn one_page_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content_id = doc.add_object(Stream::new(dictionary! {}, b"0 0 m 10 10 l S".to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).expect("save");
        out
    }

    fn document_fields() -> Vec<Field> {
        let mut name = Field::new("name", FieldType::Text)
            .with_value("Ada")
            .with_geometry(1, 72.0, 100.0, 200.0, 20.0);
        name.required = true;
        vec![
            Field::new("sig", FieldType::Signature).with_geometry(1, 72.0, 300.0, 150.0, 40.0),
            name,
            Field::new("plan", FieldType::Dropdown)
                .with_geometry(1, 72.0, 400.0, 150.0, 20.0)
                .with_rule(
                    r#"{"condition":{"type":"isNotEmpty","fieldId":"name"},
                        "action":{"type":"setValue","value":"Pro"},"targetFieldId":""}"#,
                ),
            Field::new("reason", FieldType::Text)
                .with_geometry(1, 72.0, 450.0, 150.0, 20.0)
                .with_rule(
                    r#"{"condition":{"type":"equals","fieldId":"name","value":"Ada"},
                        "action":{"type":"hide"},"targetFieldId":""}"#,
                ),
        ]
    }

    struct FlakyObjects {
        inner: InMemoryObjectStore,
        failures_left: AtomicUsize,
    }

    impl ObjectStore for FlakyObjects {
        fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.inner.put(key, bytes)
        }

        fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::new(StorageErrorKind::Timeout, "gateway timeout"));
            }
            self.inner.get(key)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        let cases = [
            FieldFlat::builder().default_font_size(0.0),
            FieldFlat::builder().default_font_size(f32::NAN),
            FieldFlat::builder().text_padding(-1.0),
            FieldFlat::builder().default_font(" "),
            FieldFlat::builder().retry_policy(RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            }),
        ];
        for builder in cases {
            assert!(matches!(
                builder.build(),
                Err(FieldFlatError::InvalidConfiguration(_))
            ));
        }
        let defaults = FieldFlat::builder().build().expect("defaults");
        assert_eq!(defaults.render_options(), &RenderOptions::default());
    }

    #[test]
    fn formulas_use_the_configured_clock() {
        let engine = engine();
        assert_eq!(engine.evaluate_formula("TODAY()", &[]), "2024-03-09");
        assert_eq!(engine.evaluate_formula("2 + 2", &[]), "4");
        assert_eq!(engine.evaluate_formula("${missing} + 1", &[]), "1");
    }

    #[test]
    fn visibility_follows_rules() {
        let fields = document_fields();
        let engine = engine();
        assert!(!engine.evaluate_visibility(&fields[3], &fields));
        assert!(engine.evaluate_visibility(&fields[0], &fields));
    }

    #[test]
    fn render_paints_each_page_on_its_own_surface() {
        let engine = engine();
        let pages: PageSizes = [(1, Size::design_page())].into_iter().collect();
        let summary = engine
            .resolve_and_render_fields(&document_fields(), &pages, |_, size| Canvas::new(size))
            .expect("render");
        assert_eq!(summary.surfaces.len(), 1);
        // sig (empty) and reason (hidden) skip; name and plan paint.
        assert_eq!(summary.counts.painted, 2);
        assert_eq!(summary.counts.skipped, 2);
        let page = &summary.surfaces[0].1;
        assert!(page.commands().iter().any(
            |cmd| matches!(cmd, Command::DrawString { text, .. } if text == "Pro")
        ));
    }

    #[test]
    fn out_of_range_page_renders_nothing() {
        let engine = engine();
        let pages: PageSizes = [(1, Size::design_page())].into_iter().collect();
        let mut fields = document_fields();
        fields[1].page_number = 2;
        let mut made = 0;
        let result = engine.resolve_and_render_fields(&fields, &pages, |_, size| {
            made += 1;
            Canvas::new(size)
        });
        assert!(matches!(result, Err(FieldFlatError::PageOutOfRange { .. })));
        assert_eq!(made, 0);
    }

    #[test]
    fn saving_fields_and_signers_keeps_bindings_consistent() {
        let engine = engine();
        let records = InMemoryRecordStore::new();

        let report = engine
            .save_fields(&records, "doc", document_fields())
            .expect("save fields");
        assert!(report.is_noop());
        assert_eq!(records.find_fields("doc").expect("fields").len(), 4);

        let report = engine
            .save_signer(&records, Signer::new("a", "doc", "a@example.com"))
            .expect("signer a");
        assert_eq!(report.signature_rebound, 1);
        assert_eq!(report.required_rebound, 1);

        let report = engine
            .save_signer(&records, Signer::new("b", "doc", "b@example.com"))
            .expect("signer b");
        assert_eq!(report.changed(), 2);
        let sig = records.find_field("sig").expect("find").expect("sig");
        assert_eq!(sig.bound_signer(), Some("b"));
        assert_eq!(records.find_signer("doc").expect("find").map(|s| s.id), Some("b".into()));

        let mut trimmed = document_fields();
        trimmed.truncate(2);
        let report = engine.save_fields(&records, "doc", trimmed).expect("save");
        assert_eq!(report.changed(), 2);
        assert_eq!(records.find_fields("doc").expect("fields").len(), 2);
        assert_eq!(
            records.find_field("name").expect("find").and_then(|f| f.signer_id),
            Some("b".to_string())
        );

        assert_eq!(engine.delete_signer(&records, "doc").expect("delete"), 2);
        assert!(records.find_field("sig").expect("find").is_some_and(|f| f.signer_id.is_none()));
        assert!(matches!(
            engine.delete_signer(&records, "doc"),
            Err(FieldFlatError::MissingSigner(_))
        ));
    }

    #[test]
    fn only_value_and_required_effects_are_persisted() {
        let engine = engine();
        let records = InMemoryRecordStore::new();
        engine.save_fields(&records, "doc", document_fields()).expect("save");
        let effects = vec![
            RuleEffect {
                source_field_id: "name".into(),
                target_field_id: "plan".into(),
                effect: Effect::SetValue("Pro".into()),
            },
            RuleEffect {
                source_field_id: "name".into(),
                target_field_id: "reason".into(),
                effect: Effect::Required(true),
            },
            RuleEffect {
                source_field_id: "name".into(),
                target_field_id: "sig".into(),
                effect: Effect::Visibility(false),
            },
            RuleEffect {
                source_field_id: "name".into(),
                target_field_id: "deleted".into(),
                effect: Effect::SetValue("x".into()),
            },
        ];
        assert_eq!(engine.persist_rule_effects(&records, &effects).expect("persist"), 2);
        let plan = records.find_field("plan").expect("find").expect("plan");
        assert_eq!(plan.value, "Pro");
        assert!(records.find_field("reason").expect("find").is_some_and(|f| f.required));
        assert_eq!(engine.persist_rule_effects(&records, &effects).expect("again"), 0);
    }

    #[test]
    fn finalize_document_retries_and_stores_output() {
        let engine = engine();
        let records = InMemoryRecordStore::new();
        engine.save_fields(&records, "doc", document_fields()).expect("save");
        records
            .create_signer(Signer::new("s1", "doc", "s@example.com"))
            .expect("signer");
        let objects = FlakyObjects {
            inner: InMemoryObjectStore::new(),
            failures_left: AtomicUsize::new(2),
        };
        objects.inner.put("original.pdf", &one_page_pdf()).expect("put");

        let report = engine
            .finalize_document(&records, &objects, "doc", "original.pdf", "final.pdf")
            .expect("finalize");
        assert_eq!(report.page_count, 1);
        assert_eq!(report.painted, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.reconciled.changed(), 2);
        assert_eq!(report.effects_persisted, 1);

        let stored = objects.inner.get("final.pdf").expect("output");
        assert_eq!(report.sha256.len(), 64);
        assert!(Document::load_mem(&stored).is_ok());
        assert_eq!(
            records.find_field("sig").expect("find").and_then(|f| f.signer_id),
            Some("s1".to_string())
        );
        assert_eq!(
            records.find_field("plan").expect("find").map(|f| f.value),
            Some("Pro".to_string())
        );
    }

    #[test]
    fn finalize_surfaces_permanent_storage_errors() {
        let engine = engine();
        let records = InMemoryRecordStore::new();
        let objects = InMemoryObjectStore::new();
        match engine.finalize_document(&records, &objects, "doc", "missing.pdf", "out.pdf") {
            Err(FieldFlatError::Storage(err)) => assert_eq!(err.kind, StorageErrorKind::NotFound),
            other => panic!("unexpected {:?}", other.map(|r| r.page_count)),
        }
    }

    #[test]
    fn finalize_trace_records_the_rule_contract() {
        let path =
            std::env::temp_dir().join(format!("fieldflat-finalize-{}.jsonl", std::process::id()));
        let engine = FieldFlat::builder()
            .clock(clock())
            .retry_policy(RetryPolicy::no_delay())
            .debug_log(&path)
            .build()
            .expect("engine");
        let records = InMemoryRecordStore::new();
        engine.save_fields(&records, "doc", document_fields()).expect("save");
        let objects = InMemoryObjectStore::new();
        objects.put("in.pdf", &one_page_pdf()).expect("put");
        engine
            .finalize_document(&records, &objects, "doc", "in.pdf", "out.pdf")
            .expect("finalize");

        let text = std::fs::read_to_string(&path).expect("log");
        let finalized: serde_json::Value = text
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json"))
            .find(|line| line["type"] == "document.finalized")
            .expect("finalized event");
        assert_eq!(finalized["rule_contract"], "fieldflat.rule_contract");
        assert_eq!(
            finalized["rule_contract_sha256"],
            fieldflat_rule_contract::contract_fingerprint_sha256()
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn debug_log_records_render_outcomes() {
        let path = std::env::temp_dir().join(format!("fieldflat-lib-{}.jsonl", std::process::id()));
        let engine = FieldFlat::builder()
            .clock(clock())
            .debug_log(&path)
            .build()
            .expect("engine");
        let pages: PageSizes = [(1, Size::design_page())].into_iter().collect();
        engine
            .resolve_and_render_fields(&document_fields(), &pages, |_, size| Canvas::new(size))
            .expect("render");
        let text = std::fs::read_to_string(&path).expect("log");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.iter().filter(|l| l["type"] == "field.render").count(), 4);
        let summary = lines.last().expect("summary");
        assert_eq!(summary["type"], "debug.summary");
        assert_eq!(summary["counts"]["fields.painted"], 2);
        let _ = std::fs::remove_file(&path);
    }
}
