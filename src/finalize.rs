//! Flattening: paint resolved field values onto the original PDF.

use crate::canvas::{Canvas, Page};
use crate::error::FieldFlatError;
use crate::font::FontRegistry;
use crate::layout::{PageSizes, page_rect_for, validate_pages};
use crate::logic::RuleEffect;
use crate::model::Field;
use crate::pdf::OverlayEmitter;
use crate::pipeline::{ResolvedField, ResolvedFields, resolve_fields_at};
use crate::render::{RenderOptions, RenderOutcome, render_field};
use crate::types::Size;
use chrono::{Local, NaiveDateTime};
use log::{debug, info};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct FlattenOptions {
    pub render: RenderOptions,
    /// Clock for `TODAY()`/`NOW()`; the local clock when unset.
    pub now: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    pub field_id: String,
    pub page_number: usize,
    pub outcome: RenderOutcome,
}

#[derive(Debug, Clone)]
pub struct PageOverlay {
    pub page_number: usize,
    pub page: Page,
    pub outcomes: Vec<FieldOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderCounts {
    pub painted: usize,
    pub skipped: usize,
    pub fallbacks: usize,
}

impl RenderCounts {
    pub fn record(&mut self, outcome: &RenderOutcome) {
        match outcome {
            RenderOutcome::Painted => self.painted += 1,
            RenderOutcome::Skipped => self.skipped += 1,
            RenderOutcome::Fallback(_) => self.fallbacks += 1,
        }
    }

    pub fn from_overlays(overlays: &[PageOverlay]) -> Self {
        let mut counts = Self::default();
        for outcome in overlays.iter().flat_map(|overlay| &overlay.outcomes) {
            counts.record(&outcome.outcome);
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct FlattenOutput {
    pub bytes: Vec<u8>,
    pub page_count: usize,
    pub painted: usize,
    pub skipped: usize,
    pub fallbacks: usize,
    /// Lower-case hex SHA-256 of `bytes`.
    pub sha256: String,
    pub outcomes: Vec<FieldOutcome>,
    pub effects: Vec<RuleEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PageBox {
    llx: f64,
    lly: f64,
    urx: f64,
    ury: f64,
}

impl PageBox {
    // US Letter, used when a page declares no box at all.
    const DEFAULT: PageBox = PageBox {
        llx: 0.0,
        lly: 0.0,
        urx: 612.0,
        ury: 792.0,
    };

    fn size(&self) -> Size {
        Size::new(self.urx - self.llx, self.ury - self.lly)
    }

    fn to_object(self) -> Vec<Object> {
        [self.llx, self.lly, self.urx, self.ury]
            .into_iter()
            .map(|value| Object::Real(value as _))
            .collect()
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(*value as f64),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Looks `key` up on the page, then on its ancestors.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_object(page_id).and_then(Object::as_dict).ok();
    let mut depth = 0;
    while let Some(dict) = node {
        if let Ok(value) = dict.get(key) {
            return resolve(doc, value);
        }
        depth += 1;
        if depth > 64 {
            break;
        }
        node = dict
            .get(b"Parent")
            .and_then(Object::as_reference)
            .and_then(|parent| doc.get_object(parent))
            .and_then(Object::as_dict)
            .ok();
    }
    None
}

fn page_box(doc: &Document, page_id: ObjectId) -> PageBox {
    for key in [b"CropBox".as_slice(), b"MediaBox".as_slice()] {
        let Some(Object::Array(items)) = inherited(doc, page_id, key) else {
            continue;
        };
        let values: Vec<f64> = items
            .iter()
            .filter_map(|item| resolve(doc, item).and_then(number))
            .collect();
        if let [x0, y0, x1, y1] = values[..] {
            return PageBox {
                llx: x0.min(x1),
                lly: y0.min(y1),
                urx: x0.max(x1),
                ury: y0.max(y1),
            };
        }
    }
    PageBox::DEFAULT
}

fn load(bytes: &[u8]) -> Result<Document, FieldFlatError> {
    let doc = Document::load_mem(bytes)?;
    if doc.is_encrypted() {
        return Err(FieldFlatError::Pdf("document is encrypted".to_string()));
    }
    Ok(doc)
}

fn boxes(doc: &Document) -> BTreeMap<usize, (ObjectId, PageBox)> {
    doc.get_pages()
        .into_iter()
        .map(|(number, id)| (number as usize, (id, page_box(doc, id))))
        .collect()
}

/// Page sizes from each page's CropBox, or MediaBox when there is none.
pub fn page_sizes_from_pdf(bytes: &[u8]) -> Result<PageSizes, FieldFlatError> {
    let doc = load(bytes)?;
    Ok(boxes(&doc)
        .into_iter()
        .map(|(number, (_, page_box))| (number, page_box.size()))
        .collect())
}

/// Renders every page that carries fields. Fails before painting anything when a field
/// sits on a page that does not exist.
pub fn render_overlays(
    resolved: &ResolvedFields,
    pages: &PageSizes,
    fonts: Option<&Arc<FontRegistry>>,
    options: &RenderOptions,
) -> Result<Vec<PageOverlay>, FieldFlatError> {
    validate_pages(resolved.fields.iter().map(|r| &r.field), pages)?;

    let mut by_page: BTreeMap<usize, Vec<&ResolvedField>> = BTreeMap::new();
    for field in &resolved.fields {
        // Validated above, so the page number is a positive key of `pages`.
        let page_number = field.field.page_number as usize;
        by_page.entry(page_number).or_default().push(field);
    }
    let work: Vec<(usize, Size, Vec<&ResolvedField>)> = by_page
        .into_iter()
        .filter_map(|(number, fields)| pages.get(&number).map(|size| (number, *size, fields)))
        .collect();

    work.into_par_iter()
        .map(|(page_number, size, fields)| -> Result<PageOverlay, FieldFlatError> {
            let mut canvas = match fonts {
                Some(fonts) => Canvas::with_fonts(size, Arc::clone(fonts)),
                None => Canvas::new(size),
            };
            let mut outcomes = Vec::with_capacity(fields.len());
            for resolved in fields {
                let rect = page_rect_for(&resolved.field, pages)?;
                let outcome = render_field(&mut canvas, resolved, rect, options);
                debug!("page {} field {}: {:?}", page_number, resolved.id(), outcome);
                outcomes.push(FieldOutcome {
                    field_id: resolved.id().to_string(),
                    page_number,
                    outcome,
                });
            }
            Ok(PageOverlay {
                page_number,
                page: canvas.finish(),
                outcomes,
            })
        })
        .collect()
}

fn page_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(dict)) => dict.clone(),
        _ => Dictionary::new(),
    }
}

fn xobject_dict(doc: &Document, resources: &Dictionary) -> Dictionary {
    match resources.get(b"XObject").ok().and_then(|obj| resolve(doc, obj)) {
        Some(Object::Dictionary(dict)) => dict.clone(),
        _ => Dictionary::new(),
    }
}

fn content_refs(doc: &Document, page_id: ObjectId) -> Vec<Object> {
    let contents = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .and_then(|page| page.get(b"Contents"))
        .ok();
    match contents {
        Some(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(Object::Array(items)) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Some(Object::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// Isolates the original content in `q ... Q` and draws `form_id` after it.
fn stamp_form(
    doc: &mut Document,
    page_id: ObjectId,
    page_box: PageBox,
    form_id: ObjectId,
    form_name: &str,
) -> Result<(), FieldFlatError> {
    let mut resources = page_resources(doc, page_id);
    let mut xobjects = xobject_dict(doc, &resources);
    xobjects.set(form_name.as_bytes().to_vec(), Object::Reference(form_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let stamp = format!(
        "Q\nq 1 0 0 1 {} {} cm /{} Do Q\n",
        page_box.llx, page_box.lly, form_name
    );
    let stamp_id = doc.add_object(Stream::new(Dictionary::new(), stamp.into_bytes()));

    let mut contents = vec![Object::Reference(open_id)];
    contents.extend(content_refs(doc, page_id));
    contents.push(Object::Reference(stamp_id));

    let page = doc.get_object_mut(page_id).and_then(Object::as_dict_mut)?;
    page.set("Resources", Object::Dictionary(resources));
    page.set("Contents", Object::Array(contents));
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Resolves `fields`, renders them and stamps the overlays onto `original`.
pub fn flatten_pdf(
    original: &[u8],
    fields: &[Field],
    fonts: Option<&Arc<FontRegistry>>,
    options: &FlattenOptions,
) -> Result<FlattenOutput, FieldFlatError> {
    let mut doc = load(original)?;
    let page_boxes = boxes(&doc);
    let pages: PageSizes = page_boxes
        .iter()
        .map(|(number, (_, page_box))| (*number, page_box.size()))
        .collect();

    let now = options.now.unwrap_or_else(|| Local::now().naive_local());
    let resolved = resolve_fields_at(fields, now);
    let overlays = render_overlays(&resolved, &pages, fonts, &options.render)?;

    let mut emitter = OverlayEmitter::new(fonts.map(|fonts| fonts.as_ref()));
    for overlay in overlays.iter().filter(|overlay| !overlay.page.is_empty()) {
        let Some((page_id, page_box)) = page_boxes.get(&overlay.page_number).copied() else {
            continue;
        };
        let form_id = emitter.add_form(&mut doc, &overlay.page, page_box_origin_bbox(page_box))?;
        let form_name = format!("FFOverlay{}", overlay.page_number);
        stamp_form(&mut doc, page_id, page_box, form_id, &form_name)?;
    }

    doc.prune_objects();
    doc.compress();
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;

    let counts = RenderCounts::from_overlays(&overlays);
    let sha256 = sha256_hex(&bytes);
    info!(
        "flattened {} page(s): {} painted, {} skipped, {} fallback(s), sha256 {}",
        pages.len(),
        counts.painted,
        counts.skipped,
        counts.fallbacks,
        sha256
    );
    Ok(FlattenOutput {
        bytes,
        page_count: pages.len(),
        painted: counts.painted,
        skipped: counts.skipped,
        fallbacks: counts.fallbacks,
        sha256,
        outcomes: overlays.into_iter().flat_map(|overlay| overlay.outcomes).collect(),
        effects: resolved.effects,
    })
}

// The form is drawn translated to the box origin, so its own bbox starts at zero.
fn page_box_origin_bbox(page_box: PageBox) -> Vec<Object> {
    PageBox {
        llx: 0.0,
        lly: 0.0,
        urx: page_box.urx - page_box.llx,
        ury: page_box.ury - page_box.lly,
    }
    .to_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;
    use chrono::NaiveDate;
    use lopdf::dictionary;

    fn pdf_bytes(page_count: usize, media_box: [i64; 4], crop_box: Option<[i64; 4]>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids = Vec::new();
        for n in 0..page_count {
            let content = format!("BT /F1 18 Tf 72 720 Td (Page {}) Tj ET", n + 1).into_bytes();
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            };
            if let Some(crop) = crop_box {
                page.set("CropBox", crop.iter().map(|v| Object::Integer(*v)).collect::<Vec<_>>());
            }
            kids.push(Object::Reference(doc.add_object(page)));
        }
        let count = kids.len() as i64;
        // Resources and MediaBox inherited from the page tree root.
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => media_box.iter().map(|v| Object::Integer(*v)).collect::<Vec<_>>(),
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).expect("save");
        out
    }

    fn options() -> FlattenOptions {
        FlattenOptions {
            render: RenderOptions::default(),
            now: NaiveDate::from_ymd_opt(2024, 3, 9).and_then(|d| d.and_hms_opt(12, 0, 0)),
        }
    }

    fn fields() -> Vec<Field> {
        let hidden = Field::new("hidden", FieldType::Text)
            .with_value("secret")
            .with_geometry(1, 72.0, 200.0, 100.0, 20.0)
            .with_rule(
                r#"{"condition":{"type":"isChecked","fieldId":"agree"},
                    "action":{"type":"show"},"targetFieldId":""}"#,
            );
        vec![
            Field::new("name", FieldType::Text)
                .with_value("Ada Lovelace")
                .with_geometry(1, 72.0, 100.0, 200.0, 20.0),
            Field::new("agree", FieldType::Checkbox).with_geometry(2, 72.0, 100.0, 20.0, 20.0),
            hidden,
            Field::new("sig", FieldType::Signature)
                .with_value("data:image/png;base64,AAAA")
                .with_geometry(2, 72.0, 300.0, 150.0, 40.0),
        ]
    }

    fn page_text(doc: &Document, number: u32) -> String {
        let page_id = *doc.get_pages().get(&number).expect("page");
        let content = doc.get_page_content(page_id).expect("content");
        String::from_utf8_lossy(&content).into_owned()
    }

    #[test]
    fn page_sizes_prefer_crop_box_and_follow_inheritance() {
        let sizes = page_sizes_from_pdf(&pdf_bytes(2, [0, 0, 612, 792], None)).expect("sizes");
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.get(&2), Some(&Size::letter()));

        let sizes =
            page_sizes_from_pdf(&pdf_bytes(1, [0, 0, 612, 792], Some([10, 20, 510, 720])))
                .expect("sizes");
        assert_eq!(sizes.get(&1), Some(&Size::new(500.0, 700.0)));
    }

    #[test]
    fn flattening_stamps_each_page_and_reports_counts() {
        let original = pdf_bytes(2, [0, 0, 595, 842], None);
        let output = flatten_pdf(&original, &fields(), None, &options()).expect("flatten");
        assert_eq!(output.page_count, 2);
        assert_eq!(output.painted, 2);
        assert_eq!(output.skipped, 1);
        assert_eq!(output.fallbacks, 1);
        assert_eq!(output.sha256, sha256_hex(&output.bytes));
        assert_eq!(output.sha256.len(), 64);
        assert!(output.effects.iter().any(|e| e.target_field_id == "hidden"));

        let doc = Document::load_mem(&output.bytes).expect("reload");
        assert_eq!(doc.get_pages().len(), 2);
        let first = page_text(&doc, 1);
        assert!(first.starts_with("q\n"), "{}", first);
        assert!(first.contains("(Page 1) Tj"));
        assert!(first.contains("/FFOverlay1 Do"));
        assert!(page_text(&doc, 2).contains("/FFOverlay2 Do"));
    }

    #[test]
    fn overlay_form_keeps_inherited_fonts_and_paints_values() {
        let original = pdf_bytes(1, [0, 0, 595, 842], None);
        let fields = vec![
            Field::new("name", FieldType::Text)
                .with_value("Ada")
                .with_geometry(1, 72.0, 100.0, 200.0, 20.0),
        ];
        let output = flatten_pdf(&original, &fields, None, &options()).expect("flatten");
        let doc = Document::load_mem(&output.bytes).expect("reload");
        let page_id = *doc.get_pages().get(&1).expect("page");
        let page = doc.get_object(page_id).and_then(Object::as_dict).expect("page");
        let resources = page.get(b"Resources").and_then(Object::as_dict).expect("resources");
        assert!(resources.get(b"Font").is_ok());
        let xobjects = resources.get(b"XObject").and_then(Object::as_dict).expect("xobjects");
        let form_id = xobjects
            .get(b"FFOverlay1")
            .and_then(Object::as_reference)
            .expect("form");
        let form = doc.get_object(form_id).and_then(Object::as_stream).expect("stream");
        let content = form
            .decompressed_content()
            .unwrap_or_else(|_| form.content.clone());
        let content = String::from_utf8_lossy(&content);
        assert!(content.contains("(Ada) Tj"), "{}", content);
    }

    #[test]
    fn fields_on_missing_pages_fail_the_whole_render() {
        let original = pdf_bytes(1, [0, 0, 595, 842], None);
        let fields = vec![
            Field::new("ok", FieldType::Text)
                .with_value("x")
                .with_geometry(1, 0.0, 0.0, 10.0, 10.0),
            Field::new("stray", FieldType::Text)
                .with_value("y")
                .with_geometry(4, 0.0, 0.0, 10.0, 10.0),
        ];
        match flatten_pdf(&original, &fields, None, &options()) {
            Err(FieldFlatError::PageOutOfRange {
                field_id,
                page_count,
                ..
            }) => {
                assert_eq!(field_id, "stray");
                assert_eq!(page_count, 1);
            }
            other => panic!("unexpected {:?}", other.map(|o| o.page_count)),
        }
    }

    #[test]
    fn overlays_are_rendered_in_page_order() {
        let pages: PageSizes = (1..=3).map(|n| (n, Size::design_page())).collect();
        let resolved = resolve_fields_at(&fields(), options().now.expect("clock"));
        let overlays =
            render_overlays(&resolved, &pages, None, &RenderOptions::default()).expect("render");
        let numbers: Vec<usize> = overlays.iter().map(|o| o.page_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(overlays[0].outcomes[0].field_id, "name");
        let counts = RenderCounts::from_overlays(&overlays);
        assert_eq!(counts.painted + counts.skipped + counts.fallbacks, 4);
    }

    #[test]
    fn garbage_input_is_a_pdf_error() {
        assert!(matches!(
            page_sizes_from_pdf(b"not a pdf"),
            Err(FieldFlatError::Pdf(_))
        ));
    }
}
