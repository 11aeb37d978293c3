use crate::canvas::{Command, DecodedImage, ImagePixels, JpegColor, Page};
use crate::error::FieldFlatError;
use crate::font::{BuiltinFont, DEFAULT_FONT, FontRegistry, RegisteredFont};
use crate::types::{Color, Pt};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use std::collections::{BTreeMap, HashMap};

/// Writes recorded pages into a PDF document as Form XObjects (or standalone pages).
/// Font objects are shared across every form the emitter writes into the same document.
pub struct OverlayEmitter<'a> {
    registry: Option<&'a FontRegistry>,
    font_objects: HashMap<String, ObjectId>,
}

impl<'a> OverlayEmitter<'a> {
    pub fn new(registry: Option<&'a FontRegistry>) -> Self {
        Self {
            registry,
            font_objects: HashMap::new(),
        }
    }

    /// Adds `page` to `doc` as a Form XObject clipped to `bbox` and returns its id.
    pub fn add_form(
        &mut self,
        doc: &mut Document,
        page: &Page,
        bbox: Vec<Object>,
    ) -> Result<ObjectId, FieldFlatError> {
        let (resources, content) = self.page_resources_and_content(doc, page)?;
        let form = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "FormType" => 1,
                "BBox" => Object::Array(bbox),
                "Resources" => Object::Dictionary(resources),
            },
            content.into_bytes(),
        );
        Ok(doc.add_object(form))
    }

    fn page_resources_and_content(
        &mut self,
        doc: &mut Document,
        page: &Page,
    ) -> Result<(Dictionary, String), FieldFlatError> {
        let mut font_dict = Dictionary::new();
        let mut font_resources = BTreeMap::new();
        for (idx, name) in page.fonts_used.iter().enumerate() {
            let resource = format!("F{}", idx + 1);
            let font_id = self.font_object(doc, name)?;
            font_dict.set(resource.as_bytes().to_vec(), Object::Reference(font_id));
            font_resources.insert(name.clone(), resource);
        }

        let mut xobjects = Dictionary::new();
        for (resource_id, image) in &page.images {
            let image_id = add_image(doc, image);
            xobjects.set(resource_id.as_bytes().to_vec(), Object::Reference(image_id));
        }

        let mut resources = Dictionary::new();
        if !font_dict.is_empty() {
            resources.set("Font", Object::Dictionary(font_dict));
        }
        if !xobjects.is_empty() {
            resources.set("XObject", Object::Dictionary(xobjects));
        }
        Ok((resources, page_content(page, &font_resources)))
    }

    fn font_object(&mut self, doc: &mut Document, name: &str) -> Result<ObjectId, FieldFlatError> {
        let registered = self.registry.and_then(|registry| registry.resolve(name));
        let key = match registered {
            Some(font) => format!("embedded:{}", font.name),
            None => BuiltinFont::for_family(name).base_font().to_string(),
        };
        if let Some(id) = self.font_objects.get(&key) {
            return Ok(*id);
        }
        let id = match registered {
            Some(font) => add_embedded_font(doc, font),
            None => doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => BuiltinFont::for_family(name).base_font(),
                "Encoding" => "WinAnsiEncoding",
            }),
        };
        self.font_objects.insert(key, id);
        Ok(id)
    }
}

/// Standalone PDF with one page per recorded page. Mostly useful for inspecting overlays.
pub fn pages_to_pdf(pages: &[Page], registry: Option<&FontRegistry>) -> Result<Vec<u8>, FieldFlatError> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let mut emitter = OverlayEmitter::new(registry);
    let mut kids = Vec::with_capacity(pages.len());
    for page in pages {
        let (resources, content) = emitter.page_resources_and_content(&mut doc, page)?;
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                0.into(),
                0.into(),
                pt_object(page.page_size.width),
                pt_object(page.page_size.height),
            ],
            "Contents" => content_id,
            "Resources" => Object::Dictionary(resources),
        });
        kids.push(Object::Reference(page_id));
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Content stream for `page`. Coordinates are already page space.
pub fn page_content(page: &Page, font_resources: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    // Font selection lives in the canvas graphics state, so it follows q/Q too.
    let mut font_name = DEFAULT_FONT.to_string();
    let mut font_size = Pt::from_f32(12.0);
    let mut saved: Vec<(String, Pt)> = Vec::new();

    for cmd in &page.commands {
        match cmd {
            Command::SaveState => {
                saved.push((font_name.clone(), font_size));
                out.push_str("q\n");
            }
            Command::RestoreState => {
                if let Some((name, size)) = saved.pop() {
                    font_name = name;
                    font_size = size;
                }
                out.push_str("Q\n");
            }
            Command::SetFillColor(color) => out.push_str(&color_op(*color, "rg")),
            Command::SetStrokeColor(color) => out.push_str(&color_op(*color, "RG")),
            Command::SetLineWidth(width) => out.push_str(&format!("{} w\n", fmt_pt(*width))),
            Command::SetFontName(name) => font_name = name.clone(),
            Command::SetFontSize(size) => font_size = *size,
            Command::MoveTo { x, y } => {
                out.push_str(&format!("{} {} m\n", fmt_pt(*x), fmt_pt(*y)));
            }
            Command::LineTo { x, y } => {
                out.push_str(&format!("{} {} l\n", fmt_pt(*x), fmt_pt(*y)));
            }
            Command::CurveTo {
                x1,
                y1,
                x2,
                y2,
                x,
                y,
            } => {
                out.push_str(&format!(
                    "{} {} {} {} {} {} c\n",
                    fmt_pt(*x1),
                    fmt_pt(*y1),
                    fmt_pt(*x2),
                    fmt_pt(*y2),
                    fmt_pt(*x),
                    fmt_pt(*y),
                ));
            }
            Command::ClosePath => out.push_str("h\n"),
            Command::Fill => out.push_str("f\n"),
            Command::Stroke => out.push_str("S\n"),
            Command::FillStroke => out.push_str("B\n"),
            Command::DrawRect {
                x,
                y,
                width,
                height,
            } => {
                out.push_str(&format!(
                    "{} {} {} {} re\n",
                    fmt_pt(*x),
                    fmt_pt(*y),
                    fmt_pt(*width),
                    fmt_pt(*height)
                ));
            }
            Command::DrawString { x, y, text } => {
                let resource = font_resources
                    .get(&font_name)
                    .map(String::as_str)
                    .unwrap_or("F1");
                out.push_str("BT\n");
                out.push_str(&format!("/{} {} Tf\n", resource, fmt_pt(font_size)));
                out.push_str(&format!("{} {} Td\n", fmt_pt(*x), fmt_pt(*y)));
                out.push_str(&format!("({}) Tj\n", encode_winansi_pdf_string(text)));
                out.push_str("ET\n");
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                resource_id,
            } => {
                out.push_str(&format!(
                    "q\n{} 0 0 {} {} {} cm\n/{} Do\nQ\n",
                    fmt_pt(*width),
                    fmt_pt(*height),
                    fmt_pt(*x),
                    fmt_pt(*y),
                    resource_id
                ));
            }
        }
    }
    out
}

fn add_image(doc: &mut Document, image: &DecodedImage) -> ObjectId {
    match &image.pixels {
        ImagePixels::Jpeg { data, color } => {
            let color_space = match color {
                JpegColor::Gray => "DeviceGray",
                JpegColor::Rgb => "DeviceRGB",
                JpegColor::Cmyk | JpegColor::InvertedCmyk => "DeviceCMYK",
            };
            let mut stream = Stream::new(
                image_dict(image.width, image.height, color_space),
                data.clone(),
            );
            stream.dict.set("Filter", "DCTDecode");
            if *color == JpegColor::InvertedCmyk {
                let decode = [1, 0, 1, 0, 1, 0, 1, 0].map(Object::Integer).to_vec();
                stream.dict.set("Decode", decode);
            }
            stream.allows_compression = false;
            doc.add_object(stream)
        }
        ImagePixels::Rgb { rgb, alpha } => {
            let mut dict = image_dict(image.width, image.height, "DeviceRGB");
            if let Some(alpha) = alpha {
                let smask = Stream::new(
                    image_dict(image.width, image.height, "DeviceGray"),
                    alpha.clone(),
                );
                let smask_id = doc.add_object(smask);
                dict.set("SMask", Object::Reference(smask_id));
            }
            doc.add_object(Stream::new(dict, rgb.clone()))
        }
    }
}

fn image_dict(width: u32, height: u32, color_space: &str) -> Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => color_space,
        "BitsPerComponent" => 8,
    }
}

fn add_embedded_font(doc: &mut Document, font: &RegisteredFont) -> ObjectId {
    let base = sanitize_font_name(&font.name);
    let metrics = &font.metrics;
    // CFF-flavored OpenType starts with "OTTO" and embeds as FontFile3.
    let is_cff = font.data.starts_with(b"OTTO");

    let mut file_dict = dictionary! { "Length1" => font.data.len() as i64 };
    if is_cff {
        file_dict.set("Subtype", "OpenType");
    }
    let file_id = doc.add_object(Stream::new(file_dict, font.data.clone()));

    let mut flags: i64 = 32;
    if metrics.is_fixed_pitch {
        flags |= 1;
    }
    let (file_key, subtype) = if is_cff {
        ("FontFile3", "Type1")
    } else {
        ("FontFile2", "TrueType")
    };
    let (x_min, y_min, x_max, y_max) = metrics.bbox;
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => Object::Name(base.as_bytes().to_vec()),
        "Flags" => flags,
        "FontBBox" => vec![
            (x_min as i64).into(),
            (y_min as i64).into(),
            (x_max as i64).into(),
            (y_max as i64).into(),
        ],
        "ItalicAngle" => metrics.italic_angle as i64,
        "Ascent" => metrics.ascent as i64,
        "Descent" => metrics.descent as i64,
        "CapHeight" => metrics.cap_height as i64,
        "StemV" => 80,
        "MissingWidth" => metrics.missing_width as i64,
        file_key => Object::Reference(file_id),
    });

    let widths: Vec<Object> = metrics
        .widths
        .iter()
        .map(|width| Object::Integer(*width as i64))
        .collect();
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => subtype,
        "BaseFont" => Object::Name(base.into_bytes()),
        "FirstChar" => metrics.first_char as i64,
        "LastChar" => metrics.last_char as i64,
        "Widths" => widths,
        "FontDescriptor" => Object::Reference(descriptor_id),
        "Encoding" => "WinAnsiEncoding",
    })
}

fn sanitize_font_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else if ch == ' ' {
            out.push('-');
        }
    }
    if out.is_empty() {
        "EmbeddedFont".to_string()
    } else {
        out
    }
}

/// Escaped single-byte string for a WinAnsi-encoded font. Characters outside the
/// encoding become `?`.
fn encode_winansi_pdf_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let byte = match ch {
            '\u{0000}'..='\u{007F}' | '\u{00A0}'..='\u{00FF}' => ch as u8,
            '\u{20AC}' => 0x80,
            '\u{201A}' => 0x82,
            '\u{201E}' => 0x84,
            '\u{2026}' => 0x85,
            '\u{2020}' => 0x86,
            '\u{2021}' => 0x87,
            '\u{2030}' => 0x89,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{2122}' => 0x99,
            _ => b'?',
        };
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'(' => out.push_str("\\("),
            b')' => out.push_str("\\)"),
            b if !(0x20..0x7f).contains(&b) => out.push_str(&format!("\\{:03o}", b)),
            b => out.push(b as char),
        }
    }
    out
}

fn color_op(color: Color, op: &str) -> String {
    format!(
        "{} {} {} {}\n",
        fmt_unit(color.r),
        fmt_unit(color.g),
        fmt_unit(color.b),
        op
    )
}

fn fmt_unit(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    format_milli((value.clamp(0.0, 1.0) * 1000.0).round() as i64)
}

fn format_milli(milli: i64) -> String {
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.unsigned_abs();
    let int_part = abs / 1000;
    let frac_part = abs % 1000;
    if frac_part == 0 {
        return format!("{}{}", sign, int_part);
    }
    let frac = format!("{:03}", frac_part);
    format!("{}{}.{}", sign, int_part, frac.trim_end_matches('0'))
}

fn fmt_pt(value: Pt) -> String {
    format_milli(value.to_milli_i64())
}

fn pt_object(value: Pt) -> Object {
    let milli = value.to_milli_i64();
    if milli % 1000 == 0 {
        Object::Integer(milli / 1000)
    } else {
        Object::Real(value.to_f64() as _)
    }
}
