//! Per-type painting of resolved fields.
//!
//! Every field paints background and border first, then its value. A field whose value
//! cannot be painted (a corrupt signature image, say) paints a fallback label instead and
//! reports [`RenderOutcome::Fallback`]; rendering of the rest of the page carries on.

use crate::canvas::{DecodedImage, ImagePixels, JpegColor, PaintSurface, Stroke, TextStyle};
use crate::condition::is_checked_value;
use crate::font::DEFAULT_FONT;
use crate::formula::parse_date_text;
use crate::model::{Field, FieldType};
use crate::pipeline::ResolvedField;
use crate::types::{Color, Pt, Rect};
use base64::Engine;
use image::GenericImageView;
use log::warn;
use std::sync::Arc;

pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub font_name: String,
    pub font_size: Pt,
    /// Horizontal inset applied on both sides of text.
    pub padding: Pt,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            font_name: DEFAULT_FONT.to_string(),
            font_size: Pt::from_f32(12.0),
            padding: Pt::from_f32(4.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Skipped,
    Painted,
    Fallback(String),
}

pub fn render_field<S: PaintSurface + ?Sized>(
    surface: &mut S,
    resolved: &ResolvedField,
    rect: Rect,
    options: &RenderOptions,
) -> RenderOutcome {
    if !resolved.should_render() {
        return RenderOutcome::Skipped;
    }
    let field = &resolved.field;
    draw_frame(surface, field, rect);

    let value = field.value.as_str();
    match &field.field_type {
        FieldType::Signature | FieldType::Initial => {
            render_signature(surface, field, rect, options)
        }
        FieldType::Checkbox => {
            render_checkbox(surface, field, rect);
            RenderOutcome::Painted
        }
        FieldType::Date => {
            draw_fitted_text(surface, field, rect, &format_date_display(value), options);
            RenderOutcome::Painted
        }
        FieldType::Radio => {
            render_radio(surface, field, rect, options);
            RenderOutcome::Painted
        }
        FieldType::Formula => {
            let text = format_formula_display(value, &field.validation_rule);
            draw_fitted_text(surface, field, rect, &text, options);
            RenderOutcome::Painted
        }
        FieldType::Payment => {
            draw_fitted_text(surface, field, rect, &format_usd(value), options);
            RenderOutcome::Painted
        }
        FieldType::Text
        | FieldType::Email
        | FieldType::Phone
        | FieldType::Number
        | FieldType::Dropdown
        | FieldType::Other(_) => {
            draw_fitted_text(surface, field, rect, value, options);
            RenderOutcome::Painted
        }
    }
}

fn style_color(raw: &str) -> Option<Color> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| Color::from_hex_or_gray(raw))
}

fn draw_frame<S: PaintSurface + ?Sized>(surface: &mut S, field: &Field, rect: Rect) {
    let fill = style_color(&field.background_color);
    let stroke = style_color(&field.border_color).map(|color| Stroke::new(color, 1.0));
    surface.draw_rect(rect, fill, stroke);
}

fn text_style(field: &Field, options: &RenderOptions) -> TextStyle {
    let font_name = match field.font_family.trim() {
        "" => options.font_name.clone(),
        family => family.to_string(),
    };
    let font_size = field
        .font_size
        .filter(|size| size.is_finite() && *size > 0.0)
        .map(Pt::from_f32)
        .unwrap_or(options.font_size);
    let color = style_color(&field.text_color)
        .or_else(|| style_color(&field.color))
        .unwrap_or(Color::BLACK);
    TextStyle {
        font_name,
        font_size,
        color,
    }
}

/// Longest prefix of `text` that, followed by `...`, fits in `max_width`. Text that fits
/// as is comes back unchanged; when not even the ellipsis fits the result is empty.
pub fn fit_text<S: PaintSurface + ?Sized>(
    surface: &S,
    text: &str,
    style: &TextStyle,
    max_width: Pt,
) -> String {
    let measure = |candidate: &str| {
        surface.measure_text_width(&style.font_name, style.font_size, candidate)
    };
    if measure(text) <= max_width {
        return text.to_string();
    }
    let boundaries: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
    let with_ellipsis = |chars: usize| {
        let end = boundaries.get(chars).copied().unwrap_or(text.len());
        format!("{}{}", text[..end].trim_end(), ELLIPSIS)
    };
    if measure(ELLIPSIS) > max_width {
        return String::new();
    }
    // Widths grow with the prefix, so binary search the longest one that fits.
    let (mut lo, mut hi) = (0usize, boundaries.len());
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if measure(&with_ellipsis(mid)) <= max_width {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    with_ellipsis(lo)
}

fn draw_fitted_text<S: PaintSurface + ?Sized>(
    surface: &mut S,
    field: &Field,
    rect: Rect,
    text: &str,
    options: &RenderOptions,
) {
    let style = text_style(field, options);
    draw_text_in(surface, rect, text, &style, options.padding);
}

fn draw_text_in<S: PaintSurface + ?Sized>(
    surface: &mut S,
    rect: Rect,
    text: &str,
    style: &TextStyle,
    padding: Pt,
) {
    let max_width = rect.width - padding - padding;
    let fitted = fit_text(surface, text, style, max_width);
    if fitted.is_empty() {
        return;
    }
    let ascent = surface.font_ascent(&style.font_name, style.font_size);
    let baseline = rect.y + (rect.height - ascent) / 2;
    surface.draw_text(rect.x + padding, baseline, &fitted, style);
}

fn render_signature<S: PaintSurface + ?Sized>(
    surface: &mut S,
    field: &Field,
    rect: Rect,
    options: &RenderOptions,
) -> RenderOutcome {
    match decode_data_uri_image(&field.value) {
        Ok(image) => {
            let target = fit_image(rect, image.width, image.height);
            surface.draw_image(target, Arc::new(image));
            RenderOutcome::Painted
        }
        Err(reason) => {
            warn!("field {}: {}; drawing fallback label", field.id, reason);
            let label = if field.field_type == FieldType::Initial {
                "Initial"
            } else {
                "Signature"
            };
            draw_fitted_text(surface, field, rect, label, options);
            RenderOutcome::Fallback(reason)
        }
    }
}

/// Largest rect with the image's aspect ratio that fits `rect`, centered in it.
pub fn fit_image(rect: Rect, width: u32, height: u32) -> Rect {
    let (w, h) = (rect.width.to_f64(), rect.height.to_f64());
    if width == 0 || height == 0 || w <= 0.0 || h <= 0.0 {
        return rect;
    }
    let scale = (w / width as f64).min(h / height as f64);
    let fit_w = width as f64 * scale;
    let fit_h = height as f64 * scale;
    Rect::new(
        rect.x.to_f64() + (w - fit_w) / 2.0,
        rect.y.to_f64() + (h - fit_h) / 2.0,
        fit_w,
        fit_h,
    )
}

/// Decodes a `data:image/png;base64,...` or `data:image/jpeg;base64,...` URI.
pub fn decode_data_uri_image(uri: &str) -> Result<DecodedImage, String> {
    let uri = uri.trim();
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| "signature value is not a data URI".to_string())?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URI has no payload".to_string())?;
    let mime = header.split(';').next().unwrap_or("").to_ascii_lowercase();
    let format = if mime.contains("png") {
        image::ImageFormat::Png
    } else if mime.contains("jpeg") || mime.contains("jpg") {
        image::ImageFormat::Jpeg
    } else {
        return Err(format!("unsupported image type {:?}", mime));
    };
    if !header.contains("base64") {
        return Err("data URI is not base64 encoded".to_string());
    }
    let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| format!("invalid base64 payload: {}", err))?;
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|err| format!("undecodable image: {}", err))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err("image has no pixels".to_string());
    }

    if format == image::ImageFormat::Jpeg {
        let color = match jpeg_color(&bytes) {
            Some(color) => color,
            None if matches!(decoded.color(), image::ColorType::L8 | image::ColorType::La8) => {
                JpegColor::Gray
            }
            None => JpegColor::Rgb,
        };
        return Ok(DecodedImage {
            width,
            height,
            pixels: ImagePixels::Jpeg { data: bytes, color },
        });
    }

    let rgba = decoded.to_rgba8();
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    let mut has_alpha = false;
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        has_alpha |= a != 255;
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }
    Ok(DecodedImage {
        width,
        height,
        pixels: ImagePixels::Rgb {
            rgb,
            alpha: has_alpha.then_some(alpha),
        },
    })
}

/// Reads the component count from the first SOF segment. An Adobe APP14 segment ahead of
/// it marks four-component data as inverted.
fn jpeg_color(bytes: &[u8]) -> Option<JpegColor> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut adobe = false;
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if matches!(marker, 0x01 | 0xD0..=0xD7) {
            pos += 2;
            continue;
        }
        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        let segment = bytes.get(pos + 4..pos + 2 + len)?;
        match marker {
            0xEE if segment.starts_with(b"Adobe") => adobe = true,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                return match segment.get(5)? {
                    1 => Some(JpegColor::Gray),
                    3 => Some(JpegColor::Rgb),
                    4 if adobe => Some(JpegColor::InvertedCmyk),
                    4 => Some(JpegColor::Cmyk),
                    _ => None,
                };
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }
        pos += 2 + len;
    }
    None
}

fn render_checkbox<S: PaintSurface + ?Sized>(surface: &mut S, field: &Field, rect: Rect) {
    let side = rect.width.min(rect.height);
    let x = rect.x + (rect.width - side) / 2;
    let y = rect.y + (rect.height - side) / 2;
    let color = style_color(&field.border_color).unwrap_or(Color::BLACK);
    surface.draw_rect(
        Rect {
            x,
            y,
            width: side,
            height: side,
        },
        None,
        Some(Stroke::new(color, 1.0)),
    );
    if !is_checked_value(&field.value) {
        return;
    }
    let mark = style_color(&field.text_color).unwrap_or(Color::BLACK);
    let weight = (side.to_f32() * 0.1).max(1.0);
    let at = |fx: f32, fy: f32| (x + side * fx, y + side * fy);
    surface.draw_polyline(
        &[at(0.2, 0.5), at(0.42, 0.25), at(0.8, 0.78)],
        Stroke::new(mark, weight),
    );
}

fn render_radio<S: PaintSurface + ?Sized>(
    surface: &mut S,
    field: &Field,
    rect: Rect,
    options: &RenderOptions,
) {
    let value = field.value.trim();
    if !field.option_list().contains(&value) {
        draw_fitted_text(surface, field, rect, &field.value, options);
        return;
    }
    let style = text_style(field, options);
    let diameter = (rect.height * 0.6).min(rect.width);
    let radius = diameter / 2;
    let cx = rect.x + options.padding + radius;
    let cy = rect.y + rect.height / 2;
    surface.draw_circle(cx, cy, radius, None, Some(Stroke::new(style.color, 1.0)));
    surface.draw_circle(cx, cy, radius * 0.5, Some(style.color), None);

    let text_x = rect.x + options.padding + diameter;
    let text_rect = Rect {
        x: text_x,
        y: rect.y,
        width: (rect.right() - text_x).max(Pt::ZERO),
        height: rect.height,
    };
    draw_text_in(surface, text_rect, &field.value, &style, options.padding);
}

/// `MM/DD/YYYY` when the value parses as a date, the raw value otherwise.
pub fn format_date_display(value: &str) -> String {
    match parse_date_text(value) {
        Some((at, _)) => at.format("%m/%d/%Y").to_string(),
        None => value.to_string(),
    }
}

/// Numeric results of arithmetic get two decimals; other whole numbers print as integers.
pub fn format_formula_display(value: &str, expression: &str) -> String {
    let Ok(number) = value.trim().parse::<f64>() else {
        return value.to_string();
    };
    if !number.is_finite() {
        return value.to_string();
    }
    if has_arithmetic_operator(expression) {
        return format!("{:.2}", number);
    }
    if number.fract() == 0.0 && number.abs() < 1e15 {
        return format!("{}", number as i64);
    }
    value.to_string()
}

fn has_arithmetic_operator(expression: &str) -> bool {
    let mut rest = expression;
    let mut outside = String::with_capacity(expression.len());
    while let Some(start) = rest.find("${") {
        outside.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
            }
        }
    }
    outside.push_str(rest);
    outside.contains(['+', '-', '*', '/'])
}

/// US dollars with thousands separators and two decimals; unparseable input is `$0.00`.
pub fn format_usd(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|ch| *ch != '$' && *ch != ',')
        .collect();
    let amount = cleaned
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .unwrap_or(0.0);
    let cents = (amount.abs() * 100.0).round();
    if cents >= u64::MAX as f64 {
        return "$0.00".to_string();
    }
    let cents = cents as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, ch) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}
