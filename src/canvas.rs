use crate::font::{BuiltinFont, DEFAULT_FONT, FontRegistry};
use crate::types::{Color, Pt, Rect, Size};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// Control-point distance for approximating a quarter circle with one cubic Bezier.
const KAPPA: f32 = 0.552_284_8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stroke {
    pub color: Color,
    pub width: Pt,
}

impl Stroke {
    pub fn new(color: Color, width: f32) -> Self {
        Self {
            color,
            width: Pt::from_f32(width),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub font_name: String,
    pub font_size: Pt,
    pub color: Color,
}

/// Raster ready for embedding. JPEG payloads are kept as is; everything else is decoded
/// to 8-bit RGB with an optional alpha plane, both row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: ImagePixels,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImagePixels {
    Jpeg { data: Vec<u8>, color: JpegColor },
    Rgb { rgb: Vec<u8>, alpha: Option<Vec<u8>> },
}

/// Colour model of an embedded JPEG, taken from its frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegColor {
    Gray,
    Rgb,
    Cmyk,
    /// CMYK written by Adobe tools, stored with inverted components.
    InvertedCmyk,
}

/// Page-paint capability. Coordinates are page space: points, origin bottom-left.
pub trait PaintSurface {
    fn draw_rect(&mut self, rect: Rect, fill: Option<Color>, stroke: Option<Stroke>);
    /// `baseline` is the y of the text baseline.
    fn draw_text(&mut self, x: Pt, baseline: Pt, text: &str, style: &TextStyle);
    fn draw_image(&mut self, rect: Rect, image: Arc<DecodedImage>);
    fn draw_polyline(&mut self, points: &[(Pt, Pt)], stroke: Stroke);
    fn draw_circle(
        &mut self,
        cx: Pt,
        cy: Pt,
        radius: Pt,
        fill: Option<Color>,
        stroke: Option<Stroke>,
    );
    fn measure_text_width(&self, font_name: &str, font_size: Pt, text: &str) -> Pt;
    fn font_ascent(&self, font_name: &str, font_size: Pt) -> Pt;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SaveState,
    RestoreState,
    SetFillColor(Color),
    SetStrokeColor(Color),
    SetLineWidth(Pt),
    SetFontName(String),
    SetFontSize(Pt),
    MoveTo {
        x: Pt,
        y: Pt,
    },
    LineTo {
        x: Pt,
        y: Pt,
    },
    CurveTo {
        x1: Pt,
        y1: Pt,
        x2: Pt,
        y2: Pt,
        x: Pt,
        y: Pt,
    },
    ClosePath,
    Fill,
    Stroke,
    FillStroke,
    DrawRect {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
    },
    DrawString {
        x: Pt,
        y: Pt,
        text: String,
    },
    DrawImage {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
        resource_id: String,
    },
}

/// Recorded paint of one page, ready to be emitted as a PDF content stream.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_size: Size,
    pub commands: Vec<Command>,
    pub images: BTreeMap<String, Arc<DecodedImage>>,
    pub fonts_used: BTreeSet<String>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone)]
struct GraphicsState {
    fill_color: Color,
    stroke_color: Color,
    line_width: Pt,
    font_size: Pt,
    font_name: String,
}

pub struct Canvas {
    page_size: Size,
    commands: Vec<Command>,
    images: BTreeMap<String, Arc<DecodedImage>>,
    fonts_used: BTreeSet<String>,
    state_stack: Vec<GraphicsState>,
    current_state: GraphicsState,
    fonts: Option<Arc<FontRegistry>>,
}

impl Canvas {
    pub fn new(page_size: Size) -> Self {
        Self {
            page_size,
            commands: Vec::new(),
            images: BTreeMap::new(),
            fonts_used: BTreeSet::new(),
            state_stack: Vec::new(),
            current_state: GraphicsState {
                fill_color: Color::BLACK,
                stroke_color: Color::BLACK,
                line_width: Pt::from_f32(1.0),
                font_size: Pt::from_f32(12.0),
                font_name: DEFAULT_FONT.to_string(),
            },
            fonts: None,
        }
    }

    pub fn with_fonts(page_size: Size, fonts: Arc<FontRegistry>) -> Self {
        let mut canvas = Self::new(page_size);
        canvas.fonts = Some(fonts);
        canvas
    }

    pub fn page_size(&self) -> Size {
        self.page_size
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn save_state(&mut self) {
        self.state_stack.push(self.current_state.clone());
        self.commands.push(Command::SaveState);
    }

    pub fn restore_state(&mut self) {
        if let Some(state) = self.state_stack.pop() {
            self.current_state = state;
            self.commands.push(Command::RestoreState);
        }
    }

    pub fn set_fill_color(&mut self, color: Color) {
        if self.current_state.fill_color == color {
            return;
        }
        self.current_state.fill_color = color;
        self.commands.push(Command::SetFillColor(color));
    }

    pub fn set_stroke_color(&mut self, color: Color) {
        if self.current_state.stroke_color == color {
            return;
        }
        self.current_state.stroke_color = color;
        self.commands.push(Command::SetStrokeColor(color));
    }

    pub fn set_line_width(&mut self, width: Pt) {
        let width = width.max(Pt::ZERO);
        if self.current_state.line_width == width {
            return;
        }
        self.current_state.line_width = width;
        self.commands.push(Command::SetLineWidth(width));
    }

    pub fn set_font_name(&mut self, name: &str) {
        if self.current_state.font_name == name {
            return;
        }
        self.current_state.font_name = name.to_string();
        self.commands
            .push(Command::SetFontName(self.current_state.font_name.clone()));
    }

    pub fn set_font_size(&mut self, size: Pt) {
        if self.current_state.font_size == size {
            return;
        }
        self.current_state.font_size = size;
        self.commands.push(Command::SetFontSize(size));
    }

    pub fn move_to(&mut self, x: Pt, y: Pt) {
        self.commands.push(Command::MoveTo { x, y });
    }

    pub fn line_to(&mut self, x: Pt, y: Pt) {
        self.commands.push(Command::LineTo { x, y });
    }

    pub fn curve_to(&mut self, x1: Pt, y1: Pt, x2: Pt, y2: Pt, x: Pt, y: Pt) {
        self.commands.push(Command::CurveTo {
            x1,
            y1,
            x2,
            y2,
            x,
            y,
        });
    }

    pub fn close_path(&mut self) {
        self.commands.push(Command::ClosePath);
    }

    // Colors must be set before the path; PDF forbids state changes inside a path.
    fn set_paint_style(&mut self, fill: Option<Color>, stroke: Option<Stroke>) {
        if let Some(color) = fill {
            self.set_fill_color(color);
        }
        if let Some(stroke) = stroke {
            self.set_stroke_color(stroke.color);
            self.set_line_width(stroke.width);
        }
    }

    fn paint_path(&mut self, fill: bool, stroke: bool) {
        match (fill, stroke) {
            (true, true) => self.commands.push(Command::FillStroke),
            (true, false) => self.commands.push(Command::Fill),
            (false, true) => self.commands.push(Command::Stroke),
            (false, false) => {}
        }
    }

    pub fn finish(self) -> Page {
        Page {
            page_size: self.page_size,
            commands: self.commands,
            images: self.images,
            fonts_used: self.fonts_used,
        }
    }
}

impl PaintSurface for Canvas {
    fn draw_rect(&mut self, rect: Rect, fill: Option<Color>, stroke: Option<Stroke>) {
        if fill.is_none() && stroke.is_none() {
            return;
        }
        self.save_state();
        self.set_paint_style(fill, stroke);
        self.commands.push(Command::DrawRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
        self.paint_path(fill.is_some(), stroke.is_some());
        self.restore_state();
    }

    fn draw_text(&mut self, x: Pt, baseline: Pt, text: &str, style: &TextStyle) {
        if text.is_empty() {
            return;
        }
        self.save_state();
        self.set_fill_color(style.color);
        self.set_font_name(&style.font_name);
        self.set_font_size(style.font_size);
        self.fonts_used.insert(style.font_name.clone());
        self.commands.push(Command::DrawString {
            x,
            y: baseline,
            text: text.to_string(),
        });
        self.restore_state();
    }

    fn draw_image(&mut self, rect: Rect, image: Arc<DecodedImage>) {
        let resource_id = format!("Im{}", self.images.len() + 1);
        self.images.insert(resource_id.clone(), image);
        self.commands.push(Command::DrawImage {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            resource_id,
        });
    }

    fn draw_polyline(&mut self, points: &[(Pt, Pt)], stroke: Stroke) {
        let Some(((x0, y0), rest)) = points.split_first() else {
            return;
        };
        self.save_state();
        self.set_paint_style(None, Some(stroke));
        self.move_to(*x0, *y0);
        for (x, y) in rest {
            self.line_to(*x, *y);
        }
        self.paint_path(false, true);
        self.restore_state();
    }

    fn draw_circle(
        &mut self,
        cx: Pt,
        cy: Pt,
        radius: Pt,
        fill: Option<Color>,
        stroke: Option<Stroke>,
    ) {
        if fill.is_none() && stroke.is_none() {
            return;
        }
        let r = radius;
        let k = radius * KAPPA;
        self.save_state();
        self.set_paint_style(fill, stroke);
        self.move_to(cx + r, cy);
        self.curve_to(cx + r, cy + k, cx + k, cy + r, cx, cy + r);
        self.curve_to(cx - k, cy + r, cx - r, cy + k, cx - r, cy);
        self.curve_to(cx - r, cy - k, cx - k, cy - r, cx, cy - r);
        self.curve_to(cx + k, cy - r, cx + r, cy - k, cx + r, cy);
        self.close_path();
        self.paint_path(fill.is_some(), stroke.is_some());
        self.restore_state();
    }

    fn measure_text_width(&self, font_name: &str, font_size: Pt, text: &str) -> Pt {
        match &self.fonts {
            Some(fonts) => fonts.measure_text_width(font_name, font_size, text),
            None => BuiltinFont::for_family(font_name).measure_text_width(font_size, text),
        }
    }

    fn font_ascent(&self, font_name: &str, font_size: Pt) -> Pt {
        match &self.fonts {
            Some(fonts) => fonts.ascent(font_name, font_size),
            None => {
                let units = BuiltinFont::for_family(font_name).ascent();
                font_size.mul_ratio(units as i32, 1000)
            }
        }
    }
}
