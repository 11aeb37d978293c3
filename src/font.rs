use crate::error::FieldFlatError;
use crate::types::Pt;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_FONT: &str = "Helvetica";

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TextWidthKey {
    font: FontKey,
    size_milli: i64,
    text: String,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum FontKey {
    Registered(usize),
    Builtin(BuiltinFont),
}

#[derive(Debug)]
struct TextWidthCache {
    map: HashMap<TextWidthKey, Pt>,
    order: VecDeque<TextWidthKey>,
    max_entries: usize,
}

impl TextWidthCache {
    fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&self, key: &TextWidthKey) -> Option<Pt> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: TextWidthKey, value: Pt) {
        if self.map.contains_key(&key) {
            return;
        }
        self.map.insert(key.clone(), value);
        self.order.push_back(key);
        while self.map.len() > self.max_entries {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&old);
        }
    }
}

/// Standard PDF fonts available without embedding.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum BuiltinFont {
    Helvetica,
    Courier,
}

// Helvetica advance widths for U+0020..=U+007E, 1/1000 em.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // 0..9
    278, 278, 584, 584, 584, 556, 1015, // :..@
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, 667, 778,
    722, 667, 611, 722, 667, 944, 667, 667, 611, // A..Z
    278, 278, 278, 469, 556, 333, // [..`
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, 556, 556,
    333, 500, 278, 556, 500, 722, 500, 500, 500, // a..z
    334, 260, 334, 584, // {..~
];

impl BuiltinFont {
    /// Courier for monospace family names, Helvetica for everything else.
    pub fn for_family(name: &str) -> BuiltinFont {
        let key = normalize_name(name);
        if key.contains("courier") || key.contains("mono") {
            BuiltinFont::Courier
        } else {
            BuiltinFont::Helvetica
        }
    }

    pub fn base_font(self) -> &'static str {
        match self {
            BuiltinFont::Helvetica => "Helvetica",
            BuiltinFont::Courier => "Courier",
        }
    }

    fn advance(self, ch: char) -> u16 {
        match self {
            BuiltinFont::Courier => 600,
            BuiltinFont::Helvetica => {
                let code = ch as u32;
                if (0x20..=0x7e).contains(&code) {
                    HELVETICA_WIDTHS[(code - 0x20) as usize]
                } else {
                    556
                }
            }
        }
    }

    pub fn ascent(self) -> i16 {
        match self {
            BuiltinFont::Helvetica => 718,
            BuiltinFont::Courier => 629,
        }
    }

    pub fn descent(self) -> i16 {
        match self {
            BuiltinFont::Helvetica => -207,
            BuiltinFont::Courier => -157,
        }
    }

    pub fn measure_text_width(self, font_size: Pt, text: &str) -> Pt {
        let units = text
            .chars()
            .fold(0i32, |acc, ch| acc.saturating_add(self.advance(ch) as i32));
        font_size.mul_ratio(units, 1000)
    }
}

#[derive(Debug)]
pub struct RegisteredFont {
    pub name: String,
    pub data: Vec<u8>,
    pub metrics: FontMetrics,
}

/// Metrics of a registered TrueType/OpenType face, scaled to 1/1000 em and laid out for
/// the single-byte range `first_char..=last_char`.
#[derive(Debug)]
pub struct FontMetrics {
    pub first_char: u8,
    pub last_char: u8,
    pub widths: Vec<u16>,
    pub ascent: i16,
    pub descent: i16,
    pub cap_height: i16,
    pub italic_angle: i16,
    pub bbox: (i16, i16, i16, i16),
    pub missing_width: u16,
    pub is_fixed_pitch: bool,
}

impl FontMetrics {
    fn from_face(face: &ttf_parser::Face<'_>) -> Self {
        let units_per_em = face.units_per_em().max(1);
        let scale = 1000.0 / units_per_em as f32;
        let first_char = 32u8;
        let last_char = 255u8;
        let widths = build_widths(face, scale, first_char, last_char);
        let missing_width = widths.first().copied().unwrap_or(0);

        let ascent = scale_i16(face.ascender(), scale);
        let descent = scale_i16(face.descender(), scale);
        let cap_height = face
            .capital_height()
            .map(|value| scale_i16(value, scale))
            .unwrap_or(ascent);
        let bbox = face.global_bounding_box();
        let bbox = (
            scale_i16(bbox.x_min, scale),
            scale_i16(bbox.y_min, scale),
            scale_i16(bbox.x_max, scale),
            scale_i16(bbox.y_max, scale),
        );
        let italic_angle = face
            .italic_angle()
            .map(|value| value.round() as i16)
            .unwrap_or(0);

        Self {
            first_char,
            last_char,
            widths,
            ascent,
            descent,
            cap_height,
            italic_angle,
            bbox,
            missing_width,
            is_fixed_pitch: face.is_monospaced(),
        }
    }

    fn advance_for_char(&self, ch: char) -> u16 {
        let code = ch as u32;
        let first = self.first_char as u32;
        let last = self.last_char as u32;
        if code < first || code > last {
            return self.missing_width;
        }
        self.widths
            .get((code - first) as usize)
            .copied()
            .unwrap_or(self.missing_width)
    }

    fn measure_text_width(&self, font_size: Pt, text: &str) -> Pt {
        let units = text
            .chars()
            .fold(0i32, |acc, ch| acc.saturating_add(self.advance_for_char(ch) as i32));
        if units <= 0 {
            return Pt::ZERO;
        }
        font_size.mul_ratio(units, 1000)
    }
}

/// Fonts available to text fields. Names that do not resolve to a registered face fall
/// back to a built-in font, so measuring never fails.
#[derive(Debug)]
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
    text_width_cache: Mutex<TextWidthCache>,
}

impl Default for FontRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FontRegistry {
    pub fn new() -> Self {
        Self {
            fonts: Vec::new(),
            lookup: HashMap::new(),
            text_width_cache: Mutex::new(TextWidthCache::new(20_000)),
        }
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    /// Registers every `.ttf`/`.otf` file directly inside `path`. Returns how many loaded.
    pub fn register_dir(&mut self, path: impl AsRef<Path>) -> Result<usize, FieldFlatError> {
        let mut loaded = 0;
        for entry in fs::read_dir(path.as_ref())?.flatten() {
            let path = entry.path();
            if path.is_file() && self.register_file(&path)?.is_some() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Registers a font file. Files without a font extension are skipped (`Ok(None)`).
    pub fn register_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<Option<String>, FieldFlatError> {
        let path = path.as_ref();
        let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
            return Ok(None);
        };
        let ext = ext.to_ascii_lowercase();
        if ext != "ttf" && ext != "otf" {
            return Ok(None);
        }
        let data = fs::read(path)?;
        let source = path.to_string_lossy();
        self.register_bytes(data, Some(&source)).map(Some)
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, FieldFlatError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            return Err(FieldFlatError::InvalidConfiguration(format!(
                "invalid font data for {source}"
            )));
        };

        let (name, aliases) = font_names(&face, Path::new(source));
        let metrics = FontMetrics::from_face(&face);
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name: name.clone(),
            data,
            metrics,
        });

        for alias in std::iter::once(name.clone()).chain(aliases) {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }
        log::debug!("registered font {} from {}", name, source);
        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        self.lookup
            .get(&normalize_name(name))
            .and_then(|index| self.fonts.get(*index))
    }

    fn key_for(&self, name: &str) -> FontKey {
        match self.lookup.get(&normalize_name(name)) {
            Some(index) => FontKey::Registered(*index),
            None => FontKey::Builtin(BuiltinFont::for_family(name)),
        }
    }

    pub fn measure_text_width(&self, name: &str, font_size: Pt, text: &str) -> Pt {
        let font = self.key_for(name);
        let cache_key = TextWidthKey {
            font,
            size_milli: font_size.to_milli_i64(),
            text: text.to_string(),
        };
        if let Ok(cache) = self.text_width_cache.lock() {
            if let Some(value) = cache.get(&cache_key) {
                return value;
            }
        }
        let value = match font {
            FontKey::Registered(index) => match self.fonts.get(index) {
                Some(registered) => registered.metrics.measure_text_width(font_size, text),
                None => BuiltinFont::Helvetica.measure_text_width(font_size, text),
            },
            FontKey::Builtin(builtin) => builtin.measure_text_width(font_size, text),
        };
        if let Ok(mut cache) = self.text_width_cache.lock() {
            cache.insert(cache_key, value);
        }
        value
    }

    /// Ascent above the baseline at `font_size`.
    pub fn ascent(&self, name: &str, font_size: Pt) -> Pt {
        let units = match self.resolve(name) {
            Some(font) => font.metrics.ascent,
            None => BuiltinFont::for_family(name).ascent(),
        };
        font_size.mul_ratio(units.max(0) as i32, 1000)
    }
}

fn build_widths(face: &ttf_parser::Face<'_>, scale: f32, first: u8, last: u8) -> Vec<u16> {
    (first..=last)
        .map(|code| {
            let width = char::from_u32(code as u32)
                .and_then(|ch| face.glyph_index(ch))
                .and_then(|id| face.glyph_hor_advance(id))
                .unwrap_or(0);
            let scaled = (width as f32 * scale).round() as i32;
            scaled.clamp(0, u16::MAX as i32) as u16
        })
        .collect()
}

fn scale_i16(value: i16, scale: f32) -> i16 {
    let scaled = (value as f32 * scale).round() as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn font_names(face: &ttf_parser::Face<'_>, path: &Path) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        let slot = match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => &mut family,
            name_id::FULL_NAME => &mut full,
            name_id::POST_SCRIPT_NAME => &mut post,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(name);
        }
    }

    let stem = path
        .file_stem()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string());
    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let aliases = [family, full, post, stem]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate != primary)
        .collect();

    (primary, aliases)
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helvetica_widths_follow_the_afm_table() {
        let size = Pt::from_f32(10.0);
        assert_eq!(
            BuiltinFont::Helvetica.measure_text_width(size, "Hi").to_milli_i64(),
            9_440
        );
        assert_eq!(
            BuiltinFont::Helvetica
                .measure_text_width(Pt::from_f32(12.0), "...")
                .to_milli_i64(),
            10_008
        );
        assert_eq!(
            BuiltinFont::Courier.measure_text_width(size, "abc").to_milli_i64(),
            18_000
        );
    }

    #[test]
    fn unknown_names_measure_with_builtin_metrics() {
        let registry = FontRegistry::new();
        let size = Pt::from_f32(12.0);
        assert_eq!(
            registry.measure_text_width("Arial", size, "W"),
            BuiltinFont::Helvetica.measure_text_width(size, "W")
        );
        assert_eq!(
            registry.measure_text_width("Courier New", size, "W").to_milli_i64(),
            7_200
        );
        // Second call is served from the cache and must agree.
        assert_eq!(
            registry.measure_text_width("Courier New", size, "W").to_milli_i64(),
            7_200
        );
    }

    #[test]
    fn ascent_scales_with_size() {
        let registry = FontRegistry::new();
        assert_eq!(
            registry.ascent("Helvetica", Pt::from_f32(10.0)).to_milli_i64(),
            7_180
        );
    }

    #[test]
    fn invalid_font_bytes_are_rejected() {
        let mut registry = FontRegistry::new();
        assert!(registry.register_bytes(vec![0, 1, 2, 3], Some("junk.ttf")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn non_font_files_are_skipped() {
        let mut registry = FontRegistry::new();
        let path = std::env::temp_dir().join("fieldflat_font_skip.txt");
        std::fs::write(&path, b"not a font").expect("write");
        assert!(matches!(registry.register_file(&path), Ok(None)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn text_width_cache_evicts_oldest_entries() {
        let mut cache = TextWidthCache::new(2);
        let key = |text: &str| TextWidthKey {
            font: FontKey::Builtin(BuiltinFont::Helvetica),
            size_milli: 12_000,
            text: text.to_string(),
        };
        cache.insert(key("a"), Pt::from_i32(1));
        cache.insert(key("b"), Pt::from_i32(2));
        cache.insert(key("c"), Pt::from_i32(3));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.get(&key("c")), Some(Pt::from_i32(3)));
    }
}
