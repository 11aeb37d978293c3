use fixed::types::I32F32;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Pt(I32F32);

impl Pt {
    pub const ZERO: Pt = Pt(I32F32::from_bits(0));

    pub fn from_f32(value: f32) -> Pt {
        Pt::from_f64(value as f64)
    }

    pub fn from_f64(value: f64) -> Pt {
        if !value.is_finite() {
            return Pt::ZERO;
        }
        let milli = (value * 1000.0).round();
        let milli = milli.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
        Pt::from_milli_i64(milli)
    }

    pub fn from_i32(value: i32) -> Pt {
        Pt::from_milli_i64((value as i64) * 1000)
    }

    pub fn to_f32(self) -> f32 {
        self.0.to_num()
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_num()
    }

    pub fn to_milli_i64(self) -> i64 {
        let bits = self.0.to_bits() as i128;
        let denom = 1i128 << 32;
        let scaled = bits * 1000;
        let adj = if scaled >= 0 { denom / 2 } else { -denom / 2 };
        let milli = (scaled + adj) / denom;
        milli.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Rounds to two decimal digits (hundredths of a point).
    pub fn round_centi(self) -> Pt {
        let milli = self.to_milli_i64() as i128;
        Pt::from_milli_i128(div_round_i128(milli, 10) * 10)
    }

    pub fn max(self, other: Pt) -> Pt {
        if self >= other { self } else { other }
    }

    pub fn min(self, other: Pt) -> Pt {
        if self <= other { self } else { other }
    }

    pub fn abs(self) -> Pt {
        if self.to_milli_i64() < 0 { -self } else { self }
    }

    pub fn mul_ratio(self, num: i32, denom: i32) -> Pt {
        if denom == 0 {
            return Pt::ZERO;
        }
        let milli = self.to_milli_i64() as i128;
        let value = div_round_i128(milli.saturating_mul(num as i128), denom as i128);
        Pt::from_milli_i128(value)
    }

    pub fn from_milli_i64(milli: i64) -> Pt {
        Pt::from_milli_i128(milli as i128)
    }

    fn from_milli_i128(milli: i128) -> Pt {
        let denom = 1i128 << 32;
        let adj = if milli >= 0 { 500 } else { -500 };
        let bits = (milli * denom + adj) / 1000;
        let bits = bits.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        Pt(I32F32::from_bits(bits))
    }
}

impl std::ops::Add for Pt {
    type Output = Pt;
    fn add(self, rhs: Pt) -> Pt {
        Pt::from_milli_i128(self.to_milli_i64() as i128 + rhs.to_milli_i64() as i128)
    }
}

impl std::ops::AddAssign for Pt {
    fn add_assign(&mut self, rhs: Pt) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Pt {
    type Output = Pt;
    fn sub(self, rhs: Pt) -> Pt {
        Pt::from_milli_i128(self.to_milli_i64() as i128 - rhs.to_milli_i64() as i128)
    }
}

impl std::ops::Mul<f32> for Pt {
    type Output = Pt;
    fn mul(self, rhs: f32) -> Pt {
        if !rhs.is_finite() {
            return Pt::ZERO;
        }
        Pt::from_f64(self.to_f64() * rhs as f64)
    }
}

impl std::ops::Div<i32> for Pt {
    type Output = Pt;
    fn div(self, rhs: i32) -> Pt {
        if rhs == 0 {
            Pt::ZERO
        } else {
            let milli = self.to_milli_i64() as i128;
            Pt::from_milli_i128(div_round_i128(milli, rhs as i128))
        }
    }
}

impl std::ops::Neg for Pt {
    type Output = Pt;
    fn neg(self) -> Pt {
        Pt::from_milli_i128(-(self.to_milli_i64() as i128))
    }
}

fn div_round_i128(num: i128, den: i128) -> i128 {
    if den == 0 {
        return 0;
    }
    let den_abs = den.abs();
    if num >= 0 {
        (num + (den_abs / 2)) / den
    } else {
        -(((-num) + (den_abs / 2)) / den)
    }
}

/// Width and height of the reference page field geometry is authored against.
pub const DESIGN_PAGE_WIDTH: f64 = 595.0;
pub const DESIGN_PAGE_HEIGHT: f64 = 842.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: Pt,
    pub height: Pt,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: Pt::from_f64(width),
            height: Pt::from_f64(height),
        }
    }

    pub fn design_page() -> Self {
        Self::new(DESIGN_PAGE_WIDTH, DESIGN_PAGE_HEIGHT)
    }

    pub fn letter() -> Self {
        // 8.5in x 11in at 72pt/in.
        Self::new(612.0, 792.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: Pt,
    pub y: Pt,
    pub width: Pt,
    pub height: Pt,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x: Pt::from_f64(x),
            y: Pt::from_f64(y),
            width: Pt::from_f64(width),
            height: Pt::from_f64(height),
        }
    }

    pub fn rounded(self) -> Self {
        Self {
            x: self.x.round_centi(),
            y: self.y.round_centi(),
            width: self.width.round_centi(),
            height: self.height.round_centi(),
        }
    }

    pub fn right(&self) -> Pt {
        self.x + self.width
    }

    pub fn top(&self) -> Pt {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub const NEUTRAL_GRAY: Color = Color {
        r: 0.5,
        g: 0.5,
        b: 0.5,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rgb` / `#rrggbb` (leading `#` optional).
    pub fn from_hex(value: &str) -> Option<Color> {
        let s = value.trim();
        let s = s.strip_prefix('#').unwrap_or(s);
        if !s.is_ascii() {
            return None;
        }
        let hex = match s.len() {
            3 => {
                let mut out = String::with_capacity(6);
                for ch in s.chars() {
                    out.push(ch);
                    out.push(ch);
                }
                out
            }
            6 => s.to_string(),
            _ => return None,
        };

        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Color::rgb(
            r as f32 / 255.0,
            g as f32 / 255.0,
            b as f32 / 255.0,
        ))
    }

    pub fn from_hex_or_gray(value: &str) -> Color {
        Color::from_hex(value).unwrap_or(Color::NEUTRAL_GRAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_centi_drops_sub_hundredths() {
        assert_eq!(Pt::from_f64(12.345).round_centi().to_milli_i64(), 12_350);
        assert_eq!(Pt::from_f64(12.344).round_centi().to_milli_i64(), 12_340);
        assert_eq!(Pt::from_f64(-1.005).round_centi().to_milli_i64(), -1_010);
    }

    #[test]
    fn hex_colors_parse_short_and_long_forms() {
        assert_eq!(Color::from_hex("#000"), Some(Color::BLACK));
        assert_eq!(Color::from_hex("ffffff"), Some(Color::rgb(1.0, 1.0, 1.0)));
        assert_eq!(Color::from_hex("#12345"), None);
        assert_eq!(Color::from_hex("#gggggg"), None);
        assert_eq!(Color::from_hex_or_gray("tomato"), Color::NEUTRAL_GRAY);
    }

    #[test]
    fn non_finite_values_collapse_to_zero() {
        assert_eq!(Pt::from_f64(f64::NAN), Pt::ZERO);
        assert_eq!(Pt::from_f64(f64::INFINITY), Pt::ZERO);
    }
}
