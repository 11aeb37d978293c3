use crate::expr::{self, Scope};
use crate::model::{Field, FieldIndex};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};
use log::warn;

/// Literal result of any formula that fails to parse or evaluate.
pub const FORMULA_ERROR: &str = "Error";

/// Evaluates `expression` against the field snapshot using the local clock.
pub fn evaluate_formula(expression: &str, fields: &[Field]) -> String {
    evaluate_formula_at(expression, fields, Local::now().naive_local())
}

/// Same as [`evaluate_formula`] with an explicit clock for `TODAY()` and `NOW()`.
pub fn evaluate_formula_at(expression: &str, fields: &[Field], now: NaiveDateTime) -> String {
    let index = FieldIndex::new(fields);
    evaluate_with_index(expression, &index, now)
}

pub(crate) fn evaluate_with_index(
    expression: &str,
    index: &FieldIndex<'_>,
    now: NaiveDateTime,
) -> String {
    if expression.trim().is_empty() {
        return String::new();
    }
    let result = expr::parse(expression).and_then(|ast| Scope::new(index, now).eval(&ast));
    match result {
        Ok(value) => value.into_result_text(),
        Err(err) => {
            warn!("formula {:?} failed: {}", preview(expression), err);
            FORMULA_ERROR.to_string()
        }
    }
}

fn preview(expression: &str) -> &str {
    match expression.char_indices().nth(80) {
        Some((idx, _)) => &expression[..idx],
        None => expression,
    }
}

/// Number text as a browser would print it: integral values without a fraction,
/// `NaN`/`Infinity`, exponent form outside `[1e-6, 1e21)`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let text = format!("{:e}", n);
        return match text.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => text,
        };
    }
    format!("{}", n)
}

/// Accepts `YYYY-MM-DD`, RFC 3339, `YYYY-MM-DDTHH:MM:SS` and `MM/DD/YYYY`. The flag is
/// true when the text carried a time of day.
pub fn parse_date_text(raw: &str) -> Option<(NaiveDateTime, bool)> {
    let s = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some((date.and_time(NaiveTime::MIN), false));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some((dt.naive_local(), true));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some((dt, true));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%m/%d/%Y") {
        return Some((date.and_time(NaiveTime::MIN), false));
    }
    None
}

const DATE_TOKENS: [(&str, &str); 7] = [
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("mm", "%M"),
    ("ss", "%S"),
];

/// Expands `YYYY YY MM DD HH mm ss` in `pattern`; everything else is copied through.
pub fn format_date_pattern(at: &NaiveDateTime, pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    'outer: while let Some(ch) = rest.chars().next() {
        for (token, spec) in DATE_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(&at.format(spec).to_string());
                rest = tail;
                continue 'outer;
            }
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}
