use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

use crate::types::Rect;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Signature,
    Initial,
    Text,
    Email,
    Phone,
    Number,
    Date,
    Checkbox,
    Dropdown,
    Radio,
    Formula,
    Payment,
    /// Types this engine does not know; rendered as plain text.
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Signature => "signature",
            FieldType::Initial => "initial",
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Checkbox => "checkbox",
            FieldType::Dropdown => "dropdown",
            FieldType::Radio => "radio",
            FieldType::Formula => "formula",
            FieldType::Payment => "payment",
            FieldType::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "signature" => FieldType::Signature,
            "initial" => FieldType::Initial,
            "text" => FieldType::Text,
            "email" => FieldType::Email,
            "phone" => FieldType::Phone,
            "number" => FieldType::Number,
            "date" => FieldType::Date,
            "checkbox" => FieldType::Checkbox,
            "dropdown" => FieldType::Dropdown,
            "radio" => FieldType::Radio,
            "formula" => FieldType::Formula,
            "payment" => FieldType::Payment,
            _ => FieldType::Other(raw.to_string()),
        }
    }

    /// Signature-class fields always belong to the signer.
    pub fn is_signature_class(&self) -> bool {
        matches!(self, FieldType::Signature | FieldType::Initial)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FieldType::parse(&raw))
    }
}

// Record stores hand back `null` for unset text columns.
fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Field {
    pub id: String,
    pub document_id: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(deserialize_with = "nullable_string")]
    pub label: String,
    #[serde(deserialize_with = "nullable_string")]
    pub placeholder: String,
    pub required: bool,
    pub page_number: i64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(deserialize_with = "nullable_string")]
    pub value: String,
    #[serde(deserialize_with = "nullable_string")]
    pub validation_rule: String,
    #[serde(deserialize_with = "nullable_string")]
    pub conditional_logic: String,
    #[serde(deserialize_with = "nullable_string")]
    pub color: String,
    #[serde(deserialize_with = "nullable_string")]
    pub font_family: String,
    pub font_size: Option<f32>,
    #[serde(deserialize_with = "nullable_string")]
    pub background_color: String,
    #[serde(deserialize_with = "nullable_string")]
    pub border_color: String,
    #[serde(deserialize_with = "nullable_string")]
    pub text_color: String,
    #[serde(deserialize_with = "nullable_string")]
    pub options: String,
    pub signer_id: Option<String>,
}

impl Default for Field {
    fn default() -> Self {
        Self {
            id: String::new(),
            document_id: String::new(),
            field_type: FieldType::Text,
            label: String::new(),
            placeholder: String::new(),
            required: false,
            page_number: 1,
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            value: String::new(),
            validation_rule: String::new(),
            conditional_logic: String::new(),
            color: String::new(),
            font_family: String::new(),
            font_size: None,
            background_color: String::new(),
            border_color: String::new(),
            text_color: String::new(),
            options: String::new(),
            signer_id: None,
        }
    }
}

impl Field {
    pub fn new(id: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            field_type,
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_geometry(mut self, page_number: i64, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.page_number = page_number;
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_rule(mut self, conditional_logic: impl Into<String>) -> Self {
        self.conditional_logic = conditional_logic.into();
        self
    }

    pub fn with_formula(mut self, expression: impl Into<String>) -> Self {
        self.validation_rule = expression.into();
        self
    }

    pub fn has_value(&self) -> bool {
        !self.value.is_empty()
    }

    /// Design-space rectangle, origin top-left.
    pub fn design_rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn option_list(&self) -> Vec<&str> {
        self.options
            .split(',')
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
            .collect()
    }

    pub fn bound_signer(&self) -> Option<&str> {
        self.signer_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignerStatus {
    Pending,
    Viewed,
    Completed,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    pub id: String,
    pub document_id: String,
    pub email: String,
    pub name: String,
    pub status: SignerStatus,
    #[serde(default)]
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Signer {
    pub fn new(id: impl Into<String>, document_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            email: email.into(),
            name: String::new(),
            status: SignerStatus::Pending,
            notified_at: None,
            completed_at: None,
        }
    }
}

/// Id lookup over a field snapshot. When ids collide the first field wins.
pub struct FieldIndex<'a> {
    by_id: HashMap<&'a str, &'a Field>,
}

impl<'a> FieldIndex<'a> {
    pub fn new(fields: &'a [Field]) -> Self {
        let mut by_id = HashMap::with_capacity(fields.len());
        for field in fields {
            by_id.entry(field.id.as_str()).or_insert(field);
        }
        Self { by_id }
    }

    pub fn get(&self, id: &str) -> Option<&'a Field> {
        self.by_id.get(id).copied()
    }

    /// Value of the field, or `None` when it is missing or empty.
    pub fn value(&self, id: &str) -> Option<&'a str> {
        self.get(id)
            .map(|field| field.value.as_str())
            .filter(|value| !value.is_empty())
    }
}
