use crate::store::StorageError;
use std::fmt;

#[derive(Debug)]
pub enum FieldFlatError {
    PageOutOfRange {
        field_id: String,
        page_number: i64,
        page_count: usize,
    },
    MissingSigner(String),
    InvalidConfiguration(String),
    Pdf(String),
    Storage(StorageError),
    Io(std::io::Error),
}

impl fmt::Display for FieldFlatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldFlatError::PageOutOfRange {
                field_id,
                page_number,
                page_count,
            } => write!(
                f,
                "field {} is placed on page {} but the document has {} page(s)",
                field_id, page_number, page_count
            ),
            FieldFlatError::MissingSigner(document_id) => {
                write!(f, "document {} has no signer", document_id)
            }
            FieldFlatError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            FieldFlatError::Pdf(message) => write!(f, "pdf error: {}", message),
            FieldFlatError::Storage(err) => write!(f, "storage error: {}", err),
            FieldFlatError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for FieldFlatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FieldFlatError::Storage(err) => Some(err),
            FieldFlatError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FieldFlatError {
    fn from(value: std::io::Error) -> Self {
        FieldFlatError::Io(value)
    }
}

impl From<StorageError> for FieldFlatError {
    fn from(value: StorageError) -> Self {
        FieldFlatError::Storage(value)
    }
}

impl From<lopdf::Error> for FieldFlatError {
    fn from(value: lopdf::Error) -> Self {
        FieldFlatError::Pdf(value.to_string())
    }
}
