//! Model validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("{0} can't be null")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ModelError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ModelError {
    fn from(errors: validator::ValidationErrors) -> Self {
        // Report the first offending field; callers only need one actionable message.
        let field_errors = errors.field_errors();
        let mut fields: Vec<_> = field_errors.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        match fields.first() {
            Some((field, errs)) => {
                let reason = errs
                    .first()
                    .and_then(|e| e.message.as_ref().map(|m| m.to_string()))
                    .unwrap_or_else(|| "failed validation".to_string());
                Self::InvalidField {
                    field: static_field_name(field),
                    reason,
                }
            }
            None => Self::invalid("request", "failed validation"),
        }
    }
}

fn static_field_name(field: &str) -> &'static str {
    match field {
        "name" => "name",
        "description" => "description",
        "video_url" => "video_url",
        "text_url" => "text_url",
        _ => "request",
    }
}
