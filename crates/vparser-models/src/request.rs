//! Video processing requests: the persisted job record and the payloads
//! the API accepts for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use validator::{Validate, ValidationError};

use crate::error::{ModelError, ModelResult};

/// Maximum request name length.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum URL length to prevent DoS attacks.
pub const MAX_URL_LENGTH: usize = 2048;

/// Maximum description length.
pub const MAX_TEXT_LENGTH: usize = 10_000;

/// `MAX_TEXT_LENGTH` in the integer type `validator` length bounds require.
const MAX_TEXT_LENGTH_U64: u64 = MAX_TEXT_LENGTH as u64;

/// A persisted video processing request.
///
/// `name` is unique among non-archived requests. `archived` only ever moves
/// from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    /// Store-assigned surrogate key (never exposed over the API)
    #[serde(skip)]
    pub id: i64,
    /// Caller-supplied identifier
    pub name: String,
    pub description: String,
    pub video_url: String,
    pub text_url: String,
    /// Soft-delete flag
    pub archived: bool,
    /// Completion flag, set by callers or workers
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /requests`.
///
/// Every field is optional at the JSON level so that a missing `name` can be
/// reported as a validation error rather than a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RequestSubmission {
    #[validate(custom(function = "validate_name"))]
    pub name: Option<String>,
    #[validate(length(max = MAX_TEXT_LENGTH_U64, message = "description is too long"))]
    pub description: Option<String>,
    pub processed: Option<bool>,
    #[validate(custom(function = "validate_http_url"))]
    pub video_url: Option<String>,
    #[validate(custom(function = "validate_http_url"))]
    pub text_url: Option<String>,
}

impl RequestSubmission {
    /// Validate the submission and produce the values to persist.
    pub fn into_new_request(self) -> ModelResult<NewVideoRequest> {
        let name = match self.name.as_deref() {
            None => return Err(ModelError::MissingField("name")),
            Some(name) => name.to_string(),
        };
        self.validate()?;

        Ok(NewVideoRequest {
            name,
            description: self.description.unwrap_or_default(),
            processed: self.processed.unwrap_or(false),
            video_url: self.video_url.map(|u| u.trim().to_string()).unwrap_or_default(),
            text_url: self.text_url.map(|u| u.trim().to_string()).unwrap_or_default(),
        })
    }
}

/// A validated submission, ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVideoRequest {
    pub name: String,
    pub description: String,
    pub processed: bool,
    pub video_url: String,
    pub text_url: String,
}

impl NewVideoRequest {
    pub fn new(name: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            processed: false,
            video_url: video_url.into(),
            text_url: String::new(),
        }
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Body of `PUT /requests/{name}`.
///
/// Only `description`, `processed` and `text_url` are applied; any other
/// field that a client sends is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RequestPatch {
    #[validate(length(max = MAX_TEXT_LENGTH_U64, message = "description is too long"))]
    pub description: Option<String>,
    pub processed: Option<bool>,
    #[validate(custom(function = "validate_http_url"))]
    pub text_url: Option<String>,
}

impl RequestPatch {
    /// The independent field writes this patch asks for, in application order.
    pub fn field_updates(self) -> ModelResult<Vec<FieldUpdate>> {
        self.validate()?;

        let mut updates = Vec::with_capacity(3);
        if let Some(description) = self.description {
            updates.push(FieldUpdate::Description(description));
        }
        if let Some(processed) = self.processed {
            updates.push(FieldUpdate::Processed(processed));
        }
        if let Some(text_url) = self.text_url {
            updates.push(FieldUpdate::TextUrl(text_url.trim().to_string()));
        }
        Ok(updates)
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.processed.is_none() && self.text_url.is_none()
    }
}

/// A single-column mutation of a request row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Description(String),
    Processed(bool),
    TextUrl(String),
}

impl FieldUpdate {
    /// Column written by this update.
    pub fn column(&self) -> &'static str {
        match self {
            FieldUpdate::Description(_) => "description",
            FieldUpdate::Processed(_) => "processed",
            FieldUpdate::TextUrl(_) => "text_url",
        }
    }

    /// Apply to an in-memory row (does not touch timestamps).
    pub fn apply_to(&self, request: &mut VideoRequest) {
        match self {
            FieldUpdate::Description(v) => request.description = v.clone(),
            FieldUpdate::Processed(v) => request.processed = *v,
            FieldUpdate::TextUrl(v) => request.text_url = v.clone(),
        }
    }
}

/// Names are stored exactly as sent and looked up byte for byte.
fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(error_with_message("empty_name", "name can't be empty"));
    }
    if name.trim() != name {
        return Err(error_with_message(
            "name_whitespace",
            "name can't start or end with whitespace",
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(error_with_message("name_too_long", "name is too long"));
    }
    // Names are used as a path segment in /requests/{name}.
    if name.contains('/') || name.chars().any(char::is_control) {
        return Err(error_with_message(
            "name_charset",
            "name can't contain '/' or control characters",
        ));
    }
    Ok(())
}

/// Empty strings are allowed (the field is opaque); anything else must be an
/// absolute http(s) URL.
fn validate_http_url(value: &str) -> Result<(), ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_URL_LENGTH {
        return Err(error_with_message("url_too_long", "URL is too long"));
    }
    let parsed =
        Url::parse(value).map_err(|_| error_with_message("url_format", "invalid URL format"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(error_with_message(
            "url_scheme",
            "only HTTP and HTTPS URLs are allowed",
        )),
    }
}

fn error_with_message(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(name: Option<&str>, video_url: Option<&str>) -> RequestSubmission {
        RequestSubmission {
            name: name.map(String::from),
            video_url: video_url.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let err = submission(None, Some("http://x/1.mp4"))
            .into_new_request()
            .unwrap_err();
        assert_eq!(err, ModelError::MissingField("name"));
        assert_eq!(err.to_string(), "name can't be null");
    }

    #[test]
    fn test_defaults_are_filled() {
        let new = submission(Some("vid1"), Some("http://x/1.mp4"))
            .into_new_request()
            .unwrap();
        assert_eq!(new.name, "vid1");
        assert_eq!(new.video_url, "http://x/1.mp4");
        assert_eq!(new.description, "");
        assert_eq!(new.text_url, "");
        assert!(!new.processed);
    }

    #[test]
    fn test_rejects_non_http_video_url() {
        let err = submission(Some("vid1"), Some("ftp://x/1.mp4"))
            .into_new_request()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidField { field: "video_url", .. }));
    }

    #[test]
    fn test_rejects_name_with_slash() {
        let err = submission(Some("a/b"), None).into_new_request().unwrap_err();
        assert!(matches!(err, ModelError::InvalidField { field: "name", .. }));
    }

    #[test]
    fn test_rejects_name_with_surrounding_whitespace() {
        for name in [" vid1", "vid1 ", "\tvid1"] {
            let err = submission(Some(name), None).into_new_request().unwrap_err();
            assert!(
                matches!(err, ModelError::InvalidField { field: "name", .. }),
                "{name:?}: {err}"
            );
        }
    }

    #[test]
    fn test_description_length_limit() {
        let mut long = submission(Some("vid1"), None);
        long.description = Some("x".repeat(MAX_TEXT_LENGTH + 1));
        let err = long.into_new_request().unwrap_err();
        assert!(matches!(err, ModelError::InvalidField { field: "description", .. }));

        let mut at_limit = submission(Some("vid1"), None);
        at_limit.description = Some("x".repeat(MAX_TEXT_LENGTH));
        assert!(at_limit.into_new_request().is_ok());
    }

    #[test]
    fn test_empty_video_url_is_allowed() {
        assert!(submission(Some("vid1"), Some("")).into_new_request().is_ok());
    }

    #[test]
    fn test_patch_yields_only_present_fields() {
        let patch: RequestPatch = serde_json::from_str(r#"{"processed": true}"#).unwrap();
        let updates = patch.field_updates().unwrap();
        assert_eq!(updates, vec![FieldUpdate::Processed(true)]);
    }

    #[test]
    fn test_patch_ignores_unknown_fields() {
        let patch: RequestPatch =
            serde_json::from_str(r#"{"name": "other", "archived": false, "text_url": "https://t/1.txt"}"#)
                .unwrap();
        assert_eq!(
            patch.field_updates().unwrap(),
            vec![FieldUpdate::TextUrl("https://t/1.txt".to_string())]
        );
    }

    #[test]
    fn test_request_serialization_hides_id() {
        let now = Utc::now();
        let request = VideoRequest {
            id: 42,
            name: "vid1".into(),
            description: String::new(),
            video_url: "http://x/1.mp4".into(),
            text_url: String::new(),
            archived: false,
            processed: false,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["name"], "vid1");
    }
}
