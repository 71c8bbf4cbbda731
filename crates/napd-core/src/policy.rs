//! Policy documents.
//!
//! A policy is an opaque JSON object identified by its `"Id"` field. The
//! daemon never interprets the rest of the document; it only transports,
//! prioritizes and serializes it. The id is either empty (the default and
//! self policies start out this way) or an identity-token string such as
//! `user:alice`.

use serde_json::Value;
use thiserror::Error;

use crate::token::IdentityToken;

/// Name of the identifying field inside a policy document.
pub const ID_FIELD: &str = "Id";

/// Validation errors for policy documents.
///
/// A malformed document is a hard load error: reloads fail as a whole rather
/// than committing a partial policy set.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The document is not a JSON object.
    #[error("policy document is not a JSON object")]
    NotAnObject,

    /// The `"Id"` field is missing or not a string.
    #[error("policy document has no string \"{ID_FIELD}\" field")]
    MissingId,

    /// The document text is not valid JSON.
    #[error("policy document is not valid JSON: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },
}

/// An immutable policy document plus its serialized form.
///
/// The serialized text is the comparison baseline for push decisions, so it
/// is rendered once on load and kept alongside the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDocument {
    id: String,
    content: Value,
    text: String,
}

impl PolicyDocument {
    /// Validates a parsed JSON value as a policy document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotAnObject`] for non-object values and
    /// [`PolicyError::MissingId`] when the `"Id"` field is absent or not a
    /// string.
    pub fn from_value(content: Value) -> Result<Self, PolicyError> {
        let object = content.as_object().ok_or(PolicyError::NotAnObject)?;
        let id = object
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or(PolicyError::MissingId)?
            .to_owned();
        let text = render(&content);
        Ok(Self { id, content, text })
    }

    /// Parses and validates raw JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Parse`] on invalid JSON, otherwise the
    /// [`Self::from_value`] errors.
    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let content: Value = serde_json::from_str(text).map_err(|e| PolicyError::Parse {
            message: e.to_string(),
        })?;
        Self::from_value(content)
    }

    /// The policy id, possibly empty.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The document tree.
    #[must_use]
    pub const fn content(&self) -> &Value {
        &self.content
    }

    /// The serialized document, used as the push comparison baseline.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the id is empty (default/self policies before retitling).
    #[must_use]
    pub fn has_empty_id(&self) -> bool {
        self.id.is_empty()
    }

    /// Rewrites an empty id to the given token, in the id and in the
    /// embedded `"Id"` field alike.
    ///
    /// This is the documented memoization step of the resolve stage: the
    /// first time the default policy is served to a concretely identified
    /// app, it permanently takes that app's user token as its id. A no-op
    /// when the id is already set.
    pub fn retitle_if_empty(&mut self, token: &IdentityToken) {
        if !self.id.is_empty() {
            return;
        }
        self.id = token.as_policy_id();
        if let Some(object) = self.content.as_object_mut() {
            object.insert(ID_FIELD.to_owned(), Value::String(self.id.clone()));
        }
        self.text = render(&self.content);
    }
}

/// Renders the canonical serialized form of a document tree.
fn render(content: &Value) -> String {
    // Serializing a `Value` with string keys cannot fail.
    serde_json::to_string(content).unwrap_or_default()
}
