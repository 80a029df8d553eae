use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::mqtt::TopicError;

/// Missing or malformed registry data.
///
/// Loading never fails outright: bad files are skipped and their errors are
/// kept in the registry's warning list.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("invalid topic pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: TopicError,
    },

    #[error("template '{template}' has an invalid structure: {message}")]
    InvalidSchema { template: String, message: String },

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("template '{0}' has no examples")]
    NoExample(String),
}

/// Outcome of checking a payload against a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Turns a failed report into a [`ValidationError`].
    pub fn into_result(self, template_id: &str) -> Result<(), ValidationError> {
        if self.valid {
            Ok(())
        } else {
            Err(ValidationError {
                template_id: template_id.to_string(),
                errors: self.errors,
            })
        }
    }
}

/// A payload that must not be published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    pub template_id: String,
    pub errors: Vec<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload does not match template '{}': {}",
            self.template_id,
            self.errors.join("; ")
        )
    }
}
