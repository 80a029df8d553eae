//! # Topic Registry and Template Library
//!
//! Declarative knowledge about the factory's MQTT traffic:
//!
//! ```text
//! registry/
//! ├── topics/*.toml     - one file per category: patterns, names, templates
//! └── templates/*.toml  - one file per category: structures, examples, rules
//! ```
//!
//! The registry classifies incoming messages (which entry does a concrete
//! topic belong to) and the library checks outgoing payloads before the
//! gateways publish them. Both degrade instead of failing: a missing or
//! malformed file leaves fewer entries and a warning, never a dead system.

pub mod error;
pub mod schema;
pub mod substitute;
pub mod templates;
pub mod topics;

pub use error::{RegistryError, ValidationError, ValidationReport};
pub use schema::{SchemaNode, Rule, RuleCheck};
pub use substitute::{substitute_str, substitute_value, VarContext};
pub use templates::{Template, TemplateLibrary};
pub use topics::{TopicDirection, TopicEntry, TopicRegistry};

use serde_json::Value;
use std::path::{Path, PathBuf};

/// Topic registry and template library loaded from the same directory.
#[derive(Debug, Default)]
pub struct Registry {
    pub topics: TopicRegistry,
    pub templates: TemplateLibrary,
}

impl Registry {
    pub fn load(dir: &Path) -> Self {
        Self {
            topics: TopicRegistry::load(dir),
            templates: TemplateLibrary::load(dir),
        }
    }

    pub fn reload(&mut self) {
        self.topics.reload();
        self.templates.reload();
    }

    pub fn validate_topic_payload(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Result<Option<ValidationReport>, RegistryError> {
        self.templates.validate_for_topic(&self.topics, topic, payload)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.topics
            .load_warnings()
            .iter()
            .chain(self.templates.load_warnings())
            .cloned()
            .collect()
    }
}

/// `*.toml` files directly inside `dir`, sorted by name.
fn toml_files(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
