use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{RegistryError, ValidationReport};
use super::schema::{Rule, SchemaNode};
use super::topics::TopicRegistry;

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: BTreeMap<String, TemplateSpec>,
}

#[derive(Debug, Deserialize)]
struct TemplateSpec {
    category: String,
    #[serde(default)]
    sub_category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    structure: Value,
    #[serde(default)]
    examples: Vec<Value>,
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Expected shape of one message kind.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub category: String,
    pub sub_category: Option<String>,
    pub description: Option<String>,
    /// Topic the message is normally sent on, may contain `{{variables}}`.
    pub topic: Option<String>,
    pub structure: SchemaNode,
    pub examples: Vec<Value>,
    pub rules: Vec<Rule>,
}

impl Template {
    fn from_spec(id: &str, spec: TemplateSpec) -> Result<Self, RegistryError> {
        let invalid = |message: String| RegistryError::InvalidSchema {
            template: id.to_string(),
            message,
        };
        let structure = SchemaNode::parse(&spec.structure).map_err(invalid)?;
        for rule in &spec.rules {
            rule.verify().map_err(invalid)?;
        }
        Ok(Self {
            id: id.to_string(),
            category: spec.category,
            sub_category: spec.sub_category,
            description: spec.description,
            topic: spec.topic,
            structure,
            examples: spec.examples,
            rules: spec.rules,
        })
    }

    pub fn validate(&self, payload: &Value) -> ValidationReport {
        let mut errors = Vec::new();
        self.structure.check(payload, "", &mut errors);
        for rule in &self.rules {
            rule.apply(payload, &mut errors);
        }
        ValidationReport::from_errors(errors)
    }
}

/// All templates, composed from `<registry_dir>/templates/*.toml`.
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    dir: Option<PathBuf>,
    templates: BTreeMap<String, Arc<Template>>,
    warnings: Vec<String>,
}

impl TemplateLibrary {
    /// Loads every template file in `dir`. Like the topic registry this
    /// never fails; problems end up in [`Self::load_warnings`].
    pub fn load(dir: &Path) -> Self {
        let mut library = Self {
            dir: Some(dir.to_path_buf()),
            ..Self::default()
        };
        library.reload();
        library
    }

    pub fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut library = Self::default();
        for (origin, text) in sources {
            library.add_source(origin, text);
        }
        library
    }

    pub fn reload(&mut self) {
        let Some(dir) = self.dir.clone() else {
            return;
        };
        self.templates.clear();
        self.warnings.clear();

        match super::toml_files(&dir.join("templates")) {
            Ok(files) => {
                for file in files {
                    match std::fs::read_to_string(&file) {
                        Ok(text) => self.add_source(&file.display().to_string(), &text),
                        Err(source) => self.warn(RegistryError::Io { path: file, source }),
                    }
                }
            }
            Err(e) => self.warn(e),
        }
        info!(
            "Template library loaded {} templates from {} ({} warnings)",
            self.templates.len(),
            dir.display(),
            self.warnings.len()
        );
    }

    fn add_source(&mut self, origin: &str, text: &str) {
        let file: TemplateFile = match toml::from_str(text) {
            Ok(file) => file,
            Err(e) => {
                self.warn(RegistryError::Parse {
                    origin: origin.to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };

        for (id, spec) in file.templates {
            let template = match Template::from_spec(&id, spec) {
                Ok(template) => template,
                Err(e) => {
                    self.warn(e);
                    continue;
                }
            };
            for (i, example) in template.examples.iter().enumerate() {
                let report = template.validate(example);
                if !report.valid {
                    self.warnings.push(format!(
                        "example {} of '{}' does not validate: {}",
                        i,
                        id,
                        report.errors.join("; ")
                    ));
                    warn!("Template '{}' example {} is invalid: {:?}", id, i, report.errors);
                }
            }
            if self.templates.insert(id.clone(), Arc::new(template)).is_some() {
                warn!("Template '{}' redefined by {}", id, origin);
            }
            debug!("Loaded template '{}' from {}", id, origin);
        }
    }

    fn warn(&mut self, error: RegistryError) {
        warn!("Template library: {}", error);
        self.warnings.push(error.to_string());
    }

    pub fn get(&self, id: &str) -> Result<Arc<Template>, RegistryError> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTemplate(id.to_string()))
    }

    pub fn validate(&self, id: &str, payload: &Value) -> Result<ValidationReport, RegistryError> {
        Ok(self.get(id)?.validate(payload))
    }

    /// First declared example, used as the seed payload for gateways.
    pub fn example(&self, id: &str) -> Result<Value, RegistryError> {
        self.get(id)?
            .examples
            .first()
            .cloned()
            .ok_or_else(|| RegistryError::NoExample(id.to_string()))
    }

    pub fn structure(&self, id: &str) -> Result<SchemaNode, RegistryError> {
        Ok(self.get(id)?.structure.clone())
    }

    /// Validates against the template registered for `topic`. `Ok(None)`
    /// when the topic is unknown or has no template.
    pub fn validate_for_topic(
        &self,
        registry: &TopicRegistry,
        topic: &str,
        payload: &Value,
    ) -> Result<Option<ValidationReport>, RegistryError> {
        let Some(template_id) = registry.resolve(topic).and_then(|e| e.template.clone()) else {
            return Ok(None);
        };
        self.validate(&template_id, payload).map(Some)
    }

    pub fn ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<Arc<Template>> {
        self.templates
            .values()
            .filter(|t| t.category.eq_ignore_ascii_case(category))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.warnings
    }
}
