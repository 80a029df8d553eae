use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::RegistryError;
use crate::mqtt::TopicPattern;

pub const UNKNOWN_CATEGORY: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicDirection {
    In,
    Out,
    #[default]
    Bidirectional,
}

#[derive(Debug, Deserialize)]
struct TopicFile {
    category: String,
    #[serde(default)]
    topics: Vec<TopicSpec>,
}

#[derive(Debug, Deserialize)]
struct TopicSpec {
    pattern: String,
    #[serde(default)]
    sub_category: Option<String>,
    friendly_name: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    direction: TopicDirection,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

/// One declared topic and its metadata.
#[derive(Debug, Clone)]
pub struct TopicEntry {
    /// As declared, possibly with `{{variable}}` levels.
    pub pattern: String,
    pub category: String,
    pub sub_category: Option<String>,
    pub friendly_name: String,
    pub template: Option<String>,
    pub direction: TopicDirection,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    matchers: Vec<TopicPattern>,
}

impl TopicEntry {
    fn from_spec(category: &str, spec: TopicSpec) -> Result<Self, RegistryError> {
        let mut matchers = Vec::with_capacity(1 + spec.aliases.len());
        for raw in std::iter::once(&spec.pattern).chain(spec.aliases.iter()) {
            let filter = variables_as_wildcards(raw);
            let matcher =
                TopicPattern::parse(&filter).map_err(|source| RegistryError::InvalidPattern {
                    pattern: raw.clone(),
                    source,
                })?;
            matchers.push(matcher);
        }

        Ok(Self {
            pattern: spec.pattern,
            category: category.to_string(),
            sub_category: spec.sub_category,
            friendly_name: spec.friendly_name,
            template: spec.template,
            direction: spec.direction,
            aliases: spec.aliases,
            description: spec.description,
            matchers,
        })
    }

    /// The MQTT filter used for matching and subscribing.
    pub fn filter(&self) -> &TopicPattern {
        &self.matchers[0]
    }

    /// The most specific of this entry's filters that matches `topic`.
    fn best_match(&self, topic: &str) -> Option<&TopicPattern> {
        self.matchers
            .iter()
            .filter(|m| m.matches(topic))
            .min_by(|a, b| a.specificity_cmp(b))
    }
}

/// A level containing `{{...}}` matches any single level.
fn variables_as_wildcards(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|level| if level.contains("{{") { "+" } else { level })
        .collect::<Vec<_>>()
        .join("/")
}

/// Known topics, loaded from `<registry_dir>/topics/*.toml`.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    dir: Option<PathBuf>,
    entries: Vec<Arc<TopicEntry>>,
    warnings: Vec<String>,
}

impl TopicRegistry {
    /// Loads every topics file in `dir`. Never fails: unreadable or
    /// malformed files are skipped and listed in [`Self::load_warnings`].
    pub fn load(dir: &Path) -> Self {
        let mut registry = Self {
            dir: Some(dir.to_path_buf()),
            ..Self::default()
        };
        registry.reload();
        registry
    }

    /// Builds a registry from in-memory `(origin, toml)` pairs.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut registry = Self::default();
        for (origin, text) in sources {
            registry.add_source(origin, text);
        }
        registry
    }

    pub fn reload(&mut self) {
        let Some(dir) = self.dir.clone() else {
            return;
        };
        self.entries.clear();
        self.warnings.clear();

        match super::toml_files(&dir.join("topics")) {
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
            "Topic registry loaded {} entries from {} ({} warnings)",
            self.entries.len(),
            dir.display(),
            self.warnings.len()
        );
    }

    fn add_source(&mut self, origin: &str, text: &str) {
        let file: TopicFile = match toml::from_str(text) {
            Ok(file) => file,
            Err(e) => {
                self.warn(RegistryError::Parse {
                    origin: origin.to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };

        let before = self.entries.len();
        for spec in file.topics {
            match TopicEntry::from_spec(&file.category, spec) {
                Ok(entry) => self.entries.push(Arc::new(entry)),
                Err(e) => self.warn(e),
            }
        }
        debug!(
            "Registered {} {} topics from {}",
            self.entries.len() - before,
            file.category,
            origin
        );
    }

    fn warn(&mut self, error: RegistryError) {
        warn!("Topic registry: {}", error);
        self.warnings.push(error.to_string());
    }

    /// Finds the entry for a concrete topic. When several patterns match,
    /// the most specific wins; equally specific patterns resolve to the
    /// first declared.
    pub fn resolve(&self, topic: &str) -> Option<Arc<TopicEntry>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.best_match(topic).map(|m| (entry, m)))
            .min_by(|(_, a), (_, b)| a.specificity_cmp(b))
            .map(|(entry, _)| Arc::clone(entry))
    }

    pub fn list_by_category(&self, category: &str) -> Vec<Arc<TopicEntry>> {
        self.entries
            .iter()
            .filter(|e| e.category.eq_ignore_ascii_case(category))
            .cloned()
            .collect()
    }

    /// Human label for a topic, or the topic itself when unknown.
    pub fn friendly_name(&self, topic: &str) -> String {
        self.resolve(topic)
            .map(|e| e.friendly_name.clone())
            .unwrap_or_else(|| topic.to_string())
    }

    pub fn category_of(&self, topic: &str) -> String {
        self.resolve(topic)
            .map(|e| e.category.clone())
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.entries.iter().map(|e| e.category.clone()).collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn entries(&self) -> &[Arc<TopicEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODULES: &str = r#"
category = "MODULE"

[[topics]]
pattern = "module/v1/ff/+/state"
sub_category = "state"
friendly_name = "Module state"
template = "module.state"
direction = "in"

[[topics]]
pattern = "module/v1/ff/SVR3QA0022/state"
sub_category = "state"
friendly_name = "HBW state"
direction = "in"

[[topics]]
pattern = "module/v1/ff/{{module_serial}}/order"
friendly_name = "Module order"
template = "module.order"
direction = "out"
"#;

    const TXT: &str = r#"
category = "TXT"

[[topics]]
pattern = "/j1/txt/1/i/#"
friendly_name = "TXT inputs"
aliases = ["j1/txt/1/i/#"]
"#;

    fn registry() -> TopicRegistry {
        TopicRegistry::from_sources([("modules", MODULES), ("txt", TXT)])
    }

    #[test]
    fn exact_pattern_beats_wildcard() {
        let registry = registry();
        let entry = registry.resolve("module/v1/ff/SVR3QA0022/state").unwrap();
        assert_eq!(entry.pattern, "module/v1/ff/SVR3QA0022/state");
        let entry = registry.resolve("module/v1/ff/SVR4H73275/state").unwrap();
        assert_eq!(entry.pattern, "module/v1/ff/+/state");
    }

    #[test]
    fn variable_levels_match_like_plus() {
        let registry = registry();
        let entry = registry.resolve("module/v1/ff/SVR3QA0022/order").unwrap();
        assert_eq!(entry.template.as_deref(), Some("module.order"));
        assert_eq!(entry.direction, TopicDirection::Out);
    }

    #[test]
    fn slash_variants_are_distinct_unless_aliased() {
        let registry = registry();
        assert!(registry.resolve("/j1/txt/1/i/bme680").is_some());
        assert!(registry.resolve("j1/txt/1/i/bme680").is_some());
        assert!(registry.resolve("module/v1/ff/X/state/").is_none());
        assert!(registry.resolve("/module/v1/ff/X/state").is_none());
    }

    #[test]
    fn unknown_topic_falls_back() {
        let registry = registry();
        assert_eq!(registry.friendly_name("foo/bar"), "foo/bar");
        assert_eq!(registry.category_of("foo/bar"), UNKNOWN_CATEGORY);
        assert_eq!(registry.categories(), vec!["MODULE", "TXT"]);
        assert_eq!(registry.list_by_category("module").len(), 3);
    }

    #[test]
    fn malformed_files_degrade_to_warnings() {
        let registry = TopicRegistry::from_sources([
            ("broken", "category = "),
            ("bad-pattern", "category = \"X\"\n[[topics]]\npattern = \"a/#/b\"\nfriendly_name = \"x\"\n"),
            ("modules", MODULES),
        ]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.load_warnings().len(), 2);
    }

    #[test]
    fn missing_directory_yields_empty_registry() {
        let dir = TempDir::new().unwrap();
        let registry = TopicRegistry::load(&dir.path().join("nope"));
        assert!(registry.is_empty());
        assert_eq!(registry.load_warnings().len(), 1);
    }

    #[test]
    fn reload_picks_up_new_files() {
        let dir = TempDir::new().unwrap();
        let topics = dir.path().join("topics");
        std::fs::create_dir_all(&topics).unwrap();
        std::fs::write(topics.join("txt.toml"), TXT).unwrap();
        let mut registry = TopicRegistry::load(dir.path());
        assert_eq!(registry.len(), 1);

        std::fs::write(topics.join("modules.toml"), MODULES).unwrap();
        registry.reload();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn shipped_registry_loads_cleanly() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("registry");
        let registry = TopicRegistry::load(&dir);
        assert!(registry.load_warnings().is_empty(), "{:?}", registry.load_warnings());
        for category in ["CCU", "MODULE", "FTS", "TXT", "Node-RED-Gateway"] {
            assert!(
                !registry.list_by_category(category).is_empty(),
                "no topics for {}",
                category
            );
        }
        let order = registry.resolve("ccu/order/request").unwrap();
        assert_eq!(order.template.as_deref(), Some("ccu.order.request"));
    }
}
