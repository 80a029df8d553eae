//! Conformance scanner for code built on the session layer.
//!
//! Line-based and deliberately shallow: it flags the patterns that break
//! the single-client model, not every way to express them. Test modules
//! (everything after a `#[cfg(test)]` line) are not scanned.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

// Split so this file does not flag itself.
const EPHEMERAL_CLIENT: &str = concat!("SessionClient::", "ephemeral(");
const RAW_CLIENT: &str = concat!("AsyncClient::", "new(");
const FORCED_REFRESH: &str = concat!("request_refresh(", "true)");
const BUFFER_READ: &str = concat!("get_buf", "fer(");
const WILDCARD_ALL: &str = concat!("\"", "#", "\"");
const RELATIVE_IMPORT: &str = concat!("super::", "super::");
const TEST_MARKER: &str = concat!("#[cfg(", "test)]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LintRule {
    /// A client constructed outside the mqtt module.
    StrayClient,
    /// Forced redraw in a file that also reads buffers.
    ForcedRefresh,
    /// Subscription to every topic outside diagnostics code.
    WildcardSubscription,
    RelativeImport,
}

impl LintRule {
    pub fn code(&self) -> char {
        match self {
            LintRule::StrayClient => 'a',
            LintRule::ForcedRefresh => 'b',
            LintRule::WildcardSubscription => 'c',
            LintRule::RelativeImport => 'd',
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            LintRule::StrayClient => "MQTT client constructed outside src/mqtt/; use the shared session client",
            LintRule::ForcedRefresh => "forced refresh in a buffer consumer; let the refresh controller debounce",
            LintRule::WildcardSubscription => "subscription to \"#\" outside diagnostics code",
            LintRule::RelativeImport => "nested super:: import; use a crate:: path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub path: PathBuf,
    /// 1-based.
    pub line: usize,
    pub rule: LintRule,
    pub excerpt: String,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: [{}] {}\n    {}",
            self.path.display(),
            self.line,
            self.rule.code(),
            self.rule.message(),
            self.excerpt
        )
    }
}

/// Scans every `.rs` file below `root`. Unreadable files are skipped with a
/// warning.
pub fn scan_dir(root: &Path) -> Vec<LintFinding> {
    let mut files = Vec::new();
    collect_sources(root, &mut files);
    files.sort();
    debug!("Linting {} source files under {:?}", files.len(), root);

    let mut findings = Vec::new();
    for file in files {
        match fs::read_to_string(&file) {
            Ok(source) => findings.extend(scan_source(&file, &source)),
            Err(e) => warn!("Skipping {:?}: {}", file, e),
        }
    }
    findings
}

fn collect_sources(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read {:?}: {}", dir, e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if name.starts_with('.') || name == "target" {
                continue;
            }
            collect_sources(&path, files);
        } else if name.ends_with(".rs") {
            files.push(path);
        }
    }
}

/// Scans one file's text. `path` decides which path-scoped rules apply.
pub fn scan_source(path: &Path, source: &str) -> Vec<LintFinding> {
    let code: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with(TEST_MARKER))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect();

    let in_mqtt = in_mqtt_module(path);
    let diagnostics = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().contains("diagnostics"));
    let reads_buffers = code.iter().any(|(_, line)| line.contains(BUFFER_READ));

    let mut findings = Vec::new();
    let mut flag = |line: usize, text: &str, rule: LintRule| {
        findings.push(LintFinding {
            path: path.to_path_buf(),
            line,
            rule,
            excerpt: text.trim().to_string(),
        });
    };

    for &(line, text) in &code {
        if !in_mqtt && (text.contains(EPHEMERAL_CLIENT) || text.contains(RAW_CLIENT)) {
            flag(line, text, LintRule::StrayClient);
        }
        if reads_buffers && text.contains(FORCED_REFRESH) {
            flag(line, text, LintRule::ForcedRefresh);
        }
        if !diagnostics && text.contains("subscribe") && text.contains(WILDCARD_ALL) {
            flag(line, text, LintRule::WildcardSubscription);
        }
        if text.contains(RELATIVE_IMPORT) {
            flag(line, text, LintRule::RelativeImport);
        }
    }
    findings
}

fn in_mqtt_module(path: &Path) -> bool {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect();
    parts.windows(2).any(|w| w[0] == "src" && w[1] == "mqtt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rules(findings: &[LintFinding]) -> Vec<LintRule> {
        findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn stray_client_outside_mqtt_module() {
        let source = format!("fn f() {{\n    let c = {}d);\n}}\n", EPHEMERAL_CLIENT);
        let findings = scan_source(Path::new("src/ui/panel.rs"), &source);
        assert_eq!(rules(&findings), vec![LintRule::StrayClient]);
        assert_eq!(findings[0].line, 2);

        assert!(scan_source(Path::new("src/mqtt/session.rs"), &source).is_empty());
    }

    #[test]
    fn forced_refresh_only_matters_in_buffer_readers() {
        let source = format!("fn f() {{ {}); }}\n", FORCED_REFRESH.trim_end_matches(')'));
        let forced = format!("{source}fn g() {{ c.{}\"t\"); }}\n", BUFFER_READ);
        assert!(scan_source(Path::new("src/a.rs"), &source).is_empty());
        assert_eq!(
            rules(&scan_source(Path::new("src/a.rs"), &forced)),
            vec![LintRule::ForcedRefresh]
        );
    }

    #[test]
    fn wildcard_subscription_allowed_in_diagnostics() {
        let source = format!("c.subscribe_many([{}], qos);\n", WILDCARD_ALL);
        assert_eq!(
            rules(&scan_source(Path::new("src/monitor.rs"), &source)),
            vec![LintRule::WildcardSubscription]
        );
        assert!(scan_source(Path::new("src/diagnostics_view.rs"), &source).is_empty());
    }

    #[test]
    fn comments_and_test_modules_are_skipped() {
        let source = format!(
            "use {}x::Y;\n// {}\n{}\nmod tests {{ use {}z; }}\n",
            RELATIVE_IMPORT, RELATIVE_IMPORT, TEST_MARKER, RELATIVE_IMPORT
        );
        let findings = scan_source(Path::new("src/a.rs"), &source);
        assert_eq!(rules(&findings), vec![LintRule::RelativeImport]);
        assert_eq!(findings[0].line, 1);
        assert!(findings[0].to_string().contains("[d]"));
    }

    #[test]
    fn scan_dir_walks_tree_and_skips_target() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("src").join("ui");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        let bad = format!("let c = {}o);\n", RAW_CLIENT);
        fs::write(nested.join("view.rs"), &bad).unwrap();
        fs::write(dir.path().join("target").join("gen.rs"), &bad).unwrap();
        fs::write(nested.join("notes.txt"), &bad).unwrap();

        let findings = scan_dir(dir.path());
        assert_eq!(findings.len(), 1);
        assert!(findings[0].path.ends_with("src/ui/view.rs"));
    }

    #[test]
    fn shipped_sources_are_clean() {
        let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
        let findings = scan_dir(&src);
        assert!(findings.is_empty(), "{:#?}", findings);
    }
}
