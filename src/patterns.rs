//! Finding extraction from completed output files.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::{ReconError, Result};
use crate::template::TemplateContext;

/// A pattern as written in configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PatternDef {
    pub description: String,
    pub pattern: String,
}

/// A compiled, case-insensitive pattern with its description template.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub description: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(def: &PatternDef) -> Result<Self> {
        let regex = RegexBuilder::new(&def.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ReconError::InvalidPattern {
                pattern: def.pattern.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            description: def.description.clone(),
            regex,
        })
    }

    pub fn compile_all(defs: &[PatternDef]) -> Result<Vec<Self>> {
        defs.iter().map(Self::compile).collect()
    }

    /// The first substring of `line` this pattern matches.
    pub fn find<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.regex.find(line).map(|m| m.as_str())
    }
}

/// Render every finding in `content` for the given pattern list.
///
/// Each line is lowercased before matching, so `{match}` is bound to the
/// lowercase text and case variants of a finding collapse into one.
/// Descriptions are returned in discovery order with duplicates removed.
pub fn find_matches(
    content: &str,
    patterns: &[&Pattern],
    ctx: &TemplateContext,
) -> Result<Vec<String>> {
    let mut found: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.to_lowercase();
        for pattern in patterns {
            if let Some(matched) = pattern.find(&line) {
                let description = ctx.render_with_match(&pattern.description, matched)?;
                if !found.contains(&description) {
                    found.push(description);
                }
            }
        }
    }
    Ok(found)
}

/// Per-file findings and the cross-file deduplicated pattern log.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    files: Vec<PathBuf>,
    matches: HashMap<PathBuf, Vec<String>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patterns to check for one scan: declared ones, plus the universal
    /// set when the scan is scoped to a service.
    pub fn patterns_for<'a>(
        universal: &'a [Pattern],
        declared: &'a [Pattern],
        ctx: &TemplateContext,
    ) -> Vec<&'a Pattern> {
        let mut out: Vec<&Pattern> = declared.iter().collect();
        if ctx.is_service_scoped() {
            out.extend(universal.iter());
        }
        out
    }

    /// Add findings for `file`. Returns how many were new for that file.
    pub fn record(&mut self, file: &Path, descriptions: Vec<String>) -> usize {
        if descriptions.is_empty() {
            return 0;
        }
        if !self.matches.contains_key(file) {
            self.files.push(file.to_path_buf());
        }
        let entry = self.matches.entry(file.to_path_buf()).or_default();
        let mut added = 0;
        for d in descriptions {
            if !entry.contains(&d) {
                entry.push(d);
                added += 1;
            }
        }
        added
    }

    pub fn matches_for(&self, file: &Path) -> Option<&[String]> {
        self.matches.get(file).map(Vec::as_slice)
    }

    /// Full pattern log text. A description shown under an earlier file is
    /// not repeated under a later one. `None` while nothing was recorded.
    pub fn render_log(&self) -> Option<String> {
        if self.files.is_empty() {
            return None;
        }
        let mut shown: HashSet<&str> = HashSet::new();
        let mut out = String::new();
        for file in &self.files {
            let Some(descriptions) = self.matches.get(file) else {
                continue;
            };
            let mut block = format!("[*] Pattern/s detected in: '{}'\n", file.display());
            let mut any = false;
            for d in descriptions {
                if shown.insert(d.as_str()) {
                    block.push_str(&format!("\t[-] {d}\n"));
                    any = true;
                }
            }
            block.push('\n');
            if any {
                out.push_str(&block);
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ServiceVars;

    fn pat(description: &str, pattern: &str) -> Pattern {
        Pattern::compile(&PatternDef {
            description: description.into(),
            pattern: pattern.into(),
        })
        .unwrap()
    }

    fn host() -> TemplateContext {
        TemplateContext::for_host("10.0.0.9", "/r/scans", "-Pn", "80")
    }

    fn service() -> TemplateContext {
        host().with_service(ServiceVars {
            port: 80,
            protocol: "tcp".into(),
            name: "http".into(),
            secure: false,
            scheme: "http".into(),
            username_wordlist: "u".into(),
            password_wordlist: "p".into(),
        })
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = Pattern::compile(&PatternDef {
            description: "x".into(),
            pattern: "(unclosed".into(),
        })
        .unwrap_err();
        assert!(matches!(err, ReconError::InvalidPattern { .. }));
    }

    #[test]
    fn matching_is_case_insensitive_and_renders_match() {
        let p = pat("{port}: server {match}", r"apache/[\d.]+");
        let found = find_matches("Server: APACHE/2.4.41 (Ubuntu)\n", &[&p], &service()).unwrap();
        assert_eq!(found, vec!["80: server apache/2.4.41".to_string()]);
    }

    #[test]
    fn uppercase_classes_keep_their_meaning() {
        let p = pat("token {match}", r"key=\S+");
        let found = find_matches("KEY=abc def", &[&p], &service()).unwrap();
        assert_eq!(found, vec!["token key=abc".to_string()]);
    }

    #[test]
    fn case_variants_of_a_finding_collapse() {
        let p = pat("server {match}", r"apache/[\d.]+");
        let found = find_matches(
            "Server: Apache/2.4\nserver: apache/2.4\nSERVER: APACHE/2.4\n",
            &[&p],
            &service(),
        )
        .unwrap();
        assert_eq!(found, vec!["server apache/2.4".to_string()]);
    }

    #[test]
    fn duplicate_descriptions_collapse_within_file() {
        let p = pat("anonymous ftp allowed", "anonymous");
        let found = find_matches("anonymous\nANONYMOUS login ok\n", &[&p], &service()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn missing_variable_in_description_propagates() {
        let p = pat("on port {port}", "open");
        assert!(matches!(
            find_matches("22/tcp open", &[&p], &host()),
            Err(ReconError::MissingVariable { .. })
        ));
    }

    #[test]
    fn universal_patterns_only_for_service_scans() {
        let universal = vec![pat("cve", "cve-\\d+")];
        let declared = vec![pat("ssh", "ssh")];
        assert_eq!(PatternMatcher::patterns_for(&universal, &declared, &host()).len(), 1);
        assert_eq!(PatternMatcher::patterns_for(&universal, &declared, &service()).len(), 2);
        assert!(PatternMatcher::patterns_for(&universal, &[], &host()).is_empty());
    }

    #[test]
    fn log_dedups_descriptions_across_files() {
        let mut m = PatternMatcher::new();
        assert!(m.render_log().is_none());
        m.record(Path::new("/r/a.txt"), vec!["shared".into(), "only-a".into()]);
        m.record(Path::new("/r/b.txt"), vec!["shared".into()]);
        m.record(Path::new("/r/c.txt"), vec!["shared".into(), "only-c".into()]);
        let log = m.render_log().unwrap();
        assert_eq!(log.matches("shared").count(), 1);
        assert!(log.contains("[*] Pattern/s detected in: '/r/a.txt'\n\t[-] shared\n\t[-] only-a\n\n"));
        assert!(!log.contains("/r/b.txt"));
        assert!(log.contains("[*] Pattern/s detected in: '/r/c.txt'\n\t[-] only-c\n\n"));
    }

    #[test]
    fn record_keeps_insertion_order_and_set_semantics() {
        let mut m = PatternMatcher::new();
        assert_eq!(m.record(Path::new("/r/a"), vec!["x".into(), "y".into()]), 2);
        assert_eq!(m.record(Path::new("/r/a"), vec!["y".into(), "z".into()]), 1);
        assert_eq!(
            m.matches_for(Path::new("/r/a")).unwrap(),
            &["x".to_string(), "y".to_string(), "z".to_string()]
        );
        assert_eq!(m.record(Path::new("/r/b"), Vec::new()), 0);
        assert!(m.matches_for(Path::new("/r/b")).is_none());
    }
}
