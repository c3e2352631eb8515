//! Keyword-based module prediction for summary preloading.
//!
//! A request's free text is matched against a static table of keyword
//! groups. Each matching group contributes module ids whose *summaries* the
//! loader fetches ahead of time. Prediction is a cheap hint only; the plan
//! never depends on it.

use std::collections::BTreeSet;

/// A group of modules relevant when any keyword appears in a request.
#[derive(Debug, Clone)]
pub struct PreloadRule {
    /// Rule name, used in logs.
    pub name: String,
    /// Lowercase keyword prefixes matched against request words.
    pub keywords: Vec<String>,
    /// Module ids predicted when the rule matches.
    pub modules: Vec<String>,
}

impl PreloadRule {
    pub fn new(name: impl Into<String>, keywords: &[&str], modules: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|s| s.to_lowercase()).collect(),
            modules: modules.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn matches(&self, words: &[String]) -> bool {
        words
            .iter()
            .any(|w| self.keywords.iter().any(|kw| w.starts_with(kw.as_str())))
    }
}

/// Keyword → module-set table.
#[derive(Debug, Clone, Default)]
pub struct PreloadTable {
    rules: Vec<PreloadRule>,
}

impl PreloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule (builder pattern).
    pub fn with_rule(mut self, rule: PreloadRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn add_rule(&mut self, rule: PreloadRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[PreloadRule] {
        &self.rules
    }

    /// Module ids predicted for `text`, deduplicated and sorted.
    pub fn predict(&self, text: &str) -> BTreeSet<String> {
        let words = tokenize(text);
        self.rules
            .iter()
            .filter(|rule| rule.matches(&words))
            .flat_map(|rule| rule.modules.iter().cloned())
            .collect()
    }

    /// Table covering the admin-builder agent teams.
    pub fn admin_builder() -> Self {
        Self::new()
            .with_rule(PreloadRule::new(
                "security",
                &["auth", "login", "permission", "rbac", "role", "security"],
                &["security/auth-specialist", "security/rbac-designer"],
            ))
            .with_rule(PreloadRule::new(
                "database",
                &["database", "schema", "table", "migration", "sql"],
                &["database/schema-architect", "database/migration-planner"],
            ))
            .with_rule(PreloadRule::new(
                "api",
                &["api", "rest", "endpoint", "graphql"],
                &["backend/api-designer", "backend/service-builder"],
            ))
            .with_rule(PreloadRule::new(
                "frontend",
                &["dashboard", "admin", "ui", "frontend", "page"],
                &["frontend/admin-ui-builder", "frontend/component-designer"],
            ))
            .with_rule(PreloadRule::new(
                "testing",
                &["test", "qa", "coverage"],
                &["quality/test-engineer"],
            ))
            .with_rule(PreloadRule::new(
                "documentation",
                &["doc", "readme", "guide"],
                &["documentation/technical-writer"],
            ))
    }
}

/// Lowercased alphanumeric words of `text`.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
