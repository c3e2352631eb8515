//! Agent module identity and metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which slice of an agent module to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Minimal description used for planning and prediction.
    Summary,
    /// The content an agent needs to run.
    #[default]
    Core,
    /// Core plus optional detail sections.
    Detail,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Core => "core",
            Self::Detail => "detail",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A module id paired with the variant being loaded.
///
/// Rendered as `team/agent#variant`; this string is also the id under which
/// the module is charged to the [`ResourceTracker`](crate::budget::ResourceTracker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub id: String,
    pub variant: Variant,
}

impl ModuleKey {
    pub fn new(id: impl Into<String>, variant: Variant) -> Self {
        Self {
            id: id.into(),
            variant,
        }
    }

    pub fn core(id: impl Into<String>) -> Self {
        Self::new(id, Variant::Core)
    }

    pub fn summary(id: impl Into<String>) -> Self {
        Self::new(id, Variant::Summary)
    }

    pub fn detail(id: impl Into<String>) -> Self {
        Self::new(id, Variant::Detail)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.variant)
    }
}

/// Immutable metadata for one module variant, as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,
    pub team: String,
    pub variant: Variant,
    pub estimated_size: u64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub declared_deps: BTreeSet<String>,
    /// One-line description (the summary text).
    #[serde(default)]
    pub description: String,
    /// Tagged non-critical: a failure to load or run drops the agent
    /// instead of failing its phase.
    #[serde(default)]
    pub optional: bool,
}

impl ModuleDescriptor {
    /// Minimal descriptor for an id the source knows nothing about.
    ///
    /// The team is the id prefix before the first `/`, or `"default"`.
    pub fn stub(id: &str, variant: Variant, estimated_size: u64) -> Self {
        Self {
            id: id.to_string(),
            team: team_of(id).to_string(),
            variant,
            estimated_size,
            capabilities: BTreeSet::new(),
            declared_deps: BTreeSet::new(),
            description: String::new(),
            optional: false,
        }
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.id.clone(), self.variant)
    }
}

/// The team segment of a `team/agent` module id.
pub fn team_of(id: &str) -> &str {
    id.split_once('/').map_or("default", |(team, _)| team)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        let key = ModuleKey::core("database/schema-architect");
        assert_eq!(key.to_string(), "database/schema-architect#core");
        assert_eq!(ModuleKey::detail("x").to_string(), "x#detail");
    }

    #[test]
    fn stub_derives_team() {
        let d = ModuleDescriptor::stub("security/auth-specialist", Variant::Summary, 10);
        assert_eq!(d.team, "security");
        assert_eq!(ModuleDescriptor::stub("loner", Variant::Core, 1).team, "default");
        assert!(!d.optional);
    }

    #[test]
    fn optional_defaults_to_false_when_absent() {
        let d: ModuleDescriptor = serde_json::from_str(
            r#"{"id": "a/b", "team": "a", "variant": "core", "estimated_size": 5}"#,
        )
        .unwrap();
        assert!(!d.optional);
    }

    #[test]
    fn variant_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Variant::Detail).unwrap(), "\"detail\"");
    }
}
