//! External module sources.
//!
//! The engine never interprets module content. It only needs to read a
//! variant and know how big it is. [`ModuleSource`] is that seam;
//! [`InMemorySource`] backs tests and embedding callers, [`DirectorySource`]
//! reads agent definition files from disk.

use crate::budget::estimate_units;
use crate::error::{OrchestraError, Result};
use crate::modules::descriptor::{ModuleDescriptor, ModuleKey, Variant, team_of};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

/// Provider of agent module content.
pub trait ModuleSource: Send + Sync {
    /// Read the content of one module variant.
    fn read(&self, key: &ModuleKey) -> Result<String>;

    /// Size of one module variant in budget units.
    fn size_of(&self, key: &ModuleKey) -> Result<u64>;

    /// Metadata for one module variant.
    fn descriptor(&self, key: &ModuleKey) -> Result<ModuleDescriptor>;
}

// ── InMemorySource ─────────────────────────────────────────────────

/// A module held by an [`InMemorySource`].
#[derive(Debug, Clone)]
pub struct SourceModule {
    pub id: String,
    pub description: String,
    pub core: String,
    pub detail: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub declared_deps: BTreeSet<String>,
    /// Overrides the estimated core size.
    pub core_size: Option<u64>,
    /// Overrides the estimated detail size.
    pub detail_size: Option<u64>,
    /// Tagged non-critical.
    pub optional: bool,
}

impl SourceModule {
    pub fn new(id: impl Into<String>, core: impl Into<String>) -> Self {
        let core = core.into();
        let description = first_line(&core).to_string();
        Self {
            id: id.into(),
            description,
            core,
            detail: None,
            capabilities: BTreeSet::new(),
            declared_deps: BTreeSet::new(),
            core_size: None,
            detail_size: None,
            optional: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Pin the core size instead of estimating it from content.
    pub fn with_size(mut self, size: u64) -> Self {
        self.core_size = Some(size);
        self
    }

    /// Pin the detail size instead of estimating it from content.
    pub fn with_detail_size(mut self, size: u64) -> Self {
        self.detail_size = Some(size);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.declared_deps.insert(dep.into());
        self
    }

    /// Tag the module non-critical.
    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    fn content(&self, variant: Variant) -> String {
        match variant {
            Variant::Summary => self.description.clone(),
            Variant::Core => self.core.clone(),
            Variant::Detail => match &self.detail {
                Some(detail) => format!("{}\n\n{detail}", self.core),
                None => self.core.clone(),
            },
        }
    }

    fn size(&self, variant: Variant) -> u64 {
        match variant {
            Variant::Summary => estimate_units(&self.description),
            Variant::Core => self.core_size.unwrap_or_else(|| estimate_units(&self.core)),
            Variant::Detail => self
                .detail_size
                .unwrap_or_else(|| estimate_units(&self.content(Variant::Detail))),
        }
    }
}

/// Module source backed by a map, populated with a builder.
#[derive(Debug, Default)]
pub struct InMemorySource {
    modules: HashMap<String, SourceModule>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module (builder pattern).
    pub fn with_module(mut self, module: SourceModule) -> Self {
        self.insert(module);
        self
    }

    pub fn insert(&mut self, module: SourceModule) {
        self.modules.insert(module.id.clone(), module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn get(&self, id: &str) -> Result<&SourceModule> {
        self.modules
            .get(id)
            .ok_or_else(|| OrchestraError::ModuleNotFound(id.to_string()))
    }
}

impl ModuleSource for InMemorySource {
    fn read(&self, key: &ModuleKey) -> Result<String> {
        Ok(self.get(&key.id)?.content(key.variant))
    }

    fn size_of(&self, key: &ModuleKey) -> Result<u64> {
        Ok(self.get(&key.id)?.size(key.variant))
    }

    fn descriptor(&self, key: &ModuleKey) -> Result<ModuleDescriptor> {
        let module = self.get(&key.id)?;
        Ok(ModuleDescriptor {
            id: module.id.clone(),
            team: team_of(&module.id).to_string(),
            variant: key.variant,
            estimated_size: module.size(key.variant),
            capabilities: module.capabilities.clone(),
            declared_deps: module.declared_deps.clone(),
            description: module.description.clone(),
            optional: module.optional,
        })
    }
}

// ── DirectorySource ────────────────────────────────────────────────

/// Heading that separates core content from optional detail.
const DETAIL_HEADING: &str = "## detail";

/// Reads agent definition files laid out as `<root>/<team>/<agent>.md`.
///
/// Each file may start with a `---` front-matter block:
///
/// ```text
/// ---
/// description: Designs relational schemas from requirements
/// capabilities: schema, migrations
/// depends_on: product/requirements-analyst
/// optional: false
/// ---
/// # Schema Architect
/// ...core instructions...
/// ## Detail
/// ...optional reference material...
/// ```
///
/// The summary variant is the description, core is the body up to the
/// `## Detail` heading, and detail is the whole body. `optional: true` tags
/// the module non-critical wherever a phase lists it.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every `team/agent` id under the root, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for team in std::fs::read_dir(&self.root)? {
            let team = team?;
            if !team.file_type()?.is_dir() {
                continue;
            }
            let team_name = team.file_name().to_string_lossy().to_string();
            for entry in std::fs::read_dir(team.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md")
                    && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                {
                    ids.push(format!("{team_name}/{stem}"));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || id.is_empty() {
            return Err(OrchestraError::ModuleNotFound(id.to_string()));
        }
        Ok(self.root.join(format!("{id}.md")))
    }

    fn load_file(&self, id: &str) -> Result<ParsedModule> {
        let path = self.path_for(id)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestraError::ModuleNotFound(id.to_string())
            } else {
                OrchestraError::Io(e)
            }
        })?;
        Ok(ParsedModule::parse(&text))
    }
}

impl ModuleSource for DirectorySource {
    fn read(&self, key: &ModuleKey) -> Result<String> {
        Ok(self.load_file(&key.id)?.content(key.variant))
    }

    fn size_of(&self, key: &ModuleKey) -> Result<u64> {
        Ok(estimate_units(&self.read(key)?))
    }

    fn descriptor(&self, key: &ModuleKey) -> Result<ModuleDescriptor> {
        let parsed = self.load_file(&key.id)?;
        let content = parsed.content(key.variant);
        Ok(ModuleDescriptor {
            id: key.id.clone(),
            team: team_of(&key.id).to_string(),
            variant: key.variant,
            estimated_size: estimate_units(&content),
            capabilities: parsed.list_field("capabilities"),
            declared_deps: parsed.list_field("depends_on"),
            description: parsed.description(),
            optional: parsed.flag("optional"),
        })
    }
}

/// A module file split into front matter and body.
struct ParsedModule {
    fields: BTreeMap<String, String>,
    body: String,
}

impl ParsedModule {
    fn parse(text: &str) -> Self {
        let (fields, body) = split_front_matter(text);
        Self {
            fields,
            body: body.to_string(),
        }
    }

    fn description(&self) -> String {
        self.fields
            .get("description")
            .cloned()
            .unwrap_or_else(|| first_line(&self.body).to_string())
    }

    fn list_field(&self, name: &str) -> BTreeSet<String> {
        self.fields
            .get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A `true`/`yes` front-matter flag. Anything else, or absence, is false.
    fn flag(&self, name: &str) -> bool {
        self.fields
            .get(name)
            .is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "yes"))
    }

    fn content(&self, variant: Variant) -> String {
        match variant {
            Variant::Summary => self.description(),
            Variant::Core => core_section(&self.body),
            Variant::Detail => self.body.clone(),
        }
    }
}

fn split_front_matter(text: &str) -> (BTreeMap<String, String>, &str) {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (BTreeMap::new(), text);
    };
    let Some((header, after)) = rest.split_once("\n---") else {
        return (BTreeMap::new(), text);
    };
    // Drop the remainder of the closing fence line.
    let body = after.split_once('\n').map_or("", |(_, b)| b);
    let fields = header
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    (fields, body)
}

fn core_section(body: &str) -> String {
    let mut core = Vec::new();
    for line in body.lines() {
        if line.trim().to_lowercase().starts_with(DETAIL_HEADING) {
            break;
        }
        core.push(line);
    }
    core.join("\n").trim_end().to_string()
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_FILE: &str = "---\n\
description: Designs relational schemas\n\
capabilities: schema, migrations\n\
depends_on: product/requirements-analyst\n\
---\n\
# Schema Architect\n\
Produce entities and relations.\n\
## Detail\n\
Normalization checklist.\n";

    #[test]
    fn in_memory_variants_and_sizes() {
        let source = InMemorySource::new().with_module(
            SourceModule::new("db/schema", "Schema agent\nbody")
                .with_detail("extra")
                .with_size(400)
                .with_detail_size(900),
        );
        assert_eq!(source.size_of(&ModuleKey::core("db/schema")).unwrap(), 400);
        assert_eq!(source.size_of(&ModuleKey::detail("db/schema")).unwrap(), 900);
        assert_eq!(
            source.read(&ModuleKey::summary("db/schema")).unwrap(),
            "Schema agent"
        );
        assert!(source.read(&ModuleKey::detail("db/schema")).unwrap().ends_with("extra"));
    }

    #[test]
    fn in_memory_unknown_module() {
        let source = InMemorySource::new();
        let err = source.read(&ModuleKey::core("nope")).unwrap_err();
        assert!(matches!(err, OrchestraError::ModuleNotFound(id) if id == "nope"));
    }

    #[test]
    fn front_matter_is_parsed() {
        let parsed = ParsedModule::parse(AGENT_FILE);
        assert_eq!(parsed.description(), "Designs relational schemas");
        assert_eq!(
            parsed.list_field("capabilities"),
            BTreeSet::from(["migrations".to_string(), "schema".to_string()])
        );
        let core = parsed.content(Variant::Core);
        assert!(core.contains("Produce entities"));
        assert!(!core.contains("Normalization"));
        assert!(parsed.content(Variant::Detail).contains("Normalization"));
    }

    #[test]
    fn no_front_matter_uses_first_line() {
        let parsed = ParsedModule::parse("# Writer\nWrites docs.\n");
        assert_eq!(parsed.description(), "Writer");
        assert!(parsed.fields.is_empty());
    }

    #[test]
    fn directory_source_reads_team_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("database")).unwrap();
        std::fs::write(dir.path().join("database/schema-architect.md"), AGENT_FILE).unwrap();
        std::fs::write(dir.path().join("database/notes.txt"), "ignored").unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.list().unwrap(), vec!["database/schema-architect"]);

        let key = ModuleKey::core("database/schema-architect");
        let descriptor = source.descriptor(&key).unwrap();
        assert_eq!(descriptor.team, "database");
        assert!(descriptor.declared_deps.contains("product/requirements-analyst"));
        assert_eq!(descriptor.estimated_size, source.size_of(&key).unwrap());
        assert!(
            source.size_of(&ModuleKey::detail("database/schema-architect")).unwrap()
                > source.size_of(&key).unwrap()
        );
    }

    #[test]
    fn optional_tag_reaches_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("frontend")).unwrap();
        std::fs::write(
            dir.path().join("frontend/component-designer.md"),
            "---\ndescription: x\noptional: true\n---\n# Designer\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("frontend/admin-ui-builder.md"), "# Builder\n").unwrap();

        let source = DirectorySource::new(dir.path());
        assert!(
            source
                .descriptor(&ModuleKey::core("frontend/component-designer"))
                .unwrap()
                .optional
        );
        assert!(
            !source
                .descriptor(&ModuleKey::core("frontend/admin-ui-builder"))
                .unwrap()
                .optional
        );
        assert!(!ParsedModule::parse(AGENT_FILE).flag("optional"));

        let memory = InMemorySource::new().with_module(SourceModule::new("t/a", "# A").with_optional(true));
        assert!(memory.descriptor(&ModuleKey::core("t/a")).unwrap().optional);
    }

    #[test]
    fn directory_source_rejects_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.read(&ModuleKey::core("../etc/passwd")),
            Err(OrchestraError::ModuleNotFound(_))
        ));
        assert!(matches!(
            source.read(&ModuleKey::core("team/missing")),
            Err(OrchestraError::ModuleNotFound(_))
        ));
    }
}
