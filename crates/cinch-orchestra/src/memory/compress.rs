//! Lossy compression of phase results.
//!
//! Downstream phases only need the *specification* of what an upstream
//! phase produced. Schema results shrink to entities, typed fields and
//! relation summaries; everything else keeps its declared interfaces and
//! drops implementation bodies.

use crate::phase::PhaseKind;
use serde_json::{Map, Value, json};

/// Reduces a raw phase payload to its specification-only form.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, payload: &Value) -> Value;
}

/// Pick the compressor for a phase kind.
pub fn compressor_for(kind: PhaseKind) -> &'static dyn Compressor {
    if kind.is_schema() {
        &SchemaCompressor
    } else {
        &OutputCompressor
    }
}

// ── Schema ─────────────────────────────────────────────────────────

/// Keeps entity names, field name/type/key flags, and relation summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaCompressor;

impl Compressor for SchemaCompressor {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn compress(&self, payload: &Value) -> Value {
        let compressed = compress_schema(payload);
        if compressed.is_null() {
            Value::Object(Map::new())
        } else {
            compressed
        }
    }
}

fn compress_schema(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let entities = obj.get("entities").or_else(|| obj.get("tables"));
            if let Some(Value::Array(entities)) = entities {
                let entities: Vec<Value> = entities.iter().map(compress_entity).collect();
                let relations = relation_summaries(obj);
                let mut out = Map::new();
                out.insert("entities".into(), Value::Array(entities));
                if !relations.is_empty() {
                    out.insert("relations".into(), Value::Array(relations));
                }
                return Value::Object(out);
            }
            // Agent-keyed wrapper: compress each child, keep structural ones.
            let kept: Map<String, Value> = obj
                .iter()
                .map(|(k, v)| (k.clone(), compress_schema(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if kept.is_empty() {
                Value::Null
            } else {
                Value::Object(kept)
            }
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items
                .iter()
                .map(compress_schema)
                .filter(|v| !v.is_null())
                .collect();
            if kept.is_empty() {
                Value::Null
            } else {
                Value::Array(kept)
            }
        }
        _ => Value::Null,
    }
}

fn compress_entity(entity: &Value) -> Value {
    let name = entity
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| entity.as_str())
        .unwrap_or("unnamed");
    let fields: Vec<Value> = entity
        .get("fields")
        .or_else(|| entity.get("columns"))
        .and_then(Value::as_array)
        .map(|fields| fields.iter().map(compress_field).collect())
        .unwrap_or_default();

    let mut out = Map::new();
    out.insert("name".into(), json!(name));
    out.insert("fields".into(), Value::Array(fields));
    if let Some(obj) = entity.as_object() {
        let relations = relation_summaries(obj);
        if !relations.is_empty() {
            out.insert("relations".into(), Value::Array(relations));
        }
    }
    Value::Object(out)
}

fn compress_field(field: &Value) -> Value {
    let name = field
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| field.as_str())
        .unwrap_or("unnamed");
    let ty = field.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let key = ["key", "primary_key", "primaryKey", "pk"]
        .iter()
        .filter_map(|k| field.get(*k))
        .any(|v| match v {
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            _ => false,
        });
    json!({ "name": name, "type": ty, "key": key })
}

fn relation_summaries(obj: &Map<String, Value>) -> Vec<Value> {
    obj.get("relations")
        .or_else(|| obj.get("relationships"))
        .and_then(Value::as_array)
        .map(|rels| rels.iter().filter_map(relation_summary).collect())
        .unwrap_or_default()
}

fn relation_summary(relation: &Value) -> Option<Value> {
    if let Some(s) = relation.as_str() {
        return Some(json!(s));
    }
    let from = str_field(relation, &["from", "source"])?;
    let to = str_field(relation, &["to", "target"])?;
    Some(match str_field(relation, &["type", "kind", "cardinality"]) {
        Some(kind) => json!(format!("{from} -> {to} ({kind})")),
        None => json!(format!("{from} -> {to}")),
    })
}

fn str_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| value.get(*n).and_then(Value::as_str))
}

// ── Generic output ─────────────────────────────────────────────────

/// Keys whose values are kept verbatim.
const SPEC_KEYS: &[&str] = &[
    "interfaces",
    "interface",
    "signatures",
    "specification",
    "specifications",
    "endpoints",
    "types",
    "exports",
    "summary",
    "contracts",
];

/// Keys whose values are implementation content and always dropped.
const IMPLEMENTATION_KEYS: &[&str] = &[
    "implementation",
    "code",
    "content",
    "body",
    "source",
    "files",
    "tests",
];

/// Longest string kept for non-specification scalars.
const MAX_NOTE_CHARS: usize = 160;

/// Keeps declared interfaces, drops implementation bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputCompressor;

impl Compressor for OutputCompressor {
    fn name(&self) -> &'static str {
        "output"
    }

    fn compress(&self, payload: &Value) -> Value {
        compress_output(payload).unwrap_or_else(|| Value::Object(Map::new()))
    }
}

fn compress_output(value: &Value) -> Option<Value> {
    match value {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, child) in obj {
                let lower = key.to_lowercase();
                if SPEC_KEYS.contains(&lower.as_str()) {
                    out.insert(key.clone(), child.clone());
                } else if IMPLEMENTATION_KEYS.contains(&lower.as_str()) {
                    continue;
                } else if let Some(kept) = compress_output(child) {
                    out.insert(key.clone(), kept);
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(compress_output).collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        Value::String(s) => {
            let line: String = s.lines().next().unwrap_or("").chars().take(MAX_NOTE_CHARS).collect();
            (!line.is_empty()).then_some(Value::String(line))
        }
        Value::Null => None,
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_keeps_structure_only() {
        let raw = json!({
            "database/schema-architect": {
                "entities": [{
                    "name": "User",
                    "description": "A person who logs in. Long prose here.",
                    "fields": [
                        {"name": "id", "type": "uuid", "primary_key": true, "comment": "pk"},
                        {"name": "email", "type": "text", "unique": true}
                    ],
                    "relations": [{"from": "User", "to": "Role", "type": "many-to-many"}]
                }],
                "rationale": "Normalized to 3NF because..."
            }
        });
        let compressed = SchemaCompressor.compress(&raw);
        let entity = &compressed["database/schema-architect"]["entities"][0];
        assert_eq!(entity["name"], "User");
        assert_eq!(entity["fields"][0], json!({"name": "id", "type": "uuid", "key": true}));
        assert_eq!(entity["fields"][1]["key"], false);
        assert_eq!(entity["relations"][0], "User -> Role (many-to-many)");
        assert!(entity.get("description").is_none());
        assert!(compressed["database/schema-architect"].get("rationale").is_none());
    }

    #[test]
    fn schema_without_entities_compresses_to_empty() {
        assert_eq!(SchemaCompressor.compress(&json!({"notes": "text"})), json!({}));
    }

    #[test]
    fn output_keeps_interfaces_and_drops_code() {
        let raw = json!({
            "backend/api-designer": {
                "endpoints": [{"method": "GET", "path": "/users"}],
                "implementation": "fn handler() { /* 400 lines */ }",
                "notes": "First line\nsecond line",
                "version": 2
            }
        });
        let compressed = OutputCompressor.compress(&raw);
        let agent = &compressed["backend/api-designer"];
        assert_eq!(agent["endpoints"][0]["path"], "/users");
        assert!(agent.get("implementation").is_none());
        assert_eq!(agent["notes"], "First line");
        assert_eq!(agent["version"], 2);
    }

    #[test]
    fn compression_shrinks_serialized_size() {
        let raw = json!({
            "agent": {
                "summary": "Auth service",
                "code": "x".repeat(5_000),
            }
        });
        let compressed = OutputCompressor.compress(&raw);
        assert!(compressed.to_string().len() < raw.to_string().len() / 10);
    }

    #[test]
    fn compressor_selection() {
        assert_eq!(compressor_for(PhaseKind::Schema).name(), "schema");
        assert_eq!(compressor_for(PhaseKind::Frontend).name(), "output");
    }
}
