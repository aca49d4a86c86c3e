//! Rulebook model: entities, typed field declarations and raw input rows.
//!
//! A rulebook document is a JSON object. Metadata keys (`$schema`, `Name`,
//! `Description`, `model_name`, `_meta`) describe the rulebook; every other
//! key whose value is an object with a `schema` array is an entity. Loose
//! JSON is turned into [`FieldDefinition`] values here and nowhere else, so
//! evaluation never sees an unknown shape.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use conform_state::ContentDigest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConformError, ConformResult};
use crate::formula::scanner;
use crate::value::{Record, Value};

const METADATA_KEYS: &[&str] = &["$schema", "Name", "Description", "model_name", "_meta"];

/// Declared scalar type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Boolean,
    Integer,
    Enumeration,
}

impl DataType {
    /// Parse a declared type name, accepting the common aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "text" => Some(DataType::String),
            "boolean" | "bool" => Some(DataType::Boolean),
            "integer" | "int" | "number" => Some(DataType::Integer),
            "enumeration" | "enum" => Some(DataType::Enumeration),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Enumeration => "enumeration",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A formula string with its scanned references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaSource {
    pub text: String,
    /// Field names the formula references, first occurrence order
    pub references: Vec<String>,
}

impl FormulaSource {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let references = scanner::references(&text);
        Self { text, references }
    }
}

/// Raw input or derived value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Raw,
    Calculated { formula: FormulaSource },
}

/// One declared field of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub datatype: DataType,
    /// Absence is a distinct value rather than an empty default
    pub nullable: bool,
    /// Allowed values for enumerations
    pub values: Vec<String>,
    pub description: Option<String>,
    pub kind: FieldKind,
    /// Predicate deciding whether the field is graded for a record
    pub applies_when: Option<FormulaSource>,
}

impl FieldDefinition {
    pub fn is_calculated(&self) -> bool {
        matches!(self.kind, FieldKind::Calculated { .. })
    }

    pub fn formula(&self) -> Option<&FormulaSource> {
        match &self.kind {
            FieldKind::Calculated { formula } => Some(formula),
            FieldKind::Raw => None,
        }
    }
}

/// A named record type with its declared fields and raw input rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub description: Option<String>,
    pub primary_key: String,
    pub fields: Vec<FieldDefinition>,
    /// Raw rows; calculated fields are never present here
    pub records: Vec<Record>,
}

impl Entity {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn raw_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| !f.is_calculated())
    }

    pub fn calculated_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_calculated())
    }

    /// Names of calculated fields in declaration order.
    pub fn computed_columns(&self) -> Vec<String> {
        self.calculated_fields().map(|f| f.name.clone()).collect()
    }

    /// Primary key of a record in string form.
    pub fn key_of(&self, record: &Record) -> Option<String> {
        record.get(&self.primary_key).and_then(Value::key_string)
    }
}

/// A parsed and validated rulebook.
#[derive(Debug, Clone)]
pub struct Rulebook {
    pub name: Option<String>,
    pub description: Option<String>,
    pub entities: Vec<Entity>,
    /// SHA-256 of the document bytes
    pub digest: ContentDigest,
}

impl Rulebook {
    /// Load and validate a rulebook file.
    pub fn load(path: &Path) -> ConformResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConformError::io(path, e))?;
        let rulebook = Self::from_json_str(&text)?;
        debug!(
            path = %path.display(),
            entities = rulebook.entities.len(),
            digest = rulebook.digest.short(),
            "rulebook loaded"
        );
        Ok(rulebook)
    }

    /// Parse and validate a rulebook document.
    pub fn from_json_str(text: &str) -> ConformResult<Self> {
        let doc: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ConformError::MalformedRulebook(format!("not valid JSON: {e}")))?;
        let serde_json::Value::Object(top) = doc else {
            return Err(ConformError::MalformedRulebook(
                "top level must be a JSON object".into(),
            ));
        };

        let mut entities = Vec::new();
        for (key, value) in &top {
            if METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            let is_entity = value
                .as_object()
                .map(|o| o.contains_key("schema"))
                .unwrap_or(false);
            if !is_entity {
                debug!(key = %key, "ignoring non-entity rulebook key");
                continue;
            }
            entities.push(parse_entity(key, value)?);
        }
        if entities.is_empty() {
            return Err(ConformError::MalformedRulebook(
                "rulebook declares no entities".into(),
            ));
        }

        Ok(Self {
            name: top.get("Name").and_then(|v| v.as_str()).map(str::to_string),
            description: top
                .get("Description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            entities,
            digest: ContentDigest::from_bytes(text.as_bytes()),
        })
    }

    pub fn entity(&self, name: &str) -> ConformResult<&Entity> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ConformError::UnknownEntity(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Document shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EntityDecl {
    #[serde(default)]
    primary_key: Option<String>,
    #[serde(default, alias = "Description")]
    description: Option<String>,
    schema: Vec<FieldDecl>,
    #[serde(default)]
    data: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldDecl {
    name: String,
    #[serde(default)]
    datatype: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    formula: Option<String>,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    values: Option<Vec<String>>,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    applies_when: Option<String>,
    #[serde(default, alias = "Description")]
    description: Option<String>,
    #[serde(default, alias = "Notes")]
    #[allow(dead_code)]
    notes: Option<String>,
}

fn malformed(msg: String) -> ConformError {
    ConformError::MalformedRulebook(msg)
}

fn parse_entity(name: &str, value: &serde_json::Value) -> ConformResult<Entity> {
    let decl: EntityDecl = serde_json::from_value(value.clone())
        .map_err(|e| malformed(format!("entity {name}: {e}")))?;

    let mut fields = Vec::with_capacity(decl.schema.len());
    let mut seen = BTreeSet::new();
    let mut flagged_pk = Vec::new();
    for fd in decl.schema {
        if fd.name.trim().is_empty() {
            return Err(malformed(format!("entity {name}: field with empty name")));
        }
        if !seen.insert(fd.name.clone()) {
            return Err(malformed(format!(
                "entity {name}: field {} declared twice",
                fd.name
            )));
        }
        if fd.primary_key {
            flagged_pk.push(fd.name.clone());
        }
        fields.push(parse_field(name, fd)?);
    }

    let primary_key = match (decl.primary_key, flagged_pk.as_slice()) {
        (Some(pk), []) => pk,
        (Some(pk), [flagged]) if *flagged == pk => pk,
        (Some(pk), flagged) => {
            return Err(malformed(format!(
                "entity {name}: primary_key {pk} disagrees with flagged fields {flagged:?}"
            )))
        }
        (None, [flagged]) => flagged.clone(),
        (None, []) => return Err(malformed(format!("entity {name} has no primary key"))),
        (None, flagged) => {
            return Err(malformed(format!(
                "entity {name}: several primary key fields {flagged:?}"
            )))
        }
    };
    match fields.iter().find(|f| f.name == primary_key) {
        None => {
            return Err(malformed(format!(
                "entity {name}: primary key {primary_key} is not a declared field"
            )))
        }
        Some(f) if f.is_calculated() => {
            return Err(malformed(format!(
                "entity {name}: primary key {primary_key} must be a raw field"
            )))
        }
        Some(_) => {}
    }

    for field in &fields {
        let sources = field.formula().into_iter().chain(field.applies_when.as_ref());
        for source in sources {
            for reference in &source.references {
                if !seen.contains(reference) {
                    return Err(malformed(format!(
                        "entity {name}: {} references undeclared field {reference}",
                        field.name
                    )));
                }
            }
        }
    }

    let mut entity = Entity {
        name: name.to_string(),
        description: decl.description,
        primary_key,
        fields,
        records: Vec::with_capacity(decl.data.len()),
    };
    let mut keys = BTreeSet::new();
    for (idx, row) in decl.data.into_iter().enumerate() {
        let record = parse_row(&entity, idx, row)?;
        let key = entity.key_of(&record).ok_or_else(|| {
            malformed(format!(
                "entity {name}: row {idx} has a null primary key {}",
                entity.primary_key
            ))
        })?;
        if !keys.insert(key.clone()) {
            return Err(malformed(format!(
                "entity {name}: duplicate primary key {key}"
            )));
        }
        entity.records.push(record);
    }
    Ok(entity)
}

fn parse_field(entity: &str, fd: FieldDecl) -> ConformResult<FieldDefinition> {
    let field = &fd.name;
    let datatype_name = fd
        .datatype
        .as_deref()
        .ok_or_else(|| malformed(format!("{entity}.{field} has no declared type")))?;
    let datatype = DataType::parse(datatype_name).ok_or_else(|| {
        malformed(format!(
            "{entity}.{field} has unknown type {datatype_name:?}"
        ))
    })?;

    let kind = match fd.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("raw") => {
            if fd.formula.is_some() {
                return Err(malformed(format!(
                    "{entity}.{field} is raw but declares a formula"
                )));
            }
            FieldKind::Raw
        }
        Some("calculated") => {
            let text = fd
                .formula
                .filter(|f| !f.trim().is_empty())
                .ok_or_else(|| malformed(format!("{entity}.{field} is calculated without a formula")))?;
            FieldKind::Calculated {
                formula: FormulaSource::new(text),
            }
        }
        Some(other) => {
            return Err(malformed(format!(
                "{entity}.{field} has unknown kind {other:?}"
            )))
        }
    };

    let values = match (datatype, fd.values) {
        (DataType::Enumeration, Some(v)) if !v.is_empty() => v,
        (DataType::Enumeration, _) => {
            return Err(malformed(format!(
                "{entity}.{field} is an enumeration without values"
            )))
        }
        (_, Some(_)) => {
            return Err(malformed(format!(
                "{entity}.{field} lists values but is not an enumeration"
            )))
        }
        (_, None) => Vec::new(),
    };

    Ok(FieldDefinition {
        name: fd.name,
        datatype,
        nullable: fd.nullable,
        values,
        description: fd.description,
        kind,
        applies_when: fd
            .applies_when
            .filter(|f| !f.trim().is_empty())
            .map(FormulaSource::new),
    })
}

fn parse_row(
    entity: &Entity,
    idx: usize,
    row: serde_json::Map<String, serde_json::Value>,
) -> ConformResult<Record> {
    let mut record = BTreeMap::new();
    for (key, json) in row {
        let field = entity.field(&key).ok_or_else(|| {
            malformed(format!(
                "entity {}: row {idx} has undeclared field {key}",
                entity.name
            ))
        })?;
        if field.is_calculated() {
            continue;
        }
        let value = typed_raw_value(field, &json).ok_or_else(|| {
            malformed(format!(
                "entity {}: row {idx} field {key} is not a valid {}: {json}",
                entity.name, field.datatype
            ))
        })?;
        record.insert(key, value);
    }
    for field in entity.raw_fields() {
        record.entry(field.name.clone()).or_insert(Value::Absent);
    }
    Ok(record)
}

fn typed_raw_value(field: &FieldDefinition, json: &serde_json::Value) -> Option<Value> {
    let value = Value::from_json(json)?;
    let ok = match (&value, field.datatype) {
        (Value::Absent, _) => true,
        (Value::Bool(_), DataType::Boolean) => true,
        (Value::Int(_), DataType::Integer) => true,
        (Value::Text(_), DataType::String) => true,
        (Value::Text(s), DataType::Enumeration) => s.is_empty() || field.values.contains(s),
        _ => false,
    };
    ok.then_some(value)
}
