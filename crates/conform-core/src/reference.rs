//! Reference evaluation: the ground truth every substrate is graded against.
//!
//! All formulas (and `applies_when` predicates) are compiled when the
//! evaluator is built, so a syntax error surfaces before any record is
//! touched. Any evaluation error is fatal: there is no partial ground truth.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use conform_state::ContentDigest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::absence;
use crate::artifact::write_json_atomic;
use crate::error::{ConformError, ConformResult, FormulaError};
use crate::formula::{truthy, Bindings, Formula};
use crate::resolver;
use crate::rulebook::{DataType, Entity, FieldDefinition, Rulebook};
use crate::value::{Record, Value};

/// Evaluated records of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTable {
    pub entity: String,
    pub primary_key: String,
    /// Calculated fields in evaluation order
    pub computed_columns: Vec<String>,
    /// Declared type of each calculated field
    #[serde(default)]
    pub column_types: BTreeMap<String, DataType>,
    pub records: Vec<Record>,
    /// Primary key to calculated fields excluded from scoring for that record
    #[serde(default)]
    pub not_applicable: BTreeMap<String, BTreeSet<String>>,
}

impl EntityTable {
    pub fn is_applicable(&self, key: &str, field: &str) -> bool {
        !self
            .not_applicable
            .get(key)
            .is_some_and(|fields| fields.contains(field))
    }

    pub fn record(&self, key: &str) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.get(&self.primary_key).and_then(Value::key_string).as_deref() == Some(key))
    }
}

/// Fully evaluated records for every entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroundTruthSet {
    pub tables: BTreeMap<String, EntityTable>,
}

impl GroundTruthSet {
    pub fn table(&self, entity: &str) -> Option<&EntityTable> {
        self.tables.get(entity)
    }

    /// Digest over the canonical JSON of every table.
    pub fn digest(&self) -> ConformResult<ContentDigest> {
        let bytes = serde_json::to_vec(&self.tables)?;
        Ok(ContentDigest::from_bytes(&bytes))
    }

    /// Write one `<Entity>.json` array per table.
    pub fn write_dir(&self, dir: &Path) -> ConformResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| ConformError::io(dir, e))?;
        for (name, table) in &self.tables {
            write_json_atomic(&dir.join(format!("{name}.json")), &table.records)?;
        }
        Ok(())
    }
}

struct CompiledField {
    name: String,
    datatype: DataType,
    nullable: bool,
    values: Vec<String>,
    formula: Formula,
}

struct CompiledEntity {
    name: String,
    primary_key: String,
    /// Declared type and nullability of every field, for absence reads
    declared: BTreeMap<String, (DataType, bool)>,
    /// Calculated fields in level order
    plan: Vec<CompiledField>,
    applies_when: Vec<(String, Formula)>,
    raw_records: Vec<Record>,
}

/// Computes calculated fields in dependency order.
pub struct ReferenceEvaluator {
    entities: Vec<CompiledEntity>,
}

impl ReferenceEvaluator {
    /// Resolve levels and compile every formula in the rulebook.
    pub fn new(rulebook: &Rulebook) -> ConformResult<Self> {
        let mut entities = Vec::with_capacity(rulebook.entities.len());
        for entity in &rulebook.entities {
            entities.push(compile_entity(entity)?);
        }
        Ok(Self { entities })
    }

    fn compiled(&self, entity: &str) -> ConformResult<&CompiledEntity> {
        self.entities
            .iter()
            .find(|e| e.name == entity)
            .ok_or_else(|| ConformError::UnknownEntity(entity.to_string()))
    }

    /// Evaluate every entity's rulebook rows.
    pub fn evaluate(&self) -> ConformResult<GroundTruthSet> {
        let mut tables = BTreeMap::new();
        for compiled in &self.entities {
            let table = self.evaluate_table(compiled, &compiled.raw_records)?;
            debug!(
                entity = %compiled.name,
                records = table.records.len(),
                excluded = table.not_applicable.values().map(BTreeSet::len).sum::<usize>(),
                "entity evaluated"
            );
            tables.insert(compiled.name.clone(), table);
        }
        Ok(GroundTruthSet { tables })
    }

    /// Evaluate arbitrary raw records of one entity. Calculated values already
    /// present in the input are overwritten.
    pub fn evaluate_records(&self, entity: &str, records: &[Record]) -> ConformResult<Vec<Record>> {
        let compiled = self.compiled(entity)?;
        Ok(self.evaluate_table(compiled, records)?.records)
    }

    fn evaluate_table(
        &self,
        compiled: &CompiledEntity,
        records: &[Record],
    ) -> ConformResult<EntityTable> {
        let mut out = Vec::with_capacity(records.len());
        let mut not_applicable: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for raw in records {
            let key = raw
                .get(&compiled.primary_key)
                .and_then(Value::key_string)
                .unwrap_or_default();
            let record = evaluate_record(compiled, raw, &key)?;

            for (field, predicate) in &compiled.applies_when {
                let scope = RecordScope {
                    entity: compiled,
                    record: &record,
                };
                let applies = predicate
                    .eval(&scope)
                    .map_err(|source| ConformError::Evaluation {
                        entity: compiled.name.clone(),
                        field: format!("{field} (applies_when)"),
                        key: key.clone(),
                        source,
                    })?;
                if !truthy(&applies) {
                    not_applicable
                        .entry(key.clone())
                        .or_default()
                        .insert(field.clone());
                }
            }
            out.push(record);
        }

        Ok(EntityTable {
            entity: compiled.name.clone(),
            primary_key: compiled.primary_key.clone(),
            computed_columns: compiled.plan.iter().map(|f| f.name.clone()).collect(),
            column_types: compiled
                .plan
                .iter()
                .map(|f| (f.name.clone(), f.datatype))
                .collect(),
            records: out,
            not_applicable,
        })
    }

    /// Calculated fields of an entity in evaluation order.
    pub fn evaluation_order(&self, entity: &str) -> ConformResult<Vec<&str>> {
        Ok(self
            .compiled(entity)?
            .plan
            .iter()
            .map(|f| f.name.as_str())
            .collect())
    }
}

fn compile_entity(entity: &Entity) -> ConformResult<CompiledEntity> {
    let plan = resolver::resolve(entity)?;
    let compile = |field: &FieldDefinition, source: &str| {
        Formula::compile(source).map_err(|source| ConformError::Formula {
            entity: entity.name.clone(),
            field: field.name.clone(),
            source,
        })
    };

    let mut compiled_plan = Vec::with_capacity(plan.fields.len());
    for leveled in &plan.fields {
        let field = leveled.field;
        let Some(source) = field.formula() else {
            continue;
        };
        compiled_plan.push(CompiledField {
            name: field.name.clone(),
            datatype: field.datatype,
            nullable: field.nullable,
            values: field.values.clone(),
            formula: compile(field, &source.text)?,
        });
    }

    let mut applies_when = Vec::new();
    for field in &entity.fields {
        if let Some(predicate) = &field.applies_when {
            applies_when.push((field.name.clone(), compile(field, &predicate.text)?));
        }
    }

    Ok(CompiledEntity {
        name: entity.name.clone(),
        primary_key: entity.primary_key.clone(),
        declared: entity
            .fields
            .iter()
            .map(|f| (f.name.clone(), (f.datatype, f.nullable)))
            .collect(),
        plan: compiled_plan,
        applies_when,
        raw_records: entity.records.clone(),
    })
}

fn evaluate_record(compiled: &CompiledEntity, raw: &Record, key: &str) -> ConformResult<Record> {
    let mut record: Record = raw
        .iter()
        .filter(|(name, _)| !compiled.plan.iter().any(|f| &f.name == *name))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for field in &compiled.plan {
        let value = {
            let scope = RecordScope {
                entity: compiled,
                record: &record,
            };
            field
                .formula
                .eval(&scope)
                .and_then(|v| coerce(field, v))
                .map_err(|source| ConformError::Evaluation {
                    entity: compiled.name.clone(),
                    field: field.name.clone(),
                    key: key.to_string(),
                    source,
                })?
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

/// Field reads for one record with the absence policy applied.
struct RecordScope<'a> {
    entity: &'a CompiledEntity,
    record: &'a Record,
}

impl Bindings for RecordScope<'_> {
    fn lookup(&self, name: &str) -> Result<Value, FormulaError> {
        let (datatype, nullable) = self
            .entity
            .declared
            .get(name)
            .copied()
            .ok_or_else(|| FormulaError::UnknownField { name: name.into() })?;
        match self.record.get(name) {
            Some(stored) => Ok(absence::read(stored, datatype, nullable)),
            // Level ordering guarantees calculated dependencies are already set.
            None if self.entity.plan.iter().any(|f| f.name == name) => Err(
                FormulaError::Type(format!("{name} read before it was evaluated")),
            ),
            None => Ok(absence::read_absent(datatype, nullable)),
        }
    }
}

/// Convert a formula result to the field's declared type.
fn coerce(field: &CompiledField, value: Value) -> Result<Value, FormulaError> {
    let mismatch = |v: &Value| {
        FormulaError::Type(format!(
            "{} cannot hold {} value {v}",
            field.name, field.datatype
        ))
    };
    match field.datatype {
        DataType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Absent => Ok(Value::Bool(false)),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            Value::Text(ref s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" | "" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
        },
        DataType::Integer => match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Absent => Ok(Value::Absent),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::Text(ref s) if s.is_empty() => Ok(Value::Absent),
            Value::Text(ref s) => s.trim().parse().map(Value::Int).map_err(|_| mismatch(&value)),
        },
        DataType::String | DataType::Enumeration => {
            let text = match value {
                Value::Absent if field.nullable => return Ok(Value::Absent),
                other => other.coerce_text(),
            };
            if field.datatype == DataType::Enumeration
                && !text.is_empty()
                && !field.values.contains(&text)
            {
                return Err(FormulaError::Type(format!(
                    "{} produced {text:?}, not one of {:?}",
                    field.name, field.values
                )));
            }
            Ok(Value::Text(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rulebook(schema: serde_json::Value, data: serde_json::Value) -> Rulebook {
        let doc = json!({"E": {"primary_key": "Id", "schema": schema, "data": data}});
        Rulebook::from_json_str(&doc.to_string()).unwrap()
    }

    #[test]
    fn level_two_reads_level_one() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "N", "datatype": "integer"},
                {"name": "Double", "datatype": "integer", "type": "calculated", "formula": "={{N}} * 2"},
                {"name": "Label", "datatype": "string", "type": "calculated",
                 "formula": "={{Id}} & \":\" & {{Double}}"}
            ]),
            json!([{"Id": "a", "N": 4}]),
        );
        let gt = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
        let rec = &gt.table("E").unwrap().records[0];
        assert_eq!(rec.get("Double"), Some(&Value::Int(8)));
        assert_eq!(rec.get("Label"), Some(&Value::text("a:8")));
    }

    #[test]
    fn absent_boolean_reads_false() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "Flag", "datatype": "boolean", "nullable": true},
                {"name": "Neg", "datatype": "boolean", "type": "calculated", "formula": "=NOT({{Flag}})"}
            ]),
            json!([{"Id": "a", "Flag": null}]),
        );
        let gt = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
        assert_eq!(
            gt.table("E").unwrap().records[0].get("Neg"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn nullable_string_stays_absent() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "Alias", "datatype": "string", "nullable": true},
                {"name": "Copy", "datatype": "string", "nullable": true, "type": "calculated",
                 "formula": "={{Alias}}"},
                {"name": "Strict", "datatype": "string", "type": "calculated", "formula": "={{Alias}}"}
            ]),
            json!([{"Id": "a"}]),
        );
        let gt = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
        let rec = &gt.table("E").unwrap().records[0];
        assert_eq!(rec.get("Copy"), Some(&Value::Absent));
        assert_eq!(rec.get("Strict"), Some(&Value::text("")));
    }

    #[test]
    fn syntax_error_fails_at_construction() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "Bad", "datatype": "integer", "type": "calculated", "formula": "=1 +"}
            ]),
            json!([]),
        );
        let err = ReferenceEvaluator::new(&rb).err().unwrap();
        assert!(matches!(err, ConformError::Formula { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn evaluation_error_names_record() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "D", "datatype": "integer"},
                {"name": "Q", "datatype": "integer", "type": "calculated", "formula": "=10 / {{D}}"}
            ]),
            json!([{"Id": "ok", "D": 2}, {"Id": "zero", "D": 0}]),
        );
        let err = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap_err();
        match err {
            ConformError::Evaluation { key, field, .. } => {
                assert_eq!(key, "zero");
                assert_eq!(field, "Q");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn enumeration_result_must_be_declared() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "K", "datatype": "enumeration", "type": "calculated",
                 "values": ["x"], "formula": "=\"y\""}
            ]),
            json!([{"Id": "a"}]),
        );
        let err = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap_err();
        assert!(matches!(err, ConformError::Evaluation { .. }));
    }

    #[test]
    fn applies_when_marks_exclusions() {
        let rb = rulebook(
            json!([
                {"name": "Id", "datatype": "string"},
                {"name": "IsLanguage", "datatype": "boolean"},
                {"name": "Grammar", "datatype": "string", "type": "calculated",
                 "formula": "=\"yes\"", "applies_when": "={{IsLanguage}}"}
            ]),
            json!([{"Id": "a", "IsLanguage": true}, {"Id": "b", "IsLanguage": false}]),
        );
        let gt = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
        let table = gt.table("E").unwrap();
        assert!(table.is_applicable("a", "Grammar"));
        assert!(!table.is_applicable("b", "Grammar"));
    }
}
