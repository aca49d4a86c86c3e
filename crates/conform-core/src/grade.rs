//! Field-by-field grading of substrate output against the ground truth.
//!
//! Grading never fails on value mismatches; those are its output. The only
//! error is structurally malformed output (an unparseable file), which the
//! caller treats as an execution failure rather than a low score.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use conform_state::{ScoreSnapshot, SubstrateMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifact::write_json_atomic;
use crate::error::{ConformResult, GradeError};
use crate::reference::{EntityTable, GroundTruthSet};
use crate::rulebook::DataType;
use crate::value::{Reported, Value};

type JsonRecord = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Substrate output
// ---------------------------------------------------------------------------

/// Records reported by one substrate, keyed by entity then primary key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubstrateOutput {
    pub entities: BTreeMap<String, BTreeMap<String, JsonRecord>>,
    /// Entity files found, including ones the rulebook does not declare
    pub files: Vec<PathBuf>,
}

impl SubstrateOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: &str, key: &str, record: JsonRecord) {
        self.entities
            .entry(entity.to_string())
            .or_default()
            .insert(key.to_string(), record);
    }

    pub fn record(&self, entity: &str, key: &str) -> Option<&JsonRecord> {
        self.entities.get(entity).and_then(|records| records.get(key))
    }

    /// Entity files in `dir`: `*.json`, names starting with `_` skipped, sorted.
    pub fn entity_files(dir: &Path) -> Result<Vec<PathBuf>, GradeError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GradeError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let is_json = path.extension().is_some_and(|ext| ext == "json");
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('_'));
                is_json && !hidden && path.is_file()
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Load a substrate output directory. `Ok(None)` means no entity files
    /// were produced at all.
    pub fn load_dir(dir: &Path, ground_truth: &GroundTruthSet) -> Result<Option<Self>, GradeError> {
        let files = Self::entity_files(dir)?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut output = SubstrateOutput {
            entities: BTreeMap::new(),
            files: files.clone(),
        };
        for path in &files {
            let Some(entity) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(table) = ground_truth.table(entity) else {
                debug!(file = %path.display(), "ignoring output for undeclared entity");
                continue;
            };
            let bytes = std::fs::read(path).map_err(|e| GradeError::Io {
                path: path.clone(),
                source: e,
            })?;
            let json: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(|e| GradeError::MalformedOutput {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            let records = parse_entity_records(path, table, json)?;
            output.entities.insert(entity.to_string(), records);
        }
        Ok(Some(output))
    }

    /// Write one `<Entity>.json` array per entity, records in key order.
    pub fn write_dir(&self, dir: &Path) -> ConformResult<()> {
        for (entity, records) in &self.entities {
            let rows: Vec<&JsonRecord> = records.values().collect();
            write_json_atomic(&dir.join(format!("{entity}.json")), &rows)?;
        }
        Ok(())
    }
}

fn parse_entity_records(
    path: &Path,
    table: &EntityTable,
    json: serde_json::Value,
) -> Result<BTreeMap<String, JsonRecord>, GradeError> {
    let malformed = |reason: String| GradeError::MalformedOutput {
        path: path.to_path_buf(),
        reason,
    };
    let mut out = BTreeMap::new();
    match json {
        serde_json::Value::Array(rows) => {
            for (idx, row) in rows.into_iter().enumerate() {
                let serde_json::Value::Object(record) = row else {
                    return Err(malformed(format!("element {idx} is not an object")));
                };
                let key = record
                    .get(&table.primary_key)
                    .and_then(Value::from_json)
                    .and_then(|v| v.key_string());
                match key {
                    Some(key) => {
                        if out.contains_key(&key) {
                            return Err(malformed(format!(
                                "element {idx} repeats primary key {key}"
                            )));
                        }
                        out.insert(key, record);
                    }
                    None => warn!(
                        file = %path.display(),
                        element = idx,
                        "record without primary key {}", table.primary_key
                    ),
                }
            }
        }
        serde_json::Value::Object(map) => {
            for (key, row) in map {
                let serde_json::Value::Object(record) = row else {
                    return Err(malformed(format!("record {key} is not an object")));
                };
                out.insert(key, record);
            }
        }
        _ => {
            return Err(malformed(
                "expected an array of records or an object keyed by primary key".into(),
            ))
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

fn reported_bool(actual: &serde_json::Value) -> Option<bool> {
    match actual {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Null => Some(false),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(true),
            Some(x) if x == 0.0 => Some(false),
            _ => None,
        },
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn reported_int(actual: &serde_json::Value) -> Option<Option<i64>> {
    match actual {
        serde_json::Value::Null => Some(None),
        serde_json::Value::Number(n) => n.as_i64().map(Some).or_else(|| {
            n.as_f64()
                .filter(|x| x.fract() == 0.0 && x.abs() < 9.0e15)
                .map(|x| Some(x as i64))
        }),
        serde_json::Value::String(s) if s.trim().is_empty() => Some(None),
        serde_json::Value::String(s) => s.trim().parse().ok().map(Some),
        _ => None,
    }
}

fn reported_text(actual: &serde_json::Value) -> Option<String> {
    match actual {
        serde_json::Value::Null => Some(String::new()),
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Type-aware equality between an expected value and a reported JSON value.
///
/// Booleans compare by logical value (`"true"`, `1`, `"yes"` all mean true),
/// integers numerically, and strings with absent and `""` treated alike.
pub fn matches(expected: &Value, datatype: DataType, actual: &serde_json::Value) -> bool {
    match datatype {
        DataType::Boolean => {
            let want = matches!(expected, Value::Bool(true));
            reported_bool(actual) == Some(want)
        }
        DataType::Integer => {
            let want = match expected {
                Value::Int(i) => Some(*i),
                _ => None,
            };
            reported_int(actual) == Some(want)
        }
        DataType::String | DataType::Enumeration => {
            reported_text(actual).as_deref() == Some(expected.coerce_text().as_str())
        }
    }
}

fn infer_type(expected: &Value) -> DataType {
    match expected {
        Value::Bool(_) => DataType::Boolean,
        Value::Int(_) => DataType::Integer,
        _ => DataType::String,
    }
}

// ---------------------------------------------------------------------------
// Grades
// ---------------------------------------------------------------------------

/// Outcome for one (entity, record, field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Mismatch,
    /// Substrate produced no record with this key
    MissingRecord,
    /// Record present, field key absent
    MissingField,
    /// Field still carries the unset marker
    Unset,
    /// Fuzzy judge failed for this field
    JudgeError { reason: String },
    /// Field is not applicable to this record
    Excluded,
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Verdict::Pass | Verdict::Excluded)
    }
}

/// One graded field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGrade {
    pub entity: String,
    pub key: String,
    pub field: String,
    pub expected: Value,
    /// Reported value, when there was one
    pub actual: Option<serde_json::Value>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl FieldGrade {
    /// Human-readable actual value.
    pub fn actual_display(&self) -> String {
        match (&self.verdict, &self.actual) {
            (Verdict::MissingRecord | Verdict::MissingField, _) => "missing".to_string(),
            (Verdict::Unset, _) => "unset".to_string(),
            (Verdict::JudgeError { reason }, _) => format!("judge error: {reason}"),
            (_, Some(serde_json::Value::String(s))) => format!("{s:?}"),
            (_, Some(other)) => other.to_string(),
            (_, None) => "missing".to_string(),
        }
    }
}

/// Per-entity counts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityGrade {
    pub entity: String,
    pub records: usize,
    pub passed: u64,
    pub failed: u64,
    pub excluded: u64,
}

impl EntityGrade {
    pub fn total(&self) -> u64 {
        self.passed + self.failed
    }
}

/// Grading result for one substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSummary {
    pub substrate: String,
    pub mode: SubstrateMode,
    pub entities: Vec<EntityGrade>,
    pub fields: Vec<FieldGrade>,
    pub passed: u64,
    pub failed: u64,
    pub excluded: u64,
    pub total: u64,
    /// Substrate execution time
    pub elapsed_ms: u64,
    /// Time spent grading
    pub grading_ms: u64,
}

impl GradeSummary {
    pub fn with_mode(mut self, mode: SubstrateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn snapshot(&self) -> ScoreSnapshot {
        ScoreSnapshot::new(self.passed, self.failed, self.excluded)
    }

    /// Pass rate in percent; 100 when nothing was graded.
    pub fn score(&self) -> f64 {
        self.snapshot().percent()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FieldGrade> {
        self.fields.iter().filter(|f| f.verdict.is_failure())
    }

    pub fn write_json(&self, path: &Path) -> ConformResult<()> {
        write_json_atomic(path, self)
    }
}

/// Grade one substrate's output against the ground truth.
pub fn grade(substrate: &str, ground_truth: &GroundTruthSet, output: &SubstrateOutput) -> GradeSummary {
    let started = Instant::now();
    let mut fields = Vec::new();
    let mut entities = Vec::with_capacity(ground_truth.tables.len());

    for (name, table) in &ground_truth.tables {
        let mut entity_grade = EntityGrade {
            entity: name.clone(),
            records: table.records.len(),
            ..Default::default()
        };
        for record in &table.records {
            let Some(key) = record.get(&table.primary_key).and_then(Value::key_string) else {
                continue;
            };
            let reported = output.record(name, &key);
            for column in &table.computed_columns {
                let expected = record.get(column).cloned().unwrap_or(Value::Absent);
                let datatype = table
                    .column_types
                    .get(column)
                    .copied()
                    .unwrap_or_else(|| infer_type(&expected));
                let (verdict, actual) = if !table.is_applicable(&key, column) {
                    (Verdict::Excluded, reported.and_then(|r| r.get(column)).cloned())
                } else {
                    match reported {
                        None => (Verdict::MissingRecord, None),
                        Some(r) => judge_field(&expected, datatype, r.get(column)),
                    }
                };
                match &verdict {
                    Verdict::Pass => entity_grade.passed += 1,
                    Verdict::Excluded => entity_grade.excluded += 1,
                    _ => entity_grade.failed += 1,
                }
                fields.push(FieldGrade {
                    entity: name.clone(),
                    key: key.clone(),
                    field: column.clone(),
                    expected,
                    actual,
                    verdict,
                });
            }
        }
        entities.push(entity_grade);
    }

    let passed = entities.iter().map(|e| e.passed).sum();
    let failed = entities.iter().map(|e| e.failed).sum();
    let excluded = entities.iter().map(|e| e.excluded).sum();
    GradeSummary {
        substrate: substrate.to_string(),
        mode: SubstrateMode::Executable,
        entities,
        fields,
        passed,
        failed,
        excluded,
        total: passed + failed,
        elapsed_ms: 0,
        grading_ms: started.elapsed().as_millis() as u64,
    }
}

fn judge_field(
    expected: &Value,
    datatype: DataType,
    reported: Option<&serde_json::Value>,
) -> (Verdict, Option<serde_json::Value>) {
    match Reported::classify(reported) {
        Reported::Missing => (Verdict::MissingField, None),
        Reported::Unset => (Verdict::Unset, reported.cloned()),
        Reported::JudgeError(reason) => (Verdict::JudgeError { reason }, None),
        Reported::Json(actual) => {
            let verdict = if matches(expected, datatype, &actual) {
                Verdict::Pass
            } else {
                Verdict::Mismatch
            };
            (verdict, Some(actual))
        }
    }
}

/// Load and grade a substrate output directory.
///
/// `Ok(None)` when the directory holds no entity files.
pub fn grade_dir(
    substrate: &str,
    ground_truth: &GroundTruthSet,
    dir: &Path,
) -> Result<Option<GradeSummary>, GradeError> {
    Ok(SubstrateOutput::load_dir(dir, ground_truth)?
        .map(|output| grade(substrate, ground_truth, &output)))
}

/// Re-read a persisted grade file.
pub fn read_grade(path: &Path) -> ConformResult<GradeSummary> {
    crate::artifact::read_json(path)
}
