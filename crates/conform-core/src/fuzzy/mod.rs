//! Fuzzy grading: a language-model judge reads a non-executable artifact
//! (prose, diagrams, ontologies) and infers what each calculated field
//! should be for a record. The inferred values are then graded like any
//! other substrate output.
//!
//! Judge answers are advisory. Every query is rate limited, bounded by a
//! timeout, retried at most `max_retries` times, and written to a
//! transcript. A field whose query ultimately fails is recorded with the
//! `$judge_error` marker and graded as a failure; other fields and records
//! are unaffected.

mod error;
pub mod http;
pub mod judge;
pub mod transcript;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

pub use error::{JudgeError, JudgeResult};
pub use http::HttpJudge;
pub use judge::{Judge, ScriptedJudge, ScriptedReply};
pub use transcript::{read_transcript, TranscriptEntry, TranscriptWriter};

use crate::error::{ConformError, ConformResult};
use crate::grade::SubstrateOutput;
use crate::obs;
use crate::reference::GroundTruthSet;
use crate::rulebook::{DataType, Rulebook};
use crate::value::judge_error_marker;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Judge provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
        })
    }
}

/// `[judge]` section of the orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgeConfig {
    pub provider: Provider,
    /// Model name; provider default when unset
    pub model: Option<String>,
    /// Endpoint URL override
    pub endpoint: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-attempt time limit
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Minimum spacing between queries (milliseconds)
    pub min_interval_ms: u64,
    /// Environment variable holding the credential; provider default when unset
    pub api_key_env: Option<String>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: None,
            endpoint: None,
            temperature: 0.0,
            max_tokens: 1024,
            timeout_secs: 60,
            max_retries: 1,
            min_interval_ms: 0,
            api_key_env: None,
        }
    }
}

impl JudgeConfig {
    pub fn model_name(&self) -> String {
        self.model.clone().unwrap_or_else(|| {
            match self.provider {
                Provider::OpenAi => "gpt-4o",
                Provider::Anthropic => "claude-sonnet-4-20250514",
                Provider::Ollama => "llama3.2",
            }
            .to_string()
        })
    }

    pub fn endpoint_url(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            match self.provider {
                Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
                Provider::Anthropic => "https://api.anthropic.com/v1/messages",
                Provider::Ollama => "http://localhost:11434/api/generate",
            }
            .to_string()
        })
    }

    /// Credential variable name, `None` when the provider needs none.
    pub fn credential_var(&self) -> Option<String> {
        self.api_key_env.clone().or_else(|| match self.provider {
            Provider::OpenAi => Some("OPENAI_API_KEY".to_string()),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY".to_string()),
            Provider::Ollama => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The non-executable artifact a fuzzy substrate consists of.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub text: String,
    pub files: Vec<PathBuf>,
}

impl Artifact {
    /// Concatenate artifact files, each under a `=== name ===` header.
    pub fn load(name: &str, files: &[PathBuf]) -> ConformResult<Self> {
        let mut parts = Vec::with_capacity(files.len());
        for path in files {
            let content = std::fs::read_to_string(path).map_err(|e| ConformError::io(path, e))?;
            let label = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            parts.push(format!("=== {label} ===\n{content}"));
        }
        Ok(Self {
            name: name.to_string(),
            text: parts.join("\n\n"),
            files: files.to_vec(),
        })
    }
}

/// What the judge is told about the field it must infer.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub entity: String,
    pub name: String,
    pub datatype: DataType,
    pub description: Option<String>,
    pub values: Vec<String>,
}

/// A record as shown to the judge: primary key plus raw fields only.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub key: String,
    pub raw: serde_json::Map<String, serde_json::Value>,
}

pub fn build_prompt(artifact: &Artifact, record: &RecordView, field: &FieldSpec) -> String {
    let record_json = serde_json::to_string_pretty(&record.raw).unwrap_or_default();
    let mut type_line = format!("- type: {}", field.datatype);
    if !field.values.is_empty() {
        type_line.push_str(&format!(" (one of: {})", field.values.join(", ")));
    }
    let description = field
        .description
        .as_deref()
        .map(|d| format!("- description: {d}\n"))
        .unwrap_or_default();

    format!(
        "You are checking what a written rule set implies about a derived field.\n\n\
         ## Artifact: {artifact_name}\n\n{artifact_text}\n\n\
         ## Record ({entity}, key {key})\n\n```json\n{record_json}\n```\n\n\
         ## Field to infer\n\n- name: {field_name}\n{type_line}\n{description}\n\
         Using only the artifact above, decide what value `{field_name}` should have for this record.\n\
         Respond with only a JSON object of the form {{\"value\": <{datatype}>}} and no other text.\n",
        artifact_name = artifact.name,
        artifact_text = artifact.text,
        entity = field.entity,
        key = record.key,
        field_name = field.name,
        datatype = field.datatype,
    )
}

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("fenced block pattern")
});

static FLAT_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("flat object pattern"));

/// First `max` characters of `text`, never splitting a code point.
pub(crate) fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Extract `value` from a judge reply: fenced code block first, then the
/// whole text, then the first flat `{...}` object found.
pub fn extract_value(response: &str) -> JudgeResult<serde_json::Value> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(body) = FENCED.captures(response).and_then(|c| c.get(1)) {
        candidates.push(body.as_str());
    }
    candidates.push(response.trim());
    if let Some(m) = FLAT_OBJECT.find(response) {
        candidates.push(m.as_str());
    }

    for candidate in candidates {
        if let Ok(serde_json::Value::Object(mut map)) = serde_json::from_str(candidate) {
            if let Some(value) = map.remove("value") {
                return Ok(value);
            }
        }
    }
    Err(JudgeError::MalformedResponse(format!(
        "no {{\"value\": ...}} object in: {}",
        clip(response, 200)
    )))
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Enforces a minimum interval between judge queries.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: Mutex::new(None),
        }
    }

    /// Wait until a query may be sent, then reserve the next slot.
    pub async fn acquire(&self) {
        let mut next = self.next_allowed.lock().await;
        if let Some(at) = *next {
            if Instant::now() < at {
                tokio::time::sleep_until(at).await;
            }
        }
        *next = Some(Instant::now() + self.min_interval);
    }
}

// ---------------------------------------------------------------------------
// FuzzyGrader
// ---------------------------------------------------------------------------

/// Query statistics for one fuzzy substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JudgeStats {
    pub fields_queried: u64,
    pub fields_failed: u64,
    pub attempts: u64,
}

/// Judge answers assembled as substrate output.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyAnswers {
    pub output: SubstrateOutput,
    pub stats: JudgeStats,
}

/// Infers calculated values for one fuzzy substrate.
pub struct FuzzyGrader {
    substrate: String,
    judge: Arc<dyn Judge>,
    timeout: Duration,
    max_retries: u32,
    limiter: RateLimiter,
    transcript: Option<TranscriptWriter>,
}

impl FuzzyGrader {
    pub fn new(substrate: &str, judge: Arc<dyn Judge>, config: &JudgeConfig) -> Self {
        Self {
            substrate: substrate.to_string(),
            judge,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            max_retries: config.max_retries,
            limiter: RateLimiter::new(Duration::from_millis(config.min_interval_ms)),
            transcript: None,
        }
    }

    pub fn with_transcript(mut self, transcript: TranscriptWriter) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        self.transcript.as_ref().map(|t| t.path())
    }

    /// Ask the judge for one field's value, with timeout and bounded retry.
    pub async fn infer(
        &self,
        artifact: &Artifact,
        record: &RecordView,
        field: &FieldSpec,
    ) -> JudgeResult<serde_json::Value> {
        self.infer_counted(artifact, record, field).await.0
    }

    async fn infer_counted(
        &self,
        artifact: &Artifact,
        record: &RecordView,
        field: &FieldSpec,
    ) -> (JudgeResult<serde_json::Value>, u32) {
        let prompt = build_prompt(artifact, record, field);
        let max_attempts = self.max_retries + 1;
        let mut last_error = JudgeError::Unavailable("no attempt made".into());

        for attempt in 1..=max_attempts {
            self.limiter.acquire().await;
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, self.judge.complete(&prompt)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (response, result) = match outcome {
                Ok(Ok(text)) => {
                    let parsed = extract_value(&text);
                    (Some(text), parsed)
                }
                Ok(Err(err)) => (None, Err(err)),
                Err(_elapsed) => (
                    None,
                    Err(JudgeError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    }),
                ),
            };

            obs::emit_judge_queried(
                &self.substrate,
                &field.entity,
                &record.key,
                &field.name,
                attempt,
                result.is_ok(),
            );
            self.record(TranscriptEntry {
                timestamp: Utc::now(),
                substrate: self.substrate.clone(),
                judge: self.judge.describe(),
                entity: field.entity.clone(),
                key: record.key.clone(),
                field: field.name.clone(),
                attempt,
                prompt: prompt.clone(),
                response,
                value: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(|e| e.to_string()),
                elapsed_ms,
            })
            .await;

            match result {
                Ok(value) => return (Ok(value), attempt),
                Err(err) => last_error = err,
            }
        }
        (Err(last_error), max_attempts)
    }

    async fn record(&self, entry: TranscriptEntry) {
        if let Some(transcript) = &self.transcript {
            if let Err(e) = transcript.append(&entry).await {
                warn!(substrate = %self.substrate, error = %e, "failed to append judge transcript");
            }
        }
    }

    /// Infer every applicable calculated field of every record.
    ///
    /// Judge failures become `$judge_error` markers in the returned output;
    /// this never fails because of the judge.
    pub async fn answer(
        &self,
        artifact: &Artifact,
        rulebook: &Rulebook,
        ground_truth: &GroundTruthSet,
    ) -> ConformResult<FuzzyAnswers> {
        let mut output = SubstrateOutput::new();
        let mut stats = JudgeStats::default();

        for (name, table) in &ground_truth.tables {
            let entity = rulebook.entity(name)?;
            let raw_names: Vec<&str> = entity.raw_fields().map(|f| f.name.as_str()).collect();

            for record in &table.records {
                let Some(key) = entity.key_of(record) else {
                    continue;
                };
                let raw: serde_json::Map<String, serde_json::Value> = record
                    .iter()
                    .filter(|(k, _)| raw_names.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                let view = RecordView {
                    key: key.clone(),
                    raw: raw.clone(),
                };

                let mut answered = raw;
                for column in &table.computed_columns {
                    if !table.is_applicable(&key, column) {
                        continue;
                    }
                    let Some(def) = entity.field(column) else {
                        continue;
                    };
                    let spec = FieldSpec {
                        entity: name.clone(),
                        name: column.clone(),
                        datatype: def.datatype,
                        description: def.description.clone(),
                        values: def.values.clone(),
                    };
                    stats.fields_queried += 1;
                    let (result, attempts) = self.infer_counted(artifact, &view, &spec).await;
                    stats.attempts += u64::from(attempts);
                    let value = match result {
                        Ok(value) => value,
                        Err(err) => {
                            stats.fields_failed += 1;
                            judge_error_marker(&err.to_string())
                        }
                    };
                    answered.insert(column.clone(), value);
                }
                output.insert(name, &key, answered);
            }
        }
        Ok(FuzzyAnswers { output, stats })
    }
}
