//! Fuzzy grading with a scripted judge.

use std::path::PathBuf;
use std::sync::Arc;

use conform_core::fuzzy::{
    read_transcript, Artifact, FuzzyGrader, JudgeConfig, JudgeError, ScriptedJudge, ScriptedReply,
    TranscriptWriter,
};
use conform_core::grade::{grade, Verdict};
use conform_core::{GroundTruthSet, ReferenceEvaluator, Rulebook};
use conform_state::SubstrateMode;

const ENTITY: &str = "LanguageCandidates";

fn load() -> (Rulebook, GroundTruthSet) {
    let path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/language_candidates.json");
    let rb = Rulebook::load(&path).unwrap();
    let gt = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
    (rb, gt)
}

fn artifact() -> Artifact {
    Artifact {
        name: "english-prose".into(),
        text: "A language is anything with syntax that must be parsed and cannot be held.".into(),
        files: vec![],
    }
}

fn prompt_value<'a>(prompt: &'a str, prefix: &str) -> &'a str {
    prompt
        .lines()
        .find_map(|l| l.strip_prefix(prefix))
        .unwrap_or_default()
        .trim()
}

/// Judge that answers from the ground truth, with a hook to misbehave.
fn oracle(
    gt: GroundTruthSet,
    misbehave: impl Fn(&str, &str) -> Option<ScriptedReply> + Send + Sync + 'static,
) -> ScriptedJudge {
    ScriptedJudge::new(move |prompt| {
        let field = prompt_value(prompt, "- name:").to_string();
        let header = prompt
            .lines()
            .find(|l| l.starts_with("## Record ("))
            .unwrap_or_default();
        let key = header
            .rsplit("key ")
            .next()
            .unwrap_or_default()
            .trim_end_matches(')')
            .to_string();
        if let Some(reply) = misbehave(&key, &field) {
            return reply;
        }
        let value = gt
            .table(ENTITY)
            .and_then(|t| t.record(&key))
            .and_then(|r| r.get(&field))
            .map(|v| v.to_json())
            .unwrap_or(serde_json::Value::Null);
        ScriptedReply::Text(format!("```json\n{{\"value\": {value}}}\n```"))
    })
}

fn config() -> JudgeConfig {
    JudgeConfig {
        timeout_secs: 5,
        max_retries: 1,
        ..JudgeConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn judge_timeout_fails_only_that_record() {
    let (rb, gt) = load();
    let judge = Arc::new(oracle(gt.clone(), |key, _| {
        (key == "python").then_some(ScriptedReply::Hang)
    }));
    let grader = FuzzyGrader::new("english", judge.clone(), &config());

    let answers = grader.answer(&artifact(), &rb, &gt).await.unwrap();
    let summary = grade("english", &gt, &answers.output).with_mode(SubstrateMode::Fuzzy);

    let failed: Vec<_> = summary.failures().collect();
    assert_eq!(failed.len(), 5, "{failed:#?}");
    for f in &failed {
        assert_eq!(f.key, "python");
        assert!(matches!(&f.verdict, Verdict::JudgeError { reason } if reason.contains("timed out")));
    }
    assert!(summary.passed > 0);
    assert_eq!(answers.stats.fields_failed, 5);
    // Each hanging field is tried twice, then given up.
    assert_eq!(
        answers.stats.attempts,
        answers.stats.fields_queried + answers.stats.fields_failed
    );
}

#[tokio::test]
async fn malformed_reply_is_retried_once() {
    let (rb, gt) = load();
    let judge = Arc::new(oracle(gt.clone(), |key, field| {
        (key == "english" && field == "Question")
            .then(|| ScriptedReply::Text("I am not sure.".into()))
    }));
    let grader = FuzzyGrader::new("english", judge.clone(), &config());

    let answers = grader.answer(&artifact(), &rb, &gt).await.unwrap();
    let summary = grade("english", &gt, &answers.output);
    let failed: Vec<_> = summary.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].field, "Question");
    assert!(failed[0].actual_display().starts_with("judge error:"));
    assert_eq!(judge.calls() as u64, answers.stats.attempts);
}

#[tokio::test]
async fn transcript_records_every_attempt() {
    let (rb, gt) = load();
    let judge = Arc::new(oracle(gt.clone(), |key, _| {
        (key == "rock").then(|| ScriptedReply::Fail(JudgeError::Http("503".into())))
    }));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transcripts/english.jsonl");
    let transcript = TranscriptWriter::create(&path).await.unwrap();
    let grader = FuzzyGrader::new("english", judge.clone(), &config()).with_transcript(transcript);

    let answers = grader.answer(&artifact(), &rb, &gt).await.unwrap();
    let entries = read_transcript(&path).unwrap();
    assert_eq!(entries.len() as u64, answers.stats.attempts);
    assert!(entries.iter().all(|e| e.judge == "scripted/test"));
    let rock: Vec<_> = entries.iter().filter(|e| e.key == "rock").collect();
    assert!(!rock.is_empty());
    assert!(rock.iter().all(|e| e.error.is_some() && e.value.is_none()));
    assert!(rock.iter().any(|e| e.attempt == 2));
}

#[tokio::test]
async fn judge_sees_raw_fields_only() {
    let (rb, gt) = load();
    let judge = Arc::new(ScriptedJudge::new(|prompt| {
        assert!(!prompt.contains("\"HasGrammar\""), "calculated value leaked into prompt");
        ScriptedReply::Text("{\"value\": null}".into())
    }));
    let grader = FuzzyGrader::new("english", judge, &config());
    grader.answer(&artifact(), &rb, &gt).await.unwrap();
}
