//! End-to-end scenarios over the language-candidates rulebook.

use std::path::PathBuf;

use conform_core::grade::{grade, SubstrateOutput, Verdict};
use conform_core::value::Value;
use conform_core::{blank, resolve, GroundTruthSet, ReferenceEvaluator, Rulebook};
use serde_json::json;

const ENTITY: &str = "LanguageCandidates";

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/language_candidates.json")
}

fn rulebook() -> Rulebook {
    Rulebook::load(&fixture_path()).expect("load rulebook")
}

fn ground_truth() -> GroundTruthSet {
    ReferenceEvaluator::new(&rulebook())
        .expect("build evaluator")
        .evaluate()
        .expect("evaluate")
}

/// Output that reports every calculated value exactly as the ground truth has it.
fn perfect_output(gt: &GroundTruthSet) -> SubstrateOutput {
    let mut output = SubstrateOutput::new();
    for (name, table) in &gt.tables {
        for record in &table.records {
            let key = record[&table.primary_key].key_string().expect("key");
            let json = record
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            output.insert(name, &key, json);
        }
    }
    output
}

#[test]
fn english_record_ground_truth() {
    let gt = ground_truth();
    let english = gt.table(ENTITY).unwrap().record("english").unwrap();
    assert_eq!(english["HasGrammar"], Value::Bool(true));
    assert_eq!(english["Question"], Value::text("Is English a language?"));
    assert_eq!(english["PredictedAnswer"], Value::Bool(true));
    assert_eq!(english["IsLanguage"], Value::Bool(true));
    assert_eq!(english["GrammarNote"], Value::text("english has grammar"));
}

#[test]
fn absent_raw_boolean_reads_as_false() {
    let gt = ground_truth();
    let rock = gt.table(ENTITY).unwrap().record("rock").unwrap();
    assert_eq!(rock["HasSyntax"], Value::Absent);
    assert_eq!(rock["HasGrammar"], Value::Bool(false));
    assert_eq!(rock["PredictedAnswer"], Value::Bool(false));
}

#[test]
fn dependency_levels_follow_formula_references() {
    let rb = rulebook();
    let plan = resolve(rb.entity(ENTITY).unwrap()).unwrap();
    assert_eq!(plan.level_of("HasGrammar"), Some(1));
    assert_eq!(plan.level_of("Question"), Some(1));
    assert_eq!(plan.level_of("PredictedAnswer"), Some(1));
    assert_eq!(plan.level_of("IsLanguage"), Some(2));
    assert_eq!(plan.level_of("GrammarNote"), Some(3));
    assert_eq!(plan.max_level(), 3);
}

#[test]
fn omitted_question_is_exactly_one_failure() {
    let gt = ground_truth();
    let mut output = perfect_output(&gt);
    output
        .entities
        .get_mut(ENTITY)
        .and_then(|records| records.get_mut("english"))
        .unwrap()
        .remove("Question");

    let summary = grade("python", &gt, &output);
    let failures: Vec<_> = summary.failures().collect();
    assert_eq!(failures.len(), 1, "{failures:#?}");
    let f = failures[0];
    assert_eq!(f.key, "english");
    assert_eq!(f.field, "Question");
    assert_eq!(f.expected, Value::text("Is English a language?"));
    assert_eq!(f.verdict, Verdict::MissingField);
    assert_eq!(f.actual_display(), "missing");
}

#[test]
fn missing_record_fails_every_applicable_field() {
    let gt = ground_truth();
    let mut output = perfect_output(&gt);
    output.entities.get_mut(ENTITY).unwrap().remove("python");

    let summary = grade("python", &gt, &output);
    let failed: Vec<_> = summary.failures().map(|f| f.field.as_str()).collect();
    assert_eq!(
        failed.len(),
        5,
        "every calculated field of the record fails: {failed:?}"
    );
    assert!(summary.failures().all(|f| f.verdict == Verdict::MissingRecord));
}

#[test]
fn not_applicable_fields_are_excluded_not_failed() {
    let gt = ground_truth();
    let mut output = perfect_output(&gt);
    output
        .entities
        .get_mut(ENTITY)
        .and_then(|records| records.get_mut("rock"))
        .unwrap()
        .insert("GrammarNote".into(), json!("nonsense"));

    let summary = grade("python", &gt, &output);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.excluded, 1);
    assert_eq!(summary.score(), 100.0);
}

#[test]
fn boolean_as_string_is_not_a_false_failure() {
    let gt = ground_truth();
    let mut output = perfect_output(&gt);
    let english = output
        .entities
        .get_mut(ENTITY)
        .and_then(|records| records.get_mut("english"))
        .unwrap();
    english.insert("HasGrammar".into(), json!("true"));
    english.insert("PredictedAnswer".into(), json!("TRUE"));
    english.insert("IsLanguage".into(), json!(1));

    let summary = grade("python", &gt, &output);
    assert_eq!(summary.failed, 0);
}

#[test]
fn blank_then_rederive_scores_full_marks() {
    let rb = rulebook();
    let evaluator = ReferenceEvaluator::new(&rb).unwrap();
    let gt = evaluator.evaluate().unwrap();

    let dir = tempfile::tempdir().unwrap();
    blank(&gt).write_dir(dir.path()).unwrap();

    // Play the substrate: read the blank file, keep raw values, recompute.
    let text = std::fs::read_to_string(dir.path().join(format!("{ENTITY}.json"))).unwrap();
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&text).unwrap();
    let raw: Vec<conform_core::Record> = rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
                .collect()
        })
        .collect();
    let derived = evaluator.evaluate_records(ENTITY, &raw).unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let json_rows: Vec<serde_json::Value> = derived
        .iter()
        .map(|r| json!(r.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<serde_json::Map<_, _>>()))
        .collect();
    std::fs::write(
        out_dir.path().join(format!("{ENTITY}.json")),
        serde_json::to_string_pretty(&json_rows).unwrap(),
    )
    .unwrap();

    let summary = conform_core::grade_dir("roundtrip", &gt, out_dir.path())
        .unwrap()
        .expect("output present");
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.score(), 100.0);
    assert!(summary.passed > 0);
}

#[test]
fn untouched_blank_fixture_scores_unset() {
    let gt = ground_truth();
    let dir = tempfile::tempdir().unwrap();
    blank(&gt).write_dir(dir.path()).unwrap();

    let summary = conform_core::grade_dir("lazy", &gt, dir.path())
        .unwrap()
        .expect("output present");
    assert_eq!(summary.passed, 0);
    assert!(summary.failures().all(|f| f.verdict == Verdict::Unset));
}

#[test]
fn evaluation_is_bit_identical() {
    let rb = rulebook();
    let first = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
    let second = ReferenceEvaluator::new(&rb).unwrap().evaluate().unwrap();
    assert_eq!(first.digest().unwrap(), second.digest().unwrap());

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    first.write_dir(a.path()).unwrap();
    second.write_dir(b.path()).unwrap();
    let file = format!("{ENTITY}.json");
    assert_eq!(
        std::fs::read(a.path().join(&file)).unwrap(),
        std::fs::read(b.path().join(&file)).unwrap()
    );
}
