//! Conform-Core: rulebook model, reference evaluation and grading
//!
//! Turns a rulebook into a ground-truth answer set, derives the blank
//! fixture every substrate starts from, and grades substrate output field
//! by field. Fuzzy substrates are answered by a language-model judge and
//! graded the same way.
//!
//! ## Layer 1 - Domain
//!
//! ## Pipeline
//!
//! `Rulebook` -> `resolver::resolve` -> `ReferenceEvaluator` -> `GroundTruthSet`
//! -> `fixture::blank` -> (substrate) -> `grade::grade` -> `report`

pub mod absence;
pub mod artifact;
mod error;
pub mod fixture;
pub mod formula;
pub mod fuzzy;
pub mod grade;
pub mod obs;
pub mod reference;
pub mod report;
pub mod resolver;
pub mod rulebook;
pub mod telemetry;
pub mod value;

pub use error::{ConformError, ConformResult, FormulaError, GradeError};

pub use rulebook::{DataType, Entity, FieldDefinition, FieldKind, FormulaSource, Rulebook};

pub use resolver::{resolve, LevelPlan, LeveledField};

pub use reference::{EntityTable, GroundTruthSet, ReferenceEvaluator};

pub use fixture::{blank, BlankFixture, FixtureMetadata, METADATA_FILE};

pub use grade::{grade, grade_dir, FieldGrade, GradeSummary, SubstrateOutput, Verdict};

pub use fuzzy::{
    Artifact, FieldSpec, FuzzyAnswers, FuzzyGrader, HttpJudge, Judge, JudgeConfig, JudgeError,
    Provider,
};

pub use report::{ReportStatus, RunReport, SubstrateReport};

pub use artifact::{RunLayout, RunManifest};

pub use value::{Record, Value};
