//! Blank test fixtures: ground truth with every calculated field reset to
//! the unset marker `{"$unset": true}`.
//!
//! The marker is deliberately not `null`: a substrate that never writes a
//! field must be distinguishable from one that computed an absent value.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::write_json_atomic;
use crate::error::ConformResult;
use crate::reference::GroundTruthSet;
use crate::value::{unset_marker, UNSET_KEY};

/// File name of the fixture metadata, skipped by substrates and graders.
pub const METADATA_FILE: &str = "_metadata.json";

/// Per-entity entry of `_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureMetadata {
    pub primary_key: String,
    pub computed_columns: Vec<String>,
    pub record_count: usize,
    /// Object key that marks an unset field
    pub unset_marker: String,
}

/// Blank records of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlankTable {
    pub metadata: FixtureMetadata,
    pub records: Vec<BTreeMap<String, serde_json::Value>>,
}

/// Raw inputs shared read-only by every substrate in a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlankFixture {
    pub tables: BTreeMap<String, BlankTable>,
}

impl BlankFixture {
    /// Write `<Entity>.json` per table plus `_metadata.json`.
    pub fn write_dir(&self, dir: &Path) -> ConformResult<()> {
        let mut metadata = BTreeMap::new();
        for (name, table) in &self.tables {
            write_json_atomic(&dir.join(format!("{name}.json")), &table.records)?;
            metadata.insert(name.clone(), table.metadata.clone());
        }
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)?;
        debug!(dir = %dir.display(), entities = self.tables.len(), "blank fixture written");
        Ok(())
    }
}

/// Derive the blank fixture from the ground truth.
pub fn blank(ground_truth: &GroundTruthSet) -> BlankFixture {
    let tables = ground_truth
        .tables
        .iter()
        .map(|(name, table)| {
            let records = table
                .records
                .iter()
                .map(|record| {
                    record
                        .iter()
                        .map(|(field, value)| {
                            let json = if table.computed_columns.contains(field) {
                                unset_marker()
                            } else {
                                value.to_json()
                            };
                            (field.clone(), json)
                        })
                        .collect()
                })
                .collect();
            let blank = BlankTable {
                metadata: FixtureMetadata {
                    primary_key: table.primary_key.clone(),
                    computed_columns: table.computed_columns.clone(),
                    record_count: table.records.len(),
                    unset_marker: UNSET_KEY.to_string(),
                },
                records,
            };
            (name.clone(), blank)
        })
        .collect();
    BlankFixture { tables }
}
