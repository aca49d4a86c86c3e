//! Dependency levels for calculated fields.
//!
//! Levels are assigned by iterative relaxation over the calculated-field
//! graph: a field's level is one more than the highest level among its
//! calculated dependencies, or 1 when it depends only on raw fields. An
//! acyclic graph converges within `|fields|` passes; failure to converge
//! means a cycle, which is then located by depth-first search so the error
//! can name it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{ConformError, ConformResult};
use crate::rulebook::{Entity, FieldDefinition};

/// A calculated field with its assigned level.
#[derive(Debug, Clone, Serialize)]
pub struct LeveledField<'a> {
    pub level: u32,
    pub field: &'a FieldDefinition,
    /// Calculated fields this one reads
    pub calculated_deps: Vec<String>,
}

/// Level-ordered calculated fields of one entity.
#[derive(Debug, Clone, Serialize)]
pub struct LevelPlan<'a> {
    pub entity: String,
    /// Sorted by level, then by name within a level
    pub fields: Vec<LeveledField<'a>>,
}

impl<'a> LevelPlan<'a> {
    pub fn max_level(&self) -> u32 {
        self.fields.iter().map(|f| f.level).max().unwrap_or(0)
    }

    pub fn level_of(&self, name: &str) -> Option<u32> {
        self.fields
            .iter()
            .find(|f| f.field.name == name)
            .map(|f| f.level)
    }

    /// Fields grouped by level, ascending.
    pub fn by_level(&self) -> BTreeMap<u32, Vec<&'a FieldDefinition>> {
        let mut out: BTreeMap<u32, Vec<&'a FieldDefinition>> = BTreeMap::new();
        for f in &self.fields {
            out.entry(f.level).or_default().push(f.field);
        }
        out
    }
}

/// Assign dependency levels to an entity's calculated fields.
pub fn resolve(entity: &Entity) -> ConformResult<LevelPlan<'_>> {
    let calculated: BTreeMap<&str, &FieldDefinition> = entity
        .calculated_fields()
        .map(|f| (f.name.as_str(), f))
        .collect();

    let deps: BTreeMap<&str, Vec<&str>> = calculated
        .iter()
        .map(|(name, field)| {
            let refs = field
                .formula()
                .map(|f| f.references.as_slice())
                .unwrap_or_default();
            let calc_refs = refs
                .iter()
                .map(String::as_str)
                .filter(|r| calculated.contains_key(r))
                .collect();
            (*name, calc_refs)
        })
        .collect();

    let mut levels: BTreeMap<&str, u32> = calculated.keys().map(|n| (*n, 1)).collect();
    let mut converged = false;
    for _ in 0..=calculated.len() {
        let mut changed = false;
        for (name, field_deps) in &deps {
            let level = 1 + field_deps
                .iter()
                .map(|d| levels.get(d).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            if levels.get(name) != Some(&level) {
                levels.insert(*name, level);
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(ConformError::CyclicFormula {
            entity: entity.name.clone(),
            fields: find_cycle(&deps),
        });
    }

    let mut fields: Vec<LeveledField<'_>> = calculated
        .iter()
        .map(|(name, field)| LeveledField {
            level: levels.get(name).copied().unwrap_or(1),
            field: *field,
            calculated_deps: deps
                .get(name)
                .map(|d| d.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        })
        .collect();
    fields.sort_by(|a, b| {
        a.level
            .cmp(&b.level)
            .then_with(|| a.field.name.cmp(&b.field.name))
    });

    Ok(LevelPlan {
        entity: entity.name.clone(),
        fields,
    })
}

/// Return one cycle as a closed path (`A -> B -> A`). Falls back to the set
/// of non-converging fields if no back edge is found.
fn find_cycle(deps: &BTreeMap<&str, Vec<&str>>) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        deps: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for next in deps.get(node).map(Vec::as_slice).unwrap_or_default() {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(*next, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for node in deps.keys() {
        if marks.contains_key(node) {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(cycle) = visit(*node, deps, &mut marks, &mut stack) {
            return cycle;
        }
    }
    let involved: BTreeSet<String> = deps
        .iter()
        .filter(|(_, d)| !d.is_empty())
        .map(|(n, _)| n.to_string())
        .collect();
    involved.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rulebook::Rulebook;
    use serde_json::json;

    fn entity(calcs: &[(&str, &str)]) -> Entity {
        let mut schema = vec![
            json!({"name": "Id", "datatype": "string"}),
            json!({"name": "Raw", "datatype": "integer"}),
        ];
        for (name, formula) in calcs {
            schema.push(json!({
                "name": name, "datatype": "integer", "type": "calculated", "formula": formula
            }));
        }
        let doc = json!({"E": {"primary_key": "Id", "schema": schema}});
        Rulebook::from_json_str(&doc.to_string())
            .unwrap()
            .entities
            .remove(0)
    }

    #[test]
    fn raw_only_fields_are_level_one() {
        let e = entity(&[("A", "={{Raw}} + 1"), ("B", "=2")]);
        let plan = resolve(&e).unwrap();
        assert_eq!(plan.level_of("A"), Some(1));
        assert_eq!(plan.level_of("B"), Some(1));
        assert_eq!(plan.max_level(), 1);
    }

    #[test]
    fn chain_levels_increase() {
        let e = entity(&[
            ("C", "={{B}} + {{A}}"),
            ("B", "={{A}} * 2"),
            ("A", "={{Raw}}"),
        ]);
        let plan = resolve(&e).unwrap();
        let order: Vec<&str> = plan.fields.iter().map(|f| f.field.name.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(plan.level_of("C"), Some(3));
        assert_eq!(plan.by_level().len(), 3);
    }

    #[test]
    fn two_cycle_is_named() {
        let e = entity(&[("A", "={{B}}"), ("B", "={{A}}"), ("C", "={{Raw}}")]);
        match resolve(&e) {
            Err(ConformError::CyclicFormula { entity, fields }) => {
                assert_eq!(entity, "E");
                assert_eq!(fields, vec!["A", "B", "A"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let e = entity(&[("A", "={{A}} + 1")]);
        match resolve(&e) {
            Err(ConformError::CyclicFormula { fields, .. }) => {
                assert_eq!(fields, vec!["A", "A"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
