pub mod makefile;

use std::collections::{BTreeMap, BTreeSet};

use crate::document::BuildStage;
use crate::error::{Error, Result};

/// Orders stages for the linear build chain.
///
/// Without `after` constraints this is document order. With them, the result
/// is a topological order that always picks the lowest document index among
/// the ready stages, so unconstrained stages keep their relative position.
pub fn order_stages(stages: Vec<BuildStage>) -> Result<Vec<BuildStage>> {
    if stages.iter().all(|s| s.after.is_empty()) {
        return Ok(stages);
    }

    let index: BTreeMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut incoming = vec![0usize; stages.len()];
    let mut outgoing: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for dep in &stage.after {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(Error::unresolved(format!(
                    "stage '{}' is ordered after unknown stage '{}'",
                    stage.name, dep
                )));
            };
            if d == i {
                return Err(Error::msg(format!(
                    "stage '{}' is ordered after itself",
                    stage.name
                )));
            }
            if outgoing[d].insert(i) {
                incoming[i] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = incoming
        .iter()
        .enumerate()
        .filter_map(|(i, n)| (*n == 0).then_some(i))
        .collect();
    let mut order: Vec<usize> = Vec::with_capacity(stages.len());

    while let Some(n) = ready.pop_first() {
        order.push(n);
        for &m in &outgoing[n] {
            incoming[m] -= 1;
            if incoming[m] == 0 {
                ready.insert(m);
            }
        }
    }

    if order.len() != stages.len() {
        let remaining: Vec<&str> = incoming
            .iter()
            .enumerate()
            .filter_map(|(i, n)| (*n > 0).then_some(stages[i].name.as_str()))
            .collect();
        return Err(Error::msg(format!(
            "stage ordering contains a cycle; remaining stages: {}",
            remaining.join(", ")
        )));
    }

    let mut slots: Vec<Option<BuildStage>> = stages.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ArtifactKind, ArtifactRef, Command};
    use crate::error::ErrorKind;

    fn stage(name: &str, after: &[&str]) -> BuildStage {
        BuildStage {
            name: name.into(),
            artifact: ArtifactRef {
                kind: ArtifactKind::Package,
                name: name.to_lowercase(),
                version: None,
                url: format!("https://example.org/{}.tar.xz", name.to_lowercase()),
                file: format!("{}.tar.xz", name.to_lowercase()),
                checksum: "0".repeat(32),
                revision: None,
            },
            commands: vec![Command::ordinary("make")],
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn names(stages: &[BuildStage]) -> Vec<&str> {
        stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn unconstrained_stages_keep_document_order() {
        let out = order_stages(vec![stage("C", &[]), stage("A", &[]), stage("B", &[])])
            .expect("order");
        assert_eq!(names(&out), ["C", "A", "B"]);
    }

    #[test]
    fn after_constraints_move_only_what_they_must() {
        let out = order_stages(vec![
            stage("Gcc", &["Binutils"]),
            stage("Zlib", &[]),
            stage("Binutils", &[]),
            stage("Glibc", &["Gcc"]),
        ])
        .expect("order");
        assert_eq!(names(&out), ["Zlib", "Binutils", "Gcc", "Glibc"]);
    }

    #[test]
    fn cycles_are_configuration_errors() {
        let err = order_stages(vec![stage("A", &["B"]), stage("B", &["A"]), stage("C", &[])])
            .expect_err("cycle");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("A, B"));
    }

    #[test]
    fn unknown_after_is_unresolved() {
        let err = order_stages(vec![stage("A", &["Nope"])]).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);
    }
}
