use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::planner::makefile::{BuildNode, Manifest};
use crate::workspace::Layout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: String,
    pub identity: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub stages: Vec<StageStatus>,
}

impl StatusReport {
    /// First stage without a sentinel; where the runner picks up.
    pub fn resume_point(&self) -> Option<&StageStatus> {
        self.stages.iter().find(|s| !s.done)
    }

    pub fn completed(&self) -> usize {
        self.stages.iter().filter(|s| s.done).count()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.stages {
            let mark = if s.done { "done" } else { "pending" };
            writeln!(f, "{mark:<8} {} ({})", s.stage, s.identity)?;
        }
        match self.resume_point() {
            Some(next) => write!(
                f,
                "{}/{} stages complete; next: {}",
                self.completed(),
                self.stages.len(),
                next.stage
            ),
            None => write!(f, "{} stages complete", self.stages.len()),
        }
    }
}

fn sentinel_names(layout: &Layout) -> Result<BTreeSet<OsString>> {
    let mut out = BTreeSet::new();
    if !layout.flags.is_dir() {
        return Ok(out);
    }
    for entry in WalkDir::new(&layout.flags).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::io(format!("failed to list flags: {e}")))?;
        if entry.file_type().is_file() {
            out.insert(entry.file_name().to_os_string());
        }
    }
    Ok(out)
}

fn is_done(node: &BuildNode, present: &BTreeSet<OsString>) -> bool {
    node.sentinel
        .file_name()
        .is_some_and(|n| present.contains(n))
}

pub fn load_manifest(layout: &Layout) -> Result<Manifest> {
    let path = layout.manifest_file();
    let raw = std::fs::read(&path).map_err(|e| {
        Error::io(format!(
            "failed to read {} (run `plan` first): {e}",
            path.display()
        ))
    })?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::msg(format!("invalid plan manifest {}: {e}", path.display())))
}

pub fn status(layout: &Layout) -> Result<StatusReport> {
    let manifest = load_manifest(layout)?;
    let present = sentinel_names(layout)?;
    Ok(StatusReport {
        stages: manifest
            .nodes
            .iter()
            .map(|n| StageStatus {
                stage: n.stage.clone(),
                identity: n.identity.clone(),
                done: is_done(n, &present),
            })
            .collect(),
    })
}
