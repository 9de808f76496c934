//! Validated in-memory form of a build book.
//!
//! A book is loaded once from its adapter shape ([`RawDocument`]) and checked
//! up front: checksums are well formed, every stage resolves to a registered
//! package, and ordering constraints name real stages. Everything downstream
//! works on the checked [`Document`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::checksum::Algorithm;
use crate::error::{Error, Result};

pub mod rewrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Package,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub name: String,
    pub version: Option<String>,
    pub url: String,
    /// Basename of `url`; the artifact's file name in the sources directory.
    pub file: String,
    pub checksum: String,
    /// Variant tag (e.g. `systemd`, `sysv`); `None` is the canonical variant.
    pub revision: Option<String>,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ArtifactKind::Package => "package",
            ArtifactKind::Patch => "patch",
        };
        write!(f, "{kind} '{}'", self.name)?;
        if let Some(v) = &self.version {
            write!(f, " ({v})")?;
        }
        write!(f, " at {}", self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Ordinary,
    Remapped(String),
    Test,
}

impl CommandKind {
    pub fn from_remap(remap: Option<&str>) -> Self {
        match remap.map(str::trim).filter(|s| !s.is_empty()) {
            None => CommandKind::Ordinary,
            Some("test") => CommandKind::Test,
            Some(other) => CommandKind::Remapped(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn ordinary(text: impl Into<String>) -> Self {
        Self::new(text, CommandKind::Ordinary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    pub name: String,
    pub artifact: ArtifactRef,
    pub commands: Vec<Command>,
    /// Names of stages that must come earlier in the chain.
    pub after: Vec<String>,
}

// Adapter shape. Any front end (XML book parser, TOML file, tests) produces this.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDocument {
    pub version: String,
    pub packages: Vec<RawArtifact>,
    pub patches: Vec<RawArtifact>,
    pub stages: Vec<RawStage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawArtifact {
    pub name: String,
    pub version: Option<String>,
    pub url: String,
    #[serde(alias = "md5")]
    pub checksum: String,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawStage {
    pub name: String,
    /// Source URL; must match a package URL.
    pub source: String,
    pub commands: Vec<RawCommand>,
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCommand {
    pub text: String,
    pub remap: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub version: String,
    pub packages: Vec<ArtifactRef>,
    pub patches: Vec<ArtifactRef>,
    stages: Vec<BuildStage>,
    commands_rewritten: bool,
}

pub fn url_basename(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let base = path.rsplit('/').next()?.trim();
    (!base.is_empty() && base != "." && base != "..").then_some(base)
}

fn build_artifact(kind: ArtifactKind, raw: &RawArtifact, algorithm: Algorithm) -> Result<ArtifactRef> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err(Error::msg(format!("artifact at '{}' has no name", raw.url)));
    }
    let url = raw.url.trim();
    let Some(file) = url_basename(url) else {
        return Err(Error::msg(format!(
            "artifact '{}' has no file name in url '{}'",
            name, raw.url
        )));
    };
    let checksum = algorithm
        .validate_hex(&raw.checksum)
        .map_err(|e| Error::msg(format!("artifact '{}': {e}", name)))?;
    Ok(ArtifactRef {
        kind,
        name: name.to_string(),
        version: raw
            .version
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned),
        url: url.to_string(),
        file: file.to_string(),
        checksum,
        revision: raw
            .revision
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned),
    })
}

impl Document {
    pub fn from_raw(raw: RawDocument, algorithm: Algorithm) -> Result<Self> {
        let mut packages = Vec::with_capacity(raw.packages.len());
        let mut patches = Vec::with_capacity(raw.patches.len());
        let mut files: BTreeMap<String, String> = BTreeMap::new();

        for (kind, list, out) in [
            (ArtifactKind::Package, &raw.packages, &mut packages),
            (ArtifactKind::Patch, &raw.patches, &mut patches),
        ] {
            for entry in list {
                let a = build_artifact(kind, entry, algorithm)?;
                // Variants of one package may share a file only when they share the URL.
                if let Some(existing) = files.get(&a.file)
                    && existing != &a.url
                {
                    return Err(Error::msg(format!(
                        "file name '{}' is used by both '{}' and '{}'",
                        a.file, existing, a.url
                    )));
                }
                files.insert(a.file.clone(), a.url.clone());
                out.push(a);
            }
        }

        let mut doc = Self {
            version: raw.version.trim().to_string(),
            packages,
            patches,
            stages: Vec::with_capacity(raw.stages.len()),
            commands_rewritten: false,
        };

        let mut names = BTreeSet::new();
        for s in &raw.stages {
            let name = s.name.trim();
            if name.is_empty() {
                return Err(Error::msg(format!("stage for '{}' has no name", s.source)));
            }
            if !names.insert(name.to_string()) {
                return Err(Error::msg(format!("duplicate stage name '{}'", name)));
            }
            let artifact = doc
                .find_package_by_url(s.source.trim())
                .cloned()
                .ok_or_else(|| {
                    Error::unresolved(format!(
                        "stage '{}' uses unregistered package '{}'",
                        name, s.source
                    ))
                })?;
            let commands = s
                .commands
                .iter()
                .map(|c| Command::new(c.text.clone(), CommandKind::from_remap(c.remap.as_deref())))
                .collect();
            doc.stages.push(BuildStage {
                name: name.to_string(),
                artifact,
                commands,
                after: s
                    .after
                    .iter()
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect(),
            });
        }

        for stage in &doc.stages {
            for dep in &stage.after {
                if !names.contains(dep) {
                    return Err(Error::msg(format!(
                        "stage '{}' must come after unknown stage '{}'",
                        stage.name, dep
                    )));
                }
            }
        }

        debug!(
            packages = doc.packages.len(),
            patches = doc.patches.len(),
            stages = doc.stages.len(),
            "document loaded"
        );
        Ok(doc)
    }

    /// Finds the first package with exactly this URL.
    ///
    /// When several revisions share a URL, the first listed wins; call
    /// [`Document::select_revision`] first to get the intended variant.
    pub fn find_package_by_url(&self, url: &str) -> Option<&ArtifactRef> {
        self.packages.iter().find(|p| p.url == url)
    }

    pub fn stages(&self) -> &[BuildStage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<BuildStage> {
        self.stages
    }

    /// All artifacts that must be present locally, packages first.
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.packages.iter().chain(self.patches.iter())
    }

    /// Keeps the canonical artifacts plus those tagged with `revision`.
    /// Stages bound to a dropped package are dropped with it.
    pub fn select_revision(&mut self, revision: Option<&str>) {
        let keep = |a: &ArtifactRef| match (&a.revision, revision) {
            (None, _) => true,
            (Some(r), Some(want)) => r == want,
            (Some(_), None) => false,
        };
        self.packages.retain(|a| keep(a));
        self.patches.retain(|a| keep(a));

        let kept = &self.packages;
        self.stages
            .retain(|s| kept.iter().any(|p| p.url == s.artifact.url));

        // A stage resolved to a dropped variant of a shared URL is re-pointed.
        for stage in &mut self.stages {
            if let Some(p) = kept.iter().find(|p| p.url == stage.artifact.url) {
                stage.artifact = p.clone();
            }
        }

        let remaining: BTreeSet<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        for stage in &mut self.stages {
            stage.after.retain(|d| remaining.contains(d));
        }
    }

    /// Applies `transform` to every stage's command list.
    ///
    /// Step identities are derived from the rewritten commands, so this may
    /// run once per document; a second call is rejected.
    pub fn map_stage_commands<F>(&mut self, mut transform: F) -> Result<()>
    where
        F: FnMut(&str, Vec<Command>) -> Vec<Command>,
    {
        if self.commands_rewritten {
            return Err(Error::msg("stage commands were already rewritten"));
        }
        for stage in &mut self.stages {
            let cmds = std::mem::take(&mut stage.commands);
            stage.commands = transform(&stage.name, cmds);
        }
        self.commands_rewritten = true;
        Ok(())
    }
}

pub fn load_document(path: &Path, algorithm: Algorithm) -> Result<Document> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read book {}: {e}", path.display())))?;
    let raw: RawDocument = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    Document::from_raw(raw, algorithm)
}
