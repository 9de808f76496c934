use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::config::BuilderConfig;
use crate::error::{Error, Result};

const SOURCES_DIR: &str = "sources";
const TOOLS_DIR: &str = "tools";
const SCRIPTS_DIR: &str = "scripts";
const FLAGS_DIR: &str = "flags";
const SCRATCH_DIR: &str = "build";
const PLAN_FILE: &str = "plan";
const MANIFEST_FILE: &str = "plan.json";

/// Directory layout under the build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub sources: PathBuf,
    pub tools: PathBuf,
    pub work: PathBuf,
    pub scripts: PathBuf,
    pub flags: PathBuf,
    /// Clean extraction directory used by each rule body.
    pub scratch: PathBuf,
}

impl Layout {
    pub fn new(root: &Path, work_dir: &str) -> Result<Self> {
        let work_rel = validate_rel_dir(work_dir)?;
        let work = root.join(work_rel);
        Ok(Self {
            root: root.to_path_buf(),
            sources: root.join(SOURCES_DIR),
            tools: root.join(TOOLS_DIR),
            scripts: work.join(SCRIPTS_DIR),
            flags: work.join(FLAGS_DIR),
            scratch: work.join(SCRATCH_DIR),
            work,
        })
    }

    pub fn from_config(cfg: &BuilderConfig) -> Result<Self> {
        let raw = PathBuf::from(cfg.general.root.trim());
        let root = if raw.is_absolute() {
            raw
        } else {
            std::env::current_dir()
                .map_err(|e| Error::io(format!("cwd error: {e}")))?
                .join(raw)
        };
        // Canonical when it exists so generated paths and link checks agree.
        let root = root.canonicalize().unwrap_or(root);
        Self::new(&root, &cfg.general.work_dir)
    }

    pub fn plan_file(&self) -> PathBuf {
        self.work.join(PLAN_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.work.join(MANIFEST_FILE)
    }

    fn dirs(&self) -> [&Path; 6] {
        [
            &self.root,
            &self.sources,
            &self.tools,
            &self.work,
            &self.scripts,
            &self.flags,
        ]
    }
}

fn validate_rel_dir(p: &str) -> Result<&Path> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty work dir"));
    }
    let path = Path::new(p);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid work dir '{}' (must be relative to the root, without '..')",
            p
        )));
    }
    Ok(path)
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())))
}

/// Creates the layout. An existing root without a `sources` directory is
/// refused: it was not created by this tool.
pub fn init_root(layout: &Layout) -> Result<()> {
    if layout.root.is_dir() && !layout.sources.is_dir() {
        let empty = fs::read_dir(&layout.root)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if !empty {
            return Err(Error::msg(format!(
                "root {} exists and is not a build root (no {}/)",
                layout.root.display(),
                SOURCES_DIR
            )));
        }
    }
    for dir in layout.dirs() {
        ensure_dir(dir)?;
    }
    info!(root = %layout.root.display(), "build root ready");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Correct,
    Missing,
}

/// Decides whether `link` already points at `tools_dir`. Anything else at
/// `link` is fatal; this tool never replaces it.
pub fn check_tools_link(link: &Path, tools_dir: &Path) -> Result<LinkState> {
    let meta = match fs::symlink_metadata(link) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LinkState::Missing),
        Err(e) => {
            return Err(Error::io(format!("failed to inspect {}: {e}", link.display())));
        }
    };
    if !meta.file_type().is_symlink() {
        return Err(Error::msg(format!(
            "{} exists and is not a symlink",
            link.display()
        )));
    }
    let expected = tools_dir
        .canonicalize()
        .unwrap_or_else(|_| tools_dir.to_path_buf());
    let actual = link
        .canonicalize()
        .or_else(|_| fs::read_link(link))
        .map_err(|e| Error::io(format!("failed to read link {}: {e}", link.display())))?;
    if actual != expected {
        return Err(Error::msg(format!(
            "symlink {} points to {} instead of {}",
            link.display(),
            actual.display(),
            expected.display()
        )));
    }
    Ok(LinkState::Correct)
}

/// Creates `link -> tools_dir` through the configured elevation command
/// (e.g. `sudo ln -sT <tools> <link>`) when it is missing.
pub fn ensure_tools_link(link: &Path, tools_dir: &Path, elevate: &[String]) -> Result<()> {
    if check_tools_link(link, tools_dir)? == LinkState::Correct {
        info!(link = %link.display(), "tools link already in place");
        return Ok(());
    }

    let mut argv: Vec<&str> = elevate
        .iter()
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
        .collect();
    let tools = tools_dir.to_string_lossy();
    let link_s = link.to_string_lossy();
    argv.extend(["ln", "-sT", tools.as_ref(), link_s.as_ref()]);

    let (prog, args) = argv
        .split_first()
        .ok_or_else(|| Error::msg("empty link command"))?;
    info!(command = %argv.join(" "), "creating tools link");
    let status = Command::new(prog)
        .args(args)
        .status()
        .map_err(|e| Error::io(format!("failed to run {prog}: {e}")))?;
    if !status.success() {
        return Err(Error::io(format!(
            "failed to create {} symlink ({status})",
            link.display()
        )));
    }
    match check_tools_link(link, tools_dir)? {
        LinkState::Correct => Ok(()),
        LinkState::Missing => Err(Error::io(format!(
            "{} still missing after link command",
            link.display()
        ))),
    }
}

/// Writes `body` to a temp file beside `path` and renames it into place, so
/// readers never see a half-written file.
pub fn atomic_write(path: &Path, body: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::io(format!("invalid path for write: {}", path.display())))?;
    ensure_dir(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".lfsb-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| Error::io(format!("failed to create temp file in {}: {e}", parent.display())))?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write temp file for {}: {e}", path.display())))?;
    tmp.persist(path).map_err(|e| {
        Error::io(format!("failed to rename temp file onto {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(format!("failed to chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
pub fn set_executable(path: &Path) -> Result<()> {
    tracing::warn!(path = %path.display(), "executable bit not supported on this platform");
    Ok(())
}
