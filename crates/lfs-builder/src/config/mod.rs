use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::checksum::Algorithm;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    // Relative paths in the config are relative to the config file.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        resolve_ref_path(&self.path, raw)
    }
}

fn default_work_dir() -> String {
    "work".into()
}

fn default_fetch_retries() -> u32 {
    5
}

fn default_checksum_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_link() -> String {
    "/tools".into()
}

fn default_elevate() -> Vec<String> {
    vec!["sudo".into()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralConfig {
    pub root: String,
    pub book: String,
    pub target: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default)]
    pub checksum: Algorithm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DownloadConfig {
    pub use_mirror: Option<String>,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_checksum_retries")]
    pub checksum_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub jobs: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            use_mirror: None,
            fetch_retries: default_fetch_retries(),
            checksum_retries: default_checksum_retries(),
            timeout_secs: default_timeout_secs(),
            jobs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RewriteConfig {
    pub strip_tests: bool,
    pub make_jobs: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToolsConfig {
    #[serde(default = "default_link")]
    pub link: String,
    #[serde(default = "default_true")]
    pub create_link: bool,
    #[serde(default = "default_elevate")]
    pub elevate: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            link: default_link(),
            create_link: true,
            elevate: default_elevate(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub general: GeneralConfig,
    pub download: DownloadConfig,
    pub rewrite: RewriteConfig,
    pub tools: ToolsConfig,
    /// Book document path, resolved against the config file.
    pub book_path: PathBuf,
}

impl BuilderConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let general: GeneralConfig = doc
            .deserialize_path("general")?
            .ok_or_else(|| Error::msg(format!("{}: missing [general] table", doc.path.display())))?;
        for (key, v) in [
            ("root", &general.root),
            ("book", &general.book),
            ("target", &general.target),
            ("work-dir", &general.work_dir),
        ] {
            if v.trim().is_empty() {
                return Err(Error::msg(format!("general.{key} must not be empty")));
            }
        }
        let download: DownloadConfig = doc.deserialize_path("download")?.unwrap_or_default();
        if download.fetch_retries == 0 {
            return Err(Error::msg("download.fetch-retries must be at least 1"));
        }
        let rewrite = doc.deserialize_path("rewrite")?.unwrap_or_default();
        let tools: ToolsConfig = doc.deserialize_path("tools")?.unwrap_or_default();
        if tools.create_link && tools.elevate.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::msg(
                "tools.elevate must name a command when tools.create-link is enabled",
            ));
        }
        let book_path = doc.resolve_path(general.book.trim());
        Ok(Self {
            general,
            download,
            rewrite,
            tools,
            book_path,
        })
    }

    /// Mirror prefix for a given book version, e.g. `<use-mirror><version>/`.
    pub fn mirror_prefix(&self, book_version: &str) -> Option<String> {
        let base = self
            .download
            .use_mirror
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        let mut out = base.to_string();
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(book_version.trim());
        out.push('/');
        Some(out)
    }

    pub fn download_jobs(&self) -> usize {
        if self.download.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.download.jobs
        }
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }

    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
        // Root-level imports merge in order, then the file itself wins.
        for imp in parse_imports(path, tbl)? {
            let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
            merge_values(&mut out, loaded);
        }
        tbl.remove("imports");
    }

    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

pub fn load_builder_config(path: &Path) -> Result<BuilderConfig> {
    BuilderConfig::from_doc(&load(path)?)
}
