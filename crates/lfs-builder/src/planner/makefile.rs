use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::script::ScriptedStage;
use crate::workspace::{Layout, atomic_write, ensure_dir, set_executable};

const UMBRELLA: &str = "all";

/// Variables every stage script sees, passed explicitly on the rule line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnv {
    pub root: PathBuf,
    pub target: String,
}

impl BuildEnv {
    pub fn header(&self) -> String {
        format!(
            "LFS={} LFS_TGT={}",
            sh_quote(&self.root.to_string_lossy()),
            sh_quote(&self.target)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub identity: String,
    pub stage: String,
    pub artifact: PathBuf,
    pub script: PathBuf,
    pub sentinel: PathBuf,
    /// Sentinel of the previous node in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<PathBuf>,
}

/// What `plan.json` holds; read back by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub plan: PathBuf,
    pub flags: PathBuf,
    pub nodes: Vec<BuildNode>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub nodes: Vec<BuildNode>,
    pub text: String,
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn recipe_escape(s: &str) -> String {
    s.replace('$', "$$")
}

fn make_target(p: &Path) -> Result<String> {
    let s = p.to_string_lossy();
    if s.chars().any(|c| c.is_whitespace() || matches!(c, ':' | '#' | '%')) {
        return Err(Error::msg(format!(
            "path '{}' cannot be used as a make target",
            s
        )));
    }
    Ok(recipe_escape(&s))
}

fn quoted(p: &Path) -> String {
    recipe_escape(&sh_quote(&p.to_string_lossy()))
}

/// Links stages into a single chain: each node depends on the previous one.
///
/// Two stages with the same identity would share one sentinel, so the second
/// rule would depend on itself and never run; that is rejected.
pub fn build_nodes(stages: &[ScriptedStage], layout: &Layout) -> Result<Vec<BuildNode>> {
    let mut previous: Option<PathBuf> = None;
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    let mut out = Vec::with_capacity(stages.len());
    for s in stages {
        let identity = s.identity.to_string();
        if let Some(first) = seen.insert(identity.clone(), s.stage.name.as_str()) {
            return Err(Error::msg(format!(
                "stages '{}' and '{}' have the same identity {identity}; rename one of them",
                first, s.stage.name
            )));
        }
        let sentinel = layout.flags.join(format!("build-{identity}"));
        out.push(BuildNode {
            stage: s.stage.name.clone(),
            artifact: layout.sources.join(&s.stage.artifact.file),
            script: layout.scripts.join(format!("{identity}.sh")),
            sentinel: sentinel.clone(),
            depends_on: previous.replace(sentinel),
            identity,
        });
    }
    Ok(out)
}

/// Renders the rule file for an already linked chain.
pub fn render_plan(nodes: &[BuildNode], scratch: &Path, env: &BuildEnv) -> Result<String> {
    let mut out = format!(".PHONY: {UMBRELLA}\n");
    match nodes.last() {
        Some(last) => out.push_str(&format!("{UMBRELLA}: {}\n", make_target(&last.sentinel)?)),
        None => out.push_str(&format!("{UMBRELLA}:\n")),
    }

    let header = recipe_escape(&env.header());
    let scratch_q = quoted(scratch);
    for node in nodes {
        let mut prereqs = make_target(&node.artifact)?;
        if let Some(prev) = &node.depends_on {
            prereqs.push(' ');
            prereqs.push_str(&make_target(prev)?);
        }
        out.push_str(&format!(
            "\n{}: {prereqs}\n",
            make_target(&node.sentinel)?
        ));
        for line in [
            format!("rm -rf {scratch_q}"),
            format!("mkdir -p {scratch_q}"),
            format!("tar -xf {} -C {scratch_q}", quoted(&node.artifact)),
            format!("cd {scratch_q}/* && {header} bash {}", quoted(&node.script)),
            format!("rm -rf {scratch_q}"),
            format!("touch {}", quoted(&node.sentinel)),
        ] {
            out.push('\t');
            out.push_str(&line);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Writes scripts, the rule file and its manifest. Existing sentinels are
/// left alone so a re-run of the runner resumes at the first missing one.
pub fn emit(stages: &[ScriptedStage], layout: &Layout, env: &BuildEnv) -> Result<Plan> {
    ensure_dir(&layout.scripts)?;
    ensure_dir(&layout.flags)?;

    let nodes = build_nodes(stages, layout)?;
    let text = render_plan(&nodes, &layout.scratch, env)?;

    for (stage, node) in stages.iter().zip(&nodes) {
        atomic_write(&node.script, stage.script.as_bytes())?;
        set_executable(&node.script)?;
        debug!(stage = %node.stage, script = %node.script.display(), "script written");
    }

    let manifest = Manifest {
        plan: layout.plan_file(),
        flags: layout.flags.clone(),
        nodes: nodes.clone(),
    };
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::io(format!("failed to encode plan manifest: {e}")))?;
    atomic_write(&layout.manifest_file(), &json)?;
    atomic_write(&layout.plan_file(), text.as_bytes())?;

    info!(
        stages = nodes.len(),
        plan = %layout.plan_file().display(),
        "build plan written"
    );
    Ok(Plan { nodes, text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Algorithm;
    use crate::document::{ArtifactKind, ArtifactRef, BuildStage, Command};

    fn scripted(name: &str, file: &str, cmds: &[&str]) -> ScriptedStage {
        let stage = BuildStage {
            name: name.into(),
            artifact: ArtifactRef {
                kind: ArtifactKind::Package,
                name: name.to_lowercase(),
                version: None,
                url: format!("https://example.org/{file}"),
                file: file.into(),
                checksum: "0".repeat(32),
                revision: None,
            },
            commands: cmds.iter().map(|c| Command::ordinary(*c)).collect(),
            after: vec![],
        };
        ScriptedStage::new(stage, Algorithm::Md5)
    }

    fn env() -> BuildEnv {
        BuildEnv {
            root: PathBuf::from("/mnt/lfs"),
            target: "x86_64-lfs-linux-gnu".into(),
        }
    }

    fn layout() -> Layout {
        Layout::new(Path::new("/mnt/lfs"), "work").expect("layout")
    }

    fn rule_for<'a>(text: &'a str, sentinel: &Path) -> &'a str {
        let head = format!("{}:", sentinel.display());
        let start = text.find(&head).expect("rule present");
        let rest = &text[start..];
        let end = rest.find("\n\n").map(|i| i + 1).unwrap_or(rest.len());
        &rest[..end]
    }

    #[test]
    fn empty_stage_list_is_umbrella_only() {
        let text = render_plan(&[], Path::new("/mnt/lfs/work/build"), &env()).expect("render");
        assert_eq!(text, ".PHONY: all\nall:\n");
    }

    #[test]
    fn single_stage_plan_renders_exactly() {
        let l = layout();
        let nodes = build_nodes(&[scripted("Only", "only-1.tar.gz", &["true"])], &l).expect("nodes");
        let id = &nodes[0].identity;
        let text = render_plan(&nodes, &l.scratch, &env()).expect("render");
        assert_eq!(
            text,
            format!(
                ".PHONY: all\n\
                 all: /mnt/lfs/work/flags/build-{id}\n\
                 \n\
                 /mnt/lfs/work/flags/build-{id}: /mnt/lfs/sources/only-1.tar.gz\n\
                 \trm -rf '/mnt/lfs/work/build'\n\
                 \tmkdir -p '/mnt/lfs/work/build'\n\
                 \ttar -xf '/mnt/lfs/sources/only-1.tar.gz' -C '/mnt/lfs/work/build'\n\
                 \tcd '/mnt/lfs/work/build'/* && LFS='/mnt/lfs' LFS_TGT='x86_64-lfs-linux-gnu' bash '/mnt/lfs/work/scripts/{id}.sh'\n\
                 \trm -rf '/mnt/lfs/work/build'\n\
                 \ttouch '/mnt/lfs/work/flags/build-{id}'\n"
            )
        );
    }

    #[test]
    fn colliding_identities_are_rejected() {
        let l = layout();
        let stages = vec![
            scripted("Gcc Pass 1", "gcc.tar", &["make"]),
            scripted("Gcc/Pass 1", "gcc.tar", &["make"]),
        ];
        assert_eq!(stages[0].identity, stages[1].identity);
        let err = build_nodes(&stages, &l).expect_err("collision");
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        assert!(err.to_string().contains("Gcc/Pass 1"));

        let tmp = tempfile::tempdir().expect("tempdir");
        let l = Layout::new(tmp.path(), "work").expect("layout");
        assert!(emit(&stages, &l, &env()).is_err());
        assert!(!l.plan_file().exists());
    }

    #[test]
    fn stages_chain_linearly() {
        let l = layout();
        let stages = vec![
            scripted("A", "a-1.tar.xz", &["make"]),
            scripted("B", "b-1.tar.xz", &["make"]),
            scripted("C", "c-1.tar.xz", &["make install"]),
        ];
        let nodes = build_nodes(&stages, &l).expect("nodes");
        let text = render_plan(&nodes, &l.scratch, &env()).expect("render");

        assert_eq!(nodes[0].depends_on, None);
        assert_eq!(nodes[1].depends_on.as_ref(), Some(&nodes[0].sentinel));
        assert_eq!(nodes[2].depends_on.as_ref(), Some(&nodes[1].sentinel));
        assert!(text.contains(&format!("all: {}\n", nodes[2].sentinel.display())));

        let b = rule_for(&text, &nodes[1].sentinel);
        assert!(b.starts_with(&format!(
            "{}: /mnt/lfs/sources/b-1.tar.xz {}\n",
            nodes[1].sentinel.display(),
            nodes[0].sentinel.display()
        )));
        assert!(b.contains(
            "\tcd '/mnt/lfs/work/build'/* && LFS='/mnt/lfs' LFS_TGT='x86_64-lfs-linux-gnu' bash "
        ));
        assert!(b.ends_with(&format!("\ttouch '{}'\n", nodes[1].sentinel.display())));
        assert_eq!(text.matches(".PHONY").count(), 1);
    }

    #[test]
    fn rule_body_runs_in_order() {
        let l = layout();
        let nodes = build_nodes(&[scripted("Only", "only-1.tar.gz", &["true"])], &l).expect("nodes");
        let text = render_plan(&nodes, &l.scratch, &env()).expect("render");
        let body: Vec<&str> = rule_for(&text, &nodes[0].sentinel)
            .lines()
            .skip(1)
            .map(|l| l.split_whitespace().next().unwrap_or(""))
            .collect();
        assert_eq!(body, ["rm", "mkdir", "tar", "cd", "rm", "touch"]);
    }

    #[test]
    fn changed_stage_only_touches_its_own_rule_and_successor_link() {
        let l = layout();
        let before = vec![
            scripted("A", "a.tar", &["make"]),
            scripted("B", "b.tar", &["make"]),
            scripted("C", "c.tar", &["make"]),
        ];
        let mut after = before.clone();
        after[1] = scripted("B", "b.tar", &["make -k"]);

        let n1 = build_nodes(&before, &l).expect("nodes");
        let n2 = build_nodes(&after, &l).expect("nodes");
        let t1 = render_plan(&n1, &l.scratch, &env()).expect("render");
        let t2 = render_plan(&n2, &l.scratch, &env()).expect("render");

        assert_eq!(n1[0], n2[0]);
        assert_eq!(rule_for(&t1, &n1[0].sentinel), rule_for(&t2, &n2[0].sentinel));
        assert_ne!(n1[1].identity, n2[1].identity);
        assert_ne!(n1[1].script, n2[1].script);
        assert_eq!(n1[2].identity, n2[2].identity);
        assert_eq!(n1[2].script, n2[2].script);
        assert_eq!(before[2].script, after[2].script);
        assert_eq!(n2[2].depends_on.as_ref(), Some(&n2[1].sentinel));
    }

    #[test]
    fn dollar_signs_are_escaped_for_make() {
        let e = BuildEnv {
            root: PathBuf::from("/mnt/lfs"),
            target: "weird$tgt".into(),
        };
        let text = render_plan(
            &build_nodes(&[scripted("A", "a.tar", &["true"])], &layout()).expect("nodes"),
            Path::new("/mnt/lfs/work/build"),
            &e,
        )
        .expect("render");
        assert!(text.contains("LFS_TGT='weird$$tgt'"));
    }

    #[test]
    fn unusable_target_paths_are_rejected() {
        let l = Layout::new(Path::new("/mnt/my lfs"), "work").expect("layout");
        let nodes = build_nodes(&[scripted("A", "a.tar", &["true"])], &l).expect("nodes");
        assert!(render_plan(&nodes, &l.scratch, &env()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn emit_writes_scripts_plan_and_manifest_and_keeps_sentinels() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let l = Layout::new(tmp.path(), "work").expect("layout");
        let stages = vec![
            scripted("A", "a.tar", &["echo a"]),
            scripted("B", "b.tar", &["echo b"]),
        ];

        let plan = emit(&stages, &l, &env()).expect("emit");
        std::fs::write(&plan.nodes[0].sentinel, "").expect("sentinel");

        let script = std::fs::read_to_string(&plan.nodes[0].script).expect("script");
        assert_eq!(script, stages[0].script);
        let mode = std::fs::metadata(&plan.nodes[0].script)
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read_to_string(l.plan_file()).expect("plan"),
            plan.text
        );

        let again = emit(&stages, &l, &env()).expect("re-emit");
        assert_eq!(again.text, plan.text);
        assert!(plan.nodes[0].sentinel.exists());

        let manifest: Manifest =
            serde_json::from_slice(&std::fs::read(l.manifest_file()).expect("manifest"))
                .expect("decode");
        assert_eq!(manifest.nodes, plan.nodes);
    }
}
