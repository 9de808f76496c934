use std::fmt;

use crate::checksum::{Algorithm, digest_text};
use crate::document::BuildStage;

// Strict mode, no command hashing, files created without group/other write.
const PREAMBLE: &str = "#!/bin/bash\n\nset +h\nset -e\numask 022\n\n";

/// Content-derived name of a stage: `<sanitized name>-<digest of script>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepIdentity {
    pub name_part: String,
    pub digest: String,
}

impl fmt::Display for StepIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name_part, self.digest)
    }
}

pub fn sanitize_stage_name(name: &str) -> String {
    let mut s = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
            s.push(c);
        } else {
            s.push('_');
        }
    }
    if s.is_empty() {
        s.push_str("stage");
    }
    s
}

pub fn render_script(stage: &BuildStage) -> String {
    let body_len: usize = stage.commands.iter().map(|c| c.text.len() + 1).sum();
    let mut out = String::with_capacity(PREAMBLE.len() + body_len);
    out.push_str(PREAMBLE);
    for cmd in &stage.commands {
        out.push_str(&cmd.text);
        out.push('\n');
    }
    out
}

pub fn derive_identity(stage: &BuildStage, algorithm: Algorithm) -> StepIdentity {
    StepIdentity {
        name_part: sanitize_stage_name(&stage.name),
        digest: digest_text(algorithm, &render_script(stage)),
    }
}

/// A stage with its rendered script and identity, ready for emission.
#[derive(Debug, Clone)]
pub struct ScriptedStage {
    pub stage: BuildStage,
    pub script: String,
    pub identity: StepIdentity,
}

impl ScriptedStage {
    pub fn new(stage: BuildStage, algorithm: Algorithm) -> Self {
        let script = render_script(&stage);
        let identity = StepIdentity {
            name_part: sanitize_stage_name(&stage.name),
            digest: digest_text(algorithm, &script),
        };
        Self {
            stage,
            script,
            identity,
        }
    }
}
