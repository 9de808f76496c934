//! Built-in command transforms for [`Document::map_stage_commands`].
//!
//! [`Document::map_stage_commands`]: super::Document::map_stage_commands

use std::sync::OnceLock;

use regex::Regex;

use super::{Command, CommandKind};
use crate::config::RewriteConfig;

fn make_invocation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*make)(\s|$)").expect("static regex"))
}

fn has_jobs_flag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|\s)(-j\d*|--jobs(=\d+)?)(\s|$)").expect("static regex"))
}

pub fn strip_tests(cmds: Vec<Command>) -> Vec<Command> {
    cmds.into_iter()
        .filter(|c| c.kind != CommandKind::Test)
        .collect()
}

/// Inserts `-j<jobs>` right after a leading `make` when the command carries
/// no jobs flag. The rest of the command, pipes and continuations included,
/// is left as written.
pub fn inject_make_jobs(cmds: Vec<Command>, jobs: usize) -> Vec<Command> {
    if jobs == 0 {
        return cmds;
    }
    let replacement = format!("${{1}} -j{jobs}${{2}}");
    cmds.into_iter()
        .map(|mut c| {
            if make_invocation().is_match(&c.text) && !has_jobs_flag().is_match(&c.text) {
                c.text = make_invocation()
                    .replace(&c.text, replacement.as_str())
                    .into_owned();
            }
            c
        })
        .collect()
}

/// The transform described by the `[rewrite]` config table.
pub fn from_config(cfg: &RewriteConfig) -> impl FnMut(&str, Vec<Command>) -> Vec<Command> + '_ {
    move |_stage: &str, mut cmds: Vec<Command>| {
        if cfg.strip_tests {
            cmds = strip_tests(cmds);
        }
        inject_make_jobs(cmds, cfg.make_jobs)
    }
}
