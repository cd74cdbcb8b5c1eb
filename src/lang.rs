//! Per-language compiler and runner knowledge.
//!
//! One enum case per supported language, each answering the same three
//! questions: which external tool must be present, where build
//! dependencies are searched, and how sources become an executable.
//! Compiled languages emit a single compiler command; interpreted
//! languages assemble their sources into one executable script.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Supported source languages, keyed by the input document's `language`
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "c")]
    C,
    #[serde(rename = "cpp")]
    Cpp,
    #[serde(rename = "cpp11")]
    Cpp11,
    #[serde(rename = "ocaml")]
    Ocaml,
    #[serde(rename = "pascal")]
    Pascal,
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "python2")]
    Python2,
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "nodejs")]
    NodeJs,
    #[serde(rename = "php")]
    Php,
}

impl Language {
    /// All supported languages.
    pub const ALL: &'static [Language] = &[
        Language::C,
        Language::Cpp,
        Language::Cpp11,
        Language::Ocaml,
        Language::Pascal,
        Language::Python,
        Language::Python2,
        Language::Shell,
        Language::NodeJs,
        Language::Php,
    ];

    /// Parse the input document's language key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|lang| lang.key() == key)
    }

    /// The key used in input documents and config transform tables.
    pub fn key(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Cpp11 => "cpp11",
            Language::Ocaml => "ocaml",
            Language::Pascal => "pascal",
            Language::Python => "python",
            Language::Python2 => "python2",
            Language::Shell => "shell",
            Language::NodeJs => "nodejs",
            Language::Php => "php",
        }
    }

    /// The executable that must be resolvable on PATH for this language to
    /// be usable. For compiled languages this is the compiler; for
    /// interpreted ones, the interpreter named in the assembled shebang.
    pub fn required_tool(&self) -> &'static str {
        match self {
            Language::C => "gcc",
            Language::Cpp | Language::Cpp11 => "g++",
            Language::Ocaml => "ocamlopt",
            Language::Pascal => "fpc",
            Language::Python => "python3",
            Language::Python2 => "python2",
            Language::Shell => "sh",
            Language::NodeJs => "node",
            Language::Php => "php",
        }
    }

    /// Whether sources are assembled into a script rather than compiled.
    pub fn is_interpreted(&self) -> bool {
        matches!(
            self,
            Language::Python | Language::Python2 | Language::Shell | Language::NodeJs | Language::Php
        )
    }

    /// Shebang line prepended to assembled scripts that lack one.
    pub fn shebang(&self) -> Option<&'static str> {
        match self {
            Language::Python => Some("#!/usr/bin/env python3"),
            Language::Python2 => Some("#!/usr/bin/env python2"),
            Language::Shell => Some("#!/bin/sh"),
            Language::NodeJs => Some("#!/usr/bin/env node"),
            Language::Php => Some("#!/usr/bin/env php"),
            _ => None,
        }
    }

    /// The single compile command producing `exe_name` from `sources`, or
    /// `None` for interpreted languages.
    pub fn compile_command(&self, exe_name: &str, sources: &[String]) -> Option<Vec<String>> {
        let mut cmd: Vec<String> = match self {
            Language::C => vec![
                "gcc".into(),
                "-W".into(),
                "-Wall".into(),
                "-O2".into(),
                "-std=gnu99".into(),
                "-o".into(),
                exe_name.into(),
            ],
            Language::Cpp => vec![
                "g++".into(),
                "-W".into(),
                "-Wall".into(),
                "-O2".into(),
                "-o".into(),
                exe_name.into(),
            ],
            Language::Cpp11 => vec![
                "g++".into(),
                "-W".into(),
                "-Wall".into(),
                "-O2".into(),
                "-std=gnu++11".into(),
                "-o".into(),
                exe_name.into(),
            ],
            Language::Ocaml => vec!["ocamlopt".into(), "-o".into(), exe_name.into()],
            Language::Pascal => vec!["fpc".into(), format!("-o{exe_name}")],
            _ => return None,
        };
        cmd.extend(sources.iter().cloned());
        if *self == Language::C {
            cmd.push("-lm".into());
        }
        Some(cmd)
    }

    /// Ordered locations where a build dependency named `name` is searched
    /// under the task directory.
    pub fn dependency_candidates(&self, name: &str, task_path: &Path) -> Vec<PathBuf> {
        vec![
            task_path.join(name),
            task_path.join("modules").join(name),
            task_path.join("modules").join(self.key()).join(name),
        ]
    }
}

/// Resolve a tool name against the PATH, mirroring what the shell would
/// execute.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        for lang in Language::ALL {
            assert_eq!(Language::from_key(lang.key()), Some(*lang));
        }
        assert_eq!(Language::from_key("cobol"), None);
    }

    #[test]
    fn serde_uses_keys() {
        let lang: Language = serde_json::from_str("\"cpp11\"").unwrap();
        assert_eq!(lang, Language::Cpp11);
        assert_eq!(serde_json::to_string(&Language::Shell).unwrap(), "\"shell\"");
    }

    #[test]
    fn compiled_languages_emit_one_command() {
        let cmd = Language::Cpp
            .compile_command("sol.exe", &["main.cpp".into(), "util.cpp".into()])
            .unwrap();
        assert_eq!(cmd[0], "g++");
        assert!(cmd.contains(&"sol.exe".to_string()));
        assert!(cmd.contains(&"util.cpp".to_string()));

        let c = Language::C.compile_command("sol.exe", &["main.c".into()]).unwrap();
        assert_eq!(c.last().map(String::as_str), Some("-lm"));
    }

    #[test]
    fn interpreted_languages_have_shebangs_not_commands() {
        for lang in Language::ALL.iter().filter(|l| l.is_interpreted()) {
            assert!(lang.compile_command("x.exe", &[]).is_none());
            assert!(lang.shebang().is_some());
        }
    }

    #[test]
    fn dependency_search_order() {
        let task = Path::new("/task");
        let candidates = Language::C.dependency_candidates("graph.h", task);
        assert_eq!(candidates[0], Path::new("/task/graph.h"));
        assert_eq!(candidates[1], Path::new("/task/modules/graph.h"));
        assert_eq!(candidates[2], Path::new("/task/modules/c/graph.h"));
    }

    #[test]
    #[cfg(unix)]
    fn find_tool_locates_sh() {
        assert!(find_tool("sh").is_some());
        assert!(find_tool("definitely-not-a-real-tool-xyz").is_none());
    }
}
