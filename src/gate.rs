//! Decides whether a rendered command must execute.
//!
//! The gate is a file-presence cache: a command whose output file already
//! exists is treated as done, whatever that file contains. Each distinct
//! rendered command is admitted at most once per run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Output-flag convention used to locate a command's result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputConvention {
    /// Host-level port scans writing structured (XML) results.
    Primary,
    /// Service follow-up tools with varied output-flag syntax.
    Secondary,
}

impl OutputConvention {
    /// Lower-case tokens whose following argument is the output path.
    pub fn flag_tokens(self) -> &'static [&'static str] {
        match self {
            OutputConvention::Primary => &["-ox"],
            OutputConvention::Secondary => &["-on", "tee", "-o", "--simple-report"],
        }
    }
}

/// Find the output path of `command`: the argument following the first
/// token that matches one of `flags` case-insensitively.
///
/// Returns `None` when no flag is present, when a flag is the last token,
/// or when the command cannot be split into shell words.
pub fn determine_output_file(command: &str, flags: &[&str]) -> Option<PathBuf> {
    let fragments = shlex::split(command)?;
    fragments
        .iter()
        .enumerate()
        .filter(|(_, f)| flags.iter().any(|flag| f.eq_ignore_ascii_case(flag)))
        .find_map(|(idx, _)| fragments.get(idx + 1))
        .map(PathBuf::from)
}

/// What the gate decided for one rendered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Execute the command; `output` is where its result will be, if known.
    Run { output: Option<PathBuf> },
    /// Output already on disk: do not execute, but still post-process it.
    SkipExisting { output: PathBuf },
    /// Identical rendered command already admitted earlier in this run.
    Duplicate,
}

/// Commands-ran set plus the file-presence check.
#[derive(Debug, Default)]
pub struct CommandGate {
    ran: HashSet<String>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-insert `rendered` into the commands-ran set, then classify it.
    pub fn admit(&mut self, rendered: &str, convention: OutputConvention) -> GateDecision {
        if !self.ran.insert(rendered.to_string()) {
            return GateDecision::Duplicate;
        }
        match determine_output_file(rendered, convention.flag_tokens()) {
            None => GateDecision::Run { output: None },
            Some(path) if should_run(&path) => GateDecision::Run { output: Some(path) },
            Some(path) => GateDecision::SkipExisting { output: path },
        }
    }

    pub fn contains(&self, rendered: &str) -> bool {
        self.ran.contains(rendered)
    }

    pub fn len(&self) -> usize {
        self.ran.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ran.is_empty()
    }
}

fn should_run(output: &Path) -> bool {
    !output.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn primary(cmd: &str) -> Option<PathBuf> {
        determine_output_file(cmd, OutputConvention::Primary.flag_tokens())
    }

    fn secondary(cmd: &str) -> Option<PathBuf> {
        determine_output_file(cmd, OutputConvention::Secondary.flag_tokens())
    }

    #[test]
    fn primary_finds_xml_flag_any_case() {
        assert_eq!(
            primary("nmap -sV -oX /r/scans/xml/full.xml 10.0.0.1"),
            Some(PathBuf::from("/r/scans/xml/full.xml"))
        );
        assert_eq!(
            primary("nmap -ox /r/a.xml 10.0.0.1"),
            Some(PathBuf::from("/r/a.xml"))
        );
    }

    #[test]
    fn primary_ignores_secondary_flags() {
        assert_eq!(primary("nmap -oN /r/a.txt 10.0.0.1"), None);
        assert_eq!(primary("nikto -h 10.0.0.1 -o /r/n.txt"), None);
    }

    #[test]
    fn secondary_conventions() {
        assert_eq!(
            secondary("nmap -sV -p 80 -oN /r/80_nmap.txt 10.0.0.1"),
            Some(PathBuf::from("/r/80_nmap.txt"))
        );
        assert_eq!(
            secondary("whatweb http://10.0.0.1:80 | tee /r/80_whatweb.txt"),
            Some(PathBuf::from("/r/80_whatweb.txt"))
        );
        assert_eq!(
            secondary("nikto -h 10.0.0.1 -p 80 -o /r/80_nikto.txt"),
            Some(PathBuf::from("/r/80_nikto.txt"))
        );
        assert_eq!(
            secondary("sslscan --simple-report /r/443_ssl.txt 10.0.0.1:443"),
            Some(PathBuf::from("/r/443_ssl.txt"))
        );
        assert_eq!(secondary("nmap -oX /r/a.xml 10.0.0.1"), None);
    }

    #[test]
    fn quoted_paths_are_unquoted() {
        assert_eq!(
            secondary("tool -o '/r/with space.txt' target"),
            Some(PathBuf::from("/r/with space.txt"))
        );
    }

    #[test]
    fn first_flag_with_argument_wins() {
        assert_eq!(
            secondary("tool -o /r/first.txt | tee /r/second.txt"),
            Some(PathBuf::from("/r/first.txt"))
        );
        // trailing flag has no argument, earlier one is used
        assert_eq!(
            secondary("tool -o /r/first.txt --simple-report"),
            Some(PathBuf::from("/r/first.txt"))
        );
    }

    #[test]
    fn missing_argument_or_bad_quoting_yields_none() {
        assert_eq!(secondary("tool target -o"), None);
        assert_eq!(secondary("tool 'unterminated -o /r/x.txt"), None);
        assert_eq!(secondary(""), None);
    }

    #[test]
    fn admit_runs_when_output_absent() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("a.xml");
        let cmd = format!("nmap -oX {} 10.0.0.1", out.display());
        let mut gate = CommandGate::new();
        assert_eq!(
            gate.admit(&cmd, OutputConvention::Primary),
            GateDecision::Run { output: Some(out) }
        );
        assert!(gate.contains(&cmd));
    }

    #[test]
    fn admit_skips_when_output_exists() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("a.xml");
        std::fs::write(&out, "").unwrap();
        let cmd = format!("nmap -oX {} 10.0.0.1", out.display());
        let mut gate = CommandGate::new();
        assert_eq!(
            gate.admit(&cmd, OutputConvention::Primary),
            GateDecision::SkipExisting { output: out }
        );
    }

    #[test]
    fn admit_without_output_always_runs_once() {
        let mut gate = CommandGate::new();
        assert_eq!(
            gate.admit("ping -c 1 10.0.0.1", OutputConvention::Secondary),
            GateDecision::Run { output: None }
        );
        assert_eq!(
            gate.admit("ping -c 1 10.0.0.1", OutputConvention::Secondary),
            GateDecision::Duplicate
        );
        assert_eq!(gate.len(), 1);
    }

    #[test]
    fn identical_commands_from_different_conventions_dedup() {
        let mut gate = CommandGate::new();
        let cmd = "tool -o /nonexistent/dir/out.txt";
        assert!(matches!(
            gate.admit(cmd, OutputConvention::Secondary),
            GateDecision::Run { .. }
        ));
        assert_eq!(gate.admit(cmd, OutputConvention::Primary), GateDecision::Duplicate);
    }
}
