//! External process execution.
//!
//! Everything this tool actually does on a system happens through external
//! collaborators (schroot, debootstrap, git, ssh-agent, ...). This module is
//! the one place that spawns them: a command is a program plus arguments,
//! with options for privilege elevation, shell interpretation, output
//! capture and extra environment variables.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::DebforgeError;

/// How a command should be executed.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run as the privileged user (inside a session: `--user root`).
    pub root: bool,
    /// Interpret the command line through `/bin/sh -c`.
    pub shell: bool,
    /// Capture stdout instead of streaming to the tty.
    pub capture: bool,
    /// Extra environment variables, injected on top of the inherited set.
    pub env: BTreeMap<String, String>,
    /// Working directory on the host.
    pub cwd: Option<PathBuf>,
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions::default()
    }

    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Result of a captured run. Streamed runs return an empty stdout.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
}

impl RunOutput {
    /// Captured stdout lines, trailing whitespace trimmed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim_end)
    }
}

/// Run a command on the host.
///
/// A nonzero exit becomes [`DebforgeError::ToolFailed`] carrying the program
/// name and status; output is never inspected for error recovery.
pub fn run_host(cmd: &[&str], opts: &RunOptions) -> Result<RunOutput> {
    let argv: Vec<String>;
    let full: Vec<&str> = if opts.shell {
        argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            cmd.join(" "),
        ];
        argv.iter().map(String::as_str).collect()
    } else {
        cmd.to_vec()
    };
    run_argv(&full, opts)
}

/// Run a fully-assembled argv.
pub fn run_argv(argv: &[&str], opts: &RunOptions) -> Result<RunOutput> {
    let (program, args) = argv
        .split_first()
        .context("empty command")?;

    debug!(command = %argv.join(" "), capture = opts.capture, "exec");

    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }

    if opts.capture {
        // stderr is captured too so a failing command's diagnostics end up
        // in the error report instead of on the tty.
        let output = command
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning '{program}'"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DebforgeError::ToolFailed {
                program: program.to_string(),
                status: format!("{}: {}", output.status, stderr.trim()),
            }
            .into());
        }
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    } else {
        let status = command
            .status()
            .with_context(|| format!("spawning '{program}'"))?;
        if !status.success() {
            return Err(DebforgeError::ToolFailed {
                program: program.to_string(),
                status: status.to_string(),
            }
            .into());
        }
        Ok(RunOutput {
            stdout: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_run_returns_stdout() {
        let out = run_host(&["echo", "hello"], &RunOptions::new().capture()).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn shell_run_supports_pipelines() {
        let out = run_host(
            &["printf 'a\\nb\\n' | wc -l"],
            &RunOptions::new().shell().capture(),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "2");
    }

    #[test]
    fn nonzero_exit_is_tool_failure() {
        let err = run_host(&["false"], &RunOptions::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DebforgeError>(),
            Some(DebforgeError::ToolFailed { program, .. }) if program == "false"
        ));
    }

    #[test]
    fn extra_env_is_visible_to_the_child() {
        let out = run_host(
            &["printenv", "DEBFORGE_PROBE"],
            &RunOptions::new().capture().env("DEBFORGE_PROBE", "42"),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

}
