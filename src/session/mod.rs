//! schroot session management.
//!
//! A [`Session`] is a guard over one schroot session: beginning it yields a
//! token, every command is run inside `session:<token>`, and dropping the
//! guard force-ends the session. The forced end runs on every exit path, so
//! a failing command (or a caller bailing out mid-sequence) never leaks a
//! session. A SIGKILLed process still can; cleanup is best-effort only.

pub mod agent;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::env::BuildEnv;
use crate::exec::{run_argv, RunOptions, RunOutput};

/// An open schroot session bound to a build environment's chroot name.
pub struct Session {
    /// `session:<token>` identifier understood by schroot.
    session_id: String,
}

impl Session {
    /// Begin a session for the environment's chroot.
    ///
    /// Verifies the config-link invariant first; a moved build directory is
    /// caught here rather than as an opaque schroot failure. A begin failure
    /// propagates immediately — there is no session to clean up yet.
    pub fn begin(env: &BuildEnv) -> Result<Session> {
        env.check_configuration_linked()?;
        let output = run_argv(
            &["schroot", "--chroot", &env.name, "--begin-session"],
            &RunOptions::new().capture(),
        )
        .with_context(|| format!("beginning schroot session for '{}'", env.name))?;
        let token = output.stdout.trim();
        anyhow::ensure!(!token.is_empty(), "schroot returned an empty session token");
        let session_id = format!("session:{token}");
        debug!(session = %session_id, "schroot session open");
        Ok(Session { session_id })
    }

    /// The `session:<token>` identifier.
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Run a command inside the session.
    ///
    /// A command failure does not end the session; the caller decides
    /// whether to continue issuing commands.
    pub fn run(&self, cmd: &[&str], opts: &RunOptions) -> Result<RunOutput> {
        let argv = session_argv(&self.session_id, cmd, opts);
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        run_argv(&argv_refs, opts)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Unconditional forced end; schroot reaps whatever the session left
        // running. Failures here are only worth a warning.
        let result = run_argv(
            &[
                "schroot",
                "--chroot",
                &self.session_id,
                "--end-session",
                "--force",
            ],
            &RunOptions::new().capture(),
        );
        match result {
            Ok(_) => debug!(session = %self.session_id, "schroot session closed"),
            Err(err) => warn!(session = %self.session_id, %err, "failed to end schroot session"),
        }
    }
}

/// Assemble the schroot argv for one in-session command.
///
/// Kept as a pure function so the flag plumbing (`--user root`, `-p` for
/// environment preservation, shell wrapping) is testable without schroot.
fn session_argv(session_id: &str, cmd: &[&str], opts: &RunOptions) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "schroot".into(),
        "--chroot".into(),
        session_id.into(),
        "--run-session".into(),
        "--directory".into(),
        "/".into(),
    ];
    if opts.root {
        argv.push("--user".into());
        argv.push("root".into());
    }
    if !opts.env.is_empty() {
        // Preserve the (injected) caller environment across schroot.
        argv.push("-p".into());
    }
    argv.push("--".into());
    if opts.shell {
        argv.push("/bin/sh".into());
        argv.push("-c".into());
        argv.push(cmd.join(" "));
    } else {
        argv.extend(cmd.iter().map(|s| s.to_string()));
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_argv() {
        let argv = session_argv(
            "session:debforge_abcde-1234",
            &["apt-get", "update"],
            &RunOptions::new(),
        );
        assert_eq!(
            argv,
            [
                "schroot",
                "--chroot",
                "session:debforge_abcde-1234",
                "--run-session",
                "--directory",
                "/",
                "--",
                "apt-get",
                "update",
            ]
        );
    }

    #[test]
    fn root_adds_user_flag_before_separator() {
        let argv = session_argv("session:x", &["id"], &RunOptions::new().root());
        let sep = argv.iter().position(|a| a == "--").unwrap();
        let user = argv.iter().position(|a| a == "--user").unwrap();
        assert!(user < sep);
        assert_eq!(argv[user + 1], "root");
    }

    #[test]
    fn env_injection_preserves_environment() {
        let argv = session_argv(
            "session:x",
            &["git", "clone"],
            &RunOptions::new().env("SSH_AUTH_SOCK", "/tmp/agent.sock"),
        );
        assert!(argv.contains(&"-p".to_string()));
    }

    #[test]
    fn shell_commands_go_through_sh() {
        let argv = session_argv(
            "session:x",
            &["echo ok > /etc/marker"],
            &RunOptions::new().shell().root(),
        );
        let tail = &argv[argv.len() - 3..];
        assert_eq!(tail, ["/bin/sh", "-c", "echo ok > /etc/marker"]);
    }
}
