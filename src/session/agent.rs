//! Ephemeral ssh-agent scope.
//!
//! Cloning over SSH needs an agent holding the build identity. [`SshAgent`]
//! starts one inside the session, parses its socket/pid assignment lines,
//! registers the identity, and guarantees on drop that the agent is killed
//! and the identity file's group permissions are restored — whether or not
//! the work inside the scope succeeded.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::env::BuildEnv;
use crate::error::DebforgeError;
use crate::exec::{RunOptions, RunOutput};
use crate::session::Session;

/// Group-shared mode the identity file normally carries.
const IDENT_MODE_SHARED: u32 = 0o2770;
/// Owner-only mode ssh insists on while the key is in use.
const IDENT_MODE_PRIVATE: u32 = 0o2700;

/// A running ssh-agent bound to one session.
pub struct SshAgent<'s> {
    session: &'s Session,
    auth_sock: String,
    agent_pid: String,
    /// Host path of the identity file whose permissions we tightened.
    identity_host_path: PathBuf,
}

impl<'s> SshAgent<'s> {
    /// Start an agent in the session and register `identity_file` (a path
    /// inside the chroot) with it.
    pub fn start(session: &'s Session, env: &BuildEnv, identity_file: &str) -> Result<SshAgent<'s>> {
        // ssh wants $HOME to exist and be owned by the invoking user.
        let home = std::env::var("HOME").context("HOME is not set")?;
        let user = std::env::var("USER").context("USER is not set")?;
        session.run(&["mkdir", "-p", &home], &RunOptions::new().root())?;
        session.run(&["chown", &user, &home], &RunOptions::new().root())?;

        // ssh refuses group-readable keys; tighten for the agent's lifetime.
        let identity_host_path = env.rootfs_path(identity_file);
        set_mode(&identity_host_path, IDENT_MODE_PRIVATE)?;

        let output = session.run(&["ssh-agent"], &RunOptions::new().capture());
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                // No agent started: restore permissions before bailing.
                let _ = set_mode(&identity_host_path, IDENT_MODE_SHARED);
                return Err(err);
            }
        };
        let (auth_sock, agent_pid) = match parse_agent_output(&output) {
            Ok(values) => values,
            Err(err) => {
                let _ = set_mode(&identity_host_path, IDENT_MODE_SHARED);
                return Err(err);
            }
        };
        debug!(pid = %agent_pid, sock = %auth_sock, "ssh-agent started");

        let agent = SshAgent {
            session,
            auth_sock,
            agent_pid,
            identity_host_path,
        };
        // From here on, drop handles both the kill and the chmod.
        agent.run(&["ssh-add", identity_file], &RunOptions::new().capture())?;
        Ok(agent)
    }

    /// Run a command in the session with the agent variables injected.
    ///
    /// `HOME`, `LOGNAME` and `USER` are carried through so ssh resolves the
    /// invoking user; caller-supplied variables take precedence over those
    /// but never over the agent's own two.
    pub fn run(&self, cmd: &[&str], opts: &RunOptions) -> Result<RunOutput> {
        let mut opts = opts.clone();
        for key in ["HOME", "LOGNAME", "USER"] {
            if let Ok(value) = std::env::var(key) {
                opts.env.entry(key.to_string()).or_insert(value);
            }
        }
        opts.env
            .insert("SSH_AUTH_SOCK".to_string(), self.auth_sock.clone());
        opts.env
            .insert("SSH_AGENT_PID".to_string(), self.agent_pid.clone());
        self.session.run(cmd, &opts)
    }
}

impl Drop for SshAgent<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .session
            .run(&["kill", &self.agent_pid], &RunOptions::new().capture())
        {
            warn!(pid = %self.agent_pid, %err, "failed to kill ssh-agent");
        }
        if let Err(err) = set_mode(&self.identity_host_path, IDENT_MODE_SHARED) {
            warn!(
                path = %self.identity_host_path.display(),
                %err,
                "failed to restore identity file permissions"
            );
        }
    }
}

fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode {mode:o} on '{}'", path.display()))
}

/// Extract `SSH_AUTH_SOCK` and `SSH_AGENT_PID` from ssh-agent's stdout.
///
/// The agent prints sh-style assignments, one per line:
///
/// ```text
/// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
/// SSH_AGENT_PID=124; export SSH_AGENT_PID;
/// ```
///
/// A format change is fatal; there is no fallback that would leave us with
/// a guessable socket.
fn parse_agent_output(output: &RunOutput) -> Result<(String, String)> {
    let auth_sock = extract_assignment(output, "SSH_AUTH_SOCK")?;
    let agent_pid = extract_assignment(output, "SSH_AGENT_PID")?;
    Ok((auth_sock, agent_pid))
}

fn extract_assignment(output: &RunOutput, variable: &'static str) -> Result<String> {
    for line in output.lines() {
        let Some(rest) = line.strip_prefix(variable) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let value = rest.split(';').next().unwrap_or("").trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
    Err(DebforgeError::AgentOutput { variable }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(text: &str) -> RunOutput {
        RunOutput {
            stdout: text.to_string(),
        }
    }

    #[test]
    fn parses_standard_agent_output() {
        let out = output(
            "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.42; export SSH_AUTH_SOCK;\n\
             SSH_AGENT_PID=43; export SSH_AGENT_PID;\n\
             echo Agent pid 43;\n",
        );
        let (sock, pid) = parse_agent_output(&out).unwrap();
        assert_eq!(sock, "/tmp/ssh-abc/agent.42");
        assert_eq!(pid, "43");
    }

    #[test]
    fn format_change_is_fatal() {
        let out = output("agent listening on /tmp/sock, pid 43\n");
        let err = parse_agent_output(&out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DebforgeError>(),
            Some(DebforgeError::AgentOutput {
                variable: "SSH_AUTH_SOCK"
            })
        ));
    }

    #[test]
    fn missing_pid_line_names_the_missing_variable() {
        let out = output("SSH_AUTH_SOCK=/tmp/sock; export SSH_AUTH_SOCK;\n");
        let err = parse_agent_output(&out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DebforgeError>(),
            Some(DebforgeError::AgentOutput {
                variable: "SSH_AGENT_PID"
            })
        ));
    }
}
