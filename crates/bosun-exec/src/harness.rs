//! The shared subprocess harness.
//!
//! Every executor (and the svn/git fetch path of the files manager) runs its
//! external commands through [`run_shell`]: the command line is handed to the
//! system shell, streams are piped only when capture is requested, captured
//! streams are decoded as UTF-8 and trimmed of trailing whitespace, and on
//! POSIX the child gets the default SIGPIPE disposition back (Rust parents
//! ignore SIGPIPE, and shell pipelines misbehave when they inherit that).

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::ExecOutput;

/// A shell command to run with the harness.
#[derive(Debug)]
pub struct ShellCommand<'a> {
    /// The full command line, interpreted by the shell.
    pub command: &'a str,
    /// Working directory for the child.
    pub workdir: &'a Path,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl<'a> ShellCommand<'a> {
    pub fn new(command: &'a str, workdir: &'a Path) -> Self {
        Self {
            command,
            workdir,
            capture_stdout: true,
            capture_stderr: true,
        }
    }
}

/// Run a command line through the shell and collect its outcome.
pub fn run_shell(spec: &ShellCommand<'_>) -> Result<ExecOutput> {
    debug!(command = spec.command, workdir = %spec.workdir.display(), "running shell command");

    let mut command = shell(spec.command);
    command.current_dir(spec.workdir);
    command.stdout(pipe_or_inherit(spec.capture_stdout));
    command.stderr(pipe_or_inherit(spec.capture_stderr));
    restore_sigpipe(&mut command);

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn shell command: {}", spec.command))?;
    let output = child
        .wait_with_output()
        .with_context(|| format!("failed to wait for shell command: {}", spec.command))?;

    let exit_code = i64::from(output.status.code().unwrap_or(-1));
    let decode = |captured: bool, bytes: Vec<u8>| {
        captured.then(|| String::from_utf8_lossy(&bytes).trim_end().to_string())
    };

    Ok(ExecOutput {
        exit_code,
        stdout: decode(spec.capture_stdout, output.stdout),
        stderr: decode(spec.capture_stderr, output.stderr),
    })
}

#[cfg(unix)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[cfg(unix)]
fn restore_sigpipe(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: signal(2) with SIG_DFL is async-signal-safe and touches no
    // parent state; this runs between fork and exec.
    unsafe {
        command.pre_exec(|| {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn restore_sigpipe(_command: &mut Command) {}

fn pipe_or_inherit(capture: bool) -> Stdio {
    if capture { Stdio::piped() } else { Stdio::inherit() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn captures_stdout_trimmed() {
        let dir = tempdir().expect("tempdir");
        let output = run_shell(&ShellCommand::new("echo hi", dir.path())).expect("run");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.as_deref(), Some("hi"));
        assert_eq!(output.stderr.as_deref(), Some(""));
    }

    #[test]
    fn captures_stderr() {
        let dir = tempdir().expect("tempdir");
        let output = run_shell(&ShellCommand::new("echo oops >&2", dir.path())).expect("run");
        assert_eq!(output.stderr.as_deref(), Some("oops"));
    }

    #[test]
    fn reports_exit_code() {
        let dir = tempdir().expect("tempdir");
        let output = run_shell(&ShellCommand::new("exit 3", dir.path())).expect("run");
        assert_eq!(output.exit_code, 3);
    }

    #[test]
    fn capture_disabled_yields_none() {
        let dir = tempdir().expect("tempdir");
        let mut spec = ShellCommand::new("true", dir.path());
        spec.capture_stdout = false;
        spec.capture_stderr = false;
        let output = run_shell(&spec).expect("run");
        assert!(output.stdout.is_none());
        assert!(output.stderr.is_none());
    }

    #[test]
    fn runs_in_the_requested_workdir() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker"), b"x").expect("write");
        let output = run_shell(&ShellCommand::new("ls", dir.path())).expect("run");
        assert_eq!(output.stdout.as_deref(), Some("marker"));
    }
}
