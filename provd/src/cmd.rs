//! Subprocess invocation helper.
//!
//! All external commands (`fallocate`, `losetup`, `dmsetup`, `mkfs.ext4`,
//! `mount`, `umount`, `cp`, `tar`) go through [`run`]. Callers map
//! [`CmdFailure`] into their own error kind (`Device` for the volume
//! backend, `Unpack` for tar extraction).

use std::fmt;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// A command that could not be spawned, was cancelled, or exited non-zero.
#[derive(Debug)]
pub(crate) enum CmdFailure {
    Cancelled,
    Spawn {
        program: String,
        source: std::io::Error,
    },
    NonZero {
        program: String,
        args: Vec<String>,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

impl CmdFailure {
    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self, CmdFailure::Cancelled)
    }
}

impl fmt::Display for CmdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdFailure::Cancelled => write!(f, "command cancelled"),
            CmdFailure::Spawn { program, source } => {
                write!(f, "failed to run {}: {}", program, source)
            }
            CmdFailure::NonZero {
                program,
                args,
                status,
                stderr,
            } => {
                write!(
                    f,
                    "{} {} exited with {}: {}",
                    program,
                    args.join(" "),
                    status,
                    stderr.trim()
                )
            }
        }
    }
}

/// Run a command to completion, returning its trimmed stdout.
///
/// The wait is raced against the cancellation token; on cancellation the
/// child is left to the kernel (kill-on-drop) and the caller aborts.
pub(crate) async fn run(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
) -> Result<String, CmdFailure> {
    if cancel.is_cancelled() {
        return Err(CmdFailure::Cancelled);
    }

    tracing::debug!(program, ?args, "running command");

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(CmdFailure::Cancelled),
        result = command.output() => result.map_err(|source| CmdFailure::Spawn {
            program: program.to_string(),
            source,
        })?,
    };

    if !output.status.success() {
        return Err(CmdFailure::NonZero {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_trimmed_stdout() {
        let cancel = CancellationToken::new();
        let out = run(&cancel, "echo", &["hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let cancel = CancellationToken::new();
        let err = run(&cancel, "ls", &["/definitely/not/here"])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ls"), "unexpected message: {msg}");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run(&cancel, "echo", &["hello"]).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
