//! Utilities for running external commands with [`tokio::process::Command`].

use std::{io, process};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status {}: {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run `cmd` to completion, capturing its output. A non-zero exit status is an error.
pub async fn run(cmd: &mut Command) -> Result<Output> {
    cmd.stdin(process::Stdio::null())
        .stdout(process::Stdio::piped())
        .stderr(process::Stdio::piped());

    tracing::debug!(cmd = %render(cmd), "running command");

    let output: Output = cmd.output().await?.into();

    if !output.status.success() {
        tracing::debug!(
            ?output.stderr,
            %output.status,
            cmd = %render(cmd),
            "command returned non-zero status"
        );
        return Err(Error::NonZero(output));
    }

    Ok(output)
}

/// Render a command as the space-separated program and arguments.
pub fn render(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run(Command::new("echo").arg("hello")).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let err = run(Command::new("sh").args(["-c", "echo boom >&2; exit 3"])).await.unwrap_err();
        match err {
            Error::NonZero(out) => {
                assert_eq!(out.status.code(), Some(3));
                assert_eq!(out.stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn render_joins_program_and_args() {
        let mut cmd = Command::new("ovs-vsctl");
        cmd.args(["add-br", "br0"]);
        assert_eq!(render(&cmd), "ovs-vsctl add-br br0");
    }
}
