//! Running commands on fleet nodes, locally or over SSH.

use std::process::Stdio;

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::debug;

use hearthgrid_state::{NodeInfo, NodeTransport};

/// Builds and runs commands on a node.
#[derive(Debug, Clone)]
pub struct NodeShell {
    ssh_bin: String,
}

impl NodeShell {
    pub fn new(ssh_bin: impl Into<String>) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
        }
    }

    /// `program args...` on `node`. Remote arguments are quoted for the
    /// remote shell.
    pub fn command(&self, node: &NodeInfo, program: &str, args: &[String]) -> Command {
        match &node.transport {
            NodeTransport::Local => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            NodeTransport::Ssh { host, user, port } => {
                let mut cmd = Command::new(&self.ssh_bin);
                cmd.arg("-p")
                    .arg(port.to_string())
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(format!("{user}@{host}"))
                    .arg("--")
                    .arg(remote_command_line(program, args));
                cmd
            }
        }
    }

    /// Run `program args...` on `node` and return its trimmed stdout.
    pub async fn run(&self, node: &NodeInfo, program: &str, args: &[String]) -> anyhow::Result<String> {
        let cmd = self.command(node, program, args);
        run_command(cmd)
            .await
            .with_context(|| format!("{program} on node {}", node.id))
    }
}

/// Run `cmd` to completion, failing on a non-zero exit.
pub async fn run_command(mut cmd: Command) -> anyhow::Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = ?cmd, "running");

    let output = cmd.output().await.context("failed to spawn command")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "exit code {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Join a command line for a POSIX shell.
pub fn remote_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote `arg` so a POSIX shell passes it through unchanged.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
