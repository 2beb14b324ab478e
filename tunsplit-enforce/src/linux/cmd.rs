//! External command execution for the Linux backend

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Run `program` with `args`, optionally feeding `stdin`, and return stdout
pub(crate) async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotSupported(format!("`{}` is not installed", program))
        } else {
            Error::Io(e)
        }
    })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Command {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run`], but failures are only logged
pub(crate) async fn run_quiet(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args, None).await {
        log::debug!("Ignoring failure: {}", e);
    }
}

/// Interface that owns `addr`, parsed from `ip -o addr show to <addr>`
pub(crate) fn parse_owning_interface(output: &str) -> Option<String> {
    // 5: wg0    inet 10.8.0.2/32 scope global wg0\       valid_lft forever ...
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let name = line.split_whitespace().nth(1)?;
    let name = name.split('@').next()?;
    Some(name.trim_end_matches(':').to_string())
}
