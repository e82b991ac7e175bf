//! Lint pass over Python sources via `ruff`. A missing linter binary is
//! logged and skipped; actual findings are hard failures.

use mfp_shared::{MfpError, MfpResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const LINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lint generated library files on disk.
pub async fn lint_files(files: &[PathBuf]) -> MfpResult<()> {
    if files.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new("ruff");
    cmd.arg("check").arg("--quiet");
    cmd.args(files);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("ruff not found, lint pass skipped");
            return Ok(());
        }
        Err(e) => return Err(MfpError::Internal(format!("Failed to spawn ruff: {e}"))),
    };

    let output = timeout(LINT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| MfpError::Internal("ruff timed out".into()))?
        .map_err(|e| MfpError::Internal(format!("ruff failed to run: {e}")))?;

    if output.status.success() {
        tracing::info!(files = files.len(), "generated code lint passed");
        Ok(())
    } else {
        let findings = String::from_utf8_lossy(&output.stdout);
        Err(MfpError::Lint {
            message: format!("{} generated file(s) have lint findings", files.len()),
            output: truncate(&findings, 2000),
        })
    }
}

/// Lint a snippet (plus the prelude it will run with) over stdin.
pub async fn lint_snippet(code: &str) -> MfpResult<()> {
    let mut cmd = Command::new("ruff");
    // E402 is excluded: the generated prelude necessarily runs before the
    // snippet's own imports.
    cmd.args([
        "check",
        "--select=E,F,W",
        "--ignore=E402",
        "--stdin-filename",
        "snippet.py",
        "-",
    ]);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("ruff not found, snippet lint skipped");
            return Ok(());
        }
        Err(e) => return Err(MfpError::Internal(format!("Failed to spawn ruff: {e}"))),
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(code.as_bytes())
            .await
            .map_err(|e| MfpError::Internal(format!("Failed to feed ruff stdin: {e}")))?;
        // Dropping stdin closes the pipe so ruff sees EOF.
    }

    let output = match timeout(Duration::from_secs(10), child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| MfpError::Internal(format!("ruff failed to run: {e}")))?
        }
        Err(_) => {
            tracing::warn!("snippet lint timed out, skipped");
            return Ok(());
        }
    };

    if output.status.success() {
        Ok(())
    } else {
        let findings = String::from_utf8_lossy(&output.stdout);
        Err(MfpError::Lint {
            message: "Submitted code has lint findings".into(),
            output: truncate(&findings, 2000),
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
