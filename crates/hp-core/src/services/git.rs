use std::path::Path;

use tokio::process::Command;

use crate::error::{PoolError, Result};

async fn run_git(args: &[&str], working_directory: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| PoolError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PoolError::Git(format!(
            "git {} failed (exit {}): {stderr}",
            args.join(" "),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn clone_repo(source: &str, target_path: &Path) -> Result<()> {
    let target = target_path.to_string_lossy();
    run_git(&["clone", source, &target], None).await?;
    Ok(())
}

/// Ask the remote which commit its default branch points at, without
/// fetching any content. This is the cheap version probe behind idempotent
/// sync.
pub async fn remote_head(repo_path: &Path) -> Result<String> {
    let output = run_git(&["ls-remote", "origin", "HEAD"], Some(repo_path)).await?;
    let commit = output
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if commit.is_empty() {
        return Err(PoolError::Git(
            "ls-remote returned no commit for origin HEAD".into(),
        ));
    }
    Ok(commit)
}

pub async fn fetch(repo_path: &Path) -> Result<()> {
    run_git(&["fetch", "origin"], Some(repo_path)).await?;
    Ok(())
}

pub async fn checkout_detached(repo_path: &Path, commit: &str) -> Result<()> {
    run_git(&["checkout", "--detach", commit], Some(repo_path)).await?;
    Ok(())
}

pub async fn current_commit(repo_path: &Path) -> Result<String> {
    run_git(&["rev-parse", "HEAD"], Some(repo_path)).await
}
