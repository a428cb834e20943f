//! Shell execution for `run:` steps.

use std::process::Stdio;

use camino::Utf8Path;
use indexmap::IndexMap;
use maru2_models::Shell;
use owo_colors::OwoColorize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::outputs::parse_outputs;
use super::until;

/// The env var children write their outputs through.
pub const OUTPUT_ENV: &str = "MARU2_OUTPUT";

/// Errors produced while running a script.
#[derive(Debug, Error)]
pub(crate) enum ScriptError {
    /// The child exited unsuccessfully.
    #[error("script failed: {0}")]
    Failed(std::process::ExitStatus),

    /// The surrounding context was cancelled; the child was killed.
    #[error("step cancelled; child killed")]
    Cancelled,

    /// The step's deadline passed; the child was killed.
    #[error("step timed out; child killed")]
    Timeout,

    /// Spawning or file plumbing failed.
    #[error("I/O error running script")]
    Io(#[from] std::io::Error),
}

/// Maps a shell to its program and argument vector.
fn shell_args(shell: Shell, script: &str) -> (&'static str, Vec<String>) {
    match shell {
        Shell::Sh => (
            "sh",
            vec!["-e".into(), "-c".into(), script.into()],
        ),
        Shell::Bash => (
            "bash",
            vec![
                "-e".into(),
                "-o".into(),
                "pipefail".into(),
                "-c".into(),
                script.into(),
            ],
        ),
        Shell::Pwsh | Shell::Powershell => {
            warn!("{shell} support is untested");
            let program = match shell {
                Shell::Pwsh => "pwsh",
                _ => "powershell",
            };
            (
                program,
                vec![
                    "-Command".into(),
                    format!(
                        "$ErrorActionPreference='Stop'; {script}; if (Test-Path variable:\\LASTEXITCODE) {{ exit $LASTEXITCODE }}"
                    ),
                ],
            )
        }
    }
}

/// Runs a fully-templated script and returns the key=value outputs its
/// child wrote to `$MARU2_OUTPUT`.
///
/// The outputs temp file is removed when this returns, success or not.
pub(super) async fn run_script(
    script: &str,
    shell: Shell,
    dir: &Utf8Path,
    mut env: Vec<(String, String)>,
    mute: bool,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<IndexMap<String, String>, ScriptError> {
    let output_file = tempfile::NamedTempFile::new()?;
    env.push((
        OUTPUT_ENV.to_string(),
        output_file.path().to_string_lossy().into_owned(),
    ));

    let (program, args) = shell_args(shell, script);
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .env_clear()
        .envs(env)
        .kill_on_drop(true);

    if mute {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let mut child = command.spawn()?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ScriptError::Cancelled);
        }
        _ = until(deadline) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ScriptError::Timeout);
        }
    };

    if !status.success() {
        return Err(ScriptError::Failed(status));
    }

    let contents = std::fs::read_to_string(output_file.path()).unwrap_or_default();
    Ok(parse_outputs(&contents))
}

/// Prints a script before it runs, with CI log grouping when the host
/// supports it. `NO_COLOR` (and non-tty stdout) strip the styling via
/// anstream.
pub(super) fn print_script(title: &str, script: &str) {
    let github = std::env::var_os("GITHUB_ACTIONS").is_some();
    let gitlab = std::env::var_os("GITLAB_CI").is_some();

    let section = sanitize_section(title);
    if github {
        anstream::println!("::group::{title}");
    } else if gitlab {
        let now = chrono::Utc::now().timestamp();
        anstream::println!("\x1b[0Ksection_start:{now}:{section}[collapsed=true]\r\x1b[0K{title}");
    }

    for line in script.trim_end().lines() {
        anstream::println!("{} {}", ">".dimmed(), line.dimmed());
    }

    if github {
        anstream::println!("::endgroup::");
    } else if gitlab {
        let now = chrono::Utc::now().timestamp();
        anstream::println!("\x1b[0Ksection_end:{now}:{section}\r\x1b[0K");
    }
}

fn sanitize_section(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;

    fn cwd() -> camino::Utf8PathBuf {
        camino::Utf8PathBuf::from_path_buf(std::env::current_dir().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn captures_outputs_on_success() {
        let outputs = run_script(
            "echo \"k=v\" >> $MARU2_OUTPUT",
            Shell::Sh,
            &cwd(),
            std::env::vars().collect(),
            true,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outputs["k"], "v");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = run_script(
            "exit 3",
            Shell::Sh,
            &cwd(),
            std::env::vars().collect(),
            true,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptError::Failed(status) if status.code() == Some(3)));
    }

    #[tokio::test]
    async fn sh_is_errexit() {
        // `-e` makes the first failing command abort the script.
        let err = run_script(
            "false\necho should-not-run",
            Shell::Sh,
            &cwd(),
            std::env::vars().collect(),
            true,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptError::Failed(_)));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let start = std::time::Instant::now();
        let err = run_script(
            "sleep 5",
            Shell::Sh,
            &cwd(),
            std::env::vars().collect(),
            true,
            Some(Instant::now() + Duration::from_millis(50)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = run_script(
            "sleep 5",
            Shell::Sh,
            &cwd(),
            std::env::vars().collect(),
            true,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptError::Cancelled));
    }
}
