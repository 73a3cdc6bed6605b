//! Shell tool: run a command under `sh -c` with a hard timeout, and the
//! fixed capability reclassification table for write primitives.

use serde::Serialize;
use tokio::process::Command;

use ab_domain::config::ShellConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability reclassification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Commands carrying write primitives are reclassified from `shell.run` to
/// `shell.write` before policy matching. The table is fixed — never
/// model-discretionary.
const WRITE_COMMANDS: &[&str] = &["tee", "rm", "rmdir", "mv", "cp", "truncate", "dd", "mkfs"];

pub fn classify_shell_capability(command: &str) -> &'static str {
    // Any redirection writes.
    if command.contains('>') {
        return "shell.write";
    }
    for token in command.split(|c: char| c.is_whitespace() || c == ';' || c == '|' || c == '&') {
        let token = token.trim();
        if WRITE_COMMANDS.contains(&token) {
            return "shell.write";
        }
    }
    // `sed -i` edits in place.
    if command.contains("sed") && command.split_whitespace().any(|t| t == "-i" || t.starts_with("-i.")) {
        return "shell.write";
    }
    "shell.run"
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ShellOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run a command, killing it at the timeout. Output is truncated to the
/// configured cap so a chatty command can't blow up the model context.
pub async fn run(command: &str, cfg: &ShellConfig) -> ShellOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return ShellOutcome {
                ok: false,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("failed to spawn: {e}")),
            };
        }
    };

    let timeout = std::time::Duration::from_secs(cfg.timeout_s);
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = truncate(&String::from_utf8_lossy(&output.stdout), cfg.max_output_chars);
            let stderr = truncate(&String::from_utf8_lossy(&output.stderr), cfg.max_output_chars);
            ShellOutcome {
                ok: output.status.success(),
                exit_code: output.status.code(),
                stdout,
                stderr,
                error: None,
            }
        }
        Ok(Err(e)) => ShellOutcome {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("wait failed: {e}")),
        },
        Err(_) => ShellOutcome {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("timeout after {}s", cfg.timeout_s)),
        },
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}\n[output truncated]")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_are_shell_run() {
        assert_eq!(classify_shell_capability("echo hi"), "shell.run");
        assert_eq!(classify_shell_capability("ls -la /tmp"), "shell.run");
        assert_eq!(classify_shell_capability("git status"), "shell.run");
        // Words containing write commands as substrings don't count.
        assert_eq!(classify_shell_capability("format --check"), "shell.run");
        assert_eq!(classify_shell_capability("cargo rmeta"), "shell.run");
    }

    #[test]
    fn redirection_is_shell_write() {
        assert_eq!(classify_shell_capability("echo hi > /tmp/x"), "shell.write");
        assert_eq!(classify_shell_capability("echo hi >> /tmp/x"), "shell.write");
    }

    #[test]
    fn write_primitives_are_shell_write() {
        assert_eq!(classify_shell_capability("rm -rf /tmp/x"), "shell.write");
        assert_eq!(classify_shell_capability("cat a | tee b"), "shell.write");
        assert_eq!(classify_shell_capability("sed -i s/a/b/ file"), "shell.write");
        assert_eq!(classify_shell_capability("sed -i.bak s/a/b/ file"), "shell.write");
        assert_eq!(classify_shell_capability("ls; rm x"), "shell.write");
    }

    #[test]
    fn sed_without_in_place_is_read_only() {
        assert_eq!(classify_shell_capability("sed s/a/b/ file"), "shell.run");
    }

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let out = run("echo hi", &ShellConfig::default()).await;
        assert!(out.ok);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "hi\n");
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let out = run("exit 3", &ShellConfig::default()).await;
        assert!(!out.ok);
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn run_times_out() {
        let cfg = ShellConfig {
            timeout_s: 1,
            ..Default::default()
        };
        let out = run("sleep 5", &cfg).await;
        assert!(!out.ok);
        assert!(out.error.as_deref().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn run_truncates_long_output() {
        let cfg = ShellConfig {
            max_output_chars: 10,
            ..Default::default()
        };
        let out = run("printf 'aaaaaaaaaaaaaaaaaaaaaaaa'", &cfg).await;
        assert!(out.stdout.contains("[output truncated]"));
    }
}
