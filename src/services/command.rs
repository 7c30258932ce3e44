//! Shell commands proposed by the assistant inside `<command>…</command>`
//! blocks, and a runner that executes them only after approval.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::services::ai::ChatError;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_COMMAND_OUTPUT: usize = 10 * 1024 * 1024;

const COMMAND_KEYWORDS: [&str; 25] = [
    "执行", "运行", "命令", "帮我", "帮忙", "列出", "显示", "查看", "创建", "删除", "查找", "搜索",
    "安装", "启动", "停止", "execute", "run", "command", "list", "show", "create", "delete",
    "find", "search", "install",
];

fn command_block() -> &'static Regex {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    BLOCK.get_or_init(|| Regex::new(r"(?s)<command>(.*?)</command>").expect("valid command regex"))
}

/// Trimmed, non-empty bodies of every `<command>` block, in order.
pub fn extract_commands(content: &str) -> Vec<String> {
    command_block()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().trim())
        .filter(|body| !body.is_empty())
        .map(str::to_string)
        .collect()
}

/// `content` without its command blocks.
pub fn strip_command_blocks(content: &str) -> String {
    command_block().replace_all(content, "").trim().to_string()
}

/// Whether a user message plausibly asks for something to be run.
pub fn has_command_intent(content: &str) -> bool {
    let content = content.to_lowercase();
    COMMAND_KEYWORDS.iter().any(|keyword| content.contains(keyword))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Asked once per command before anything runs.
#[async_trait]
pub trait CommandApproval: Send + Sync {
    async fn approve(&self, command: &str) -> bool;
}

/// For callers that already confirmed with the user (the desktop dialog).
pub struct PreApproved;

#[async_trait]
impl CommandApproval for PreApproved {
    async fn approve(&self, _command: &str) -> bool {
        true
    }
}

pub struct DenyAll;

#[async_trait]
impl CommandApproval for DenyAll {
    async fn approve(&self, _command: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = if cfg!(windows) {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C");
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c");
        cmd
    };
    cmd.arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Lossy UTF-8, trimmed and capped at [`MAX_COMMAND_OUTPUT`] bytes.
fn capped_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= MAX_COMMAND_OUTPUT {
        return text.to_string();
    }
    let mut end = MAX_COMMAND_OUTPUT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

impl CommandRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `command` through the platform shell once `approval` agrees.
    /// A declined command is `Err(cancelled)`; spawn failures and timeouts
    /// come back as an unsuccessful [`CommandResult`].
    pub async fn run(
        &self,
        command: &str,
        approval: &dyn CommandApproval,
    ) -> Result<CommandResult, ChatError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ChatError::invalid_request("Empty command"));
        }
        if !approval.approve(command).await {
            log::info!("Command declined: {}", command);
            return Err(ChatError::cancelled());
        }

        log::info!("Running command: {}", command);
        let child = match shell(command).spawn() {
            Ok(child) => child,
            Err(err) => {
                log::warn!("Failed to spawn command: {}", err);
                return Ok(CommandResult {
                    success: false,
                    output: String::new(),
                    error: Some(err.to_string()),
                    exit_code: None,
                });
            }
        };

        // Dropping the wait future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Ok(CommandResult {
                    success: false,
                    output: String::new(),
                    error: Some(err.to_string()),
                    exit_code: None,
                })
            }
            Err(_) => {
                log::warn!("Command timed out after {:?}: {}", self.timeout, command);
                return Ok(CommandResult {
                    success: false,
                    output: String::new(),
                    error: Some(format!("Command timed out after {}s", self.timeout.as_secs_f32())),
                    exit_code: None,
                });
            }
        };

        let stdout = capped_text(&output.stdout);
        let stderr = capped_text(&output.stderr);
        let success = output.status.success();
        log::debug!(
            "Command exited with {:?} ({} bytes of output)",
            output.status.code(),
            stdout.len() + stderr.len()
        );
        Ok(CommandResult {
            success,
            output: if stdout.is_empty() { stderr.clone() } else { stdout },
            error: (!success && !stderr.is_empty()).then_some(stderr),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_trimmed_non_empty_blocks() {
        let reply = "Try this:\n<command>\n  ls -la\n</command>\nthen <command> </command> and\n<command>echo \"a\nb\"</command>";
        assert_eq!(extract_commands(reply), vec!["ls -la".to_string(), "echo \"a\nb\"".to_string()]);
        assert_eq!(strip_command_blocks(reply), "Try this:\n\nthen  and");
        assert!(extract_commands("no commands <command>unterminated").is_empty());
    }

    #[test]
    fn command_intent_keywords() {
        assert!(has_command_intent("帮我列出桌面文件"));
        assert!(has_command_intent("Please RUN the tests"));
        assert!(!has_command_intent("what a nice day"));
    }

    #[test]
    fn output_is_capped_on_a_char_boundary() {
        let text = "答".repeat(MAX_COMMAND_OUTPUT / 3 + 1);
        let capped = capped_text(text.as_bytes());
        assert!(capped.len() <= MAX_COMMAND_OUTPUT);
        assert!(capped.chars().all(|c| c == '答'));
    }

    #[tokio::test]
    async fn declined_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let command = format!("echo hi > \"{}\"", marker.display());
        let result = CommandRunner::default().run(&command, &DenyAll).await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn approved_command_reports_output() {
        let result = CommandRunner::default().run("echo hello", &PreApproved).await.unwrap();
        assert_eq!(
            result,
            CommandResult {
                success: true,
                output: "hello".to_string(),
                error: None,
                exit_code: Some(0),
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_stderr_and_code() {
        let result = CommandRunner::default()
            .run("echo oops >&2; exit 3", &PreApproved)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "oops");
        assert_eq!(result.error.as_deref(), Some("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = CommandRunner::with_timeout(Duration::from_millis(200));
        let result = runner.run("sleep 5", &PreApproved).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
