//! Centralized prompts for AI services.
//!
//! Single source of truth for the system message sent at the head of every
//! chat request. Edit this file to customize AI behavior.

use super::config::Language;

// ============================================================================
// SYSTEM PROMPTS
// ============================================================================

pub const BASE_SYSTEM_PROMPT_ZH: &str = r#"你是 Polaris，一个运行在用户桌面上的 AI 助手。

## 交互原则

- 回答准确可靠，不确定时明确说明
- 表达简洁清晰，避免冗长
- 关注用户的实际需求，给出可执行的建议
- 涉及危险操作时给出明确警告

## 命令执行

当用户需要执行系统命令时，使用 <command>命令</command> 标签包裹，每个标签只放一条命令，并说明命令的作用。

## 思考过程

对于需要推理的复杂问题，先在 <think> 标签中写出分析过程，再给出最终回答。"#;

pub const BASE_SYSTEM_PROMPT_EN: &str = r#"You are Polaris, an AI assistant running on the user's desktop.

## Interaction Principles

- Be accurate and say so when you are unsure
- Be concise and clear
- Focus on what the user actually needs and give actionable suggestions
- Warn clearly before anything destructive

## Running Commands

When the user needs a system command, wrap it in <command>command</command> tags, one command per tag, and explain what it does.

## Thinking

For problems that need reasoning, write your analysis inside <think> tags first, then give the final answer."#;

// ============================================================================
// BUILDERS
// ============================================================================

/// Human-readable name of the host OS.
pub fn os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macOS",
        "windows" => "Windows",
        "linux" => "Linux",
        _ => "Unknown",
    }
}

fn environment_section(language: Language) -> String {
    let os = os_name();
    match language {
        Language::En => format!(
            "\n\n## System Environment\n\n- **Operating System**: {os}\n- **Important**: Only provide commands that work on {os}."
        ),
        Language::Zh => format!(
            "\n\n## 系统环境\n\n- **操作系统**: {os}\n- **重要提示**: 只提供适用于 {os} 的命令。"
        ),
    }
}

/// Base prompt for `language`, the host environment, then the user's own instructions if any.
pub fn build_system_prompt(user_prompt: &str, language: Language) -> String {
    let base = match language {
        Language::En => BASE_SYSTEM_PROMPT_EN,
        Language::Zh => BASE_SYSTEM_PROMPT_ZH,
    };
    let mut prompt = format!("{base}{}", environment_section(language));

    let user_prompt = user_prompt.trim();
    if !user_prompt.is_empty() {
        let label = match language {
            Language::En => "## Custom Instructions",
            Language::Zh => "## 用户自定义指令",
        };
        prompt.push_str(&format!("\n\n{label}\n\n{user_prompt}"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_instructions_are_appended_last() {
        let prompt = build_system_prompt("  Answer in haiku.  ", Language::En);
        assert!(prompt.starts_with(BASE_SYSTEM_PROMPT_EN));
        assert!(prompt.contains("## System Environment"));
        assert!(prompt.ends_with("## Custom Instructions\n\nAnswer in haiku."));
    }

    #[test]
    fn blank_user_prompt_adds_no_section() {
        let prompt = build_system_prompt("   ", Language::Zh);
        assert!(prompt.starts_with(BASE_SYSTEM_PROMPT_ZH));
        assert!(!prompt.contains("用户自定义指令"));
    }
}
