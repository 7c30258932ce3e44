//! Provider and chat settings loading.
//!
//! Secrets never leave this module through `ProviderPublicConfig`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
    DeepSeek,
    Moonshot,
    OpenRouter,
    SiliconCloud,
    Ollama,
    Zhipu,
    Custom,
}

/// Wire-format family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderFamily {
    OpenAiCompatible,
    Anthropic,
    Gemini,
    Ollama,
}

/// Built-in defaults for a provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDefaults {
    pub name: &'static str,
    pub api_url: &'static str,
    pub model: &'static str,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub requires_api_key: bool,
}

impl Provider {
    pub const ALL: [Provider; 10] = [
        Provider::OpenAI,
        Provider::Anthropic,
        Provider::Google,
        Provider::DeepSeek,
        Provider::Moonshot,
        Provider::OpenRouter,
        Provider::SiliconCloud,
        Provider::Ollama,
        Provider::Zhipu,
        Provider::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::DeepSeek => "deepseek",
            Provider::Moonshot => "moonshot",
            Provider::OpenRouter => "openrouter",
            Provider::SiliconCloud => "siliconcloud",
            Provider::Ollama => "ollama",
            Provider::Zhipu => "zhipu",
            Provider::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "openai-compatible" | "openai_compatible" | "compatible" => Some(Provider::Custom),
            "gemini" => Some(Provider::Google),
            "claude" => Some(Provider::Anthropic),
            other => Provider::ALL.into_iter().find(|p| p.as_str() == other),
        }
    }

    pub fn family(self) -> ProviderFamily {
        match self {
            Provider::Anthropic => ProviderFamily::Anthropic,
            Provider::Google => ProviderFamily::Gemini,
            Provider::Ollama => ProviderFamily::Ollama,
            Provider::OpenAI
            | Provider::DeepSeek
            | Provider::Moonshot
            | Provider::OpenRouter
            | Provider::SiliconCloud
            | Provider::Zhipu
            | Provider::Custom => ProviderFamily::OpenAiCompatible,
        }
    }

    pub fn defaults(self) -> ProviderDefaults {
        match self {
            Provider::OpenAI => ProviderDefaults {
                name: "OpenAI",
                api_url: "https://api.openai.com/v1/chat/completions",
                model: "gpt-4o",
                max_tokens: 4096,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::Anthropic => ProviderDefaults {
                name: "Anthropic (Claude)",
                api_url: "https://api.anthropic.com/v1/messages",
                model: "claude-3-5-sonnet-20241022",
                max_tokens: 8192,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::Google => ProviderDefaults {
                name: "Google (Gemini)",
                api_url: "https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent",
                model: "gemini-2.0-flash-exp",
                max_tokens: 8192,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::DeepSeek => ProviderDefaults {
                name: "DeepSeek",
                api_url: "https://api.deepseek.com/v1/chat/completions",
                model: "deepseek-chat",
                max_tokens: 8192,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::Moonshot => ProviderDefaults {
                name: "Moonshot (Kimi)",
                api_url: "https://api.moonshot.cn/v1/chat/completions",
                model: "moonshot-v1-8k",
                max_tokens: 8192,
                temperature: 0.3,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::OpenRouter => ProviderDefaults {
                name: "OpenRouter",
                api_url: "https://openrouter.ai/api/v1/chat/completions",
                model: "anthropic/claude-3.5-sonnet",
                max_tokens: 4096,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::SiliconCloud => ProviderDefaults {
                name: "SiliconCloud",
                api_url: "https://api.siliconflow.cn/v1/chat/completions",
                model: "deepseek-ai/DeepSeek-V3",
                max_tokens: 8192,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
            Provider::Ollama => ProviderDefaults {
                name: "Ollama",
                api_url: "http://localhost:11434/api/chat",
                model: "llama3.2-vision",
                max_tokens: 4096,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: false,
            },
            Provider::Zhipu => ProviderDefaults {
                name: "Zhipu AI (GLM)",
                api_url: "https://open.bigmodel.cn/api/paas/v4/chat/completions",
                model: "glm-4.6v",
                max_tokens: 16384,
                temperature: 0.3,
                top_p: 0.6,
                requires_api_key: true,
            },
            Provider::Custom => ProviderDefaults {
                name: "Custom endpoint",
                api_url: "",
                model: "",
                max_tokens: 4096,
                temperature: 0.7,
                top_p: 1.0,
                requires_api_key: true,
            },
        }
    }
}

fn infer_provider(api_url: &str) -> Provider {
    let url = api_url.trim().to_ascii_lowercase();
    let hosts = [
        ("api.openai.com", Provider::OpenAI),
        ("api.anthropic.com", Provider::Anthropic),
        ("generativelanguage.googleapis.com", Provider::Google),
        ("api.deepseek.com", Provider::DeepSeek),
        ("api.moonshot.cn", Provider::Moonshot),
        ("openrouter.ai", Provider::OpenRouter),
        ("api.siliconflow.cn", Provider::SiliconCloud),
        ("localhost:11434", Provider::Ollama),
        ("127.0.0.1:11434", Provider::Ollama),
        ("open.bigmodel.cn", Provider::Zhipu),
    ];
    hosts
        .into_iter()
        .find(|(host, _)| url.contains(host))
        .map(|(_, provider)| provider)
        .unwrap_or(Provider::Custom)
}

/// Everything an adapter needs to talk to one provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub provider: Provider,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl ProviderSettings {
    pub fn for_provider(provider: Provider) -> Self {
        let defaults = provider.defaults();
        Self {
            provider,
            api_url: defaults.api_url.to_string(),
            api_key: String::new(),
            model: defaults.model.to_string(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            top_p: defaults.top_p,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.provider.defaults().requires_api_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Zh,
    En,
}

impl Language {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Language::En,
            _ => Language::Zh,
        }
    }
}

/// Chat behaviour settings for one UI context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub provider: ProviderSettings,
    pub history_turns: usize,
    pub system_prompt: String,
    pub language: Language,
    pub private_mode: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::for_provider(Provider::OpenAI),
            history_turns: 4,
            system_prompt: String::new(),
            language: Language::default(),
            private_mode: false,
        }
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(keys: &[&str]) -> Option<T> {
    env_first(keys).and_then(|v| v.parse::<T>().ok())
}

fn env_flag(keys: &[&str]) -> bool {
    env_first(keys)
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(false)
}

/// Load chat settings from `.env`/environment.
///
/// Reads:
/// - `POLARIS_PROVIDER` (fallback: `AI_PROVIDER`)
/// - `POLARIS_API_URL` (fallback: `AI_BASE_URL`)
/// - `POLARIS_API_KEY` (fallback: `AI_API_KEY`, `OPENAI_API_KEY`)
/// - `POLARIS_MODEL` (fallback: `AI_MODEL`)
/// - `POLARIS_MAX_TOKENS`, `POLARIS_TEMPERATURE`, `POLARIS_TOP_P`
/// - `POLARIS_HISTORY_TURNS`, `POLARIS_SYSTEM_PROMPT`, `POLARIS_LANGUAGE`, `POLARIS_PRIVATE_MODE`
pub fn load_chat_settings() -> ChatSettings {
    let _ = dotenvy::dotenv();

    let api_url = env_first(&["POLARIS_API_URL", "AI_BASE_URL"]);
    let provider = env_first(&["POLARIS_PROVIDER", "AI_PROVIDER"])
        .and_then(|v| Provider::parse(&v))
        .or_else(|| api_url.as_deref().map(infer_provider))
        .unwrap_or(Provider::OpenAI);

    let mut settings = ProviderSettings::for_provider(provider);
    if let Some(api_url) = api_url {
        settings.api_url = api_url;
    }
    if let Some(api_key) = env_first(&["POLARIS_API_KEY", "AI_API_KEY", "OPENAI_API_KEY"]) {
        settings.api_key = api_key;
    }
    if let Some(model) = env_first(&["POLARIS_MODEL", "AI_MODEL"]) {
        settings.model = model;
    }
    if let Some(max_tokens) = env_parse::<u32>(&["POLARIS_MAX_TOKENS"]) {
        settings.max_tokens = max_tokens.max(1);
    }
    if let Some(temperature) = env_parse::<f64>(&["POLARIS_TEMPERATURE"]) {
        settings.temperature = temperature.clamp(0.0, 2.0);
    }
    if let Some(top_p) = env_parse::<f64>(&["POLARIS_TOP_P"]) {
        settings.top_p = top_p.clamp(0.0, 1.0);
    }

    let defaults = ChatSettings::default();
    ChatSettings {
        provider: settings,
        history_turns: env_parse::<usize>(&["POLARIS_HISTORY_TURNS"])
            .map(|v| v.clamp(0, 50))
            .unwrap_or(defaults.history_turns),
        system_prompt: env_first(&["POLARIS_SYSTEM_PROMPT"]).unwrap_or_default(),
        language: env_first(&["POLARIS_LANGUAGE"])
            .map(|v| Language::parse(&v))
            .unwrap_or_default(),
        private_mode: env_flag(&["POLARIS_PRIVATE_MODE"]),
    }
}

/// Provider configuration that is safe to show in any window (secrets omitted).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPublicConfig {
    pub provider: Provider,
    pub name: String,
    pub api_url: String,
    pub model: String,
    pub has_api_key: bool,
}

impl From<&ProviderSettings> for ProviderPublicConfig {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            provider: settings.provider,
            name: settings.provider.defaults().name.to_string(),
            api_url: settings.api_url.clone(),
            model: settings.model.clone(),
            has_api_key: !settings.api_key.is_empty(),
        }
    }
}
