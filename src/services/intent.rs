//! Picks how deep to read the UI tree, and which app to read, for one question.
//!
//! A small non-streaming completion classifies the question. Any failure
//! (no key, timeout, HTTP error, unparsable reply) falls back to keyword
//! matching, so callers always get an [`Intent`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::plugins::ui_tree::{app_windows_for_ai, UiTreeSource, WindowTree};
use crate::services::ai::{CanonicalMessage, CanonicalRequest, ContentPart, PromptRole, StreamProxy};
use crate::services::config::ProviderSettings;

pub const MIN_INTENT_DEPTH: usize = 3;
pub const MAX_INTENT_DEPTH: usize = 8;
const FALLBACK_DEPTH: usize = 6;
const FALLBACK_CONFIDENCE: f64 = 0.5;
const KEYWORD_CONFIDENCE: f64 = 0.7;
const INTENT_MAX_TOKENS: u32 = 150;
const INTENT_TIMEOUT: Duration = Duration::from_secs(10);

const BOX_MARKERS: [&str; 2] = ["<|begin_of_box|>", "<|end_of_box|>"];
const PUNCTUATION: &[char] = &[
    '，', '。', '！', '？', '、', '；', '：', '“', '”', '‘', '’', '（', '）', '《', '》', '【', '】', '"',
    ',', '.', '!', '?', ';', ':',
];
const FILLER_PHRASES: [&str; 4] = ["里有", "有什么", "是什么", "里面"];
const STOPWORDS: [&str; 17] = [
    "的", "里", "面", "中", "在", "有", "是", "了", "吗", "呢", "啊", "什么", "哪些", "怎么", "如何",
    "告诉", "我",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStrategy {
    /// Layout questions: a shallow tree is enough.
    Structure,
    Interaction,
    /// Reading text on screen: go deep.
    Content,
    Focused,
    #[default]
    Default,
}

impl IntentStrategy {
    pub fn depth(self) -> usize {
        match self {
            IntentStrategy::Structure => 3,
            IntentStrategy::Interaction | IntentStrategy::Focused => 5,
            IntentStrategy::Content => 8,
            IntentStrategy::Default => FALLBACK_DEPTH,
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "structure" => IntentStrategy::Structure,
            "interaction" => IntentStrategy::Interaction,
            "content" => IntentStrategy::Content,
            "focused" => IntentStrategy::Focused,
            _ => IntentStrategy::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub depth: usize,
    pub target_app: Option<String>,
    pub strategy: IntentStrategy,
    pub confidence: f64,
}

impl Intent {
    fn keyword(strategy: IntentStrategy, target_app: Option<String>) -> Self {
        let confidence = match strategy {
            IntentStrategy::Default => FALLBACK_CONFIDENCE,
            _ => KEYWORD_CONFIDENCE,
        };
        Self {
            depth: strategy.depth(),
            target_app,
            strategy,
            confidence,
        }
    }
}

/// Application name and title of one visible window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLabel {
    pub app: String,
    pub title: String,
}

impl From<&WindowTree> for WindowLabel {
    fn from(window: &WindowTree) -> Self {
        Self {
            app: window.application_name.clone().unwrap_or_default(),
            title: window.window_title.clone().unwrap_or_default(),
        }
    }
}

fn category_patterns() -> &'static [(IntentStrategy, Regex); 4] {
    static PATTERNS: OnceLock<[(IntentStrategy, Regex); 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let pattern = |re: &str| Regex::new(re).expect("valid intent regex");
        [
            (
                IntentStrategy::Structure,
                pattern(r"布局|结构|界面|窗口|有哪些|组成|\b(?:layout|structure|windows?|interface)\b"),
            ),
            (
                IntentStrategy::Interaction,
                pattern(r"点击|按钮|输入|操作|怎么|如何|执行|\b(?:click|button|press|type|how)\b"),
            ),
            (
                IntentStrategy::Content,
                pattern(r"内容|文字|文本|显示|写着|说|读|里面|\b(?:content|text|says?|read|shows?)\b"),
            ),
            (
                IntentStrategy::Focused,
                pattern(r"当前|正在|现在|这个|这里|\b(?:current|now|this)\b"),
            ),
        ]
    })
}

fn json_object() -> &'static Regex {
    static OBJECT: OnceLock<Regex> = OnceLock::new();
    OBJECT.get_or_init(|| Regex::new(r"(?s)\{.*?\}").expect("valid json object regex"))
}

fn keywords(message: &str) -> Vec<String> {
    let mut text = message.replace(PUNCTUATION, " ");
    for phrase in FILLER_PHRASES {
        text = text.replace(phrase, " ");
    }
    text.split_whitespace()
        .filter(|word| word.chars().count() > 1 && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// First window whose app is named in the message: full name, then a
/// keyword inside the app name (or the app name inside a keyword), then title.
fn match_app(message: &str, keywords: &[String], windows: &[WindowLabel]) -> Option<String> {
    for window in windows {
        let app = window.app.to_lowercase();
        if app.is_empty() {
            continue;
        }
        if message.contains(&app) {
            return Some(window.app.clone());
        }
        let by_keyword = keywords.iter().any(|keyword| {
            app.contains(keyword.as_str())
                || (app.chars().count() >= 3 && keyword.contains(app.as_str()))
        });
        if by_keyword {
            return Some(window.app.clone());
        }
        let title = window.title.to_lowercase();
        if !title.is_empty() && message.contains(&title) {
            return Some(window.app.clone());
        }
    }
    None
}

/// Offline classification by keyword lists.
pub fn detect_by_keywords(message: &str, windows: &[WindowLabel]) -> Intent {
    let message = message.to_lowercase();
    let target_app = match_app(&message, &keywords(&message), windows);
    let strategy = category_patterns()
        .iter()
        .find(|(_, pattern)| pattern.is_match(&message))
        .map(|(strategy, _)| *strategy)
        .unwrap_or_default();
    Intent::keyword(strategy, target_app)
}

fn number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First JSON object in a model reply, clamped into range. `None` when the
/// reply carries neither a depth nor a strategy.
pub fn parse_intent_reply(reply: &str) -> Option<Intent> {
    let mut text = reply.to_string();
    for marker in BOX_MARKERS {
        text = text.replace(marker, "");
    }
    let object = json_object().find(&text)?;
    let value: serde_json::Value = serde_json::from_str(object.as_str()).ok()?;

    let depth = value.get("depth").and_then(number);
    let strategy = value.get("strategy").and_then(|s| s.as_str());
    if depth.is_none() && strategy.is_none() {
        return None;
    }
    let target_app = value
        .get("targetApp")
        .and_then(|app| app.as_str())
        .map(str::trim)
        .filter(|app| !app.is_empty() && *app != "null" && *app != "undefined")
        .map(str::to_string);

    Some(Intent {
        depth: depth
            .filter(|d| *d >= 1.0)
            .map(|d| (d as usize).clamp(MIN_INTENT_DEPTH, MAX_INTENT_DEPTH))
            .unwrap_or(FALLBACK_DEPTH),
        target_app,
        strategy: strategy.map(IntentStrategy::parse).unwrap_or_default(),
        confidence: value
            .get("confidence")
            .and_then(number)
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(FALLBACK_CONFIDENCE),
    })
}

pub fn intent_prompt(message: &str, windows: &[WindowLabel]) -> String {
    let window_list = windows
        .iter()
        .map(|w| format!("- {}: {}", w.app, w.title))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Classify the user's question about their screen. Reply with JSON only.\n\n\
         Windows:\n{window_list}\n\n\
         Question: {message}\n\n\
         Format: {{\"depth\":number,\"targetApp\":\"app name or null\",\"strategy\":\"type\",\"confidence\":number}}\n\n\
         Rules:\n\
         - depth: content=8, interaction=5, structure=3, otherwise 6\n\
         - targetApp: the full app name from the window list that the question refers to (partial names count), else null\n\
         - strategy: content, interaction, structure, focused or default\n\
         - confidence: 0 to 1\n\n\
         Example: question \"what's in clash\" with window \"Clash Verge\" gives \
         {{\"depth\":8,\"targetApp\":\"Clash Verge\",\"strategy\":\"content\",\"confidence\":0.9}}"
    )
}

async fn detect_by_model(
    proxy: &StreamProxy,
    settings: &ProviderSettings,
    message: &str,
    windows: &[WindowLabel],
) -> Result<Intent, String> {
    let mut settings = settings.clone();
    settings.temperature = 0.0;
    settings.max_tokens = INTENT_MAX_TOKENS;
    let request = CanonicalRequest {
        messages: vec![CanonicalMessage {
            role: PromptRole::User,
            content: vec![ContentPart::text(intent_prompt(message, windows))],
        }],
    };
    let adapter = settings.provider.adapter();
    let (url, spec) = adapter.build_completion_request(&request, &settings);

    let response = tokio::time::timeout(INTENT_TIMEOUT, proxy.request_json(&url, spec))
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;
    if !response.ok {
        return Err(format!("HTTP {}", response.status));
    }
    let reply = adapter
        .completion_text(&response.data)
        .ok_or_else(|| "empty reply".to_string())?;
    log::debug!("Intent reply: {}", reply);
    parse_intent_reply(&reply).ok_or_else(|| format!("unparsable reply: {reply}"))
}

/// Model classification with keyword fallback.
pub async fn detect_intent(
    proxy: &StreamProxy,
    settings: &ProviderSettings,
    message: &str,
    windows: &[WindowLabel],
) -> Intent {
    if settings.requires_api_key() && settings.api_key.trim().is_empty() {
        log::debug!("No API key; classifying by keywords");
        return detect_by_keywords(message, windows);
    }
    match detect_by_model(proxy, settings, message, windows).await {
        Ok(intent) => {
            log::info!(
                "Intent: {:?} depth {} app {:?} ({:.2})",
                intent.strategy,
                intent.depth,
                intent.target_app,
                intent.confidence
            );
            intent
        }
        Err(err) => {
            log::warn!("Intent detection failed ({err}); falling back to keywords");
            detect_by_keywords(message, windows)
        }
    }
}

/// UI tree context sized for `message`: classify first, then capture the
/// target app at the chosen depth.
pub async fn ui_context_for_message(
    proxy: &StreamProxy,
    settings: &ProviderSettings,
    source: &dyn UiTreeSource,
    message: &str,
    max_chars: usize,
) -> Option<String> {
    if !source.is_supported() || !source.check_permission() {
        return app_windows_for_ai(source, None, None, max_chars);
    }
    let labels: Vec<WindowLabel> = match source.active_windows(1) {
        Ok(windows) => windows.iter().map(WindowLabel::from).collect(),
        Err(err) => {
            log::warn!("Failed to list windows: {}", err);
            Vec::new()
        }
    };
    let intent = detect_intent(proxy, settings, message, &labels).await;
    app_windows_for_ai(source, intent.target_app.as_deref(), Some(intent.depth), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ui_tree::{SnapshotSource, UiTreeNode, UnsupportedSource, DEFAULT_MAX_CHARS};
    use crate::services::config::Provider;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn labels() -> Vec<WindowLabel> {
        vec![
            WindowLabel {
                app: "Finder".to_string(),
                title: "Downloads".to_string(),
            },
            WindowLabel {
                app: "Clash Verge".to_string(),
                title: "Proxies".to_string(),
            },
        ]
    }

    fn settings_for(server: &MockServer) -> ProviderSettings {
        let mut settings = ProviderSettings::for_provider(Provider::OpenAI);
        settings.api_url = format!("{}/v1/chat/completions", server.uri());
        settings.api_key = "sk-test".to_string();
        settings
    }

    #[test]
    fn keywords_find_partial_app_names() {
        let intent = detect_by_keywords("clash有什么", &labels());
        assert_eq!(intent.target_app.as_deref(), Some("Clash Verge"));
        assert_eq!(intent.strategy, IntentStrategy::Default);
        assert_eq!(intent.depth, 6);
        assert_eq!(intent.confidence, 0.5);

        let by_title = detect_by_keywords("what is in downloads", &labels());
        assert_eq!(by_title.target_app.as_deref(), Some("Finder"));
    }

    #[test]
    fn keyword_categories_pick_depth() {
        let structure = detect_by_keywords("这个窗口的布局", &[]);
        assert_eq!((structure.strategy, structure.depth), (IntentStrategy::Structure, 3));

        let interaction = detect_by_keywords("How do I click send?", &[]);
        assert_eq!(interaction.strategy, IntentStrategy::Interaction);
        assert_eq!(interaction.depth, 5);
        assert_eq!(interaction.confidence, 0.7);

        let content = detect_by_keywords("读一下文本", &[]);
        assert_eq!((content.strategy, content.depth), (IntentStrategy::Content, 8));

        let focused = detect_by_keywords("现在呢", &[]);
        assert_eq!(focused.strategy, IntentStrategy::Focused);

        // "show" must not count as "how".
        let default = detect_by_keywords("hello there", &[]);
        assert_eq!(default.strategy, IntentStrategy::Default);
        assert_eq!(detect_by_keywords("show me", &[]).strategy, IntentStrategy::Content);
    }

    #[test]
    fn reply_is_extracted_and_clamped() {
        let intent = parse_intent_reply(
            "<|begin_of_box|>```json\n{\"depth\":12,\"targetApp\":\"Clash Verge\",\"strategy\":\"content\",\"confidence\":1.7}\n```<|end_of_box|>",
        )
        .unwrap();
        assert_eq!(
            intent,
            Intent {
                depth: 8,
                target_app: Some("Clash Verge".to_string()),
                strategy: IntentStrategy::Content,
                confidence: 1.0,
            }
        );

        let sparse = parse_intent_reply("{\"depth\":\"2\",\"targetApp\":\"null\"}").unwrap();
        assert_eq!(sparse.depth, 3);
        assert_eq!(sparse.target_app, None);
        assert_eq!(sparse.strategy, IntentStrategy::Default);
        assert_eq!(sparse.confidence, 0.5);

        assert_eq!(parse_intent_reply("{}"), None);
        assert_eq!(parse_intent_reply("no json here"), None);
    }

    #[tokio::test]
    async fn model_reply_drives_the_intent() {
        let server = MockServer::start().await;
        let reply = serde_json::json!({
            "choices": [{ "message": {
                "content": "{\"depth\":8,\"targetApp\":\"Clash Verge\",\"strategy\":\"content\",\"confidence\":0.9}"
            } }]
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("\"stream\":false"))
            .and(body_string_contains("\"max_tokens\":150"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply))
            .expect(1)
            .mount(&server)
            .await;

        let intent = detect_intent(&StreamProxy::default(), &settings_for(&server), "clash里有什么", &labels()).await;
        assert_eq!(intent.strategy, IntentStrategy::Content);
        assert_eq!(intent.depth, 8);
        assert_eq!(intent.target_app.as_deref(), Some("Clash Verge"));
    }

    #[tokio::test]
    async fn failed_call_falls_back_to_keywords() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let intent = detect_intent(&StreamProxy::default(), &settings_for(&server), "clash 的布局", &labels()).await;
        assert_eq!(intent.strategy, IntentStrategy::Structure);
        assert_eq!(intent.target_app.as_deref(), Some("Clash Verge"));
        assert_eq!(intent.confidence, 0.7);
    }

    #[tokio::test]
    async fn missing_key_skips_the_network() {
        let mut settings = ProviderSettings::for_provider(Provider::OpenAI);
        settings.api_url = "http://127.0.0.1:9/v1/chat/completions".to_string();
        let intent = detect_intent(&StreamProxy::default(), &settings, "当前窗口", &[]).await;
        assert_eq!(intent.strategy, IntentStrategy::Structure);
    }

    #[tokio::test]
    async fn context_targets_the_detected_app() {
        let server = MockServer::start().await;
        let reply = serde_json::json!({
            "choices": [{ "message": { "content": "{\"depth\":8,\"targetApp\":\"Clash Verge\",\"strategy\":\"content\"}" } }]
        });
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply))
            .mount(&server)
            .await;
        let window = |app: &str, text: &str| WindowTree {
            application_name: Some(app.to_string()),
            window_title: Some(app.to_string()),
            ui_tree: Some(UiTreeNode::new("AXWindow").with_children(vec![
                UiTreeNode::new("AXButton")
                    .with_children(vec![UiTreeNode::new("AXStaticText").with_value(text)]),
            ])),
            ..Default::default()
        };
        let source = SnapshotSource::new(vec![window("Finder", "Eject"), window("Clash Verge", "Connect")]);

        let xml = ui_context_for_message(
            &StreamProxy::default(),
            &settings_for(&server),
            &source,
            "what does clash show",
            DEFAULT_MAX_CHARS,
        )
        .await
        .unwrap();
        assert!(xml.contains("Connect"));
        assert!(!xml.contains("Eject"));

        let none = ui_context_for_message(
            &StreamProxy::default(),
            &settings_for(&server),
            &UnsupportedSource,
            "anything",
            DEFAULT_MAX_CHARS,
        )
        .await;
        assert_eq!(none, None);
    }
}
