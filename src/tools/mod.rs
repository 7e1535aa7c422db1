//! Tool capability: `{name, description, call}` implementations an agent
//! driver can dispatch to, plus best-effort parsing of their raw input.

pub mod mock;
pub mod translator;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::cancellation::CallContext;
use crate::translate::TranslateError;

pub use self::mock::{MockCalculator, MockTranslator};
pub use self::translator::TranslatorTool;

pub const DEFAULT_SOURCE_LANGUAGE: &str = "English";
pub const DEFAULT_TARGET_LANGUAGE: &str = "Chinese";

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn call(&self, ctx: &CallContext, input: &str) -> Result<String, TranslateError>;
}

/// A translation request recovered from raw tool input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Deserialize)]
struct ToolPayload {
    #[serde(default)]
    text: String,
    #[serde(default)]
    source_language: String,
    #[serde(default)]
    target_language: String,
}

fn quoted_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).expect("valid quoted-text regex"))
}

fn language_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bfrom\s+([A-Za-z][A-Za-z\- ]*?)\s+to\s+([A-Za-z][A-Za-z\-]*)")
            .expect("valid language regex")
    })
}

impl ToolRequest {
    /// Parse raw input. A JSON object with `text`, `source_language` and
    /// `target_language` is taken as-is; anything else is free-form text.
    /// Missing languages default to English → Chinese. Best-effort only.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            if let Ok(payload) = serde_json::from_str::<ToolPayload>(trimmed) {
                if !payload.text.is_empty() {
                    return Self::with_defaults(
                        payload.text,
                        payload.source_language,
                        payload.target_language,
                    );
                }
            }
        }
        Self::parse_free_form(trimmed)
    }

    fn parse_free_form(input: &str) -> Self {
        let (source, target) = match language_pattern().captures(input) {
            Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
            None => (String::new(), String::new()),
        };

        let quoted = quoted_pattern().captures(input).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
        });
        let text = match quoted {
            Some(text) => text,
            None => input.trim_matches(|c| c == '\'' || c == '"').trim().to_string(),
        };

        Self::with_defaults(text, source, target)
    }

    fn with_defaults(text: String, source: String, target: String) -> Self {
        let pick = |value: String, default: &str| {
            let value = value.trim().to_string();
            if value.is_empty() {
                default.to_string()
            } else {
                value
            }
        };
        Self {
            text,
            source_language: pick(source, DEFAULT_SOURCE_LANGUAGE),
            target_language: pick(target, DEFAULT_TARGET_LANGUAGE),
        }
    }
}

/// Registry of tools addressable by name.
#[derive(Default, Clone)]
pub struct Toolbox {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the offline mock tools.
    pub fn with_mocks() -> Self {
        let mut toolbox = Self::new();
        toolbox
            .register(Arc::new(MockTranslator))
            .register(Arc::new(MockCalculator));
        toolbox
    }

    /// Register a tool, replacing any earlier tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    pub async fn call(
        &self,
        name: &str,
        ctx: &CallContext,
        input: &str,
    ) -> Result<String, TranslateError> {
        let tool = self
            .get(name)
            .ok_or_else(|| TranslateError::InvalidInput(format!("unknown tool: {name}")))?;
        info!(tool = name, "tool call");
        tool.call(ctx, input).await
    }
}
