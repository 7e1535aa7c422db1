use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Tool, ToolRequest};
use crate::cancellation::CallContext;
use crate::translate::{TranslateError, TranslationService};

/// Real translation tool backed by a [`TranslationService`].
pub struct TranslatorTool {
    service: Arc<TranslationService>,
}

impl TranslatorTool {
    pub fn new(service: Arc<TranslationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for TranslatorTool {
    fn name(&self) -> &'static str {
        "translate_text"
    }

    fn description(&self) -> &'static str {
        "A translation tool that converts text between languages.\n\
         Parameters:\n\
         - text: The text to translate (required)\n\
         - source_language: The source language (default: English)\n\
         - target_language: The target language (default: Chinese)\n\
         \n\
         Example: \"Hello world\" -> \"你好，世界\""
    }

    async fn call(&self, ctx: &CallContext, input: &str) -> Result<String, TranslateError> {
        let request = ToolRequest::parse(input);
        debug!(
            text = %request.text,
            source = %request.source_language,
            target = %request.target_language,
            "translator tool parsed input"
        );
        self.service
            .translate_one(
                ctx,
                &request.text,
                &request.source_language,
                &request.target_language,
            )
            .await
            .inspect_err(|e| warn!(tool = self.name(), error = %e, "tool call failed"))
    }
}
