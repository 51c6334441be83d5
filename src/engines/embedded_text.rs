//! An "engine" which returns text already embedded in the source file.

use std::sync::Arc;

use schemars::JsonSchema;
use tokio::time::Instant;

use crate::{errors::RecognitionError, page::Page, prelude::*, recognition::TextBlock};

use super::{CommonEngineSettings, EngineAdapter, EngineCapability, EngineKind, Fitness};

/// Settings for [`EmbeddedTextAdapter`].
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct EmbeddedTextSettings {
    #[serde(flatten)]
    pub common: CommonEngineSettings,
}

/// Returns a page's embedded text as a single full-page block.
///
/// This is free and works for every category, so it makes a good fallback.
/// Pages without embedded text are declined.
pub struct EmbeddedTextAdapter {
    name: String,
    capability: EngineCapability,
}

impl EmbeddedTextAdapter {
    /// Create a new adapter.
    pub fn new(settings: &EmbeddedTextSettings) -> Self {
        Self {
            name: settings.common.name_or("embedded_text"),
            capability: EngineCapability::from_settings(
                &settings.common,
                0.0,
                Fitness::uniform(1.0),
                false,
            ),
        }
    }
}

#[async_trait]
impl EngineAdapter for EmbeddedTextAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Printed
    }

    fn capability(&self) -> &EngineCapability {
        &self.capability
    }

    async fn recognize(&self, page: Arc<Page>, _deadline: Instant) -> Result<Vec<TextBlock>> {
        let Some(text) = page.non_blank_embedded_text() else {
            return Err(RecognitionError::UnsupportedPage {
                engine: self.name.clone(),
                reason: "page has no embedded text".to_owned(),
            }
            .into());
        };
        Ok(vec![TextBlock {
            text: text.to_owned(),
            region: page.full_page_box(),
            confidence: Some(1.0),
        }])
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_returns_embedded_text_or_declines() {
        let adapter = EmbeddedTextAdapter::new(&Default::default());
        let deadline = Instant::now() + Duration::from_secs(1);

        let page = Arc::new(Page::new(0, None, Some("Hello, world".to_owned())));
        let blocks = adapter.recognize(page, deadline).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "Hello, world");
        assert_eq!(blocks[0].confidence, Some(1.0));

        let blank = Arc::new(Page::new(1, None, Some("  \n".to_owned())));
        let err = adapter.recognize(blank, deadline).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::UnsupportedPage { .. })
        ));
    }
}
