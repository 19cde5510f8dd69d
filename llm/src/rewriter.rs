use crate::client::LlmClient;
use std::sync::Arc;
use tracing::warn;

const REWRITE_PREFIX: &str = "Explain this chart or table in plain prose so the numbers and \
their relationships survive without the visual layout. Keep every figure. Content:\n\n";

/// Re-explains chart/table-like chunks through the model. Failure is always
/// recoverable: `None` means the caller keeps the original text.
pub struct VisualRewriter {
    client: Arc<dyn LlmClient>,
}

impl VisualRewriter {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn explain(&self, chunk_text: &str) -> Option<String> {
        let prompt = format!("{}{}", REWRITE_PREFIX, chunk_text);
        match self.client.complete(&prompt).await {
            Ok(explained) if !explained.trim().is_empty() => Some(explained),
            Ok(_) => {
                warn!("visual re-explanation came back empty, keeping original text");
                None
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "visual re-explanation failed, keeping original text");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLlm;

    #[tokio::test]
    async fn successful_rewrite_returns_prose() {
        let rewriter = VisualRewriter::new(Arc::new(MockLlm::fixed(
            "Growth rose from 12% in 2021 to 27% in 2023.",
        )));
        let out = rewriter.explain("2021: 12%\n2023: 27%").await;
        assert!(out.unwrap().contains("Growth rose"));
    }

    #[tokio::test]
    async fn failure_and_empty_both_yield_none() {
        let failing = VisualRewriter::new(Arc::new(MockLlm::failing()));
        assert!(failing.explain("2021: 12%").await.is_none());

        let empty = VisualRewriter::new(Arc::new(MockLlm::fixed("  ")));
        assert!(empty.explain("2021: 12%").await.is_none());
    }
}
