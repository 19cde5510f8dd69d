pub mod classifier;
pub mod client;
pub mod rewriter;

pub use classifier::{Classification, ClassifierGateway, GENERAL_BUSINESS, UNCATEGORIZED};
pub use client::{HttpLlmClient, LlmClient, MockLlm};
pub use rewriter::VisualRewriter;
