pub mod firecrawl;
mod http;
pub mod llm;

pub use firecrawl::FirecrawlPageSource;
pub use llm::OpenAiShowExtractor;
