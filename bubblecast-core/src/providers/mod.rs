pub mod anthropic;
pub mod perplexity;
pub mod tavily;
