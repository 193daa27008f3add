pub mod anthropic;

pub use anthropic::AnthropicProvider;
