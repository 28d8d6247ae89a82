//! LLM integration.
//!
//! OpenAI-compatible chat completions via rig-core. `RigAdapter` bridges
//! rig's `CompletionModel` trait to our `LlmProvider` trait, which is also
//! the seam tests use to swap in a scripted model.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::LlmConfig;
use crate::error::LlmError;

const PROVIDER: &str = "openai";

/// Create an LLM provider from configuration.
///
/// Each call builds a fresh HTTP client, so a provider must not outlive the
/// runtime it was created on.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::builder()
            .api_key(config.api_key.expose_secret())
            .base_url(&config.base_url)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            })?;

    // Compatible endpoints speak chat completions, not the responses API.
    let model = client.completions_api().completion_model(&config.model);
    tracing::debug!(model = %config.model, base_url = %config.base_url, "Creating LLM provider");
    Ok(Arc::new(RigAdapter::new(model, &config.model, PROVIDER)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            api_key: secrecy::SecretString::from("sk-test"),
            base_url: base_url.to_string(),
            model: "gpt-4o".to_string(),
            max_iterations: 10,
            tokenizer_model: "gpt-4".to_string(),
        }
    }

    #[test]
    fn create_provider_constructs_without_network() {
        // rig clients accept any key at construction; auth fails on first use.
        let provider = create_provider(&config("https://api.openai.com/v1")).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }

    #[test]
    fn create_provider_accepts_compatible_endpoint() {
        let provider = create_provider(&config("http://localhost:11434/v1")).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }
}
