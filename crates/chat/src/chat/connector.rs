use std::sync::Arc;

use parlor_llm::{LlmProvider, ProviderConfig, ProviderResult, ScriptedProvider, create_provider};

/// Builds the provider for one turn from the settings snapshot taken at turn start.
pub trait ProviderConnector: Send + Sync {
    fn connect(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>>;
}

/// Connects through [`create_provider`], i.e. the rig-backed adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigConnector;

impl ProviderConnector for RigConnector {
    fn connect(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
        create_provider(config)
    }
}

/// Every turn shares the same script queue.
impl ProviderConnector for ScriptedProvider {
    fn connect(&self, _config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use parlor_llm::{DEFAULT_DEEPSEEK_ENDPOINT, ProviderError, SCRIPTED_PROVIDER_ID};

    use super::*;

    #[test]
    fn rig_connector_builds_deepseek_adapter() {
        let provider = RigConnector
            .connect(ProviderConfig::new("deepseek", "sk-test", DEFAULT_DEEPSEEK_ENDPOINT))
            .expect("deepseek is supported");
        assert_eq!(provider.id(), "deepseek");
    }

    #[test]
    fn rig_connector_rejects_unknown_provider() {
        let error = RigConnector
            .connect(ProviderConfig::new("carrier-pigeon", "sk-test", ""))
            .err()
            .expect("unknown provider");
        assert!(matches!(error, ProviderError::UnsupportedProvider { .. }));
    }

    #[test]
    fn scripted_connector_shares_its_queue() {
        let scripted = ScriptedProvider::default();
        let provider = scripted
            .connect(ProviderConfig::new(SCRIPTED_PROVIDER_ID, "", ""))
            .expect("scripted always connects");
        assert_eq!(provider.id(), SCRIPTED_PROVIDER_ID);
    }
}
