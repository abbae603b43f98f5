use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
pub mod scripted;

pub use model::{
    DEEPSEEK_REASONER_MODEL, DEFAULT_DEEPSEEK_MODEL, DEFAULT_OPENAI_MODEL, Model,
    default_models, resolve_model, supports_deep_think,
};
pub use provider::{
    Fragment, FragmentKind, LlmProvider, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEvent, StreamRequest,
};
pub use rig_adapter::{
    DEEPSEEK_PROVIDER_ID, DEFAULT_DEEPSEEK_ENDPOINT, DEFAULT_OPENAI_ENDPOINT,
    OPENAI_PROVIDER_ID, RigFlavor, RigProviderAdapter,
};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    match RigFlavor::from_provider_id(&config.provider_id) {
        Some(flavor) => Ok(Arc::new(RigProviderAdapter::new(config, flavor)?)),
        None => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
