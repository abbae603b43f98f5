#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER_MODEL: &str = "deepseek-reasoner";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-5-mini";

pub fn default_models() -> Vec<Model> {
    vec![
        Model::from_id(DEFAULT_DEEPSEEK_MODEL).with_description("DeepSeek general chat model"),
        Model::from_id(DEEPSEEK_REASONER_MODEL)
            .with_description("DeepSeek model with a separate reasoning channel"),
        Model::from_id(DEFAULT_OPENAI_MODEL).with_description("OpenAI compact model"),
    ]
}

/// Only the DeepSeek chat model has a reasoning twin to switch to.
pub fn supports_deep_think(model_name: &str) -> bool {
    model_name.trim() == DEFAULT_DEEPSEEK_MODEL
}

/// Picks the model id actually sent to the provider.
pub fn resolve_model(model_name: &str, deep_think: bool) -> String {
    let model_name = model_name.trim();
    if deep_think && supports_deep_think(model_name) {
        return DEEPSEEK_REASONER_MODEL.to_string();
    }

    if model_name.is_empty() {
        DEFAULT_DEEPSEEK_MODEL.to_string()
    } else {
        model_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_each_model_once_with_a_description() {
        let models = default_models();
        let ids: Vec<&str> = models.iter().map(|model| model.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![DEFAULT_DEEPSEEK_MODEL, DEEPSEEK_REASONER_MODEL, DEFAULT_OPENAI_MODEL]
        );
        assert!(models.iter().all(|model| model.description.is_some()));
        assert_eq!(
            models.iter().filter(|model| supports_deep_think(&model.id)).count(),
            1
        );
    }

    #[test]
    fn deep_think_switches_chat_model_to_reasoner() {
        assert_eq!(resolve_model("deepseek-chat", true), DEEPSEEK_REASONER_MODEL);
        assert_eq!(resolve_model("deepseek-chat", false), DEFAULT_DEEPSEEK_MODEL);
    }

    #[test]
    fn deep_think_is_ignored_for_other_models() {
        assert_eq!(resolve_model("gpt-5-mini", true), "gpt-5-mini");
    }

    #[test]
    fn blank_model_name_falls_back_to_default() {
        assert_eq!(resolve_model("   ", false), DEFAULT_DEEPSEEK_MODEL);
    }
}
