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

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Model selection sentinel meaning "use the user-supplied identifier instead".
pub const CUSTOM_MODEL_ID: &str = "custom";

pub const DEFAULT_MODEL_ID: &str = "Llama-3.2-3B-Instruct-q4f32_1-MLC";

pub fn builtin_models() -> Vec<Model> {
    vec![
        Model::new(DEFAULT_MODEL_ID, "Llama 3.2 3B Instruct")
            .with_description("Balanced default for local chat"),
        Model::new("Llama-3.2-1B-Instruct-q4f32_1-MLC", "Llama 3.2 1B Instruct")
            .with_description("Smallest download, fastest replies"),
        Model::new("Phi-3.5-mini-instruct-q4f16_1-MLC", "Phi 3.5 Mini")
            .with_description("Strong reasoning for its size"),
        Model::new("Qwen2.5-1.5B-Instruct-q4f16_1-MLC", "Qwen 2.5 1.5B Instruct"),
        Model::new("gemma-2-2b-it-q4f16_1-MLC", "Gemma 2 2B"),
        Model::new(CUSTOM_MODEL_ID, "Custom model")
            .with_description("Load the identifier entered in settings"),
    ]
}
