//! Draft generation for approval steps.
//!
//! Drafts are assembled from the step's instructions and the enrollment
//! context, with `{{var}}` placeholders filled from string attributes.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use dripline_core::delivery::DraftGenerator;

#[derive(Debug, Clone)]
pub struct TemplateDraftGenerator {
    signature: String,
}

impl TemplateDraftGenerator {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
        }
    }

    /// Fills `{{key}}` and `{{ key }}` placeholders.
    pub fn render(text: &str, data: &HashMap<String, String>) -> String {
        let mut rendered = text.to_string();
        for (key, value) in data {
            rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
            rendered = rendered.replace(&format!("{{{{ {} }}}}", key), value);
        }
        rendered
    }

    fn variables(subscriber_id: &str, context: &serde_json::Value) -> HashMap<String, String> {
        let mut data = HashMap::new();
        if let Some(attributes) = context.as_object() {
            for (key, value) in attributes {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                data.insert(key.clone(), text);
            }
        }
        data.entry("subscriber_id".into())
            .or_insert_with(|| subscriber_id.to_string());
        data
    }
}

impl Default for TemplateDraftGenerator {
    fn default() -> Self {
        Self::new("The Dripline team")
    }
}

#[async_trait]
impl DraftGenerator for TemplateDraftGenerator {
    async fn generate_draft(
        &self,
        subscriber_id: &str,
        instructions: &str,
        context: &serde_json::Value,
    ) -> anyhow::Result<String> {
        if instructions.trim().is_empty() {
            anyhow::bail!("no instructions to draft from");
        }

        let data = Self::variables(subscriber_id, context);
        let greeting = data
            .get("first_name")
            .map(|name| format!("Hi {},", name))
            .unwrap_or_else(|| "Hi there,".to_string());
        let body = Self::render(instructions, &data);
        if body.contains("{{") {
            anyhow::bail!("unfilled placeholder in instructions: {}", body);
        }

        debug!(subscriber_id, "Draft generated");
        Ok(format!("{}\n\n{}\n\n{}", greeting, body, self.signature))
    }
}
