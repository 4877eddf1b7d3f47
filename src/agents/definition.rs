//! Agent declarations.
//!
//! Agents are declared, not subclassed: a definition bundles the input
//! fields, the approval requirement, and an async run callback executed once
//! every required field has been collected (and approval granted, when
//! demanded).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::fields::InputField;
use crate::tools::traits::ToolExecutionContext;

/// Async callback executed with the collected fields.
pub type AgentRunFn = Arc<
    dyn Fn(Map<String, Value>, ToolExecutionContext) -> BoxFuture<'static, Result<String, String>>
        + Send
        + Sync,
>;

/// A registered agent type.
#[derive(Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub input_fields: Vec<InputField>,
    pub needs_approval: bool,
    pub expose_as_tool: bool,
    /// Optional summary shown in approval requests; a generic one is
    /// synthesized from the collected fields when absent.
    pub approval_prompt: Option<String>,
    run: AgentRunFn,
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("name", &self.name)
            .field("input_fields", &self.input_fields)
            .field("needs_approval", &self.needs_approval)
            .field("expose_as_tool", &self.expose_as_tool)
            .finish()
    }
}

impl AgentDefinition {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn field(&self, name: &str) -> Option<&InputField> {
        self.input_fields.iter().find(|f| f.name == name)
    }

    pub(crate) async fn execute(
        &self,
        fields: Map<String, Value>,
        ctx: ToolExecutionContext,
    ) -> Result<String, String> {
        (self.run)(fields, ctx).await
    }
}

// ─── AgentBuilder ─────────────────────────────────────────────────────────────

/// Builder for [`AgentDefinition`].
pub struct AgentBuilder {
    name: String,
    description: String,
    input_fields: Vec<InputField>,
    needs_approval: bool,
    expose_as_tool: bool,
    approval_prompt: Option<String>,
    run: Option<AgentRunFn>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_fields: Vec::new(),
            needs_approval: false,
            expose_as_tool: true,
            approval_prompt: None,
            run: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn field(mut self, field: InputField) -> Self {
        self.input_fields.push(field);
        self
    }

    pub fn needs_approval(mut self, needs_approval: bool) -> Self {
        self.needs_approval = needs_approval;
        self
    }

    pub fn expose_as_tool(mut self, expose_as_tool: bool) -> Self {
        self.expose_as_tool = expose_as_tool;
        self
    }

    pub fn approval_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.approval_prompt = Some(prompt.into());
        self
    }

    /// Set the run callback.
    pub fn run<F, Fut>(mut self, run: F) -> Self
    where
        F: Fn(Map<String, Value>, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |fields, ctx| Box::pin(run(fields, ctx))));
        self
    }

    pub fn build(self) -> Result<AgentDefinition, String> {
        let run = self
            .run
            .ok_or_else(|| format!("agent '{}' has no run callback", self.name))?;
        Ok(AgentDefinition {
            name: self.name,
            description: self.description,
            input_fields: self.input_fields,
            needs_approval: self.needs_approval,
            expose_as_tool: self.expose_as_tool,
            approval_prompt: self.approval_prompt,
            run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::fields::FieldType;

    #[test]
    fn builder_requires_run_callback() {
        let result = AgentDefinition::builder("noop").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn build_and_execute() {
        let def = AgentDefinition::builder("echo")
            .description("Echoes a message")
            .field(InputField::new("message", FieldType::String, "text to echo"))
            .run(|fields, _ctx| async move {
                Ok(fields
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string())
            })
            .build()
            .unwrap();

        let mut fields = Map::new();
        fields.insert("message".to_string(), Value::String("hi".to_string()));
        let out = def
            .execute(fields, ToolExecutionContext::new("t1"))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }
}
