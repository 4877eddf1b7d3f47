//! Declared input fields for agents.
//!
//! An agent declares its inputs as a list of [`InputField`]s; the session
//! state machine collects them from tool-call arguments and user replies,
//! coercing and validating each value before accepting it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── FieldType ────────────────────────────────────────────────────────────────

/// Declared type of an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
}

impl FieldType {
    /// Canonical name used in the schema-version hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
        }
    }

    /// JSON Schema type name.
    pub fn json_type(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "integer",
            FieldType::Float => "number",
            FieldType::Bool => "boolean",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
        }
    }
}

// ─── InputField ───────────────────────────────────────────────────────────────

/// Custom validation callback for a field value.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// One declared input of an agent.
#[derive(Clone)]
pub struct InputField {
    pub name: String,
    pub field_type: FieldType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    /// Short hint surfaced in the synthesized tool schema (e.g. a format).
    pub validator_hint: Option<String>,
    pub validator: Option<Validator>,
}

impl fmt::Debug for InputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputField")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("validator_hint", &self.validator_hint)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl InputField {
    /// Declare a required field.
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: description.into(),
            required: true,
            default: None,
            validator_hint: None,
            validator: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Attach a default, which also makes the field optional.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }

    pub fn with_validator<F>(mut self, hint: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator_hint = Some(hint.into());
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Type-check and run the custom validator, if any.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if !self.field_type.matches(value) {
            return Err(format!(
                "expected a {} value for '{}'",
                self.field_type.as_str(),
                self.name
            ));
        }
        if let Some(validator) = &self.validator {
            validator(value)?;
        }
        Ok(())
    }

    /// Parse a free-text user reply into a value of the declared type.
    pub fn coerce_text(&self, text: &str) -> Result<Value, String> {
        let text = text.trim();
        let value = match self.field_type {
            FieldType::String => Value::String(text.to_string()),
            FieldType::Int => text
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{text}' is not a whole number"))?,
            FieldType::Float => text
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("'{text}' is not a number"))?,
            FieldType::Bool => match text.to_lowercase().as_str() {
                "true" | "yes" | "y" => Value::Bool(true),
                "false" | "no" | "n" => Value::Bool(false),
                _ => return Err(format!("'{text}' is not a yes/no value")),
            },
        };
        self.validate(&value)?;
        Ok(value)
    }

    /// The question asked when this field is being collected.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("What should I use for '{}'? ({})", self.name, self.description);
        if let Some(hint) = &self.validator_hint {
            prompt.push(' ');
            prompt.push_str(hint);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_checks() {
        let field = InputField::new("count", FieldType::Int, "how many");
        assert!(field.validate(&json!(3)).is_ok());
        assert!(field.validate(&json!("three")).is_err());

        let field = InputField::new("ratio", FieldType::Float, "a ratio");
        assert!(field.validate(&json!(0.5)).is_ok());
        assert!(field.validate(&json!(2)).is_ok());
    }

    #[test]
    fn coerce_text_parses_declared_type() {
        let field = InputField::new("count", FieldType::Int, "how many");
        assert_eq!(field.coerce_text(" 42 ").unwrap(), json!(42));
        assert!(field.coerce_text("many").is_err());

        let field = InputField::new("confirm", FieldType::Bool, "confirm");
        assert_eq!(field.coerce_text("yes").unwrap(), json!(true));
        assert_eq!(field.coerce_text("No").unwrap(), json!(false));
    }

    #[test]
    fn custom_validator_rejects() {
        let field = InputField::new("recipient", FieldType::String, "email address")
            .with_validator("Must contain '@'.", |v| {
                if v.as_str().is_some_and(|s| s.contains('@')) {
                    Ok(())
                } else {
                    Err("not an email address".to_string())
                }
            });
        assert!(field.validate(&json!("alice@x.com")).is_ok());
        assert!(field.validate(&json!("alice")).is_err());
    }

    #[test]
    fn default_makes_field_optional() {
        let field =
            InputField::new("priority", FieldType::String, "priority").with_default(json!("normal"));
        assert!(!field.required);
        assert_eq!(field.default, Some(json!("normal")));
    }

    #[test]
    fn prompt_includes_hint() {
        let field = InputField::new("when", FieldType::String, "send time")
            .with_validator("Use YYYY-MM-DD.", |_| Ok(()));
        let prompt = field.prompt();
        assert!(prompt.contains("when"));
        assert!(prompt.contains("YYYY-MM-DD"));
    }
}
