//! Agent type registry and tool-schema synthesis.
//!
//! The registry maps an agent name to its definition and a schema version: a
//! deterministic content hash over the declared `(name, type, required)`
//! field tuples.  Adding or removing a field, or changing a type, changes the
//! version; pool entries recorded under an older version are discarded on
//! retrieval and restore.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::definition::AgentDefinition;
use super::fields::{FieldType, InputField};
use crate::ai::types::ToolInfo;

/// Marker appended to the synthesized description of approval-gated agents.
pub const APPROVAL_MARKER: &str = "[Requires user confirmation before execution]";

// ─── AgentSpec ────────────────────────────────────────────────────────────────

/// Serializable view of a declared field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_hint: Option<String>,
}

impl From<&InputField> for FieldSpec {
    fn from(field: &InputField) -> Self {
        Self {
            name: field.name.clone(),
            field_type: field.field_type,
            description: field.description.clone(),
            required: field.required,
            validator_hint: field.validator_hint.clone(),
        }
    }
}

/// Registry record for one agent type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub input_fields: Vec<FieldSpec>,
    pub needs_approval: bool,
    pub expose_as_tool: bool,
    pub schema_version: String,
}

// ─── Schema version ───────────────────────────────────────────────────────────

/// Deterministic hash over `(field_name, declared_type, required)` tuples
/// sorted by name.
pub fn schema_version(fields: &[InputField]) -> String {
    let mut tuples: Vec<(&str, &str, bool)> = fields
        .iter()
        .map(|f| (f.name.as_str(), f.field_type.as_str(), f.required))
        .collect();
    tuples.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, ty, required) in tuples {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(ty.as_bytes());
        hasher.update(b":");
        hasher.update(if required { b"1" } else { b"0" });
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

// ─── AgentRegistry ────────────────────────────────────────────────────────────

/// Maps agent name to definition and schema version.
///
/// Populated once at startup and shared as `Arc<AgentRegistry>`; a snapshot
/// is taken at construction and runtime mutation is not supported.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentDefinition>>,
    versions: HashMap<String, String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            versions: HashMap::new(),
        }
    }

    /// Register an agent type.  Overwrites any previous agent with the same
    /// name.
    pub fn register(&mut self, definition: AgentDefinition) {
        let version = schema_version(&definition.input_fields);
        self.versions.insert(definition.name.clone(), version);
        self.agents
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(name).cloned()
    }

    pub fn schema_version_of(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }

    pub fn spec(&self, name: &str) -> Option<AgentSpec> {
        let def = self.agents.get(name)?;
        Some(AgentSpec {
            name: def.name.clone(),
            description: def.description.clone(),
            input_fields: def.input_fields.iter().map(FieldSpec::from).collect(),
            needs_approval: def.needs_approval,
            expose_as_tool: def.expose_as_tool,
            schema_version: self.versions.get(name).cloned().unwrap_or_default(),
        })
    }

    pub fn list(&self) -> Vec<AgentSpec> {
        let mut specs: Vec<AgentSpec> =
            self.agents.keys().filter_map(|n| self.spec(n)).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Synthesized [`ToolInfo`]s for every agent with `expose_as_tool`.
    pub fn tool_catalog(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .agents
            .values()
            .filter(|d| d.expose_as_tool)
            .map(|d| synthesize_tool_info(d))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthesize the function-calling schema of an agent: its declared fields
/// plus a free-form `task_instruction`, with validator hints folded into the
/// field descriptions and the approval marker into the top-level description.
pub fn synthesize_tool_info(definition: &AgentDefinition) -> ToolInfo {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();

    properties.insert(
        "task_instruction".to_string(),
        json!({
            "type": "string",
            "description": "Free-form instruction describing what the user wants this agent to do.",
        }),
    );

    for field in &definition.input_fields {
        let description = match &field.validator_hint {
            Some(hint) => format!("{} ({})", field.description, hint),
            None => field.description.clone(),
        };
        properties.insert(
            field.name.clone(),
            json!({
                "type": field.field_type.json_type(),
                "description": description,
            }),
        );
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }

    let description = if definition.needs_approval {
        format!("{} {}", definition.description, APPROVAL_MARKER)
    } else {
        definition.description.clone()
    };

    ToolInfo {
        name: definition.name.clone(),
        description,
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}
