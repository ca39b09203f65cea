pub mod plan_tools;
pub mod skill_tools;
pub mod time_tools;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{Value, json};

/// A named, independently callable operation exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the call arguments.
    fn parameters(&self) -> Value {
        empty_object_schema()
    }

    async fn call(&self, args: Value) -> Result<Value>;
}

pub fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Renders a schemars schema without the draft metadata the chat APIs reject.
pub fn schema_for<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| empty_object_schema());
    if let Some(map) = schema.as_object_mut() {
        map.remove("$schema");
        map.remove("title");
    }
    schema
}

pub fn tool_error_payload(code: &str, message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "code": code,
        "error": message.into()
    })
}

type ToolHandler = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Closure-backed tool.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    handler: ToolHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_schema<T: JsonSchema>(self) -> Self {
        self.with_parameters(schema_for::<T>())
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn call(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

// ---------------------------------------------------------------------------
// Tool sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOrigin {
    pub namespace: String,
    pub module: String,
}

#[derive(Clone)]
pub struct ToolEntry {
    pub tool: Arc<dyn Tool>,
    pub origin: ToolOrigin,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Ordered tool collection keyed by name.
///
/// Inserting a name that already exists replaces the earlier tool in place:
/// the entry keeps the position of the first occurrence and the value of the
/// last one. Namespaces loaded later therefore override earlier ones.
#[derive(Clone, Default)]
pub struct ToolSet {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry that was overridden, if any.
    pub fn insert(&mut self, tool: Arc<dyn Tool>, origin: ToolOrigin) -> Option<ToolEntry> {
        let name = tool.name().to_string();
        let entry = ToolEntry { tool, origin };
        match self.index.get(&name) {
            Some(&position) => Some(std::mem::replace(&mut self.entries[position], entry)),
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.entry(name).map(|entry| &entry.tool)
    }

    pub fn entry(&self, name: &str) -> Option<&ToolEntry> {
        self.index.get(name).map(|&position| &self.entries[position])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.tool.name().to_string())
            .collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .map(|entry| ToolSpec {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// First line of a tool description, as shown in prompts and listings.
pub fn description_headline(description: &str) -> &str {
    description
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
}
