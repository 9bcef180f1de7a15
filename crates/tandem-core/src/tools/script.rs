//! User-defined tools from the embedding language
//!
//! Arguments arrive by name but the underlying function takes them
//! positionally, in declared parameter order.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::stringify_output;
use crate::ai::types::{AiTool, ToolArgs};
use crate::error::ToolError;

/// Callable body of a user-defined tool, supplied by the script evaluator
#[async_trait]
pub trait ScriptFunction: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> Result<Value>;
}

struct FnScript<F>(F);

#[async_trait]
impl<F, Fut> ScriptFunction for FnScript<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.0)(args).await
    }
}

/// A declared parameter with its optional type annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParam {
    pub name: String,
    pub type_hint: Option<String>,
}

impl ScriptParam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
        }
    }

    pub fn typed(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(type_hint.into()),
        }
    }
}

#[derive(Clone)]
pub struct ScriptTool {
    name: String,
    description: String,
    params: Vec<ScriptParam>,
    function: Arc<dyn ScriptFunction>,
}

impl ScriptTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<ScriptParam>,
        function: Arc<dyn ScriptFunction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            function,
        }
    }

    /// Build a tool around an async closure taking positional arguments
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<ScriptParam>,
        f: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(name, description, params, Arc::new(FnScript(f)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &[ScriptParam] {
        &self.params
    }

    /// Order named arguments by declared parameter position.
    ///
    /// Every declared parameter is required; extra arguments are ignored.
    pub fn bind_arguments(&self, args: &ToolArgs) -> Result<Vec<Value>, ToolError> {
        self.params
            .iter()
            .map(|param| {
                args.get(&param.name)
                    .cloned()
                    .ok_or_else(|| ToolError::MissingArgument {
                        param: param.name.clone(),
                        tool: self.name.clone(),
                    })
            })
            .collect()
    }

    /// JSON schema synthesized from declared parameters
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({ "type": json_schema_type(param.type_hint.as_deref()) }),
            );
        }
        let required: Vec<&str> = self.params.iter().map(|p| p.name.as_str()).collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn advertise(&self) -> AiTool {
        AiTool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters_schema(),
        }
    }

    pub async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let positional = self.bind_arguments(args)?;
        let value = self.function.call(positional).await?;
        Ok(stringify_output(value))
    }
}

/// Map a script type annotation to a JSON schema type; unknown means string
fn json_schema_type(type_hint: Option<&str>) -> &'static str {
    let Some(hint) = type_hint else {
        return "string";
    };
    match hint.trim().to_ascii_lowercase().as_str() {
        "int" | "integer" => "integer",
        "float" | "number" | "double" => "number",
        "bool" | "boolean" => "boolean",
        "array" | "list" => "array",
        "object" | "map" | "dict" => "object",
        _ => "string",
    }
}
