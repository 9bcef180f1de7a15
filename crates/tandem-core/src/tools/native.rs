//! Built-in tools bound to Rust functions

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::stringify_output;
use crate::ai::types::{AiTool, ToolArgs};
use crate::error::ToolError;

#[async_trait]
pub trait NativeFunction: Send + Sync {
    async fn invoke(&self, args: ToolArgs) -> Result<Value>;
}

struct FnNative<F>(F);

#[async_trait]
impl<F, Fut> NativeFunction for FnNative<F>
where
    F: Fn(ToolArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn invoke(&self, args: ToolArgs) -> Result<Value> {
        (self.0)(args).await
    }
}

/// Built-in tool with a pre-built parameter schema
#[derive(Clone)]
pub struct NativeTool {
    name: String,
    description: String,
    schema: Value,
    function: Arc<dyn NativeFunction>,
}

impl NativeTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        function: Arc<dyn NativeFunction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            function,
        }
    }

    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(name, description, schema, Arc::new(FnNative(f)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn advertise(&self) -> AiTool {
        AiTool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.schema.clone(),
        }
    }

    pub async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let value = self.function.invoke(args.clone()).await?;
        Ok(stringify_output(value))
    }
}
