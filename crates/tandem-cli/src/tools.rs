//! Built-in tools the CLI offers to catalog agents

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tandem_core::tools::{NativeTool, ScriptParam, ScriptTool};
use tandem_core::AgentTool;

/// Tools an agent may name in its `tools` list
pub fn builtin_tools() -> Vec<AgentTool> {
    vec![read_file(), list_dir(), word_count()]
}

fn read_file() -> AgentTool {
    NativeTool::from_fn(
        "read_file",
        "Read a UTF-8 text file",
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }),
        |args| async move {
            let path = args
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("'path' must be a string"))?;
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read {}", path))?;
            Ok(Value::String(text))
        },
    )
    .into()
}

fn list_dir() -> AgentTool {
    NativeTool::from_fn(
        "list_dir",
        "List entries of a directory",
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } }
        }),
        |args| async move {
            let path = PathBuf::from(args.get("path").and_then(Value::as_str).unwrap_or("."));
            let mut entries = tokio::fs::read_dir(&path)
                .await
                .with_context(|| format!("cannot list {}", path.display()))?;
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
            names.sort();
            Ok(json!(names))
        },
    )
    .into()
}

fn word_count() -> AgentTool {
    ScriptTool::from_fn(
        "word_count",
        "Count words in a piece of text",
        vec![ScriptParam::typed("text", "str")],
        |args| async move {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.split_whitespace().count()))
        },
    )
    .into()
}
