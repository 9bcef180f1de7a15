//! Display classification for tool names.
//!
//! Used for client display hints only; execution never depends on it.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Execute,
    Read,
    Write,
    Search,
    Other,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Execute => "execute",
            ToolKind::Read => "read",
            ToolKind::Write => "write",
            ToolKind::Search => "search",
            ToolKind::Other => "other",
        }
    }
}

/// Categorize a tool by name.
pub fn tool_kind(name: &str) -> ToolKind {
    match name {
        "bash" | "shell" | "exec" | "execute" | "run" | "run_command" | "terminal" => {
            ToolKind::Execute
        }
        "read" | "read_file" | "cat" | "view" | "open" | "fetch" | "web_fetch" => ToolKind::Read,
        "write" | "write_file" | "edit" | "edit_file" | "multiedit" | "create_file"
        | "apply_patch" | "patch" | "delete" | "move" => ToolKind::Write,
        "grep" | "glob" | "search" | "find" | "list" | "ls" | "web_search" => ToolKind::Search,
        _ => ToolKind::Other,
    }
}
