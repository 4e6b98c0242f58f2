// Canonical fallback tool schemas
// When a request declares a tool whose schema is corrupted (empty type or
// no properties), the upstream call would be rejected. The table below maps
// a normalized tool key to a known-good definition to substitute.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{json, Value};

use super::anthropic::{InputSchema, ToolDefinition};

static FALLBACKS: OnceLock<HashMap<String, ToolDefinition>> = OnceLock::new();

/// Lowercase and strip underscores so `Todo_Write`, `todowrite` and
/// `TodoWrite` all hit the same entry.
pub fn normalize_tool_key(name: &str) -> String {
    name.to_lowercase().replace('_', "")
}

/// Canonical definition for a known tool name, or None for unknown tools.
pub fn fallback_for(name: &str) -> Option<&'static ToolDefinition> {
    fallback_table().get(&normalize_tool_key(name))
}

fn tool(name: &str, description: &str, schema: Value) -> (String, ToolDefinition) {
    let input_schema: InputSchema =
        serde_json::from_value(schema).expect("static fallback schema must deserialize");
    (
        normalize_tool_key(name),
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        },
    )
}

fn fallback_table() -> &'static HashMap<String, ToolDefinition> {
    FALLBACKS.get_or_init(|| {
        HashMap::from([
            tool(
                "Read",
                "Read a file from the local filesystem",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path to the file to read"},
                        "offset": {"type": "number", "description": "Line number to start reading from"},
                        "limit": {"type": "number", "description": "Number of lines to read"}
                    },
                    "required": ["file_path"]
                }),
            ),
            tool(
                "Write",
                "Write a file to the local filesystem",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path to the file to write"},
                        "content": {"type": "string", "description": "Content to write to the file"}
                    },
                    "required": ["file_path", "content"]
                }),
            ),
            tool(
                "Edit",
                "Perform an exact string replacement in a file",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path to the file to modify"},
                        "old_string": {"type": "string", "description": "Text to replace"},
                        "new_string": {"type": "string", "description": "Replacement text"},
                        "replace_all": {"type": "boolean", "description": "Replace every occurrence"}
                    },
                    "required": ["file_path", "old_string", "new_string"]
                }),
            ),
            tool(
                "MultiEdit",
                "Apply multiple string replacements to one file",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path to the file to modify"},
                        "edits": {
                            "type": "array",
                            "description": "Ordered list of edits to apply",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "old_string": {"type": "string"},
                                    "new_string": {"type": "string"},
                                    "replace_all": {"type": "boolean"}
                                },
                                "required": ["old_string", "new_string"]
                            }
                        }
                    },
                    "required": ["file_path", "edits"]
                }),
            ),
            tool(
                "Bash",
                "Execute a shell command",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "The command to execute"},
                        "timeout": {"type": "number", "description": "Timeout in milliseconds"},
                        "description": {"type": "string", "description": "What this command does"}
                    },
                    "required": ["command"]
                }),
            ),
            tool(
                "Grep",
                "Search file contents with a regular expression",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Regular expression to search for"},
                        "path": {"type": "string", "description": "Directory or file to search"},
                        "glob": {"type": "string", "description": "Glob filter for files to search"},
                        "output_mode": {"type": "string", "description": "content, files_with_matches, or count"}
                    },
                    "required": ["pattern"]
                }),
            ),
            tool(
                "Glob",
                "Find files by glob pattern",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Glob pattern to match"},
                        "path": {"type": "string", "description": "Directory to search"}
                    },
                    "required": ["pattern"]
                }),
            ),
            tool(
                "LS",
                "List directory contents",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path to the directory"},
                        "ignore": {"type": "array", "description": "Glob patterns to ignore", "items": {"type": "string"}}
                    },
                    "required": ["path"]
                }),
            ),
            tool(
                "Task",
                "Launch an agent to handle a multi-step task",
                json!({
                    "type": "object",
                    "properties": {
                        "description": {"type": "string", "description": "Short task description"},
                        "prompt": {"type": "string", "description": "The task for the agent to perform"}
                    },
                    "required": ["description", "prompt"]
                }),
            ),
            tool(
                "TodoWrite",
                "Create or update the task list",
                json!({
                    "type": "object",
                    "properties": {
                        "todos": {
                            "type": "array",
                            "description": "The updated todo list",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "content": {"type": "string"},
                                    "status": {"type": "string"},
                                    "priority": {"type": "string"},
                                    "id": {"type": "string"}
                                },
                                "required": ["content", "status", "priority", "id"]
                            }
                        }
                    },
                    "required": ["todos"]
                }),
            ),
            tool(
                "WebFetch",
                "Fetch a URL and process its content",
                json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "URL to fetch"},
                        "prompt": {"type": "string", "description": "What to extract from the page"}
                    },
                    "required": ["url", "prompt"]
                }),
            ),
            tool(
                "WebSearch",
                "Search the web",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search query"},
                        "allowed_domains": {"type": "array", "description": "Only include these domains", "items": {"type": "string"}}
                    },
                    "required": ["query"]
                }),
            ),
        ])
    })
}

/// Substitute corrupted schemas in place; unknown corrupted tools pass
/// through untouched.
pub fn restore_corrupted(tools: &mut [ToolDefinition]) -> usize {
    let mut restored = 0;
    for tool in tools.iter_mut() {
        if tool.input_schema.is_corrupted() {
            if let Some(fallback) = fallback_for(&tool.name) {
                log::warn!(
                    "replacing corrupted schema for tool '{}' with canonical fallback",
                    tool.name
                );
                tool.description = fallback.description.clone();
                tool.input_schema = fallback.input_schema.clone();
                restored += 1;
            }
        }
    }
    restored
}
