// Tool-call validation and correction
// Ordered pipeline of local fixups over a candidate tool call, falling back
// to an LLM-assisted repair against the correction pool. Every step is a
// small pure function sharing the ToolValidation record; the first step
// that yields a schema-valid call wins. Failure is always graceful: the
// original call is kept and the request is marked correction-failed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::anthropic::{AnthropicMessage, ToolDefinition};
use super::classifier;
use super::config::Settings;
use super::error::ProxyError;
use super::health::EndpointHealthManager;
use super::schema_fallback::normalize_tool_key;

/// Candidate call moving through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Validation record shared by all pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct ToolValidation {
    pub is_valid: bool,
    pub missing_params: Vec<String>,
    pub invalid_params: Vec<String>,
    pub has_case_issue: bool,
    pub has_tool_name_issue: bool,
    pub correct_tool_name: Option<String>,
    pub corrected_input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome {
    /// Call was already valid (possibly after local fixups).
    Valid(ToolUseCall),
    /// Call could not be repaired; the original is kept.
    Failed(ToolUseCall),
    /// Tool is on the skip list; untouched.
    Skipped(ToolUseCall),
}

impl CorrectionOutcome {
    pub fn call(&self) -> &ToolUseCall {
        match self {
            CorrectionOutcome::Valid(c)
            | CorrectionOutcome::Failed(c)
            | CorrectionOutcome::Skipped(c) => c,
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self, CorrectionOutcome::Failed(_))
    }
}

// ============================================================================
// Local pipeline steps
// ============================================================================

/// Step 1: case-/underscore-insensitive match against declared tools.
pub fn normalize_tool_name(call: &mut ToolUseCall, tools: &[ToolDefinition], v: &mut ToolValidation) {
    if tools.iter().any(|t| t.name == call.name) {
        return;
    }
    if let Some(canonical) = tools
        .iter()
        .find(|t| normalize_tool_key(&t.name) == normalize_tool_key(&call.name))
    {
        if canonical.name.eq_ignore_ascii_case(&call.name) {
            v.has_case_issue = true;
        } else {
            v.has_tool_name_issue = true;
        }
        v.correct_tool_name = Some(canonical.name.clone());
        call.name = canonical.name.clone();
    }
}

/// Step 2: `/command` style names become Task invocations when available.
pub fn map_slash_command(call: &mut ToolUseCall, tools: &[ToolDefinition]) {
    if !call.name.starts_with('/') {
        return;
    }
    let Some(task) = tools.iter().find(|t| t.name == "Task") else {
        return;
    };

    let original = call.name.clone();
    let mut input = Map::new();
    input.insert(
        "description".to_string(),
        Value::String(titlecase(original.trim_start_matches('/'))),
    );
    input.insert("prompt".to_string(), Value::String(original));
    if let Value::Object(existing) = &call.input {
        for (k, v) in existing {
            input.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    call.name = task.name.clone();
    call.input = Value::Object(input);
}

/// Step 3: fixed per-tool parameter rename table. Rename only; values are
/// never invented or deleted.
pub fn apply_param_renames(call: &mut ToolUseCall) {
    let renames: &[(&str, &str)] = match call.name.as_str() {
        "Read" | "Edit" | "MultiEdit" => &[
            ("filename", "file_path"),
            ("filepath", "file_path"),
            ("path", "file_path"),
        ],
        "Write" => &[
            ("filename", "file_path"),
            ("filepath", "file_path"),
            ("path", "file_path"),
            ("text", "content"),
        ],
        "Grep" => &[
            ("query", "pattern"),
            ("search", "pattern"),
            ("filter", "glob"),
        ],
        "Glob" => &[("query", "pattern"), ("search", "pattern")],
        "Bash" => &[("cmd", "command"), ("script", "command")],
        "WebFetch" => &[("uri", "url"), ("link", "url")],
        _ => return,
    };

    let Value::Object(input) = &mut call.input else {
        return;
    };
    for (from, to) in renames {
        if input.contains_key(*to) {
            continue;
        }
        if let Some(value) = input.remove(*from) {
            input.insert((*to).to_string(), value);
        }
    }
}

/// Step 4: MultiEdit sometimes arrives with the file path repeated inside
/// each edit. Promote the first one to the top level and strip the rest.
/// Returns false when no usable edits survive.
pub fn fix_multiedit_shape(call: &mut ToolUseCall) -> bool {
    if call.name != "MultiEdit" {
        return true;
    }
    let Value::Object(input) = &mut call.input else {
        return true;
    };
    let Some(Value::Array(edits)) = input.get("edits").cloned() else {
        return true;
    };

    const PATH_KEYS: &[&str] = &["file_path", "filename", "filepath", "path"];

    let mut promoted: Option<Value> = None;
    let mut cleaned: Vec<Value> = Vec::new();
    for edit in edits {
        let Value::Object(mut fields) = edit else {
            cleaned.push(edit);
            continue;
        };
        for key in PATH_KEYS {
            if let Some(value) = fields.remove(*key) {
                if promoted.is_none() {
                    promoted = Some(value);
                }
            }
        }
        if !fields.is_empty() {
            cleaned.push(Value::Object(fields));
        }
    }

    if let Some(path) = promoted {
        input.entry("file_path".to_string()).or_insert(path);
    }
    if cleaned.is_empty() {
        return false;
    }
    input.insert("edits".to_string(), Value::Array(cleaned));
    true
}

/// Step 5: TodoWrite arrives in many shapes; normalize them all to
/// `{todos:[{content,status,priority,id}]}`.
pub fn normalize_todowrite(call: &mut ToolUseCall) {
    if call.name != "TodoWrite" {
        return;
    }
    let Value::Object(input) = &call.input else {
        return;
    };
    if input.contains_key("todos") {
        let normalized = match input.get("todos") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| normalize_todo_item(item, None))
                .collect::<Vec<_>>(),
            _ => return,
        };
        call.input = json!({ "todos": normalized });
        return;
    }

    let items: Vec<Value> = if let Some(Value::String(todo)) = input.get("todo") {
        vec![normalize_todo_item(&Value::String(todo.clone()), None)]
    } else if let Some(Value::String(task)) = input.get("task") {
        let priority = input.get("priority").and_then(Value::as_str);
        vec![normalize_todo_item(&Value::String(task.clone()), priority)]
    } else if let Some(Value::Array(items)) = input.get("items") {
        items
            .iter()
            .map(|item| normalize_todo_item(item, None))
            .collect()
    } else if input.contains_key("content") {
        vec![normalize_todo_item(&call.input, None)]
    } else {
        return;
    };

    call.input = json!({ "todos": items });
}

fn normalize_todo_item(item: &Value, priority_hint: Option<&str>) -> Value {
    let (content, status, priority, id) = match item {
        Value::String(s) => (s.clone(), None, priority_hint.map(str::to_string), None),
        Value::Object(fields) => (
            fields
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            fields.get("status").and_then(Value::as_str).map(str::to_string),
            fields
                .get("priority")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| priority_hint.map(str::to_string)),
            fields.get("id").and_then(Value::as_str).map(str::to_string),
        ),
        other => (other.to_string(), None, None, None),
    };

    let status = match status.as_deref() {
        Some("in_progress") => "in_progress",
        Some("completed") => "completed",
        _ => "pending",
    };
    let priority = match priority.as_deref() {
        Some("high") => "high",
        Some("low") => "low",
        _ => "medium",
    };
    let id = id.unwrap_or_else(|| slugify(&content));

    json!({
        "content": content,
        "status": status,
        "priority": priority,
        "id": id,
    })
}

/// Derive a todo id from its content: lowercase, non-alphanumerics to `-`,
/// repeats collapsed, trimmed, capped at 50 chars, `task` when empty.
pub fn slugify(content: &str) -> String {
    let mut slug = String::with_capacity(content.len());
    let mut last_dash = false;
    for ch in content.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(50).collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Step 6: fetch tools pointed at local files become Read calls.
pub fn apply_semantic_fix(call: &mut ToolUseCall) {
    if call.name != "WebFetch" && call.name != "Fetch" {
        return;
    }
    let Value::Object(input) = &call.input else {
        return;
    };
    let Some(url) = input.get("url").and_then(Value::as_str) else {
        return;
    };
    if let Some(path) = url.strip_prefix("file://") {
        call.name = "Read".to_string();
        call.input = json!({ "file_path": path });
    }
}

/// Step 7: schema validation. Required properties must be present and no
/// key may fall outside the schema's properties.
pub fn validate_against_schema(call: &ToolUseCall, tool: &ToolDefinition) -> ToolValidation {
    let mut v = ToolValidation::default();

    let Value::Object(input) = &call.input else {
        v.invalid_params.push("<input is not an object>".to_string());
        return v;
    };

    for required in &tool.input_schema.required {
        if !input.contains_key(required) {
            v.missing_params.push(required.clone());
        }
    }
    for key in input.keys() {
        if !tool.input_schema.properties.contains_key(key) {
            v.invalid_params.push(key.clone());
        }
    }

    v.is_valid = v.missing_params.is_empty() && v.invalid_params.is_empty();
    v
}

fn titlecase(raw: &str) -> String {
    raw.split(|c: char| c == '-' || c == '_' || c == ' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Service
// ============================================================================

pub struct CorrectionService {
    settings: Arc<Settings>,
    health: Arc<EndpointHealthManager>,
    client: reqwest::Client,
}

impl CorrectionService {
    pub fn new(
        settings: Arc<Settings>,
        health: Arc<EndpointHealthManager>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            settings,
            health,
            client,
        }
    }

    /// Run the full pipeline over one candidate call.
    pub async fn correct(
        &self,
        original: ToolUseCall,
        tools: &[ToolDefinition],
    ) -> CorrectionOutcome {
        if self
            .settings
            .correction
            .skip_tools
            .iter()
            .any(|t| t == &original.name)
        {
            return CorrectionOutcome::Skipped(original);
        }

        let mut call = original.clone();
        let mut validation = ToolValidation::default();

        normalize_tool_name(&mut call, tools, &mut validation);
        map_slash_command(&mut call, tools);
        apply_param_renames(&mut call);
        let multiedit_ok = fix_multiedit_shape(&mut call);
        normalize_todowrite(&mut call);
        apply_semantic_fix(&mut call);

        let Some(tool) = tools.iter().find(|t| t.name == call.name) else {
            log::warn!("tool '{}' is not declared in this request", call.name);
            return CorrectionOutcome::Failed(original);
        };

        if multiedit_ok {
            let validation = validate_against_schema(&call, tool);
            if validation.is_valid {
                return CorrectionOutcome::Valid(call);
            }
            log::info!(
                "tool call '{}' invalid after local fixups (missing: {:?}, extraneous: {:?})",
                call.name,
                validation.missing_params,
                validation.invalid_params
            );
        }

        if !self.settings.correction.enabled || self.settings.correction.endpoints.is_empty() {
            return CorrectionOutcome::Failed(original);
        }

        match self.llm_correct(&call, tool).await {
            Ok(repaired) => {
                let check = validate_against_schema(&repaired, tool);
                if check.is_valid {
                    CorrectionOutcome::Valid(repaired)
                } else {
                    log::warn!(
                        "LLM correction for '{}' still invalid; keeping original call",
                        call.name
                    );
                    CorrectionOutcome::Failed(original)
                }
            }
            Err(err) => {
                log::warn!("LLM correction failed for '{}': {}", call.name, err);
                CorrectionOutcome::Failed(original)
            }
        }
    }

    /// Step 8: ask the correction model for a repaired call. Same failover
    /// and connect-timeout rules as the request path, with one retry per
    /// endpoint inside a bounded attempt budget.
    async fn llm_correct(
        &self,
        call: &ToolUseCall,
        tool: &ToolDefinition,
    ) -> Result<ToolUseCall, ProxyError> {
        let schema = serde_json::to_value(&tool.input_schema)?;
        let prompt = format!(
            "The following tool call is invalid:\n{}\n\nThe tool '{}' expects this JSON schema:\n{}\n\n\
             Respond with ONLY a JSON object of the form {{\"name\": \"...\", \"input\": {{...}}}} \
             containing the corrected call. Preserve the caller's intent; do not invent values.",
            json!({ "name": call.name, "input": call.input }),
            tool.name,
            schema
        );

        let body = json!({
            "model": self.settings.correction.model,
            "messages": [
                {"role": "system", "content": "You repair malformed tool calls. Reply with a single JSON object and nothing else."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
        });

        let raw = self.post_with_failover(&body).await?;
        let parsed = parse_corrected_call(&raw, &call.id)?;
        Ok(parsed)
    }

    /// YES/NO tool-necessity question, only asked when the local classifier
    /// is unconfident. Failures default to "optional".
    pub async fn tool_necessity(&self, messages: &[AnthropicMessage]) -> bool {
        let verdict = classifier::classify(messages);
        if verdict.confident {
            return verdict.require;
        }
        if !self.settings.correction.enabled || self.settings.correction.endpoints.is_empty() {
            return false;
        }

        let transcript: Vec<String> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| format!("{}: {}", m.role, m.content.text()))
            .collect();

        let body = json!({
            "model": self.settings.correction.model,
            "messages": [
                {"role": "system", "content": "Answer YES if the next assistant turn must use tools to satisfy the request, otherwise NO. Answer with one word."},
                {"role": "user", "content": transcript.join("\n")}
            ],
            "temperature": 0.0,
        });

        match self.post_with_failover(&body).await {
            Ok(answer) => answer.trim().to_uppercase().starts_with("YES"),
            Err(err) => {
                log::warn!("tool necessity call failed, defaulting to optional: {}", err);
                false
            }
        }
    }

    /// POST to the correction pool, failing over across healthy endpoints.
    /// Returns the first choice's content.
    async fn post_with_failover(&self, body: &Value) -> Result<String, ProxyError> {
        let pool = &self.settings.correction.endpoints;
        if pool.is_empty() {
            return Err(ProxyError::PoolExhausted);
        }
        let timeout = Duration::from_secs(self.settings.correction.timeout_secs);

        let mut last_err: Option<ProxyError> = None;
        for _attempt in 0..self.settings.correction.attempts.max(1) {
            let Some(endpoint) = self.health.healthy_endpoint(pool) else {
                break;
            };
            // One retry per endpoint before moving on.
            for _retry in 0..2 {
                match self.post_once(&endpoint, body, timeout).await {
                    Ok(content) => {
                        self.health.record_success(&endpoint);
                        return Ok(content);
                    }
                    Err(err) => {
                        log::warn!("correction endpoint {} failed: {}", endpoint, err);
                        self.health.record_failure(&endpoint);
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(ProxyError::PoolExhausted))
    }

    async fn post_once(
        &self,
        endpoint: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<String, ProxyError> {
        let response = self
            .client
            .post(endpoint)
            .header(
                "Authorization",
                format!("Bearer {}", self.settings.correction.api_key),
            )
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamStatus { status, body });
        }

        let parsed: super::openai::ChatCompletionResponse = response.json().await?;
        parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ProxyError::CorrectionFailed("empty correction response".to_string()))
    }
}

/// Parse the correction model's reply into a call, tolerating markdown
/// fences and an `arguments` alias for `input`.
fn parse_corrected_call(raw: &str, original_id: &str) -> Result<ToolUseCall, ProxyError> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| ProxyError::CorrectionFailed(format!("unparseable correction: {}", e)))?;

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::CorrectionFailed("correction missing tool name".to_string()))?
        .to_string();

    let input = value
        .get("input")
        .or_else(|| value.get("arguments"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    if !input.is_object() {
        return Err(ProxyError::CorrectionFailed(
            "corrected input is not an object".to_string(),
        ));
    }

    Ok(ToolUseCall {
        id: original_id.to_string(),
        name,
        input,
    })
}
