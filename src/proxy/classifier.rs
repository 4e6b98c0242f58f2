// Tool-necessity pre-classification
// Local two-stage classifier that decides, from the recent transcript,
// whether the next assistant turn must use tools. When it is confident the
// LLM necessity call is skipped entirely.

use std::sync::OnceLock;

use regex::Regex;

use super::anthropic::{AnthropicMessage, ContentBlock};

const STRONG_VERBS: &[&str] = &[
    "create", "creating", "update", "updating", "edit", "editing", "write", "writing", "modify",
    "modifying", "implement", "implementing", "fix", "fixing", "revert", "reverting", "delete",
    "deleting",
];

const WEAK_IMPL_VERBS: &[&str] = &[
    "add", "adding", "change", "changing", "make", "making", "refactor", "refactoring", "rename",
    "renaming", "remove", "removing", "set", "setting",
];

const RESEARCH_VERBS: &[&str] = &[
    "read", "reading", "analyze", "analyzing", "explain", "explaining", "describe", "describing",
    "investigate", "investigating",
];

const RESEARCH_TOOLS: &[&str] = &["Read", "Grep", "Glob", "Task"];

/// How many trailing messages stage A scans.
const SCAN_WINDOW: usize = 6;

fn file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)\b[A-Za-z0-9_.\-]+\.
              (md|go|ts|tsx|js|jsx|rs|py|yaml|yml|json|toml|sh|sql|txt|html|css|c|h|cpp|java)\b",
        )
        .expect("static file pattern must compile")
    })
}

/// Signals extracted by stage A.
#[derive(Debug, Default)]
pub struct Signals {
    pub strong_verbs: Vec<String>,
    pub weak_impl_verbs: Vec<String>,
    pub research_verbs: Vec<String>,
    pub file_artifacts: Vec<String>,
    pub research_done: Vec<String>,
}

impl Signals {
    fn has_impl_verb(&self) -> bool {
        !self.strong_verbs.is_empty() || !self.weak_impl_verbs.is_empty()
    }
}

/// Stage B verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Necessity {
    pub require: bool,
    pub confident: bool,
}

pub fn extract_signals(messages: &[AnthropicMessage]) -> Signals {
    let mut signals = Signals::default();

    let visible: Vec<&AnthropicMessage> = messages
        .iter()
        .filter(|m| m.role != "system")
        .collect();

    let window_start = visible.len().saturating_sub(SCAN_WINDOW);
    for msg in &visible[window_start..] {
        let text = msg.content.text().to_lowercase();
        for word in text.split(|c: char| !c.is_alphanumeric() && c != '.' && c != '_' && c != '-')
        {
            if word.is_empty() {
                continue;
            }
            let bare = word.trim_matches(|c: char| c == '.' || c == '-');
            if STRONG_VERBS.contains(&bare) {
                signals.strong_verbs.push(bare.to_string());
            } else if WEAK_IMPL_VERBS.contains(&bare) {
                signals.weak_impl_verbs.push(bare.to_string());
            } else if RESEARCH_VERBS.contains(&bare) {
                signals.research_verbs.push(bare.to_string());
            }
        }
        for artifact in file_pattern().find_iter(&text) {
            signals.file_artifacts.push(artifact.as_str().to_string());
        }
    }

    // research_done markers come from the immediately preceding assistant turn.
    if let Some(last_assistant) = visible.iter().rev().find(|m| m.role == "assistant") {
        for block in last_assistant.content.as_blocks() {
            if let ContentBlock::ToolUse { name, .. } = block {
                if RESEARCH_TOOLS.contains(&name.as_str()) {
                    signals.research_done.push(format!("research_done:{}", name));
                }
            }
        }
    }

    signals
}

/// Stage B: ordered rules, first match wins.
pub fn classify_signals(signals: &Signals) -> Necessity {
    if !signals.strong_verbs.is_empty() && !signals.file_artifacts.is_empty() {
        return Necessity { require: true, confident: true };
    }
    if signals.has_impl_verb() && !signals.file_artifacts.is_empty() {
        return Necessity { require: true, confident: true };
    }
    if !signals.research_done.is_empty() && signals.has_impl_verb() {
        return Necessity { require: true, confident: true };
    }
    if !signals.strong_verbs.is_empty() {
        return Necessity { require: true, confident: false };
    }
    if !signals.research_verbs.is_empty() && !signals.has_impl_verb() {
        return Necessity { require: false, confident: true };
    }
    Necessity { require: false, confident: false }
}

/// Convenience wrapper over both stages.
pub fn classify(messages: &[AnthropicMessage]) -> Necessity {
    classify_signals(&extract_signals(messages))
}
