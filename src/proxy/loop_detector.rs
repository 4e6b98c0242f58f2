//! Loop detection for repetitive tool calling in a conversation transcript
//!
//! Detects two unproductive shapes before a request is dispatched upstream:
//! - consecutive identical: the same tool + same arguments in ≥3 assistant
//!   turns in a row
//! - alternating pattern: two distinct calls oscillating (A→B→A→B…) for ≥6
//!   turns
//!
//! A prior detection message in the transcript fences off everything before
//! it, so an already-broken loop is never reported twice.

use super::anthropic::{AnthropicMessage, ContentBlock, MessagesResponse};
use super::transform::to_sorted_json_string;

/// Prefix of every breaking message; also what step 1 recognizes.
pub const LOOP_BREAK_PREFIX: &str = "🔄 Loop Detection: ";

const CONSECUTIVE_THRESHOLD: usize = 3;
const ALTERNATING_THRESHOLD: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    ConsecutiveIdentical,
    AlternatingPattern,
    None,
}

#[derive(Debug, Clone)]
pub struct LoopDetection {
    pub has_loop: bool,
    pub loop_type: LoopKind,
    pub tool_name: String,
    pub count: usize,
    pub recommendation: String,
}

impl LoopDetection {
    fn none() -> Self {
        Self {
            has_loop: false,
            loop_type: LoopKind::None,
            tool_name: String::new(),
            count: 0,
            recommendation: String::new(),
        }
    }
}

/// Tool fingerprint: name plus canonical argument serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    name: String,
    arguments: String,
}

/// True when the message's leading text marks a previous loop break.
fn is_break_message(msg: &AnthropicMessage) -> bool {
    if msg.role != "assistant" {
        return false;
    }
    let text = msg.content.text();
    let lead: String = text
        .trim_start()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .chars()
        .take(32)
        .collect();
    lead.to_lowercase().starts_with("loop detection")
}

/// Fingerprint of an assistant message carrying exactly one tool call.
fn single_call_fingerprint(msg: &AnthropicMessage) -> Option<Fingerprint> {
    if msg.role != "assistant" {
        return None;
    }
    let mut calls = msg.content.as_blocks().into_iter().filter_map(|b| match b {
        ContentBlock::ToolUse { name, input, .. } => Some(Fingerprint {
            name,
            arguments: to_sorted_json_string(&input),
        }),
        _ => None,
    });
    let first = calls.next()?;
    if calls.next().is_some() {
        return None;
    }
    Some(first)
}

pub fn detect(messages: &[AnthropicMessage]) -> LoopDetection {
    // Analyze only after the most recent break message, if any.
    let start = messages
        .iter()
        .rposition(is_break_message)
        .map(|i| i + 1)
        .unwrap_or(0);

    // Fingerprint stream of assistant turns in the window. A turn without a
    // single tool call is a sequence breaker, kept as None.
    let sequence: Vec<Option<Fingerprint>> = messages[start..]
        .iter()
        .filter(|m| m.role == "assistant")
        .map(single_call_fingerprint)
        .collect();

    if let Some(detection) = detect_consecutive(&sequence) {
        return detection;
    }
    if let Some(detection) = detect_alternating(&sequence) {
        return detection;
    }
    LoopDetection::none()
}

fn detect_consecutive(sequence: &[Option<Fingerprint>]) -> Option<LoopDetection> {
    let mut best: Option<(Fingerprint, usize)> = None;
    let mut run: Option<(Fingerprint, usize)> = None;

    for entry in sequence {
        match entry {
            Some(fp) => {
                run = match run.take() {
                    Some((current, count)) if &current == fp => Some((current, count + 1)),
                    _ => Some((fp.clone(), 1)),
                };
                if let Some((ref fp, count)) = run {
                    if count >= CONSECUTIVE_THRESHOLD {
                        best = Some((fp.clone(), count));
                    }
                }
            }
            None => run = None,
        }
    }

    best.map(|(fp, count)| LoopDetection {
        has_loop: true,
        loop_type: LoopKind::ConsecutiveIdentical,
        recommendation: recommendation_for(&fp.name),
        tool_name: fp.name,
        count,
    })
}

fn detect_alternating(sequence: &[Option<Fingerprint>]) -> Option<LoopDetection> {
    if sequence.len() < ALTERNATING_THRESHOLD {
        return None;
    }

    // Longest suffix oscillating between the last two fingerprints.
    let last = sequence.last()?.as_ref()?;
    let prev = sequence.get(sequence.len() - 2)?.as_ref()?;
    if last == prev {
        // Identical-argument alternation is really a consecutive run and is
        // handled (or rejected) by the consecutive rule.
        return None;
    }

    let mut length = 2;
    for i in (0..sequence.len().saturating_sub(2)).rev() {
        let expected = if (sequence.len() - i) % 2 == 0 { prev } else { last };
        match &sequence[i] {
            Some(fp) if fp == expected => length += 1,
            _ => break,
        }
    }

    if length < ALTERNATING_THRESHOLD {
        return None;
    }

    let tool_name = if last.name == prev.name {
        last.name.clone()
    } else {
        format!("{} → {}", prev.name, last.name)
    };

    Some(LoopDetection {
        has_loop: true,
        loop_type: LoopKind::AlternatingPattern,
        recommendation: recommendation_for(&last.name),
        tool_name,
        count: length,
    })
}

fn recommendation_for(tool_name: &str) -> String {
    if tool_name == "TodoWrite" {
        "The todo list may already be updated. Check the current state of your todos \
         instead of writing them again."
            .to_string()
    } else {
        "Repeating the same tool call will not produce new information. Try a different \
         approach, or summarize what you have learned so far."
            .to_string()
    }
}

/// Synthetic assistant reply that breaks the loop. Its text starts with the
/// same prefix `detect` recognizes, so a follow-up run returns no loop.
pub fn breaking_response(detection: &LoopDetection, model: &str) -> MessagesResponse {
    let description = match detection.loop_type {
        LoopKind::ConsecutiveIdentical => format!(
            "the tool '{}' was called {} times in a row with identical arguments",
            detection.tool_name, detection.count
        ),
        LoopKind::AlternatingPattern => format!(
            "the calls [{}] repeated in an alternating pattern over {} turns",
            detection.tool_name, detection.count
        ),
        LoopKind::None => "a repetitive tool-calling pattern was detected".to_string(),
    };

    let text = format!(
        "{}{}. {}",
        LOOP_BREAK_PREFIX, description, detection.recommendation
    );

    MessagesResponse::synthetic(model, vec![ContentBlock::Text { text }], "tool_use")
}
