// Harmony channel parser
// Tokenizes `<|start|>…<|channel|>…<|message|>…<|end|>` annotated assistant
// output and folds it into typed channels. Parsing never fails: malformed
// input degrades into invalid tokens / fallback channels and every anomaly
// is recorded on the returned message.

const TOKEN_START: &str = "<|start|>";
const TOKEN_CHANNEL: &str = "<|channel|>";
const TOKEN_MESSAGE: &str = "<|message|>";
const TOKEN_END: &str = "<|end|>";
const TOKEN_RETURN: &str = "<|return|>";
const TOKEN_CALL: &str = "<|call|>";
const TOKEN_CONSTRAIN: &str = "<|constrain|>";

const RECOGNIZED: &[&str] = &[
    TOKEN_START,
    TOKEN_CHANNEL,
    TOKEN_MESSAGE,
    TOKEN_END,
    TOKEN_RETURN,
    TOKEN_CALL,
    TOKEN_CONSTRAIN,
];

/// True when the content carries any recognized Harmony token.
pub fn is_harmony_formatted(content: &str) -> bool {
    RECOGNIZED.iter().any(|t| content.contains(t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Start,
    Channel,
    Message,
    End,
    Return,
    Call,
    Constrain,
    Text,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarmonyToken {
    pub kind: TokenKind,
    pub value: String,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Analysis,
    Final,
    Commentary,
    Unknown,
}

impl ChannelType {
    fn classify(id: &str) -> ChannelType {
        match id {
            "analysis" => ChannelType::Analysis,
            "final" => ChannelType::Final,
            "commentary" => ChannelType::Commentary,
            _ => ChannelType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub channel_type: ChannelType,
    pub content: String,
    pub recipient: Option<String>,
    pub constraint_type: Option<String>,
    pub raw_channel: String,
    pub valid: bool,
}

/// Fully parsed Harmony message. `raw` always equals the input.
#[derive(Debug, Clone)]
pub struct HarmonyMessage {
    pub raw: String,
    pub channels: Vec<Channel>,
    pub thinking_text: String,
    pub response_text: String,
    pub has_harmony: bool,
    pub parse_errors: Vec<String>,
}

/// Produce the ordered token stream. Garbled `<|…|>` sequences are kept as
/// invalid tokens rather than dropped; unterminated `<|` sequences become
/// text so no content is lost.
pub fn tokenize(content: &str) -> (Vec<HarmonyToken>, Vec<String>) {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        match rest.find("<|") {
            None => {
                tokens.push(HarmonyToken {
                    kind: TokenKind::Text,
                    value: rest.to_string(),
                    valid: true,
                });
                break;
            }
            Some(idx) => {
                if idx > 0 {
                    tokens.push(HarmonyToken {
                        kind: TokenKind::Text,
                        value: rest[..idx].to_string(),
                        valid: true,
                    });
                }
                let tail = &rest[idx..];
                match tail.find("|>") {
                    None => {
                        // No closing delimiter until EOF.
                        errors.push("unterminated token sequence at end of input".to_string());
                        tokens.push(HarmonyToken {
                            kind: TokenKind::Text,
                            value: tail.to_string(),
                            valid: false,
                        });
                        break;
                    }
                    Some(close) => {
                        let raw_token = &tail[..close + 2];
                        let kind = match raw_token {
                            TOKEN_START => TokenKind::Start,
                            TOKEN_CHANNEL => TokenKind::Channel,
                            TOKEN_MESSAGE => TokenKind::Message,
                            TOKEN_END => TokenKind::End,
                            TOKEN_RETURN => TokenKind::Return,
                            TOKEN_CALL => TokenKind::Call,
                            TOKEN_CONSTRAIN => TokenKind::Constrain,
                            _ => TokenKind::Unknown,
                        };
                        let valid = kind != TokenKind::Unknown;
                        if !valid {
                            errors.push(format!("unrecognized token: {}", raw_token));
                        }
                        tokens.push(HarmonyToken {
                            kind,
                            value: raw_token.to_string(),
                            valid,
                        });
                        rest = &tail[close + 2..];
                        continue;
                    }
                }
            }
        }
    }

    (tokens, errors)
}

#[derive(Debug, PartialEq)]
enum FoldState {
    Idle,
    Header,
    Content,
}

struct ChannelBuilder {
    id: String,
    recipient: Option<String>,
    constraint_type: Option<String>,
    raw_header: String,
    content: String,
    saw_message: bool,
    valid: bool,
}

impl ChannelBuilder {
    fn new() -> Self {
        Self {
            id: String::new(),
            recipient: None,
            constraint_type: None,
            raw_header: String::new(),
            content: String::new(),
            saw_message: true,
            valid: true,
        }
    }

    fn finish(self, errors: &mut Vec<String>) -> Channel {
        if !self.saw_message {
            errors.push(format!(
                "channel '{}' closed without a message delimiter",
                self.id
            ));
        }
        Channel {
            channel_type: ChannelType::classify(&self.id),
            content: self.content,
            recipient: self.recipient,
            constraint_type: self.constraint_type,
            raw_channel: if self.raw_header.is_empty() {
                self.id.clone()
            } else {
                self.raw_header.trim().to_string()
            },
            valid: self.valid && self.saw_message,
        }
    }
}

/// Parse arbitrary assistant output into a HarmonyMessage. Never panics and
/// never returns an error; callers may inspect `parse_errors`.
pub fn parse_robust(content: &str) -> HarmonyMessage {
    let has_harmony = is_harmony_formatted(content);
    let (tokens, mut errors) = tokenize(content);

    let mut channels: Vec<Channel> = Vec::new();
    let mut state = FoldState::Idle;
    let mut current: Option<ChannelBuilder> = None;
    // Pending header directives waiting for the identifier text that follows.
    let mut awaiting_channel_id = false;
    let mut awaiting_constraint = false;

    for token in &tokens {
        match token.kind {
            TokenKind::Start => {
                if let Some(builder) = current.take() {
                    channels.push(builder.finish(&mut errors));
                }
                let mut builder = ChannelBuilder::new();
                builder.saw_message = false;
                current = Some(builder);
                state = FoldState::Header;
                awaiting_channel_id = false;
                awaiting_constraint = false;
            }
            TokenKind::Channel => {
                if current.is_none() {
                    // Channel marker with no start: tolerate with an implicit channel.
                    errors.push("channel token outside a started message".to_string());
                    let mut builder = ChannelBuilder::new();
                    builder.saw_message = false;
                    builder.valid = false;
                    current = Some(builder);
                    state = FoldState::Header;
                }
                awaiting_channel_id = true;
            }
            TokenKind::Constrain => {
                if state == FoldState::Header {
                    awaiting_constraint = true;
                } else {
                    errors.push("constrain token outside a channel header".to_string());
                }
            }
            TokenKind::Message => {
                if let Some(ref mut builder) = current {
                    builder.saw_message = true;
                    state = FoldState::Content;
                } else {
                    // Message with no header at all: open an anonymous channel.
                    errors.push("message token without channel header".to_string());
                    let mut builder = ChannelBuilder::new();
                    builder.valid = false;
                    current = Some(builder);
                    state = FoldState::Content;
                }
                awaiting_channel_id = false;
                awaiting_constraint = false;
            }
            TokenKind::End | TokenKind::Return | TokenKind::Call => {
                if let Some(builder) = current.take() {
                    channels.push(builder.finish(&mut errors));
                } else {
                    errors.push(format!("dangling terminator: {}", token.value));
                }
                state = FoldState::Idle;
            }
            TokenKind::Text => match state {
                FoldState::Header => {
                    if let Some(ref mut builder) = current {
                        builder.raw_header.push_str(&token.value);
                        parse_header_text(
                            &token.value,
                            builder,
                            &mut awaiting_channel_id,
                            &mut awaiting_constraint,
                            &mut errors,
                        );
                        if !token.valid {
                            builder.valid = false;
                        }
                    }
                }
                FoldState::Content => {
                    if let Some(ref mut builder) = current {
                        builder.content.push_str(&token.value);
                        if !token.valid {
                            builder.valid = false;
                        }
                    }
                }
                FoldState::Idle => {
                    // Free text between channels is preserved verbatim.
                    if !token.value.trim().is_empty() {
                        channels.push(Channel {
                            channel_type: ChannelType::Unknown,
                            content: token.value.clone(),
                            recipient: None,
                            constraint_type: None,
                            raw_channel: String::new(),
                            valid: token.valid,
                        });
                    }
                }
            },
            TokenKind::Unknown => {
                // Already recorded at tokenize time; poison the active channel.
                if let Some(ref mut builder) = current {
                    builder.valid = false;
                }
            }
        }
    }

    if let Some(builder) = current.take() {
        // EOF closes the channel; content up to EOF is kept and stays valid.
        let mut builder = builder;
        if state == FoldState::Content {
            builder.saw_message = true;
        }
        channels.push(builder.finish(&mut errors));
    }

    let mut thinking_parts = Vec::new();
    let mut final_parts = Vec::new();
    let mut unknown_parts = Vec::new();
    for ch in &channels {
        match ch.channel_type {
            ChannelType::Analysis => {
                if !ch.content.is_empty() {
                    thinking_parts.push(ch.content.as_str());
                }
            }
            ChannelType::Final => {
                if !ch.content.is_empty() {
                    final_parts.push(ch.content.as_str());
                }
            }
            ChannelType::Unknown => {
                if !ch.content.is_empty() {
                    unknown_parts.push(ch.content.as_str());
                }
            }
            ChannelType::Commentary => {}
        }
    }

    let thinking_text = thinking_parts.join("\n");
    let response_text = if final_parts.is_empty() {
        unknown_parts.join("\n")
    } else {
        final_parts.join("\n")
    };

    let any_content = !thinking_text.is_empty()
        || !response_text.is_empty()
        || channels.iter().any(|c| !c.content.is_empty());

    let mut channels = channels;
    let mut response_text = response_text;
    if !any_content && !content.is_empty() {
        // Nothing was extracted: keep the raw input on a synthetic channel.
        errors.push("no content extracted; falling back to raw input".to_string());
        channels.push(Channel {
            channel_type: ChannelType::Unknown,
            content: content.to_string(),
            recipient: None,
            constraint_type: None,
            raw_channel: "fallback".to_string(),
            valid: false,
        });
        response_text = content.to_string();
    }

    HarmonyMessage {
        raw: content.to_string(),
        channels,
        thinking_text,
        response_text,
        has_harmony,
        parse_errors: errors,
    }
}

/// Pull channel id, recipient, and constraint type out of header text.
fn parse_header_text(
    text: &str,
    builder: &mut ChannelBuilder,
    awaiting_channel_id: &mut bool,
    awaiting_constraint: &mut bool,
    errors: &mut Vec<String>,
) {
    for word in text.split_whitespace() {
        if *awaiting_channel_id && builder.id.is_empty() {
            // The identifier may be glued to `to=` (e.g. "commentary to=functions.X").
            builder.id = word.to_string();
            *awaiting_channel_id = false;
            continue;
        }
        if *awaiting_constraint {
            if builder.constraint_type.is_some() {
                errors.push(format!(
                    "multiple constraint types in one channel; keeping '{}'",
                    word
                ));
            }
            builder.constraint_type = Some(word.to_string());
            *awaiting_constraint = false;
            continue;
        }
        if let Some(recipient) = word.strip_prefix("to=") {
            builder.recipient = Some(recipient.to_string());
        }
        // Role words ("assistant") and anything else stay in raw_header only.
    }
}
