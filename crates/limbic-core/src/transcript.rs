//! Transcript parsing, layer extraction and input cleaning.
//!
//! A transcript is an ordered list of role-tagged messages whose content is
//! either a plain string or an array of typed blocks (`text`, `thinking`,
//! tool calls, ...). The most recent user → assistant exchange becomes one
//! turn: the user text is the input layer, assistant `thinking` blocks the
//! deliberation layer and assistant `text` blocks the output layer.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::CaptureConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Joined `text` blocks (or the plain string content).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => join(blocks.iter().filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })),
        }
    }

    /// Joined `thinking` blocks.
    pub fn thinking(&self) -> String {
        match &self.content {
            MessageContent::Text(_) => String::new(),
            MessageContent::Blocks(blocks) => join(blocks.iter().filter_map(|b| match b {
                ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                _ => None,
            })),
        }
    }
}

fn join<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    Malformed(String),
    NoAssistantReply,
    NoUserInput,
}

impl fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptError::Malformed(msg) => write!(f, "malformed transcript: {msg}"),
            TranscriptError::NoAssistantReply => write!(f, "transcript has no assistant reply"),
            TranscriptError::NoUserInput => {
                write!(f, "transcript has no user message before the reply")
            }
        }
    }
}

impl std::error::Error for TranscriptError {}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptLine {
    Bare(Message),
    Envelope { message: Message },
}

impl TranscriptLine {
    fn into_message(self) -> Message {
        match self {
            TranscriptLine::Bare(m) | TranscriptLine::Envelope { message: m } => m,
        }
    }
}

/// Parse a JSON array of messages, or JSONL with one message (or
/// `{"message": {...}}` envelope) per line. JSONL lines that are valid JSON
/// but not messages (snapshots, metadata) are skipped.
pub fn parse_transcript(raw: &str) -> Result<Vec<Message>, TranscriptError> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let lines: Vec<TranscriptLine> =
            serde_json::from_str(raw).map_err(|e| TranscriptError::Malformed(e.to_string()))?;
        return Ok(lines.into_iter().map(TranscriptLine::into_message).collect());
    }

    let mut messages = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| TranscriptError::Malformed(format!("line {}: {e}", n + 1)))?;
        if let Ok(parsed) = serde_json::from_value::<TranscriptLine>(value) {
            messages.push(parsed.into_message());
        }
    }
    Ok(messages)
}

/// Raw text of one turn, after cleaning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnLayers {
    pub input: String,
    pub deliberation: String,
    pub output: String,
    /// Speaker named in the raw input, if the host tagged one.
    pub speaker: Option<String>,
}

/// Blocks this crate injects itself; always removed so recall output is
/// never captured back as new input.
static RECALL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<limbic-recall>.*?</limbic-recall>").unwrap());
static AFFECT_BANNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\[AFFECT\b[^\]]*\].*$").unwrap());
static ZERO_WIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[\u{200B}-\u{200D}\u{2060}\u{FEFF}\u{00AD}]").unwrap());
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Normalizes and strips injected context from each layer.
#[derive(Debug, Clone)]
pub struct InputCleaner {
    strip: Vec<Regex>,
    speaker: Option<Regex>,
}

impl InputCleaner {
    /// Invalid patterns are skipped; [`crate::Config::validated`] reports them.
    pub fn new(cfg: &CaptureConfig) -> Self {
        Self {
            strip: cfg
                .strip_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            speaker: cfg.speaker_pattern.as_deref().and_then(|p| Regex::new(p).ok()),
        }
    }

    /// NFKC normalization and zero-width removal. Runs before any matching so
    /// lookalike characters cannot slip past the filters.
    pub fn normalize(text: &str) -> String {
        let nfkc: String = text.nfkc().collect();
        ZERO_WIDTH.replace_all(&nfkc, "").into_owned()
    }

    pub fn clean(&self, text: &str) -> String {
        let mut out = Self::normalize(text);
        out = RECALL_BLOCK.replace_all(&out, "").into_owned();
        out = AFFECT_BANNER.replace_all(&out, "").into_owned();
        for re in &self.strip {
            out = re.replace_all(&out, "").into_owned();
        }
        BLANK_LINES.replace_all(out.trim(), "\n\n").into_owned()
    }

    pub fn speaker(&self, raw: &str) -> Option<String> {
        let re = self.speaker.as_ref()?;
        let normalized = Self::normalize(raw);
        let name = re.captures(&normalized)?.get(1)?.as_str().trim().to_string();
        (!name.is_empty()).then_some(name)
    }
}

/// Locate the most recent user → assistant exchange and clean its layers.
pub fn extract_layers(
    messages: &[Message],
    cleaner: &InputCleaner,
) -> Result<TurnLayers, TranscriptError> {
    let reply_idx = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant && !m.text().trim().is_empty())
        .ok_or(TranscriptError::NoAssistantReply)?;

    // User messages that only carry tool results have no text and are skipped.
    let input_idx = messages[..reply_idx]
        .iter()
        .rposition(|m| m.role == Role::User && !m.text().trim().is_empty())
        .ok_or(TranscriptError::NoUserInput)?;

    let raw_input = messages[input_idx].text();
    let assistant = messages[input_idx + 1..=reply_idx]
        .iter()
        .filter(|m| m.role == Role::Assistant);

    let mut thinking = Vec::new();
    let mut output = Vec::new();
    for m in assistant {
        let t = m.thinking();
        if !t.is_empty() {
            thinking.push(t);
        }
        let o = m.text();
        if !o.trim().is_empty() {
            output.push(o);
        }
    }

    Ok(TurnLayers {
        speaker: cleaner.speaker(&raw_input),
        input: cleaner.clean(&raw_input),
        deliberation: cleaner.clean(&thinking.join("\n")),
        output: cleaner.clean(&output.join("\n")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> InputCleaner {
        InputCleaner::new(&CaptureConfig::default())
    }

    fn text(t: &str) -> ContentBlock {
        ContentBlock::Text { text: t.into() }
    }

    fn think(t: &str) -> ContentBlock {
        ContentBlock::Thinking { thinking: t.into() }
    }

    #[test]
    fn test_extract_latest_pair() {
        let messages = vec![
            Message::user("first question"),
            Message::assistant(vec![text("first answer")]),
            Message::user("second question"),
            Message::assistant(vec![think("pondering"), text("second answer")]),
        ];
        let layers = extract_layers(&messages, &cleaner()).unwrap();
        assert_eq!(layers.input, "second question");
        assert_eq!(layers.deliberation, "pondering");
        assert_eq!(layers.output, "second answer");
    }

    #[test]
    fn test_extract_spans_tool_calls() {
        let json = r#"[
            {"role": "user", "content": "check the logs please"},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "need to read logs"},
                {"type": "tool_use", "id": "t1", "name": "read", "input": {}}
            ]},
            {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "..."}]},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "found the error"},
                {"type": "text", "text": "The logs show a timeout."}
            ]}
        ]"#;
        let messages = parse_transcript(json).unwrap();
        let layers = extract_layers(&messages, &cleaner()).unwrap();
        assert_eq!(layers.input, "check the logs please");
        assert_eq!(layers.deliberation, "need to read logs\nfound the error");
        assert_eq!(layers.output, "The logs show a timeout.");
    }

    #[test]
    fn test_missing_reply_or_input() {
        let only_user = vec![Message::user("hello")];
        assert_eq!(
            extract_layers(&only_user, &cleaner()),
            Err(TranscriptError::NoAssistantReply)
        );
        let only_assistant = vec![Message::assistant(vec![text("hi")])];
        assert_eq!(
            extract_layers(&only_assistant, &cleaner()),
            Err(TranscriptError::NoUserInput)
        );
    }

    #[test]
    fn test_strips_recall_block_and_banner() {
        let raw = "<limbic-recall>\n[2026-01-01 10:00] alice: In: old | Out: old\n</limbic-recall>\n\
                   [AFFECT: SEEKING 0.6 CARE 0.5]\nwhat did we decide about the roof?";
        assert_eq!(cleaner().clean(raw), "what did we decide about the roof?");
    }

    #[test]
    fn test_strips_message_id_and_channel_prefix() {
        let raw = "[Telegram Alice Smith id:12345 2026-02-01 10:00 UTC] is the build green? [message_id: 998]";
        let c = cleaner();
        assert_eq!(c.clean(raw), "is the build green?");
        assert_eq!(c.speaker(raw).as_deref(), Some("Alice Smith"));
    }

    #[test]
    fn test_nfkc_normalization_defeats_lookalikes() {
        // Fullwidth letters normalize to ASCII.
        let raw = "ＨＥＡＲＴＢＥＡＴ_ＯＫ";
        assert_eq!(cleaner().clean(raw), "HEARTBEAT_OK");
        assert_eq!(InputCleaner::normalize("ok\u{200B}ay"), "okay");
    }

    #[test]
    fn test_parse_jsonl_envelopes_and_skips_metadata() {
        let jsonl = concat!(
            r#"{"type":"user","message":{"role":"user","content":"how does auth work?"}}"#,
            "\n",
            r#"{"type":"file-history-snapshot","snapshot":{}}"#,
            "\n",
            r#"{"role":"assistant","content":[{"type":"text","text":"JWT in cookies."}]}"#,
            "\n"
        );
        let messages = parse_transcript(jsonl).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].text(), "JWT in cookies.");
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            parse_transcript("{not json"),
            Err(TranscriptError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_role_tolerated() {
        let messages = parse_transcript(r#"[{"role":"tool","content":"x"}]"#).unwrap();
        assert_eq!(messages[0].role, Role::Other);
    }
}
