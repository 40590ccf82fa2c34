//! Streaming Tellask parser
//!
//! Segments generated text into call blocks and the prose between them
//! without ever needing the whole message. Input may arrive in chunks of any
//! size, including chunks that split a multi-byte character; bytes are held
//! until a full line is available and only then classified.
//!
//! ```text
//! Some prose.                       <- prose
//! !?@alice @bob !tellaskSession rv  <- headline (target-shaped)
//! !?@carol                          <- headline continuation
//! !?Please review the patch.        <- body
//! !?                                <- blank body line
//! !?Thanks.                         <- body
//!                                   <- prose, terminates the block
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::CallKind;

/// Marker that makes a line part of a call block, at column 0
pub const LINE_PREFIX: &str = "!?";
/// Addressing sigil in front of a target name
pub const MENTION_SIGIL: char = '@';
/// Headline keyword introducing a session slug
pub const SESSION_DIRECTIVE: &str = "!tellaskSession";

/// Reserved target routing the call to the human interface
pub const HUMAN_TARGET: &str = "human";
/// Reserved target routing the call back to the supdialog
pub const TELLASKER_TARGET: &str = "tellasker";
/// Reserved target opening a fresh-boots sideline of the caller
pub const SELF_TARGET: &str = "self";

/// One parsed call block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellaskCall {
    /// Kind implied by the first named target
    pub kind: CallKind,
    /// Named targets in headline order, deduplicated
    pub mentions: Vec<String>,
    /// Slug from the first session directive, if it carried a valid one
    pub session_slug: Option<String>,
    /// Number of session directives seen in the headline
    pub session_directives: usize,
    /// Headline payload; continuation lines are joined with `\n`
    pub headline: String,
    /// Body payload lines in source order
    pub body: Vec<String>,
    /// First line was not target-shaped; never dispatched
    pub malformed: bool,
}

impl TellaskCall {
    /// Body lines joined back into text
    pub fn body_text(&self) -> String {
        self.body.join("\n")
    }

    /// A teammate call naming more than one recipient
    pub fn is_collective(&self) -> bool {
        self.kind == CallKind::Teammate && self.mentions.len() > 1
    }
}

/// Output unit of the parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TellaskEvent {
    /// One complete non-protocol line, without its terminator
    Prose(String),
    /// A block terminated by prose or end of input
    Call(TellaskCall),
}

/// Incremental parser for one generated message
#[derive(Debug, Default)]
pub struct TellaskParser {
    /// Bytes of the line currently being received
    pending: Vec<u8>,
    /// Block under construction
    block: Option<BlockBuilder>,
}

impl TellaskParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a text chunk
    pub fn push(&mut self, chunk: &str) -> Vec<TellaskEvent> {
        self.push_bytes(chunk.as_bytes())
    }

    /// Feed raw bytes; a chunk may end anywhere, even inside a character
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<TellaskEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = decode_line(&self.pending[start..end]);
            self.feed_line(line, &mut events);
            start = end + 1;
        }
        self.pending.drain(..start);

        events
    }

    /// Flush the trailing partial line and any open block
    pub fn finish(&mut self) -> Vec<TellaskEvent> {
        let mut events = Vec::new();

        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.feed_line(decode_line(&rest), &mut events);
        }
        if let Some(block) = self.block.take() {
            events.push(TellaskEvent::Call(block.finish()));
        }

        events
    }

    /// Whether a block is open, i.e. the last complete line was a protocol line
    pub fn in_block(&self) -> bool {
        self.block.is_some()
    }

    fn feed_line(&mut self, line: String, events: &mut Vec<TellaskEvent>) {
        match line.strip_prefix(LINE_PREFIX) {
            Some(payload) => match &mut self.block {
                Some(block) => block.push(payload),
                None => self.block = Some(BlockBuilder::start(payload)),
            },
            None => {
                if let Some(block) = self.block.take() {
                    events.push(TellaskEvent::Call(block.finish()));
                }
                events.push(TellaskEvent::Prose(line));
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug)]
struct BlockBuilder {
    headline: Vec<String>,
    body: Vec<String>,
    in_headline: bool,
    malformed: bool,
}

impl BlockBuilder {
    fn start(payload: &str) -> Self {
        let well_formed = is_target_shaped(payload);
        Self {
            headline: vec![payload.to_string()],
            body: Vec::new(),
            in_headline: well_formed,
            malformed: !well_formed,
        }
    }

    fn push(&mut self, payload: &str) {
        if self.in_headline && is_target_shaped(payload) {
            self.headline.push(payload.to_string());
        } else {
            self.in_headline = false;
            self.body.push(payload.to_string());
        }
    }

    fn finish(self) -> TellaskCall {
        let headline = self.headline.join("\n");

        if self.malformed {
            debug!(headline = %headline, "Malformed tellask block");
            return TellaskCall {
                kind: CallKind::Teammate,
                mentions: Vec::new(),
                session_slug: None,
                session_directives: 0,
                headline,
                body: self.body,
                malformed: true,
            };
        }

        let mentions = scan_mentions(&headline);
        let (session_slug, session_directives) = scan_session(&headline);
        let kind = mentions
            .first()
            .map(|first| kind_for_target(first))
            .unwrap_or(CallKind::Teammate);

        debug!(
            kind = %kind,
            targets = mentions.len(),
            body_lines = self.body.len(),
            "Parsed tellask block"
        );

        TellaskCall {
            kind,
            mentions,
            session_slug,
            session_directives,
            headline,
            body: self.body,
            malformed: false,
        }
    }
}

/// Call kind implied by a target name
pub fn kind_for_target(name: &str) -> CallKind {
    match name {
        HUMAN_TARGET => CallKind::AskHuman,
        TELLASKER_TARGET => CallKind::AskBack,
        SELF_TARGET => CallKind::SelfRoute,
        _ => CallKind::Teammate,
    }
}

/// Whether `name` is one of the reserved protocol targets
pub fn is_reserved_target(name: &str) -> bool {
    kind_for_target(name) != CallKind::Teammate
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c == '-' || c == '.'
}

/// Whether `name` is a complete, resolvable name token
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if is_name_start(c) => {}
        _ => return false,
    }
    chars.all(is_name_char) && !name.ends_with('.')
}

/// Leading name token of `s`, raw (trailing dot included)
fn take_name(s: &str) -> Option<&str> {
    match s.chars().next() {
        Some(c) if is_name_start(c) => {}
        _ => return None,
    }
    let end = s
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    Some(&s[..end])
}

/// A single trailing dot is sentence punctuation, not part of the name
fn trim_name(raw: &str) -> &str {
    raw.strip_suffix('.').unwrap_or(raw)
}

fn is_target_shaped(payload: &str) -> bool {
    payload
        .strip_prefix(MENTION_SIGIL)
        .and_then(take_name)
        .is_some()
}

fn scan_mentions(headline: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();
    let mut prev: Option<char> = None;

    for (idx, ch) in headline.char_indices() {
        if ch == MENTION_SIGIL && prev.map_or(true, char::is_whitespace) {
            let rest = &headline[idx + ch.len_utf8()..];
            if let Some(raw) = take_name(rest) {
                let name = trim_name(raw);
                if !mentions.iter().any(|m| m == name) {
                    mentions.push(name.to_string());
                }
            }
        }
        prev = Some(ch);
    }

    mentions
}

fn scan_session(headline: &str) -> (Option<String>, usize) {
    let mut slug = None;
    let mut count = 0;
    let mut tokens = headline.split_whitespace();

    while let Some(token) = tokens.next() {
        if token != SESSION_DIRECTIVE {
            continue;
        }
        count += 1;
        let value = tokens.next().and_then(take_name).map(trim_name);
        if slug.is_none() {
            slug = value.map(str::to_string);
        }
    }

    (slug, count)
}

/// A fully parsed message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub events: Vec<TellaskEvent>,
}

impl ParsedMessage {
    pub fn calls(&self) -> impl Iterator<Item = &TellaskCall> {
        self.events.iter().filter_map(|e| match e {
            TellaskEvent::Call(call) => Some(call),
            TellaskEvent::Prose(_) => None,
        })
    }

    pub fn into_calls(self) -> Vec<TellaskCall> {
        self.events
            .into_iter()
            .filter_map(|e| match e {
                TellaskEvent::Call(call) => Some(call),
                TellaskEvent::Prose(_) => None,
            })
            .collect()
    }

    pub fn has_calls(&self) -> bool {
        self.calls().next().is_some()
    }

    /// Prose lines joined, with surrounding blank lines trimmed
    pub fn prose(&self) -> String {
        let lines: Vec<&str> = self
            .events
            .iter()
            .filter_map(|e| match e {
                TellaskEvent::Prose(line) => Some(line.as_str()),
                TellaskEvent::Call(_) => None,
            })
            .collect();
        lines.join("\n").trim_matches('\n').to_string()
    }
}

impl Extend<TellaskEvent> for ParsedMessage {
    fn extend<T: IntoIterator<Item = TellaskEvent>>(&mut self, iter: T) {
        self.events.extend(iter);
    }
}

/// Parse a complete message in one pass
pub fn parse_message(text: &str) -> ParsedMessage {
    let mut parser = TellaskParser::new();
    let mut message = ParsedMessage::default();
    message.extend(parser.push(text));
    message.extend(parser.finish());
    message
}
