//! Streaming parser for delimited file blocks in generation output.
//!
//! ```text
//! === FILE: app/main.py ===
//! ...content...
//! === END FILE ===
//! ```
//!
//! The parser is a two-state machine fed arbitrary text chunks. It emits
//! discrete [`BlockEvent`]s as soon as whole lines are available. A block
//! whose end marker never arrives (another start marker or end of input
//! comes first) is dropped entirely.

use regex::Regex;
use std::sync::LazyLock;

static FILE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*===\s*FILE:\s*(.+?)\s*===\s*$").unwrap());

static FILE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*===\s*END FILE\s*===\s*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    /// Text outside any block, one line including its newline
    TextChunk(String),
    FileStarted { path: String },
    FileCompleted { path: String, content: String },
    /// A block that never reached its end marker
    FileDropped { path: String },
}

#[derive(Debug)]
enum State {
    Outside,
    InFile { path: String, content: String },
}

#[derive(Debug)]
pub struct BlockParser {
    state: State,
    partial: String,
}

impl Default for BlockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockParser {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            partial: String::new(),
        }
    }

    /// Feed the next chunk. Only complete lines are processed.
    pub fn feed(&mut self, chunk: &str) -> Vec<BlockEvent> {
        self.partial.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.line(&line, &mut events);
        }
        events
    }

    /// Flush the trailing partial line and close the stream.
    pub fn finish(&mut self) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.line(&line, &mut events);
        }
        if let State::InFile { path, .. } = std::mem::replace(&mut self.state, State::Outside) {
            tracing::warn!(path = %path, "file block not terminated, dropping");
            events.push(BlockEvent::FileDropped { path });
        }
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<BlockEvent>) {
        let bare = line.trim_end_matches(['\n', '\r']);
        if let Some(caps) = FILE_START.captures(bare) {
            let path = caps[1].trim().trim_matches('`').to_string();
            if let State::InFile { path: open, .. } =
                std::mem::replace(&mut self.state, State::Outside)
            {
                tracing::warn!(path = %open, "file block interrupted by a new block, dropping");
                events.push(BlockEvent::FileDropped { path: open });
            }
            events.push(BlockEvent::FileStarted { path: path.clone() });
            self.state = State::InFile {
                path,
                content: String::new(),
            };
            return;
        }

        match &mut self.state {
            State::InFile { path, content } => {
                if FILE_END.is_match(bare) {
                    let path = std::mem::take(path);
                    let content = std::mem::take(content);
                    self.state = State::Outside;
                    events.push(BlockEvent::FileCompleted { path, content });
                } else {
                    content.push_str(bare);
                    content.push('\n');
                }
            }
            State::Outside => events.push(BlockEvent::TextChunk(line.to_string())),
        }
    }
}

/// Parse a complete response into `(path, content)` pairs.
pub fn parse_blocks(text: &str) -> Vec<(String, String)> {
    let mut parser = BlockParser::new();
    let mut events = parser.feed(text);
    events.extend(parser.finish());
    events
        .into_iter()
        .filter_map(|e| match e {
            BlockEvent::FileCompleted { path, content } => Some((path, content)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unterminated_block_dropped_between_valid_blocks() {
        let text = "\