//! Bounded, line-oriented output capture.
//!
//! Each session owns one [`OutputBuffer`] fed by the reader tasks of its
//! process. Lines keep their trailing `\n`, so the buffer's content is the
//! exact concatenation of the output it still holds. The newest line may be
//! partial (a prompt, say) and is extended in place when more output arrives.

use std::collections::VecDeque;

/// Default bound on buffered lines.
pub const DEFAULT_MAX_BUFFER_LINES: usize = 10_000;

/// Result of reading a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSnapshot {
    /// Buffered output, oldest first.
    pub content: String,
    /// Number of lines in `content`, counting a trailing partial line.
    pub lines: usize,
    /// Whether output was appended since the previous read.
    pub has_more: bool,
    /// Lines evicted since the previous read.
    pub dropped: u64,
}

/// FIFO buffer of output lines with a hard line bound.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    /// The back line has no terminating newline yet.
    partial: bool,
    /// Bumped on every append.
    generation: u64,
    /// Generation seen by the last read.
    observed: u64,
    /// Evictions since the last read.
    dropped: u64,
}

impl OutputBuffer {
    /// Create a buffer holding at most `max_lines` lines (minimum 1).
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
            partial: false,
            generation: 0,
            observed: 0,
            dropped: 0,
        }
    }

    /// Append a chunk of output, evicting the oldest lines past the bound.
    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        for segment in text.split_inclusive('\n') {
            let terminated = segment.ends_with('\n');
            match self.lines.back_mut() {
                Some(last) if self.partial => last.push_str(segment),
                _ => self.lines.push_back(segment.to_string()),
            }
            self.partial = !terminated;
        }

        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }

        self.generation = self.generation.wrapping_add(1);
    }

    /// Return the buffered content, draining it when `clear` is set.
    pub fn read(&mut self, clear: bool) -> BufferSnapshot {
        let content: String = self.lines.iter().map(String::as_str).collect();
        let snapshot = BufferSnapshot {
            content,
            lines: self.lines.len(),
            has_more: self.generation != self.observed,
            dropped: self.dropped,
        };

        self.observed = self.generation;
        self.dropped = 0;
        if clear {
            self.lines.clear();
            self.partial = false;
        }

        snapshot
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no output.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The configured line bound.
    pub fn max_lines(&self) -> usize {
        self.max_lines
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_LINES)
    }
}

/// Incremental UTF-8 decoder for one output stream.
///
/// Reads of a pipe or terminal can split a multi-byte character across two
/// chunks; the incomplete tail is held back until the next chunk arrives.
/// Invalid sequences are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, returning all complete characters seen so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        text
    }

    /// Flush whatever is held back at end of stream.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
