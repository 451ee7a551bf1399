//! Streaming text splitter.
//!
//! Generated text arrives token by token; the synthesis engine wants whole
//! sentences of bounded length. [`TextSplitter`] is the writer side: it
//! buffers fragments, cuts them at sentence boundaries, and sends finished
//! units down a channel. [`SentenceStream`] is the reader side, consumed one
//! unit at a time while the writer is still producing.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use parley_core::error::{ParleyError, Result};

use crate::clean::{normalize_unit, strip_markup};

pub const DEFAULT_MAX_UNIT_CHARS: usize = 300;

const TERMINATORS: [char; 6] = ['.', '!', '?', '\u{3002}', '\u{FF01}', '\u{FF1F}'];

/// Characters that may trail a terminator and still belong to the sentence.
const CLOSERS: [char; 12] = [
    '"', '\'', ')', ']', '}', '\u{201D}', '\u{2019}', '\u{300D}', '\u{300F}', '\u{FF09}',
    '\u{3011}', '\u{3015}',
];

/// Full-width 。！？ end a sentence without trailing whitespace.
fn is_full_width_terminator(c: char) -> bool {
    matches!(c, '\u{3002}' | '\u{FF01}' | '\u{FF1F}')
}

/// Words whose trailing period does not end a sentence.
const ABBREVIATIONS: [&str; 11] = [
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "e.g", "i.e",
];

/// Writer side of a streaming split.
///
/// Dropping the splitter without calling [`TextSplitter::close`] ends the
/// stream with [`ParleyError::StreamAbandoned`].
pub struct TextSplitter {
    tx: mpsc::UnboundedSender<Result<String>>,
    buffer: String,
    max_unit_chars: usize,
    emitted: usize,
    closed: bool,
}

/// Reader side of a streaming split: ordered, single pass, finite once closed.
pub struct SentenceStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

impl TextSplitter {
    pub fn new(max_unit_chars: usize) -> (Self, SentenceStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let splitter = Self {
            tx,
            buffer: String::new(),
            max_unit_chars: max_unit_chars.max(1),
            emitted: 0,
            closed: false,
        };
        (splitter, SentenceStream { rx })
    }

    /// Append a fragment, sending every unit it completes.
    pub fn push(&mut self, fragment: &str) {
        let cleaned = strip_markup(fragment);
        if cleaned.is_empty() {
            return;
        }
        self.buffer.push_str(&cleaned);

        while let Some((end, resume)) = find_boundary(&self.buffer) {
            let unit = self.buffer[..end].to_string();
            self.buffer.drain(..resume);
            self.emit(&unit);
        }
    }

    /// Flush the trailing partial unit and end the stream.
    pub fn close(mut self) {
        self.closed = true;
        let rest = std::mem::take(&mut self.buffer);
        self.emit(&rest);
        debug!(units = self.emitted, "Text splitter closed");
    }

    /// Units sent so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn emit(&mut self, unit: &str) {
        let unit = normalize_unit(unit);
        if unit.is_empty() {
            return;
        }
        for piece in split_long(&unit, self.max_unit_chars) {
            if self.tx.send(Ok(piece)).is_err() {
                debug!("Sentence stream dropped, discarding unit");
                return;
            }
            self.emitted += 1;
        }
    }
}

impl Drop for TextSplitter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.tx.send(Err(ParleyError::StreamAbandoned));
        }
    }
}

impl SentenceStream {
    /// A closed stream over a complete text.
    pub fn from_text(text: &str, max_unit_chars: usize) -> Self {
        let (mut splitter, stream) = TextSplitter::new(max_unit_chars);
        splitter.push(text);
        splitter.close();
        stream
    }

    /// Wait for the next unit. `None` once the writer has closed and every unit was read.
    pub async fn next_unit(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

impl Stream for SentenceStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Locate the first complete unit in `text`.
///
/// Returns the end of the unit and the offset to resume scanning from. A
/// terminator at the very end of the buffer is not a boundary yet: the next
/// fragment may turn "3." into "3.5".
fn find_boundary(text: &str) -> Option<(usize, usize)> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return Some((i, i + 1));
        }
        if !TERMINATORS.contains(&c) {
            continue;
        }

        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        if let Some(&(_, next)) = chars.peek() {
            let spaced = next.is_whitespace() && !(c == '.' && ends_with_abbreviation(&text[..i]));
            if spaced || is_full_width_terminator(c) {
                return Some((end, end));
            }
        }
    }
    None
}

fn ends_with_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    ABBREVIATIONS.contains(&word.as_str())
}

/// Break a unit longer than `max_chars` at the last comma or space that fits.
fn split_long(unit: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = unit;

    while remaining.chars().count() > max_chars {
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let cut = remaining[..limit]
            .char_indices()
            .rev()
            .find(|&(i, c)| i > 0 && (matches!(c, ',' | '\u{3001}' | '\u{FF0C}') || c.is_whitespace()))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(limit);

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = remaining[cut..].trim_start();
    }

    if !remaining.is_empty() {
        pieces.push(remaining.to_string());
    }
    pieces
}
