//! Splitting document text into bounded, overlapping chunks.
//!
//! Chunks are assembled from the whitespace-delimited tokens of the original
//! text. A chunk's content is its tokens joined by single spaces; its offsets
//! are the character positions of its first token's start and last token's
//! end in the original text. Collapsing whitespace therefore never shifts an
//! offset.
//!
//! Two strategies are available:
//!
//! - **structured** (default): paragraphs separated by blank lines are packed
//!   into chunks; heading lines are isolated into chunks of their own.
//! - **sentence**: sentences ending in `.`, `!` or `?` are packed into chunks.
//!
//! Units longer than the chunk size are word-wrapped, and single tokens longer
//! than the chunk size are hard-sliced.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// A scalar metadata value attached to a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Ordered chunk metadata.
pub type ChunkMetadata = IndexMap<String, MetadataValue>;

/// A chunk of text extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text with whitespace runs collapsed to single spaces.
    pub content: String,

    /// Metadata about the chunk (source, type, heading, chunk_index, ...).
    pub metadata: ChunkMetadata,

    /// Character offset of the first character in the original text.
    pub start_offset: usize,

    /// Character offset one past the last character in the original text.
    pub end_offset: usize,
}

impl Chunk {
    /// Create a new chunk without metadata.
    pub fn new(content: impl Into<String>, start_offset: usize, end_offset: usize) -> Self {
        Self {
            content: content.into(),
            metadata: ChunkMetadata::new(),
            start_offset,
            end_offset,
        }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content length in characters.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// The `source` metadata value, if present.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(MetadataValue::as_str)
    }
}

/// Structural information supplied alongside document text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralHints {
    /// 0-based line numbers that are headings.
    pub heading_lines: BTreeSet<usize>,

    /// Also treat markdown `#` lines as headings.
    pub detect_markdown_headings: bool,
}

impl StructuralHints {
    /// Hints for markdown sources.
    pub fn markdown() -> Self {
        Self {
            heading_lines: BTreeSet::new(),
            detect_markdown_headings: true,
        }
    }

    /// Mark a line as a heading.
    pub fn with_heading_line(mut self, line: usize) -> Self {
        self.heading_lines.insert(line);
        self
    }
}

/// Configuration for the splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub max_chunk_size: usize,

    /// Maximum characters carried from one chunk into the next.
    pub overlap: usize,

    /// Use the structure-aware strategy instead of the sentence strategy.
    pub preserve_structure: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 500,
            overlap: 50,
            preserve_structure: true,
        }
    }
}

impl ChunkerConfig {
    /// Check that the parameters can produce chunks.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(ProcessingError::InvalidConfig(
                "max_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.overlap >= self.max_chunk_size {
            return Err(ProcessingError::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_chunk_size ({})",
                self.overlap, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// Splits document text into chunks.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    config: ChunkerConfig,
}

impl ChunkSplitter {
    /// Create a splitter, validating the configuration.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The splitter configuration.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split text into chunks carrying only per-chunk metadata.
    pub fn split(&self, text: &str, hints: &StructuralHints) -> Vec<Chunk> {
        self.split_with_metadata(text, hints, &ChunkMetadata::new())
    }

    /// Split text and prefix every chunk's metadata with `base`.
    pub fn split_with_metadata(
        &self,
        text: &str,
        hints: &StructuralHints,
        base: &ChunkMetadata,
    ) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let tokens = tokenize(text);
        let chunks = if self.config.preserve_structure {
            self.split_structured(text, &tokens, hints)
        } else {
            self.split_sentences(text, &tokens)
        };

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, mut chunk)| {
                let mut metadata = base.clone();
                metadata.extend(chunk.metadata);
                metadata.insert("chunk_index".to_string(), index.into());
                chunk.metadata = metadata;
                chunk
            })
            .collect()
    }

    fn split_structured(&self, text: &str, tokens: &[Token], hints: &StructuralHints) -> Vec<Chunk> {
        let headings = heading_lines(text, hints);
        let mut packer = Packer::new(text, tokens, &self.config);

        for paragraph in paragraphs(tokens, &headings) {
            let span = paragraph.span;
            if paragraph.is_heading {
                packer.flush();
                let title = packer.join(span.start, span.end);
                packer.heading = Some(title.trim_start_matches('#').trim().to_string());
                packer.push_span(span, Seed::None);
                packer.flush();
            } else {
                packer.push_span(span, Seed::LastUnit);
            }
        }

        packer.finish()
    }

    fn split_sentences(&self, text: &str, tokens: &[Token]) -> Vec<Chunk> {
        let mut packer = Packer::new(text, tokens, &self.config);
        for span in sentences(text, tokens) {
            packer.push_span(span, Seed::Units);
        }
        packer.finish()
    }
}

/// Detect markdown header level (1-6).
pub fn detect_header_level(line: &str) -> Option<u8> {
    let trimmed = line.trim();
    if !trimmed.starts_with('#') {
        return None;
    }

    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level <= 6 {
        // Ensure there's a space after the #'s
        let rest = &trimmed[level..];
        if rest.starts_with(' ') || rest.is_empty() {
            return u8::try_from(level).ok();
        }
    }
    None
}

/// A whitespace-delimited token of the original text.
#[derive(Debug, Clone, Copy)]
struct Token {
    byte_start: usize,
    byte_end: usize,
    /// Character offsets.
    start: usize,
    end: usize,
    len: usize,
    line: usize,
    blank_line_before: bool,
}

/// Half-open range of token indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
struct Paragraph {
    span: Span,
    is_heading: bool,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<Token> = None;
    let mut line = 0;
    let mut newlines_in_gap = 0;

    for (char_idx, (byte_idx, ch)) in text.char_indices().enumerate() {
        if ch.is_whitespace() {
            if let Some(token) = current.take() {
                tokens.push(token);
            }
            if ch == '\n' {
                line += 1;
                newlines_in_gap += 1;
            }
            continue;
        }

        let byte_end = byte_idx + ch.len_utf8();
        match current.as_mut() {
            Some(token) => {
                token.byte_end = byte_end;
                token.end = char_idx + 1;
                token.len += 1;
            }
            None => {
                current = Some(Token {
                    byte_start: byte_idx,
                    byte_end,
                    start: char_idx,
                    end: char_idx + 1,
                    len: 1,
                    line,
                    blank_line_before: newlines_in_gap >= 2,
                });
                newlines_in_gap = 0;
            }
        }
    }

    if let Some(token) = current {
        tokens.push(token);
    }
    tokens
}

fn heading_lines(text: &str, hints: &StructuralHints) -> BTreeSet<usize> {
    let mut lines = hints.heading_lines.clone();
    if hints.detect_markdown_headings {
        lines.extend(
            text.split('\n')
                .enumerate()
                .filter(|(_, line)| detect_header_level(line).is_some())
                .map(|(number, _)| number),
        );
    }
    lines
}

fn paragraphs(tokens: &[Token], headings: &BTreeSet<usize>) -> Vec<Paragraph> {
    let is_heading = |i: usize| headings.contains(&tokens[i].line);
    let mut out: Vec<Paragraph> = Vec::new();

    for i in 0..tokens.len() {
        let starts_new = i == 0
            || tokens[i].blank_line_before
            || (tokens[i].line != tokens[i - 1].line && (is_heading(i) || is_heading(i - 1)));

        match out.last_mut() {
            Some(paragraph) if !starts_new => paragraph.span.end = i + 1,
            _ => out.push(Paragraph {
                span: Span { start: i, end: i + 1 },
                is_heading: is_heading(i),
            }),
        }
    }
    out
}

fn sentences(text: &str, tokens: &[Token]) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        let ends_sentence = text[token.byte_start..token.byte_end].ends_with(['.', '!', '?']);
        if ends_sentence || i + 1 == tokens.len() {
            out.push(Span { start, end: i + 1 });
            start = i + 1;
        }
    }
    out
}

/// What a closed chunk passes on to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seed {
    None,
    /// Trailing words of the last unit.
    LastUnit,
    /// Trailing words of the chunk.
    Words,
    /// Trailing whole units.
    Units,
}

/// Packs token spans into chunks.
///
/// The open chunk is always a contiguous token range `[start, end)`; spans are
/// pushed in document order so every new span begins at `end`.
struct Packer<'a> {
    text: &'a str,
    tokens: &'a [Token],
    /// `prefix[i]` is the summed length of `tokens[..i]`.
    prefix: Vec<usize>,
    max: usize,
    overlap: usize,
    start: usize,
    end: usize,
    unit_starts: Vec<usize>,
    heading: Option<String>,
    out: Vec<Chunk>,
}

impl<'a> Packer<'a> {
    fn new(text: &'a str, tokens: &'a [Token], config: &ChunkerConfig) -> Self {
        let mut prefix = Vec::with_capacity(tokens.len() + 1);
        prefix.push(0);
        for token in tokens {
            prefix.push(prefix[prefix.len() - 1] + token.len);
        }

        Self {
            text,
            tokens,
            prefix,
            max: config.max_chunk_size,
            overlap: config.overlap,
            start: 0,
            end: 0,
            unit_starts: Vec::new(),
            heading: None,
            out: Vec::new(),
        }
    }

    /// Joined length of `tokens[a..b]` with single-space separators.
    fn width(&self, a: usize, b: usize) -> usize {
        if b <= a {
            0
        } else {
            self.prefix[b] - self.prefix[a] + (b - a - 1)
        }
    }

    fn join(&self, a: usize, b: usize) -> String {
        let mut content = String::with_capacity(self.width(a, b));
        for token in &self.tokens[a..b] {
            if !content.is_empty() {
                content.push(' ');
            }
            content.push_str(&self.text[token.byte_start..token.byte_end]);
        }
        content
    }

    fn is_open(&self) -> bool {
        self.end > self.start
    }

    /// Push a span, word-wrapping it when it cannot fit in one chunk.
    fn push_span(&mut self, span: Span, seed: Seed) {
        if self.width(span.start, span.end) <= self.max {
            self.push_unit(span, seed);
            return;
        }
        for i in span.start..span.end {
            if self.tokens[i].len > self.max {
                self.push_oversized(i);
            } else {
                self.push_unit(Span { start: i, end: i + 1 }, Seed::Words);
            }
        }
    }

    fn push_unit(&mut self, span: Span, seed: Seed) {
        if !self.is_open() {
            self.start = span.start;
            self.end = span.end;
            self.unit_starts = vec![span.start];
            return;
        }

        if self.width(self.start, span.end) <= self.max {
            self.end = span.end;
            self.unit_starts.push(span.start);
            return;
        }

        let seed_start = self.seed_start(seed, span.end);
        self.emit(self.start, self.end);

        if seed_start < self.end {
            self.unit_starts.retain(|&u| u > seed_start);
            self.unit_starts.insert(0, seed_start);
            self.start = seed_start;
        } else {
            self.unit_starts.clear();
            self.start = span.start;
        }
        self.unit_starts.push(span.start);
        self.end = span.end;
    }

    /// First token of the overlap carried into a chunk that will end at `next_end`.
    fn seed_start(&self, seed: Seed, next_end: usize) -> usize {
        if self.overlap == 0 {
            return self.end;
        }

        // A seed never repeats the whole closed chunk.
        let floor = self.start + 1;
        let mut s = self.end;
        match seed {
            Seed::None => return self.end,
            Seed::LastUnit | Seed::Words => {
                let floor = match (seed, self.unit_starts.last()) {
                    (Seed::LastUnit, Some(&last)) => last.max(floor),
                    _ => floor,
                };
                while s > floor && self.width(s - 1, self.end) <= self.overlap {
                    s -= 1;
                }
            }
            Seed::Units => {
                for &unit in self.unit_starts.iter().rev() {
                    if unit < floor || self.width(unit, self.end) > self.overlap {
                        break;
                    }
                    s = unit;
                }
            }
        }

        while s < self.end && self.width(s, next_end) > self.max {
            s += 1;
        }
        s
    }

    /// Emit a token longer than the chunk size as fixed-width slices.
    fn push_oversized(&mut self, index: usize) {
        self.flush();
        let token = self.tokens[index];
        let chars: Vec<char> = self.text[token.byte_start..token.byte_end].chars().collect();
        for (n, piece) in chars.chunks(self.max).enumerate() {
            let start = token.start + n * self.max;
            let chunk = self.chunk(piece.iter().collect(), start, start + piece.len());
            self.out.push(chunk);
        }
        self.start = index + 1;
        self.end = index + 1;
    }

    fn flush(&mut self) {
        if self.is_open() {
            self.emit(self.start, self.end);
        }
        self.start = self.end;
        self.unit_starts.clear();
    }

    fn emit(&mut self, a: usize, b: usize) {
        let content = self.join(a, b);
        let chunk = self.chunk(content, self.tokens[a].start, self.tokens[b - 1].end);
        self.out.push(chunk);
    }

    fn chunk(&self, content: String, start: usize, end: usize) -> Chunk {
        let chunk = Chunk::new(content, start, end);
        match &self.heading {
            Some(heading) => chunk.with_metadata("heading", heading.as_str()),
            None => chunk,
        }
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.flush();
        self.out
    }
}
