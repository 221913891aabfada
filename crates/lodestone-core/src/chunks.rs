//! Splits a document's lines into overlapping chunks for embedding.
//!
//! Blank lines are paragraph separators. A chunk closes once `chunk_size`
//! separators have been seen and there is text to emit; the next chunk is
//! prefixed with the last `margin` lines of the previous one for context.
//!
//! Line positions count non-empty lines only. `line_start..line_end` is the
//! half-open range covered by the chunk's own lines; margin lines are context
//! and are not part of the range.

use std::io;

/// Default number of paragraph breaks per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5;
/// Default number of trailing lines carried over from the previous chunk.
pub const DEFAULT_MARGIN: usize = 3;

/// How a document is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Paragraph breaks that close a chunk.
    pub chunk_size: usize,
    /// Lines of the previous chunk prepended to the next one.
    pub margin: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            margin: DEFAULT_MARGIN,
        }
    }
}

/// A chunk of text from a document, with source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub filename: String,
    /// Margin lines followed by the chunk's own lines, joined with `\n`. Never empty.
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
}

/// Incremental chunker for a single document. Feed lines with [`Chunker::push_line`],
/// then call [`Chunker::finish`] once the document ends.
#[derive(Debug, Clone)]
pub struct Chunker {
    filename: String,
    settings: ChunkSettings,
    accumulator: Vec<String>,
    prev_chunk: Vec<String>,
    breaks: usize,
    line_pos: usize,
}

impl Chunker {
    pub fn new(filename: impl Into<String>, settings: ChunkSettings) -> Self {
        Self {
            filename: filename.into(),
            settings,
            accumulator: Vec::new(),
            prev_chunk: Vec::new(),
            breaks: 0,
            line_pos: 0,
        }
    }

    /// Consume one line (without its terminator). Returns a chunk when this line closes one.
    pub fn push_line(&mut self, line: &str) -> Option<Chunk> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.is_empty() {
            self.accumulator.push(line.to_string());
            self.line_pos += 1;
            return None;
        }
        self.breaks += 1;
        if self.breaks >= self.settings.chunk_size && !self.accumulator.is_empty() {
            self.breaks = 0;
            return Some(self.emit());
        }
        None
    }

    /// Flush whatever is left at end of document.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.accumulator.is_empty() {
            return None;
        }
        Some(self.emit())
    }

    fn emit(&mut self) -> Chunk {
        let own = std::mem::take(&mut self.accumulator);
        let content = margin_tail(&self.prev_chunk, self.settings.margin)
            .iter()
            .chain(&own)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        let line_end = self.line_pos;
        let line_start = line_end.saturating_sub(own.len());
        self.prev_chunk = own;

        Chunk {
            filename: self.filename.clone(),
            content,
            line_start,
            line_end,
        }
    }
}

/// Last `margin` lines of `lines`, or all of them if there are fewer.
fn margin_tail(lines: &[String], margin: usize) -> &[String] {
    let start = lines.len().saturating_sub(margin);
    &lines[start..]
}

/// Lazy chunk iterator over a stream of lines, e.g. [`std::io::BufRead::lines`].
/// Stops after the first read error.
pub struct Chunks<I> {
    lines: I,
    chunker: Chunker,
    done: bool,
}

impl<I> Chunks<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(lines: I, chunker: Chunker) -> Self {
        Self {
            lines,
            chunker,
            done: false,
        }
    }
}

impl<I> Iterator for Chunks<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for line in self.lines.by_ref() {
            match line {
                Ok(line) => {
                    if let Some(chunk) = self.chunker.push_line(&line) {
                        return Some(Ok(chunk));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        self.chunker.finish().map(Ok)
    }
}

/// Chunk an in-memory document.
pub fn chunk_text(filename: &str, text: &str, settings: ChunkSettings) -> Vec<Chunk> {
    let mut chunker = Chunker::new(filename, settings);
    let mut chunks: Vec<Chunk> = text.lines().filter_map(|l| chunker.push_line(l)).collect();
    chunks.extend(chunker.finish());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(count: usize, lines_each: usize) -> String {
        (0..count)
            .map(|p| {
                (0..lines_each)
                    .map(|l| format!("p{p} l{l}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn own_lines(chunk: &Chunk) -> Vec<&str> {
        let lines: Vec<&str> = chunk.content.lines().collect();
        let own = chunk.line_end - chunk.line_start;
        lines[lines.len() - own..].to_vec()
    }

    #[test]
    fn document_without_blank_lines_is_one_chunk() {
        let text = "a\nb\nc\nd";
        let c = chunk_text("doc.txt", text, ChunkSettings::default());
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].content, text);
        assert_eq!((c[0].line_start, c[0].line_end), (0, 4));
    }

    #[test]
    fn blank_only_document_has_no_chunks() {
        assert!(chunk_text("doc.txt", "\n\n\n\n\n\n\n", ChunkSettings::default()).is_empty());
        assert!(chunk_text("doc.txt", "", ChunkSettings::default()).is_empty());
    }

    #[test]
    fn twelve_paragraphs_make_three_chunks_with_margin() {
        let text = paragraphs(12, 2);
        let settings = ChunkSettings {
            chunk_size: 5,
            margin: 3,
        };
        let c = chunk_text("doc.txt", &text, settings);
        assert_eq!(c.len(), 3);

        assert_eq!((c[0].line_start, c[0].line_end), (0, 10));
        assert_eq!((c[1].line_start, c[1].line_end), (10, 20));
        assert_eq!((c[2].line_start, c[2].line_end), (20, 24));

        assert_eq!(c[0].content.lines().count(), 10);
        assert_eq!(c[1].content.lines().count(), 13);
        assert_eq!(c[2].content.lines().count(), 7);

        assert!(c[1].content.starts_with("p3 l1\np4 l0\np4 l1\np5 l0"));
        assert!(c[2].content.starts_with("p8 l1\np9 l0\np9 l1\np10 l0"));
    }

    #[test]
    fn margin_is_tail_of_previous_chunk_own_lines() {
        let text = paragraphs(9, 3);
        let settings = ChunkSettings {
            chunk_size: 2,
            margin: 4,
        };
        let c = chunk_text("doc.txt", &text, settings);
        assert!(c.len() > 2);
        for pair in c.windows(2) {
            let prev_own = own_lines(&pair[0]);
            let keep = prev_own.len().min(4);
            let expected = &prev_own[prev_own.len() - keep..];
            let next: Vec<&str> = pair[1].content.lines().take(keep).collect();
            assert_eq!(next, expected);
        }
    }

    #[test]
    fn margin_larger_than_previous_chunk_takes_all_of_it() {
        let text = "a\n\nb\nc";
        let settings = ChunkSettings {
            chunk_size: 1,
            margin: 10,
        };
        let c = chunk_text("doc.txt", text, settings);
        assert_eq!(c.len(), 2);
        assert_eq!(c[1].content, "a\nb\nc");
        assert_eq!((c[1].line_start, c[1].line_end), (1, 3));
    }

    #[test]
    fn ranges_cover_every_non_empty_line_without_gaps() {
        let text = "x\n\n\ny\nz\n\nw\n\n\n\nv\nu\n\nt";
        let settings = ChunkSettings {
            chunk_size: 2,
            margin: 1,
        };
        let c = chunk_text("doc.txt", text, settings);
        assert!(c.iter().all(|ch| !ch.content.is_empty()));
        let mut expected_start = 0;
        for ch in &c {
            assert_eq!(ch.line_start, expected_start);
            assert!(ch.line_end > ch.line_start);
            expected_start = ch.line_end;
        }
        let non_empty = text.lines().filter(|l| !l.is_empty()).count();
        assert_eq!(expected_start, non_empty);
    }

    #[test]
    fn leading_blank_lines_close_chunk_at_next_separator() {
        let text = "\n\n\na\nb\n\nc";
        let settings = ChunkSettings {
            chunk_size: 3,
            margin: 0,
        };
        let c = chunk_text("doc.txt", text, settings);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].content, "a\nb");
        assert_eq!(c[1].content, "c");
    }

    #[test]
    fn crlf_lines_are_handled() {
        let c = chunk_text(
            "doc.txt",
            "a\r\n\r\nb\r\n",
            ChunkSettings {
                chunk_size: 1,
                margin: 0,
            },
        );
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].content, "a");
        assert_eq!(c[1].content, "b");
    }

    #[test]
    fn iterator_matches_in_memory_chunking_and_stops_on_error() {
        let text = paragraphs(7, 2);
        let settings = ChunkSettings {
            chunk_size: 3,
            margin: 1,
        };
        let lines = text.lines().map(|l| Ok(l.to_string()));
        let streamed: Vec<Chunk> = Chunks::new(lines, Chunker::new("doc.txt", settings))
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(streamed, chunk_text("doc.txt", &text, settings));

        let failing = vec![
            Ok("a".to_string()),
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad utf-8")),
            Ok("b".to_string()),
        ];
        let mut it = Chunks::new(failing.into_iter(), Chunker::new("doc.txt", settings));
        assert!(it.next().unwrap().is_err());
        assert!(it.next().is_none());
    }
}
