//! The preprocessed-document model.
//!
//! A document is the unit the preprocessor stages and the opencode provider
//! agree on: an ordered list of lines, each either *original* (kept from the
//! input, with its input line number) or *generated* (inserted by a stage,
//! carrying the line number of the original line it replaces so diagnostics
//! still point somewhere meaningful).

/// One line of a document. `text` keeps its line terminator, if the input
/// had one, so reassembling the document is byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocLine {
    text: String,
    lineno: Option<usize>,
    original: bool,
}

impl DocLine {
    pub fn original(text: impl Into<String>, lineno: usize) -> Self {
        Self {
            text: text.into(),
            lineno: Some(lineno),
            original: true,
        }
    }

    /// A generated line; `replaces` is the input line it stands in for.
    pub fn generated(text: impl Into<String>, replaces: Option<usize>) -> Self {
        Self {
            text: text.into(),
            lineno: replaces,
            original: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The line text without its terminator.
    pub fn content(&self) -> &str {
        self.text
            .strip_suffix("\r\n")
            .or_else(|| self.text.strip_suffix('\n'))
            .or_else(|| self.text.strip_suffix('\r'))
            .unwrap_or(&self.text)
    }

    pub fn lineno(&self) -> Option<usize> {
        self.lineno
    }

    pub fn is_original(&self) -> bool {
        self.original
    }
}

/// A sequence of document lines with a stable iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    lines: Vec<DocLine>,
}

impl Document {
    pub fn new(lines: Vec<DocLine>) -> Self {
        Self { lines }
    }

    /// Split input text into original lines, keeping terminators so that
    /// concatenating all line texts reproduces the input.
    pub fn from_text(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut rest = text;
        let mut lineno = 0;
        while !rest.is_empty() {
            let term = rest
                .char_indices()
                .find_map(|(i, c)| match c {
                    '\n' => Some(i + 1),
                    '\r' => Some(if rest[i + 1..].starts_with('\n') {
                        i + 2
                    } else {
                        i + 1
                    }),
                    _ => None,
                })
                .unwrap_or(rest.len());
            let (line, tail) = rest.split_at(term);
            lines.push(DocLine::original(line, lineno));
            lineno += 1;
            rest = tail;
        }
        Self { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn at(&self, idx: usize) -> &DocLine {
        &self.lines[idx]
    }

    pub fn get(&self, idx: usize) -> Option<&DocLine> {
        self.lines.get(idx)
    }

    pub fn lines(&self) -> &[DocLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<DocLine> {
        self.lines
    }

    /// Full text of the document (generated lines included).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for l in &self.lines {
            out.push_str(l.text());
            if !l.text().ends_with('\n') && !l.text().ends_with('\r') {
                out.push('\n');
            }
        }
        out
    }
}
