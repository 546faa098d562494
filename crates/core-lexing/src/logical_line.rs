//! Logical-line extraction.
//!
//! A logical line is the unit every later layer works with: one or more
//! physical card images joined by the continuation convention. The rules
//! are column-exact and configured by ICTL: code occupies columns
//! `begin..=end` (1-based), the continuation indicator sits in column
//! `end+1`, and a continuation line restarts code at column `continuation`
//! with columns before it required blank.
//!
//! Each physical line is split into `prefix | code | continuation | ignore`
//! plus the end-of-line marker; concatenating those pieces for every
//! segment reproduces the input exactly. Columns are Unicode scalar
//! positions; UTF-16 positions for editor consumers are derived from the
//! same ranges by [`crate::utf16`].

use crate::{SHIFT_IN, SHIFT_OUT};
use thiserror::Error;

/// End-of-line marker of one physical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eol {
    #[default]
    None,
    Lf,
    Cr,
    Crlf,
}

impl Eol {
    pub fn as_str(self) -> &'static str {
        match self {
            Eol::None => "",
            Eol::Lf => "\n",
            Eol::Cr => "\r",
            Eol::Crlf => "\r\n",
        }
    }
}

/// Column configuration, as established by an ICTL statement.
///
/// All columns are 1-based. `continuation == 0` turns continuation off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ictl {
    pub begin: usize,
    pub end: usize,
    pub continuation: usize,
    pub dbcs: bool,
    /// COPY-member rule: running out of input while continued is not an
    /// error.
    pub eof_copy_rules: bool,
}

/// Default columns {1, 71, 16}.
pub const DEFAULT_ICTL: Ictl = Ictl {
    begin: 1,
    end: 71,
    continuation: 16,
    dbcs: false,
    eof_copy_rules: false,
};

/// Default columns with COPY-member end-of-file rules.
pub const DEFAULT_ICTL_COPY: Ictl = Ictl {
    eof_copy_rules: true,
    ..DEFAULT_ICTL
};

impl Default for Ictl {
    fn default() -> Self {
        DEFAULT_ICTL
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IctlError {
    #[error("begin column {0} outside 1..=40")]
    BadBegin(usize),
    #[error("end column {0} outside 41..=80")]
    BadEnd(usize),
    #[error("continue column {0} outside begin+1..=40")]
    BadContinuation(usize),
}

impl Ictl {
    /// Validated construction from ICTL operands.
    ///
    /// `begin = continuation - 1` is accepted; `continuation <= begin` is
    /// not.
    pub fn new(begin: usize, end: usize, continuation: usize) -> Result<Self, IctlError> {
        if !(1..=40).contains(&begin) {
            return Err(IctlError::BadBegin(begin));
        }
        if !(41..=80).contains(&end) {
            return Err(IctlError::BadEnd(end));
        }
        if continuation != 0 && !(begin + 1..=40).contains(&continuation) {
            return Err(IctlError::BadContinuation(continuation));
        }
        Ok(Self {
            begin,
            end,
            continuation,
            dbcs: false,
            eof_copy_rules: false,
        })
    }

    pub fn with_dbcs(mut self, dbcs: bool) -> Self {
        self.dbcs = dbcs;
        self
    }

    pub fn with_copy_rules(mut self, copy: bool) -> Self {
        self.eof_copy_rules = copy;
        self
    }
}

/// One physical line of a logical line, partitioned into its column
/// regions. All slices are contiguous pieces of the same input line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalLineSegment<'a> {
    /// Columns before the code region (blanks on continuation lines).
    pub prefix: &'a str,
    /// The code region, columns `begin..=end` (or `continuation..=end`).
    pub code: &'a str,
    /// The continuation indicator character(s); empty on the last segment.
    pub continuation: &'a str,
    /// Trailing sequence-number columns.
    pub ignore: &'a str,
    pub eol: Eol,
    /// The mandatory-blank rule was violated on this continuation line.
    pub continuation_error: bool,
    /// The segment ends inside a DBCS sequence or continues via SO/SI.
    pub so_si_continuation: bool,
}

impl<'a> LogicalLineSegment<'a> {
    /// Whether another segment follows this one.
    pub fn is_continued(&self) -> bool {
        !self.continuation.is_empty()
    }

    /// The segment reassembled, end-of-line included.
    pub fn to_text(&self) -> String {
        let mut s = String::with_capacity(
            self.prefix.len() + self.code.len() + self.continuation.len() + self.ignore.len() + 2,
        );
        s.push_str(self.prefix);
        s.push_str(self.code);
        s.push_str(self.continuation);
        s.push_str(self.ignore);
        s.push_str(self.eol.as_str());
        s
    }
}

/// A fully extracted logical line.
#[derive(Debug, Clone, Default)]
pub struct LogicalLine<'a> {
    pub segments: Vec<LogicalLineSegment<'a>>,
    pub continuation_error: bool,
    pub so_si_continuation: bool,
    pub missing_next_line: bool,
}

impl<'a> LogicalLine<'a> {
    pub fn clear(&mut self) {
        self.segments.clear();
        self.continuation_error = false;
        self.so_si_continuation = false;
        self.missing_next_line = false;
    }

    /// Concatenated code regions of all segments: the statement text the
    /// parser sees.
    pub fn code_text(&self) -> String {
        self.segments.iter().map(|s| s.code).collect()
    }

    /// Whether the line still expects a continuation segment.
    pub fn expects_continuation(&self) -> bool {
        self.segments.last().is_some_and(|s| s.is_continued())
    }
}

/// Split one physical line (text + end-of-line marker) off `input`.
/// Returns `None` on empty input.
pub fn extract_line<'a>(input: &mut &'a str) -> Option<(&'a str, Eol)> {
    if input.is_empty() {
        return None;
    }
    for (i, c) in input.char_indices() {
        match c {
            '\n' => {
                let line = &input[..i];
                *input = &input[i + 1..];
                return Some((line, Eol::Lf));
            }
            '\r' => {
                let line = &input[..i];
                if input[i + 1..].starts_with('\n') {
                    *input = &input[i + 2..];
                    return Some((line, Eol::Crlf));
                }
                *input = &input[i + 1..];
                return Some((line, Eol::Cr));
            }
            _ => {}
        }
    }
    let line = *input;
    *input = "";
    Some((line, Eol::None))
}

/// Byte offset of the `n`-th character of `s`, clamped to the end.
fn char_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// Append the next physical line of `input` to `out`.
///
/// Returns `true` when the produced segment is continued and another call
/// is required; `false` ends the logical line (which still needs
/// [`finish_logical_line`]). Consumes nothing on empty input.
pub fn append_to_logical_line<'a>(
    out: &mut LogicalLine<'a>,
    input: &mut &'a str,
    opts: &Ictl,
) -> bool {
    let Some((line, eol)) = extract_line(input) else {
        return false;
    };

    let is_continuation_segment = out.expects_continuation();
    let code_start_col = if is_continuation_segment {
        opts.continuation - 1
    } else {
        opts.begin - 1
    };

    let prefix_end = char_offset(line, code_start_col);
    let code_end = char_offset(line, opts.end);
    let cont_col = char_offset(line, opts.end);
    let cont_char = line[cont_col..].chars().next();

    let mut segment = LogicalLineSegment {
        eol,
        ..Default::default()
    };

    segment.prefix = &line[..prefix_end.min(code_end)];
    if is_continuation_segment && segment.prefix.chars().any(|c| c != ' ') {
        segment.continuation_error = true;
        out.continuation_error = true;
    }

    let continued = match cont_char {
        Some(c) if opts.continuation != 0 => c != ' ',
        _ => false,
    };

    let mut code_region_end = code_end;
    let mut cont_end = cont_col;
    if continued {
        let cont_char = cont_char.unwrap();
        cont_end = cont_col + cont_char.len_utf8();
        if opts.dbcs {
            // A run of characters identical to the continuation character
            // extends the indicator leftwards into the code region.
            let code = &line[prefix_end.min(code_end)..code_region_end];
            let run: usize = code
                .chars()
                .rev()
                .take_while(|&c| c == cont_char)
                .map(|c| c.len_utf8())
                .sum();
            code_region_end -= run;
        }
        if cont_char == SHIFT_OUT || cont_char == SHIFT_IN {
            segment.so_si_continuation = true;
            out.so_si_continuation = true;
        }
    }

    segment.code = &line[prefix_end.min(code_region_end)..code_region_end];
    segment.continuation = &line[code_region_end..cont_end];
    segment.ignore = &line[cont_end.max(cont_col)..];

    if opts.dbcs && unbalanced_shift_out(segment.code) {
        segment.so_si_continuation = true;
        out.so_si_continuation = true;
    }

    out.segments.push(segment);
    continued
}

/// Final bookkeeping once no further input is available or the line ended.
pub fn finish_logical_line(out: &mut LogicalLine<'_>, opts: &Ictl) {
    if out.expects_continuation() && !opts.eof_copy_rules {
        out.missing_next_line = true;
    }
}

/// Extract the next complete logical line from `input`.
/// Returns `None` when `input` is exhausted.
pub fn extract_logical_line<'a>(input: &mut &'a str, opts: &Ictl) -> Option<LogicalLine<'a>> {
    let mut out = LogicalLine::default();
    while append_to_logical_line(&mut out, input, opts) {}
    finish_logical_line(&mut out, opts);
    if out.segments.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn unbalanced_shift_out(code: &str) -> bool {
    let mut depth = 0usize;
    for c in code.chars() {
        if c == SHIFT_OUT {
            depth += 1;
        } else if c == SHIFT_IN {
            depth = depth.saturating_sub(1);
        }
    }
    depth > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const DBCS: Ictl = Ictl {
        dbcs: true,
        ..DEFAULT_ICTL
    };

    fn chars(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut input = "";
        assert!(extract_logical_line(&mut input, &DEFAULT_ICTL).is_none());
    }

    #[test]
    fn empty_line() {
        let mut input = "\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert!(!line.continuation_error);
        assert!(!line.so_si_continuation);
        assert!(!line.missing_next_line);
        assert_eq!(line.segments.len(), 1);
        assert_eq!(line.segments[0].code, "");
        assert_eq!(line.segments[0].continuation, "");
        assert_eq!(line.segments[0].ignore, "");
        assert_eq!(line.segments[0].eol, Eol::Lf);
        assert!(input.is_empty());
    }

    #[test]
    fn single_line() {
        let mut input =
            "12345678901234567890123456789012345678901234567890123456789012345678901 345678901234567890";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert_eq!(line.segments.len(), 1);
        let s = &line.segments[0];
        assert_eq!(chars(s.code), 71);
        assert_eq!(chars(s.continuation), 0);
        assert_eq!(chars(s.ignore), 19);
        assert!(!s.continuation_error);
        assert!(input.is_empty());
    }

    #[test]
    fn continued_line() {
        let mut input = "123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890\n               67890123456789012345678901234567890123456789012345678901 34567890\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert!(!line.continuation_error);
        assert!(!line.missing_next_line);
        assert_eq!(line.segments.len(), 2);

        assert_eq!(chars(line.segments[0].code), 71);
        assert_eq!(chars(line.segments[0].continuation), 1);
        assert_eq!(chars(line.segments[0].ignore), 18);

        assert_eq!(chars(line.segments[1].prefix), 15);
        assert_eq!(chars(line.segments[1].code), 56);
        assert_eq!(chars(line.segments[1].continuation), 0);
        assert_eq!(chars(line.segments[1].ignore), 9);
        assert!(input.is_empty());
    }

    #[test]
    fn bad_continuation_flags_second_segment() {
        let mut input = "123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890\n              X67890123456789012345678901234567890123456789012345678901 3456789012\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert!(line.continuation_error);
        assert_eq!(line.segments.len(), 2);
        assert!(!line.segments[0].continuation_error);
        assert!(line.segments[1].continuation_error);
        assert_eq!(chars(line.segments[1].code), 56);
    }

    #[test]
    fn dbcs_doubled_continuation_char_shrinks_code() {
        let mut input = "1234567890123456789012345678901234567890123456789012345678901234567890XX345678901234567890\n               67890123456789012345678901234567890123456789012345678901 34567890\n";
        let line = extract_logical_line(&mut input, &DBCS).unwrap();
        assert!(!line.so_si_continuation);
        assert_eq!(line.segments.len(), 2);
        assert_eq!(chars(line.segments[0].code), 70);
        assert_eq!(chars(line.segments[0].continuation), 2);
        assert_eq!(chars(line.segments[0].ignore), 18);
    }

    #[test]
    fn dbcs_so_si_continuation_detected() {
        let mut input = String::new();
        input.push_str("123456789012345678901234567890123456789012345678901234567890123456789.");
        input.push(SHIFT_IN);
        input.push(SHIFT_IN);
        input.push_str("45678901234567890\n");
        input.push_str("               67890123456789012345678901234567890123456789012345678901 34567890\n");
        let mut view = input.as_str();
        let line = extract_logical_line(&mut view, &DBCS).unwrap();
        assert!(line.so_si_continuation);
        assert!(line.segments[0].so_si_continuation);
        assert_eq!(chars(line.segments[0].code), 70);
        assert_eq!(chars(line.segments[0].continuation), 2);
    }

    #[test]
    fn segment_ending_shifted_out_is_flagged() {
        let mut text = String::from("A DC C'");
        text.push(SHIFT_OUT);
        text.push_str("XY\n");
        let mut view = text.as_str();
        let line = extract_logical_line(&mut view, &DBCS).unwrap();
        assert!(line.so_si_continuation);
    }

    #[test]
    fn missing_next_line_set_when_continued_at_eof() {
        let mut input = "123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert!(line.missing_next_line);
        assert_eq!(line.segments.len(), 1);
        assert_eq!(chars(line.segments[0].continuation), 1);
    }

    #[test]
    fn copy_rules_suppress_missing_next_line() {
        let mut input = "123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL_COPY).unwrap();
        assert!(!line.missing_next_line);
    }

    #[test]
    fn eol_markers() {
        for (text, eol) in [
            (" ", Eol::None),
            (" \n", Eol::Lf),
            (" \r", Eol::Cr),
            (" \r\n", Eol::Crlf),
        ] {
            let mut input = text;
            let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
            assert_eq!(line.segments[0].eol, eol);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn partition_is_lossless() {
        let input = "LABEL    LR    1,2                    remark                            X01234567\n               15                                                        00000002\nNEXT     L     3,SAVE\r\n";
        let mut view = input;
        let mut reassembled = String::new();
        while let Some(line) = extract_logical_line(&mut view, &DEFAULT_ICTL) {
            for s in &line.segments {
                reassembled.push_str(&s.to_text());
            }
        }
        assert_eq!(reassembled, input);
    }

    #[test]
    fn ictl_validation_bounds() {
        assert!(Ictl::new(1, 71, 16).is_ok());
        // begin = continuation - 1 accepted
        assert!(Ictl::new(15, 71, 16).is_ok());
        // continuation <= begin rejected
        assert_eq!(
            Ictl::new(16, 71, 16),
            Err(IctlError::BadContinuation(16))
        );
        assert_eq!(Ictl::new(0, 71, 16), Err(IctlError::BadBegin(0)));
        assert_eq!(Ictl::new(41, 71, 0), Err(IctlError::BadBegin(41)));
        assert_eq!(Ictl::new(1, 40, 16), Err(IctlError::BadEnd(40)));
        assert_eq!(Ictl::new(1, 81, 16), Err(IctlError::BadEnd(81)));
        // continuation off
        assert!(Ictl::new(1, 71, 0).is_ok());
    }

    #[test]
    fn continuation_off_never_continues() {
        let opts = Ictl::new(1, 71, 0).unwrap();
        let mut input = "123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890\nSECOND\n";
        let line = extract_logical_line(&mut input, &opts).unwrap();
        assert_eq!(line.segments.len(), 1);
        assert!(!line.missing_next_line);
        assert_eq!(input, "SECOND\n");
    }

    #[test]
    fn code_text_joins_segments() {
        let mut input = "A\n";
        let line = extract_logical_line(&mut input, &DEFAULT_ICTL).unwrap();
        assert_eq!(line.code_text(), "A");
    }
}
