//! Statement-field parsing over a logical line's code text.
//!
//! Works on the joined code regions of a logical line. Offsets are
//! character positions within that joined text; [`CodeMap`] translates
//! them back to per-line UTF-16 positions for diagnostics and tokens.

use core_context::{Alignment, AsmExpr, parse_expr};
use core_ident::{IdIndex, IdStorage};
use core_lexing::{LogicalLine, length_utf16};
use core_model::{Position, Range};
use core_semantics::{DataDef, LabelField, LengthSpec};

/// Maps character offsets of the joined code text back to source
/// positions.
#[derive(Debug, Clone)]
pub struct CodeMap {
    segments: Vec<SegMap>,
}

#[derive(Debug, Clone)]
struct SegMap {
    /// First char offset of this segment in the joined text.
    start: usize,
    /// Char count of the segment's code region.
    len: usize,
    lineno: usize,
    /// Cumulative UTF-16 widths: `utf16[i]` is the column of code char `i`
    /// relative to the line start (prefix included).
    utf16: Vec<usize>,
}

impl CodeMap {
    pub fn new(line: &LogicalLine<'_>, begin_line: usize) -> Self {
        let mut segments = Vec::with_capacity(line.segments.len());
        let mut start = 0;
        for (i, seg) in line.segments.iter().enumerate() {
            let base = length_utf16(seg.prefix);
            let mut utf16 = Vec::with_capacity(seg.code.chars().count() + 1);
            let mut col = base;
            utf16.push(col);
            for c in seg.code.chars() {
                col += c.len_utf16();
                utf16.push(col);
            }
            let len = utf16.len() - 1;
            segments.push(SegMap {
                start,
                len,
                lineno: begin_line + i,
                utf16,
            });
            start += len;
        }
        Self { segments }
    }

    /// Source position of a char offset in the joined code text.
    pub fn pos(&self, offset: usize) -> Position {
        for seg in &self.segments {
            if offset < seg.start + seg.len || seg.start + seg.len == self.total() {
                let within = offset.saturating_sub(seg.start).min(seg.len);
                return Position::new(seg.lineno, seg.utf16[within]);
            }
        }
        match self.segments.last() {
            Some(seg) => Position::new(seg.lineno, seg.utf16[seg.len]),
            None => Position::default(),
        }
    }

    pub fn range(&self, start: usize, end: usize) -> Range {
        Range::new(self.pos(start), self.pos(end))
    }

    /// Char offset of each segment's code start in the joined text.
    pub fn segment_starts(&self) -> Vec<usize> {
        self.segments.iter().map(|s| s.start).collect()
    }

    fn total(&self) -> usize {
        self.segments.last().map_or(0, |s| s.start + s.len)
    }
}

/// A statement's first part: label and instruction, plus where the operand
/// field begins.
#[derive(Debug)]
pub struct FirstPart {
    pub label: LabelField,
    pub label_range: (usize, usize),
    /// Instruction text, when present.
    pub instruction: Option<String>,
    pub instr_range: (usize, usize),
    /// Operand+remark text and its char offset in the joined code text.
    pub rest: String,
    pub rest_offset: usize,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '@' | '#' | '$' | '_')
}

fn is_name_part(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

/// Whether `text` is a valid ordinary symbol name.
pub fn is_ordinary_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if is_name_start(c) => chars.all(is_name_part),
        _ => false,
    }
}

/// Split the code text of a logical line into label, instruction, and the
/// rest. Char offsets index the joined code text.
pub fn parse_first_part(code: &str, ids: &mut IdStorage) -> FirstPart {
    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;

    // label: anything that starts in the begin column
    let label_start = i;
    while i < chars.len() && chars[i] != ' ' {
        i += 1;
    }
    let label_text: String = chars[label_start..i].iter().collect();
    let label_range = (label_start, i);
    let label = classify_label(&label_text, ids);

    while i < chars.len() && chars[i] == ' ' {
        i += 1;
    }

    let instr_start = i;
    while i < chars.len() && chars[i] != ' ' {
        i += 1;
    }
    let instruction: String = chars[instr_start..i].iter().collect();
    let instr_range = (instr_start, i);

    // exactly one blank separates the instruction from the operand field
    while i < chars.len() && chars[i] == ' ' {
        i += 1;
    }
    let rest: String = chars[i..].iter().collect();

    FirstPart {
        label,
        label_range,
        instruction: if instruction.is_empty() {
            None
        } else {
            Some(instruction)
        },
        instr_range,
        rest,
        rest_offset: i,
    }
}

pub fn classify_label(text: &str, ids: &mut IdStorage) -> LabelField {
    if text.is_empty() {
        return LabelField::Empty;
    }
    if let Some(seq) = text.strip_prefix('.') {
        if is_ordinary_name(seq) {
            return LabelField::Sequence { id: ids.add(seq) };
        }
    }
    if let Some(var) = text.strip_prefix('&') {
        if is_ordinary_name(var) {
            return LabelField::Variable {
                name: ids.add(var),
            };
        }
    }
    if is_ordinary_name(text) {
        return LabelField::Ordinary {
            id: ids.add(text),
            mixed_case: text.to_owned(),
        };
    }
    LabelField::Concat {
        text: text.to_owned(),
    }
}

/// Is the apostrophe at `idx` an attribute marker (`L'X`) rather than a
/// string delimiter? True when a lone attribute letter precedes it and an
/// operand character follows.
fn is_attribute_apostrophe(chars: &[char], idx: usize) -> bool {
    if idx == 0 {
        return false;
    }
    let prev = chars[idx - 1].to_ascii_uppercase();
    if !matches!(prev, 'L' | 'T' | 'S' | 'I' | 'K' | 'N' | 'O' | 'D') {
        return false;
    }
    if idx >= 2 && (is_name_part(chars[idx - 2]) || chars[idx - 2] == '\'') {
        return false;
    }
    chars
        .get(idx + 1)
        .is_some_and(|&c| is_name_start(c) || c == '&' || c == '=')
}

/// Operand field gathered across continuation segments.
///
/// `offsets[i]` is the joined-code char offset of `text`'s `i`-th char,
/// so diagnostic ranges survive the comma-blank-resume splicing.
#[derive(Debug, Default)]
pub struct OperandField {
    pub text: String,
    pub offsets: Vec<usize>,
    /// Remark regions as (start, end) char offsets in the joined code.
    pub remarks: Vec<(usize, usize)>,
}

impl OperandField {
    /// Joined-code offset of a char offset into `text` (clamped).
    pub fn source_offset(&self, text_off: usize) -> usize {
        self.offsets
            .get(text_off)
            .or(self.offsets.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Gather the operand field starting at `start` in the joined code text.
///
/// A blank outside apostrophes ends the field — unless the last operand
/// character was a comma and another segment follows, in which case the
/// field resumes at that segment's code start and the skipped text is
/// remark. A token running into the segment boundary continues seamlessly.
pub fn collect_operand_field(code: &str, start: usize, seg_starts: &[usize]) -> OperandField {
    let chars: Vec<char> = code.chars().collect();
    let mut field = OperandField::default();
    let mut in_string = false;
    let mut i = start;
    loop {
        if i >= chars.len() {
            return field;
        }
        match chars[i] {
            '\'' if !is_attribute_apostrophe(&chars, i) => {
                in_string = !in_string;
                field.text.push('\'');
                field.offsets.push(i);
                i += 1;
            }
            ' ' if !in_string => {
                let next_seg = seg_starts.iter().copied().find(|&s| s > i);
                if field.text.ends_with(',') {
                    if let Some(resume) = next_seg {
                        if i < resume {
                            field.remarks.push((i, resume));
                            i = resume;
                            continue;
                        }
                    }
                }
                // operand field ends; the rest of the line is remark
                if i < chars.len() {
                    field.remarks.push((i, chars.len()));
                }
                return field;
            }
            c => {
                field.text.push(c);
                field.offsets.push(i);
                i += 1;
            }
        }
    }
}

/// Split the operand field off `rest`: operands end at the first blank
/// outside apostrophes; what follows is remark text.
pub fn split_operands_and_remarks(rest: &str) -> (String, usize) {
    let chars: Vec<char> = rest.chars().collect();
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' if !is_attribute_apostrophe(&chars, i) => in_string = !in_string,
            ' ' if !in_string => break,
            _ => {}
        }
        i += 1;
    }
    (chars[..i].iter().collect(), i)
}

/// Split an operand field at top-level commas, respecting strings and
/// parenthesized sublists. Returns `(text, char offset)` pairs; an empty
/// operand between commas yields an empty string.
pub fn split_operand_list(field: &str) -> Vec<(String, usize)> {
    let chars: Vec<char> = field.chars().collect();
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0;
    for i in 0..chars.len() {
        match chars[i] {
            '\'' if !is_attribute_apostrophe(&chars, i) => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                out.push((chars[start..i].iter().collect(), start));
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < chars.len() || !chars.is_empty() || out.is_empty() {
        out.push((chars[start..].iter().collect(), start));
    }
    out
}

/// Default length attribute and alignment of a data type.
pub fn data_type_defaults(type_char: char) -> Option<(u32, Alignment)> {
    Some(match type_char.to_ascii_uppercase() {
        'F' => (4, Alignment::FULLWORD),
        'H' => (2, Alignment::HALFWORD),
        'A' => (4, Alignment::FULLWORD),
        'Y' => (2, Alignment::HALFWORD),
        'D' => (8, Alignment::DOUBLEWORD),
        'E' => (4, Alignment::FULLWORD),
        'C' => (1, Alignment::NONE),
        'X' => (1, Alignment::NONE),
        'B' => (1, Alignment::NONE),
        'P' => (1, Alignment::NONE),
        'Z' => (1, Alignment::NONE),
        _ => return None,
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DataDefError {
    #[error("missing data type")]
    MissingType,
    #[error("unknown data type `{0}`")]
    UnknownType(char),
    #[error("malformed length modifier")]
    BadLength,
    #[error("unterminated nominal value")]
    BadNominal,
}

/// Parse one DC/DS/DXD operand: `[dup]type[L len]['nominal'|(nominal)]`.
pub fn parse_data_def(text: &str, ids: &mut IdStorage) -> Result<DataDef, DataDefError> {
    let mut rest = text.trim_end();

    // duplication factor: digits or a parenthesized expression
    let mut dup_factor = None;
    if rest.starts_with(|c: char| c.is_ascii_digit()) {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        rest = &rest[digits.len()..];
        dup_factor = Some(AsmExpr::Num(
            digits.parse().map_err(|_| DataDefError::BadLength)?,
        ));
    } else if let Some(inner) = rest.strip_prefix('(') {
        let close = matching_paren(inner).ok_or(DataDefError::BadLength)?;
        let (expr, _) = parse_expr(&inner[..close], ids).map_err(|_| DataDefError::BadLength)?;
        dup_factor = Some(expr);
        rest = &inner[close + 1..];
    }

    let type_char = rest.chars().next().ok_or(DataDefError::MissingType)?;
    if data_type_defaults(type_char).is_none() {
        return Err(DataDefError::UnknownType(type_char));
    }
    rest = &rest[type_char.len_utf8()..];

    // length modifier
    let mut length = None;
    if let Some(after_l) = rest.strip_prefix(['L', 'l']) {
        if let Some(inner) = after_l.strip_prefix('(') {
            let close = matching_paren(inner).ok_or(DataDefError::BadLength)?;
            let (expr, used) = parse_expr(&inner[..close], ids).map_err(|_| DataDefError::BadLength)?;
            if used != close {
                return Err(DataDefError::BadLength);
            }
            length = Some(LengthSpec::Expr(expr));
            rest = &inner[close + 1..];
        } else {
            let digits: String = after_l.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return Err(DataDefError::BadLength);
            }
            length = Some(LengthSpec::Fixed(
                digits.parse().map_err(|_| DataDefError::BadLength)?,
            ));
            rest = &after_l[digits.len()..];
        }
    } else if let Some(inner) = rest.strip_prefix('(') {
        // bare parenthesized length: `CL(expr)` written as `C(expr)` is
        // address-style nominal instead; only treat as nominal below
        let close = matching_paren(inner).ok_or(DataDefError::BadNominal)?;
        return Ok(DataDef {
            dup_factor,
            type_char,
            length: None,
            nominal: Some(format!("({})", &inner[..close])),
        });
    }

    // nominal value
    let mut nominal = None;
    if let Some(inner) = rest.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = inner.chars();
        loop {
            match chars.next() {
                None => return Err(DataDefError::BadNominal),
                Some('\'') => {
                    if chars.clone().next() == Some('\'') {
                        chars.next();
                        value.push('\'');
                    } else {
                        break;
                    }
                }
                Some(c) => value.push(c),
            }
        }
        nominal = Some(value);
    } else if let Some(inner) = rest.strip_prefix('(') {
        let close = matching_paren(inner).ok_or(DataDefError::BadNominal)?;
        nominal = Some(format!("({})", &inner[..close]));
    }

    Ok(DataDef {
        dup_factor,
        type_char,
        length,
        nominal,
    })
}

fn matching_paren(after_open: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in after_open.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `=F'0'`-shaped literal operand?
pub fn is_literal(text: &str) -> bool {
    text.starts_with('=') && text.len() > 1
}

/// Comment line: `*` or `.*` in the begin column.
pub fn is_comment(code: &str) -> bool {
    code.starts_with('*') || code.starts_with(".*")
}
