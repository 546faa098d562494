//! Card-image lexing: logical lines, ICTL column rules, UTF-16 columns.

pub mod logical_line;
pub mod utf16;

pub use logical_line::{
    DEFAULT_ICTL, DEFAULT_ICTL_COPY, Eol, Ictl, IctlError, LogicalLine, LogicalLineSegment,
    append_to_logical_line, extract_line, extract_logical_line, finish_logical_line,
};
pub use utf16::{decode_card_text, length_utf16, utf16_col};

/// Shift-out: begins a double-byte sequence in DBCS mode.
pub const SHIFT_OUT: char = '\u{0E}';
/// Shift-in: ends a double-byte sequence in DBCS mode.
pub const SHIFT_IN: char = '\u{0F}';
