//! Highlighting tokens handed to editor consumers.

use core_model::Range;

/// Semantic scope of a highlighted span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlScope {
    Label,
    Instruction,
    Operand,
    Remark,
    Comment,
    Continuation,
    Ignored,
    SeqSymbol,
    VarSymbol,
    String,
    Number,
}

/// One highlighted span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlToken {
    pub range: Range,
    pub scope: HlScope,
}

impl HlToken {
    pub fn new(range: Range, scope: HlScope) -> Self {
        Self { range, scope }
    }
}
