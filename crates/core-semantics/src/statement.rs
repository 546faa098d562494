//! Statement variants produced by the collector.

use crate::fields::{InstructionField, LabelField, Spanned};
use crate::operand::Operand;
use core_model::{Diagnostic, Range};

/// Processing form of a statement, decided by its resolved opcode. Drives
/// how the operand field is parsed and which processor handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingForm {
    /// Machine instruction.
    Mach,
    /// Assembler instruction (EQU, DC/DS, section control, …).
    Asm,
    /// Data definition (DC/DS/DXD).
    Dat,
    /// Conditional-assembly statement.
    Ca,
    /// Macro call: operands kept as raw text for the macro's own parse.
    Mac,
    /// Operand format depends on an opcode not resolved yet.
    Deferred,
    /// Operand field intentionally not parsed (e.g. inside a skipped
    /// branch).
    Ignored,
    Unknown,
}

/// A fully parsed statement.
#[derive(Debug, Clone)]
pub struct ResolvedStatement {
    pub label: Spanned<LabelField>,
    pub instruction: Spanned<InstructionField>,
    pub operands: Vec<Operand>,
    pub remarks: Vec<Range>,
    pub range: Range,
    pub form: ProcessingForm,
}

/// Operand field retained as raw text for a later format-dependent parse.
#[derive(Debug, Clone)]
pub struct DeferredStatement {
    pub label: Spanned<LabelField>,
    pub instruction: Spanned<InstructionField>,
    pub deferred_text: String,
    pub deferred_range: Range,
    pub range: Range,
}

/// A statement that failed to assemble; carries what was diagnosed.
#[derive(Debug, Clone)]
pub struct ErrorStatement {
    pub range: Range,
    pub diags: Vec<Diagnostic>,
}

/// Any statement flowing through the pipeline.
#[derive(Debug, Clone)]
pub enum Statement {
    Resolved(ResolvedStatement),
    Deferred(DeferredStatement),
    Error(ErrorStatement),
}

impl Statement {
    pub fn range(&self) -> Range {
        match self {
            Statement::Resolved(s) => s.range,
            Statement::Deferred(s) => s.range,
            Statement::Error(s) => s.range,
        }
    }

    pub fn label(&self) -> Option<&Spanned<LabelField>> {
        match self {
            Statement::Resolved(s) => Some(&s.label),
            Statement::Deferred(s) => Some(&s.label),
            Statement::Error(_) => None,
        }
    }

    pub fn instruction(&self) -> Option<&Spanned<InstructionField>> {
        match self {
            Statement::Resolved(s) => Some(&s.instruction),
            Statement::Deferred(s) => Some(&s.instruction),
            Statement::Error(_) => None,
        }
    }
}
