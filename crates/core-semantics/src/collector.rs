//! The statement collector.
//!
//! Accumulates statement fields as the parser produces them. Each field is
//! assigned exactly once per statement; assigning twice is a programming
//! error, caught by the field mask. Extraction hands the assembled
//! statement plus the collected highlighting tokens and literal references
//! off atomically and resets the collector for the next statement.

use crate::fields::{InstructionField, LabelField, Spanned};
use crate::highlight::HlToken;
use crate::operand::{LiteralRef, Operand};
use crate::statement::{
    DeferredStatement, ErrorStatement, ProcessingForm, ResolvedStatement, Statement,
};
use core_model::{Diagnostic, Range};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct FieldMask: u8 {
        const LABEL       = 0b0001;
        const INSTRUCTION = 0b0010;
        const OPERANDS    = 0b0100;
        const REMARKS     = 0b1000;
    }
}

#[derive(Debug, Default)]
enum OperandField {
    #[default]
    Unset,
    Parsed(Vec<Operand>),
    Deferred { text: String, range: Range },
}

/// Incremental statement assembly.
#[derive(Debug, Default)]
pub struct Collector {
    assigned: FieldMask,
    label: Option<Spanned<LabelField>>,
    instruction: Option<Spanned<InstructionField>>,
    operands: OperandField,
    remarks: Vec<Range>,
    hl_tokens: Vec<HlToken>,
    literals: Vec<LiteralRef>,
    diags: Vec<Diagnostic>,
}

impl Default for FieldMask {
    fn default() -> Self {
        FieldMask::empty()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_label(&self) -> bool {
        self.assigned.contains(FieldMask::LABEL)
    }

    pub fn has_instruction(&self) -> bool {
        self.assigned.contains(FieldMask::INSTRUCTION)
    }

    pub fn has_operands(&self) -> bool {
        self.assigned.contains(FieldMask::OPERANDS)
    }

    pub fn label(&self) -> Option<&Spanned<LabelField>> {
        self.label.as_ref()
    }

    pub fn instruction(&self) -> Option<&Spanned<InstructionField>> {
        self.instruction.as_ref()
    }

    pub fn set_label(&mut self, label: LabelField, range: Range) {
        assert!(
            !self.assigned.contains(FieldMask::LABEL),
            "label field already set"
        );
        self.assigned |= FieldMask::LABEL;
        self.label = Some(Spanned::new(label, range));
    }

    pub fn set_instruction(&mut self, instruction: InstructionField, range: Range) {
        assert!(
            !self.assigned.contains(FieldMask::INSTRUCTION),
            "instruction field already set"
        );
        self.assigned |= FieldMask::INSTRUCTION;
        self.instruction = Some(Spanned::new(instruction, range));
    }

    pub fn set_operands(&mut self, operands: Vec<Operand>) {
        assert!(
            !self.assigned.contains(FieldMask::OPERANDS),
            "operand field already set"
        );
        self.assigned |= FieldMask::OPERANDS;
        self.operands = OperandField::Parsed(operands);
    }

    /// Keep the raw operand text for a macro-driven re-parse.
    pub fn set_deferred_operands(&mut self, text: impl Into<String>, range: Range) {
        assert!(
            !self.assigned.contains(FieldMask::OPERANDS),
            "operand field already set"
        );
        self.assigned |= FieldMask::OPERANDS;
        self.operands = OperandField::Deferred {
            text: text.into(),
            range,
        };
    }

    pub fn set_remarks(&mut self, remarks: Vec<Range>) {
        assert!(
            !self.assigned.contains(FieldMask::REMARKS),
            "remark field already set"
        );
        self.assigned |= FieldMask::REMARKS;
        self.remarks = remarks;
    }

    pub fn add_hl_token(&mut self, token: HlToken) {
        self.hl_tokens.push(token);
    }

    pub fn add_literal(&mut self, literal: LiteralRef) {
        self.literals.push(literal);
    }

    pub fn add_diagnostic(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    pub fn has_diagnostics(&self) -> bool {
        !self.diags.is_empty()
    }

    /// Merge fields collected by a nested operand parse.
    pub fn append_operand_collector(&mut self, mut other: Collector) {
        if other.assigned.contains(FieldMask::OPERANDS) {
            match std::mem::take(&mut other.operands) {
                OperandField::Parsed(ops) => self.set_operands(ops),
                OperandField::Deferred { text, range } => self.set_deferred_operands(text, range),
                OperandField::Unset => unreachable!(),
            }
        }
        if other.assigned.contains(FieldMask::REMARKS) {
            self.set_remarks(std::mem::take(&mut other.remarks));
        }
        self.hl_tokens.append(&mut other.hl_tokens);
        self.literals.append(&mut other.literals);
        self.diags.append(&mut other.diags);
    }

    /// Produce the statement and reset.
    ///
    /// Collected diagnostics turn the result into an error statement only
    /// when no instruction was established; otherwise they stay attached
    /// and travel with the extraction result.
    pub fn extract_statement(&mut self, form: ProcessingForm, range: Range) -> Extracted {
        let label = self
            .label
            .take()
            .unwrap_or_else(|| Spanned::new(LabelField::Empty, Range::at(range.start)));
        let instruction = self.instruction.take();
        let diags = std::mem::take(&mut self.diags);
        let operands = std::mem::take(&mut self.operands);
        let remarks = std::mem::take(&mut self.remarks);
        let hl_tokens = std::mem::take(&mut self.hl_tokens);
        let literals = std::mem::take(&mut self.literals);
        self.assigned = FieldMask::empty();

        let statement = match instruction {
            None => Statement::Error(ErrorStatement { range, diags }),
            Some(instruction) => match operands {
                OperandField::Deferred { text, range: op_range } => {
                    Statement::Deferred(DeferredStatement {
                        label,
                        instruction,
                        deferred_text: text,
                        deferred_range: op_range,
                        range,
                    })
                }
                OperandField::Parsed(ops) => {
                    if !diags.is_empty() {
                        Statement::Error(ErrorStatement { range, diags })
                    } else {
                        Statement::Resolved(ResolvedStatement {
                            label,
                            instruction,
                            operands: ops,
                            remarks,
                            range,
                            form,
                        })
                    }
                }
                OperandField::Unset => {
                    if !diags.is_empty() {
                        Statement::Error(ErrorStatement { range, diags })
                    } else {
                        Statement::Resolved(ResolvedStatement {
                            label,
                            instruction,
                            operands: Vec::new(),
                            remarks,
                            range,
                            form,
                        })
                    }
                }
            },
        };

        Extracted {
            statement,
            hl_tokens,
            literals,
        }
    }

    pub fn prepare_for_next_statement(&mut self) {
        *self = Collector::default();
    }
}

/// Atomic hand-off of a statement with its side products.
#[derive(Debug)]
pub struct Extracted {
    pub statement: Statement,
    pub hl_tokens: Vec<HlToken>,
    pub literals: Vec<LiteralRef>,
}
