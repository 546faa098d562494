//! Statement model: fields, operands, the collector, highlighting.

pub mod collector;
pub mod fields;
pub mod highlight;
pub mod operand;
pub mod statement;

pub use collector::{Collector, Extracted};
pub use fields::{InstructionField, LabelField, Spanned};
pub use highlight::{HlScope, HlToken};
pub use operand::{DataDef, LengthSpec, LiteralRef, Operand};
pub use statement::{
    DeferredStatement, ErrorStatement, ProcessingForm, ResolvedStatement, Statement,
};
