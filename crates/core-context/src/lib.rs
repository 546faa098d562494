//! Ordinary-assembly context: the relocatable-address algebra, sections
//! and location counters, ordinary symbols, the dependency solver, SET
//! variables and macro-parameter data.
//!
//! The cyclic space-to-address back-pointers of a classic implementation
//! are replaced by arenas: spaces and addresses live in registries owned by
//! [`OrdinaryAssemblyContext`] and refer to each other through ids, so
//! resolving a space is an id-set walk instead of pointer chasing.

pub mod address;
pub mod alignment;
pub mod dependency;
pub mod expr;
pub mod macro_param;
pub mod ordinary;
pub mod section;
pub mod symbol;
pub mod variable;

pub use address::{AddrId, Address, RelocStorage, SpaceId};
pub use alignment::Alignment;
pub use dependency::{
    AddResult, CycleError, DependencySource, DependencyTables, ExprResolver, PostponedCheck,
    PostponedKind,
};
pub use expr::{AsmExpr, AttrKind, BinOp, EvalContext, EvalError, EvalValue, parse_expr};
pub use macro_param::{MacroDataArena, MacroDataId};
pub use ordinary::{ContextError, OrdinaryAssemblyContext};
pub use section::{LoctrId, LoctrKind, SectionId, SectionKind};
pub use symbol::{Symbol, SymbolAttributes, SymbolValue};
pub use variable::{MacroParam, MacroParamKind, SetSymbol, SetType, SetValue, VariableSymbol};
