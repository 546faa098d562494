//! Symbol dependency tables: registration, cycle check, propagation state.
//!
//! The tables record "resolving X may allow Y to resolve" edges together
//! with the resolvable source (an expression with its captured location
//! counter, or an installed address) and the postponed statement whose
//! final check runs once the vertex resolves. The graph is acyclic by
//! construction: insertions that would close a cycle are rejected without
//! side effects.
//!
//! Propagation itself lives on [`crate::ordinary::OrdinaryAssemblyContext`],
//! which owns both these tables and the symbol/space state they resolve
//! against.

use crate::address::{AddrId, SpaceId};
use crate::expr::{AsmExpr, EvalContext, EvalError, EvalValue};
use core_ident::{IdGenerator, IdIndex, IdStorage};
use core_model::Range;
use thiserror::Error;

/// Insertion failed: the target would transitively depend on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cyclic symbol dependency")]
pub struct CycleError;

/// Outcome of [`crate::ordinary::OrdinaryAssemblyContext::add_dependency`].
pub type AddResult = Result<(), CycleError>;

/// What a postponed statement was waiting for, for re-check dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostponedKind {
    /// Ordinary statement whose operands could not be checked yet.
    Statement,
    /// A DS/DC length that had to become a space.
    SpaceLength,
    /// An EQU value.
    EquValue,
}

/// A statement whose final check was postponed until its dependencies
/// resolve. Diagnostics from the late check attach to this range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponedCheck {
    pub kind: PostponedKind,
    pub uri: String,
    pub range: Range,
}

/// An expression plus the location-counter value captured when the owning
/// statement was processed. The capture is an arena address, so space
/// resolution keeps it current.
#[derive(Debug)]
pub struct ExprResolver {
    pub expr: AsmExpr,
    pub loctr: Option<AddrId>,
}

/// The resolvable source attached to a dependency target.
#[derive(Debug)]
pub enum DependencySource {
    Expr(ExprResolver),
    /// An installed address; resolves once its space terms are gone.
    Address(AddrId),
}

impl DependencySource {
    /// Names this source still waits on: undefined ordinary symbols, or
    /// the space names of a not-yet-flat relocatable result.
    pub fn dependencies(&self, ctx: &dyn EvalContext, space_name: impl Fn(SpaceId) -> IdIndex) -> Vec<IdIndex> {
        match self {
            DependencySource::Expr(r) => {
                let mut undefined = Vec::new();
                r.expr.undefined_symbols(ctx, &mut undefined);
                if !undefined.is_empty() {
                    return undefined;
                }
                let loctr = r.loctr.map(|id| ctx.address(id).clone());
                match r.expr.eval(ctx, loctr.as_ref()) {
                    Ok(EvalValue::Reloc(addr)) => {
                        addr.spaces.iter().map(|&(s, _)| space_name(s)).collect()
                    }
                    _ => Vec::new(),
                }
            }
            DependencySource::Address(id) => ctx
                .address(*id)
                .spaces
                .iter()
                .map(|&(s, _)| space_name(s))
                .collect(),
        }
    }

    /// Final value once `dependencies` came back empty.
    pub fn resolve(&self, ctx: &dyn EvalContext) -> Result<EvalValue, EvalError> {
        match self {
            DependencySource::Expr(r) => {
                let loctr = r.loctr.map(|id| ctx.address(id).clone());
                r.expr.eval(ctx, loctr.as_ref())
            }
            DependencySource::Address(id) => {
                let addr = ctx.address(*id);
                if addr.is_absolute() {
                    Ok(EvalValue::Abs(addr.offset))
                } else {
                    Ok(EvalValue::Reloc(addr.clone()))
                }
            }
        }
    }

    /// Arena addresses owned by this source, released when it retires.
    pub fn owned_addresses(&self) -> impl Iterator<Item = AddrId> {
        let loctr = match self {
            DependencySource::Expr(r) => r.loctr,
            DependencySource::Address(id) => Some(*id),
        };
        loctr.into_iter()
    }
}

#[derive(Debug)]
pub(crate) struct DepEntry {
    pub target: IdIndex,
    pub deps: Vec<IdIndex>,
    pub source: DependencySource,
    pub postponed: Option<PostponedCheck>,
}

/// Dependency bookkeeping: entries in insertion order (propagation within a
/// layer is deterministic), plus the spaces waiting for a length.
#[derive(Debug, Default)]
pub struct DependencyTables {
    pub(crate) entries: Vec<DepEntry>,
    pub(crate) pending_spaces: Vec<(IdIndex, SpaceId)>,
    pub(crate) ready: Vec<PostponedCheck>,
    pub(crate) generator: IdGenerator,
}

impl DependencyTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `target` is already registered as a dependency target.
    pub fn contains(&self, target: IdIndex) -> bool {
        self.entries.iter().any(|e| e.target == target)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn space_for(&self, name: IdIndex) -> Option<SpaceId> {
        self.pending_spaces
            .iter()
            .find(|&&(n, _)| n == name)
            .map(|&(_, s)| s)
    }

    pub(crate) fn generated_id(&mut self, ids: &mut IdStorage) -> IdIndex {
        self.generator.next_id(ids)
    }

    /// Would adding `target` with `dependencies` close a cycle?
    pub(crate) fn closes_cycle(&self, target: IdIndex, dependencies: &[IdIndex]) -> bool {
        if dependencies.contains(&target) {
            return true;
        }
        let mut stack: Vec<IdIndex> = dependencies.to_vec();
        let mut visited: Vec<IdIndex> = Vec::new();
        while let Some(top) = stack.pop() {
            if visited.contains(&top) {
                continue;
            }
            visited.push(top);
            if let Some(entry) = self.entries.iter().find(|e| e.target == top) {
                for &dep in &entry.deps {
                    if dep == target {
                        return true;
                    }
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Postponed statements whose dependencies were satisfied, in the order
    /// they became ready.
    pub fn collect_resolved(&mut self) -> Vec<PostponedCheck> {
        std::mem::take(&mut self.ready)
    }

    /// Drain everything: the ready list plus every still-unresolved
    /// postponed statement (end of module).
    pub fn collect_all(&mut self) -> (Vec<PostponedCheck>, Vec<PostponedCheck>) {
        let ready = std::mem::take(&mut self.ready);
        let unresolved = self
            .entries
            .drain(..)
            .filter_map(|e| e.postponed)
            .collect();
        (ready, unresolved)
    }

    /// Targets still waiting, for end-of-module diagnostics.
    pub fn unresolved_targets(&self) -> impl Iterator<Item = IdIndex> + '_ {
        self.entries.iter().map(|e| e.target)
    }
}
