//! The ordinary-assembly context: sections, symbols, and the solver.
//!
//! Owns every registry the address algebra needs (sections, location
//! counters, spaces, the address arena, the symbol table) plus the
//! dependency tables, and runs dependency propagation against them.

use crate::address::{AddrId, Address, RelocStorage, SpaceId};
use crate::alignment::Alignment;
use crate::dependency::{
    AddResult, CycleError, DepEntry, DependencySource, DependencyTables, PostponedCheck,
};
use crate::expr::{AttrKind, EvalContext, EvalValue};
use crate::section::{LocationCounter, LoctrId, LoctrKind, Section, SectionId, SectionKind};
use crate::symbol::{Symbol, SymbolAttributes, SymbolValue};
use core_ident::{IdGenerator, IdIndex, IdStorage};
use core_model::{Diagnostic, DiagnosticCollector, Location};
use std::collections::HashMap;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("symbol already defined")]
    SymbolRedefined,
    #[error("cyclic symbol dependency")]
    Cycle,
}

impl From<CycleError> for ContextError {
    fn from(_: CycleError) -> Self {
        ContextError::Cycle
    }
}

/// Central assembly state for one analysis.
#[derive(Debug, Default)]
pub struct OrdinaryAssemblyContext {
    sections: Vec<Section>,
    loctrs: Vec<LocationCounter>,
    pub reloc: RelocStorage,
    symbols: HashMap<IdIndex, Symbol>,
    symbol_order: Vec<IdIndex>,
    current_section: Option<SectionId>,
    pub deps: DependencyTables,
    /// Attributes discovered by lookahead for symbols not defined yet.
    lookahead_attrs: HashMap<IdIndex, SymbolAttributes>,
}

impl OrdinaryAssemblyContext {
    pub fn new() -> Self {
        Self::default()
    }

    // -- symbols ----------------------------------------------------------

    pub fn symbol(&self, name: IdIndex) -> Option<&Symbol> {
        self.symbols.get(&name)
    }

    pub fn symbol_exists(&self, name: IdIndex) -> bool {
        self.symbols.contains_key(&name)
    }

    pub fn symbol_is_defined(&self, name: IdIndex) -> bool {
        self.symbols.get(&name).is_some_and(Symbol::is_defined)
    }

    /// Symbols in definition order.
    pub fn symbols_in_order(&self) -> impl Iterator<Item = &Symbol> {
        self.symbol_order.iter().map(|n| &self.symbols[n])
    }

    /// Create a symbol; redefinition is an error. A defined value triggers
    /// dependency propagation.
    pub fn create_symbol(
        &mut self,
        ids: &mut IdStorage,
        name: IdIndex,
        value: SymbolValue,
        attrs: SymbolAttributes,
        definition: Option<Location>,
        diags: &mut DiagnosticCollector,
    ) -> Result<(), ContextError> {
        if self.symbols.contains_key(&name) {
            return Err(ContextError::SymbolRedefined);
        }
        let mut sym = Symbol::new(name, value, attrs);
        if let Some(loc) = definition {
            sym = sym.with_definition(loc);
        }
        self.symbols.insert(name, sym);
        self.symbol_order.push(name);
        if value.is_defined() {
            self.add_defined(ids, name, diags);
        }
        Ok(())
    }

    /// Note an attribute found by lookahead for a symbol that has no
    /// definition yet.
    pub fn record_lookahead_attrs(&mut self, name: IdIndex, attrs: SymbolAttributes) {
        self.lookahead_attrs.entry(name).or_insert(attrs);
    }

    pub fn lookahead_attrs(&self, name: IdIndex) -> Option<&SymbolAttributes> {
        self.lookahead_attrs.get(&name)
    }

    // -- sections and location counters -----------------------------------

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    pub fn loctr(&self, id: LoctrId) -> &LocationCounter {
        &self.loctrs[id.0 as usize]
    }

    pub fn current_section(&self) -> Option<SectionId> {
        self.current_section
    }

    fn create_section_raw(&mut self, ids: &mut IdStorage, name: IdIndex, kind: SectionKind) -> SectionId {
        let sect_id = SectionId(self.sections.len() as u32);
        let loctr_id = LoctrId(self.loctrs.len() as u32);
        self.loctrs.push(LocationCounter::new(
            name,
            sect_id,
            loctr_id,
            LoctrKind::Starting,
            name,
            ids,
            &mut self.reloc,
        ));
        self.sections.push(Section {
            name,
            kind,
            loctrs: vec![loctr_id],
            current_loctr: loctr_id,
        });
        self.current_section = Some(sect_id);
        sect_id
    }

    /// The unnamed section created when storage is reserved with no
    /// section established.
    fn ensure_section(&mut self, ids: &mut IdStorage) -> SectionId {
        match self.current_section {
            Some(id) => id,
            None => self.create_section_raw(ids, IdIndex::EMPTY, SectionKind::Executable),
        }
    }

    pub fn section_defined(&self, name: IdIndex, kind: SectionKind) -> bool {
        self.sections
            .iter()
            .any(|s| s.name == name && s.kind == kind)
    }

    /// Establish (or switch back to) a section. A new section also defines
    /// an ordinary symbol carrying the section's origin address.
    pub fn set_section(
        &mut self,
        ids: &mut IdStorage,
        name: IdIndex,
        kind: SectionKind,
        definition: Option<Location>,
        diags: &mut DiagnosticCollector,
    ) -> Result<SectionId, ContextError> {
        if let Some(pos) = self
            .sections
            .iter()
            .position(|s| s.name == name && s.kind == kind)
        {
            let id = SectionId(pos as u32);
            self.current_section = Some(id);
            return Ok(id);
        }
        if !name.is_empty() && self.symbols.contains_key(&name) {
            return Err(ContextError::SymbolRedefined);
        }
        let id = self.create_section_raw(ids, name, kind);
        if !name.is_empty() {
            let origin = self.current_loctr_mut(id).reserve_storage(0, Alignment::NONE);
            let addr = self.reloc.install(origin);
            self.create_symbol(
                ids,
                name,
                SymbolValue::Reloc(addr),
                SymbolAttributes::section(),
                definition,
                diags,
            )?;
        }
        Ok(id)
    }

    /// Switch to (or define) a location counter in the current section.
    /// Defining one creates a symbol with the counter's origin address.
    pub fn set_location_counter(
        &mut self,
        ids: &mut IdStorage,
        name: IdIndex,
        definition: Option<Location>,
        diags: &mut DiagnosticCollector,
    ) -> Result<LoctrId, ContextError> {
        let sect_id = self.ensure_section(ids);
        let section = &self.sections[sect_id.0 as usize];
        if let Some(&existing) = section
            .loctrs
            .iter()
            .find(|&&l| self.loctrs[l.0 as usize].name == name)
        {
            self.sections[sect_id.0 as usize].current_loctr = existing;
            return Ok(existing);
        }
        if self.symbols.contains_key(&name) {
            return Err(ContextError::SymbolRedefined);
        }
        let sect_name = section.name;
        let loctr_id = LoctrId(self.loctrs.len() as u32);
        self.loctrs.push(LocationCounter::new(
            name,
            sect_id,
            loctr_id,
            LoctrKind::NonStarting,
            sect_name,
            ids,
            &mut self.reloc,
        ));
        let section = &mut self.sections[sect_id.0 as usize];
        section.loctrs.push(loctr_id);
        section.current_loctr = loctr_id;

        let origin = self.loctrs[loctr_id.0 as usize].reserve_storage(0, Alignment::NONE);
        let addr = self.reloc.install(origin);
        self.create_symbol(
            ids,
            name,
            SymbolValue::Reloc(addr),
            SymbolAttributes::section(),
            definition,
            diags,
        )?;
        Ok(loctr_id)
    }

    fn current_loctr_id(&mut self, ids: &mut IdStorage) -> LoctrId {
        let sect = self.ensure_section(ids);
        self.sections[sect.0 as usize].current_loctr
    }

    fn current_loctr_mut(&mut self, sect: SectionId) -> &mut LocationCounter {
        let id = self.sections[sect.0 as usize].current_loctr;
        &mut self.loctrs[id.0 as usize]
    }

    /// Reserve storage on the current location counter.
    pub fn reserve_storage(
        &mut self,
        ids: &mut IdStorage,
        length: usize,
        align: Alignment,
    ) -> Address {
        let loctr = self.current_loctr_id(ids);
        self.loctrs[loctr.0 as usize].reserve_storage(length, align)
    }

    /// The current location-counter address.
    pub fn current_address(&mut self, ids: &mut IdStorage) -> Address {
        self.reserve_storage(ids, 0, Alignment::NONE)
    }

    /// Register a fresh space on the current location counter.
    pub fn register_space(&mut self, ids: &mut IdStorage) -> SpaceId {
        let loctr = self.current_loctr_id(ids);
        let owner_name = self.sections[self.loctrs[loctr.0 as usize].owner.0 as usize].name;
        self.loctrs[loctr.0 as usize].register_space(loctr, owner_name, ids, &mut self.reloc)
    }

    // -- dependency solver -------------------------------------------------

    /// Register that resolving `target` waits on `source`'s inputs.
    ///
    /// An empty `target` gets a generated name. Insertion closing a cycle
    /// is rejected without side effects (beyond releasing addresses owned
    /// by the rejected source); a source with no unmet inputs resolves
    /// eagerly.
    pub fn add_dependency(
        &mut self,
        ids: &mut IdStorage,
        target: IdIndex,
        source: DependencySource,
        postponed: Option<PostponedCheck>,
        diags: &mut DiagnosticCollector,
    ) -> AddResult {
        let target = if target.is_empty() {
            self.deps.generated_id(ids)
        } else {
            target
        };
        debug_assert!(
            !self.deps.contains(target),
            "symbol dependency already present"
        );

        let dependencies = source.dependencies(self, |s| self.reloc.space(s).name);
        if dependencies.is_empty() {
            let mut queue = VecDeque::new();
            let entry = DepEntry {
                target,
                deps: Vec::new(),
                source,
                postponed,
            };
            self.resolve_entry(ids, entry, &mut queue, diags);
            self.propagate(ids, queue, diags);
            return Ok(());
        }
        if self.deps.closes_cycle(target, &dependencies) {
            for id in source.owned_addresses() {
                self.reloc.remove(id);
            }
            return Err(CycleError);
        }
        debug!(target: "solver", target = ?target, deps = dependencies.len(), "dependency added");
        self.deps.entries.push(DepEntry {
            target,
            deps: dependencies,
            source,
            postponed,
        });
        Ok(())
    }

    /// Register a dependency that resolves a space's length.
    pub fn add_space_dependency(
        &mut self,
        ids: &mut IdStorage,
        space: SpaceId,
        source: DependencySource,
        postponed: Option<PostponedCheck>,
        diags: &mut DiagnosticCollector,
    ) -> AddResult {
        let name = self.reloc.space(space).name;
        self.deps.pending_spaces.push((name, space));
        let result = self.add_dependency(ids, name, source, postponed, diags);
        if result.is_err() {
            self.deps.pending_spaces.retain(|&(n, _)| n != name);
        }
        result
    }

    /// Mark `name` defined and propagate.
    pub fn add_defined(
        &mut self,
        ids: &mut IdStorage,
        name: IdIndex,
        diags: &mut DiagnosticCollector,
    ) {
        self.propagate(ids, VecDeque::from([name]), diags);
    }

    fn propagate(
        &mut self,
        ids: &mut IdStorage,
        mut queue: VecDeque<IdIndex>,
        diags: &mut DiagnosticCollector,
    ) {
        while let Some(defined) = queue.pop_front() {
            let entries = std::mem::take(&mut self.deps.entries);
            let mut kept = Vec::with_capacity(entries.len());
            let mut resolved = Vec::new();
            for mut entry in entries {
                if !entry.deps.contains(&defined) {
                    kept.push(entry);
                    continue;
                }
                let new_deps = entry.source.dependencies(self, |s| self.reloc.space(s).name);
                if new_deps.is_empty() {
                    resolved.push(entry);
                } else {
                    entry.deps = new_deps;
                    kept.push(entry);
                }
            }
            self.deps.entries = kept;
            for entry in resolved {
                self.resolve_entry(ids, entry, &mut queue, diags);
            }
        }
    }

    fn resolve_entry(
        &mut self,
        ids: &mut IdStorage,
        entry: DepEntry,
        queue: &mut VecDeque<IdIndex>,
        diags: &mut DiagnosticCollector,
    ) {
        let DepEntry {
            target,
            source,
            postponed,
            ..
        } = entry;

        if IdGenerator::is_generated(ids, target) {
            // statement-only dependency: the value is the re-check's
            // business, not the solver's
            for id in source.owned_addresses() {
                self.reloc.remove(id);
            }
            if let Some(check) = postponed {
                self.deps.ready.push(check);
            }
            self.deps.generator.release(target);
            return;
        }

        let value = source.resolve(self);
        for id in source.owned_addresses() {
            self.reloc.remove(id);
        }

        if let Some(space) = self.deps.space_for(target) {
            self.deps.pending_spaces.retain(|&(n, _)| n != target);
            match value.as_ref().ok().and_then(|v| v.as_abs()) {
                Some(len) if len >= 0 => {
                    self.resolve_space(space, len as usize);
                    queue.push_back(target);
                }
                _ => {
                    let (uri, range) = postponed
                        .as_ref()
                        .map(|p| (p.uri.clone(), p.range))
                        .unwrap_or_default();
                    diags.add(
                        Diagnostic::error("DEF003", range, "length must be a non-negative absolute value")
                            .with_uri(uri),
                    );
                }
            }
            if let Some(check) = postponed {
                self.deps.ready.push(check);
            }
            return;
        }

        match value {
            Ok(EvalValue::Abs(v)) => {
                if let Some(sym) = self.symbols.get_mut(&target) {
                    if !sym.is_defined() {
                        sym.set_value(SymbolValue::Abs(v));
                    }
                }
                debug!(target: "solver", symbol = ?target, value = v, "resolved");
                queue.push_back(target);
            }
            Ok(EvalValue::Reloc(addr)) => {
                let id = self.reloc.install(addr);
                if let Some(sym) = self.symbols.get_mut(&target) {
                    if !sym.is_defined() {
                        sym.set_value(SymbolValue::Reloc(id));
                    } else {
                        self.reloc.remove(id);
                    }
                } else {
                    self.reloc.remove(id);
                }
                queue.push_back(target);
            }
            Err(_) => {
                let (uri, range) = postponed
                    .as_ref()
                    .map(|p| (p.uri.clone(), p.range))
                    .unwrap_or_default();
                diags.add(
                    Diagnostic::error("DEF004", range, "dependency could not be evaluated")
                        .with_uri(uri),
                );
            }
        }
        if let Some(check) = postponed {
            self.deps.ready.push(check);
        }
    }

    /// Resolve a space and keep the owning counter's bookkeeping straight.
    pub fn resolve_space(&mut self, space: SpaceId, length: usize) {
        let owner = self.reloc.resolve_space(space, length);
        let counter = &mut self.loctrs[owner.0 as usize];
        counter.remove_pending_space(space);
        counter.grow_storage(length);
    }

    /// Fix the module layout: per section, resolve every non-starting
    /// counter's base-space to the accumulated storage of its
    /// predecessors, and propagate the newly-known distances.
    pub fn finish_module_layout(
        &mut self,
        ids: &mut IdStorage,
        diags: &mut DiagnosticCollector,
    ) {
        let mut newly_defined = Vec::new();
        for sect_idx in 0..self.sections.len() {
            let loctr_ids = self.sections[sect_idx].loctrs.clone();
            let mut total = 0usize;
            for loctr_id in loctr_ids {
                let counter = &mut self.loctrs[loctr_id.0 as usize];
                if counter.kind == LoctrKind::NonStarting {
                    let base = counter.spaces()[0];
                    newly_defined.push(self.reloc.space(base).name);
                    let counter = &mut self.loctrs[loctr_id.0 as usize];
                    counter.finish_layout(total, &mut self.reloc);
                } else {
                    counter.finish_layout(0, &mut self.reloc);
                }
                total = self.loctrs[loctr_id.0 as usize].storage();
            }
        }
        for name in newly_defined {
            self.add_defined(ids, name, diags);
        }
    }

    /// End-of-module: unresolved targets get diagnostics; every remaining
    /// postponed statement drains for its final (failing) check.
    ///
    /// A space whose equation only mentions itself (`X DS CL(Y-*)` where
    /// `Y` sits past `X`) is vacuously satisfied and stays quiet — the
    /// space *is* the distance the equation describes.
    pub fn report_unresolved(&mut self, diags: &mut DiagnosticCollector) -> Vec<PostponedCheck> {
        let self_referential: Vec<bool> = self
            .deps
            .entries
            .iter()
            .filter(|e| e.postponed.is_some())
            .map(|e| e.deps.iter().all(|&d| d == e.target))
            .collect();
        let (ready, unresolved) = self.deps.collect_all();
        for (check, vacuous) in unresolved.iter().zip(self_referential) {
            if vacuous && check.kind == crate::dependency::PostponedKind::SpaceLength {
                continue;
            }
            diags.add(
                Diagnostic::error("DEF001", check.range, "statement has unresolved dependencies")
                    .with_uri(check.uri.clone()),
            );
        }
        let mut all = ready;
        all.extend(unresolved);
        all
    }
}

impl EvalContext for OrdinaryAssemblyContext {
    fn symbol(&self, id: IdIndex) -> Option<&Symbol> {
        self.symbols.get(&id)
    }

    fn address(&self, id: AddrId) -> &Address {
        self.reloc.get(id)
    }

    fn attribute(&self, id: IdIndex, attr: AttrKind) -> Option<i32> {
        let attrs = match self.symbols.get(&id) {
            Some(sym) if sym.is_defined() => sym.attrs,
            _ => *self.lookahead_attrs.get(&id)?,
        };
        Some(match attr {
            AttrKind::Length => attrs.length as i32,
            AttrKind::Type => attrs.type_attr as i32,
            AttrKind::Scale | AttrKind::Integer => 0,
        })
    }
}
