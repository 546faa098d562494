//! Sections and location counters.

use crate::address::{Address, RelocStorage, SpaceId};
use crate::alignment::Alignment;
use core_ident::{IdIndex, IdStorage};

/// Handle of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub(crate) u32);

/// Handle of a location counter (the arena is shared across sections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoctrId(pub(crate) u32);

/// Kind of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// CSECT
    Executable,
    /// RSECT
    ReadOnly,
    /// DSECT
    Dummy,
    /// COM
    Common,
    External,
}

/// Whether a location counter opens its section.
///
/// The starting counter begins at the section origin; a non-starting one
/// sits an unknown distance from it until the module layout is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoctrKind {
    Starting,
    NonStarting,
}

/// A named region of generated code or data.
#[derive(Debug)]
pub struct Section {
    pub name: IdIndex,
    pub kind: SectionKind,
    pub loctrs: Vec<LoctrId>,
    pub current_loctr: LoctrId,
}

/// A byte cursor within a section.
#[derive(Debug)]
pub struct LocationCounter {
    pub name: IdIndex,
    pub owner: SectionId,
    pub kind: LoctrKind,
    storage: usize,
    spaces: Vec<SpaceId>,
    next_space_ordinal: usize,
    layout_done: bool,
}

impl LocationCounter {
    /// A non-starting counter immediately owns its base-space: the unknown
    /// distance from the section origin.
    pub(crate) fn new(
        name: IdIndex,
        owner: SectionId,
        self_id: LoctrId,
        kind: LoctrKind,
        owner_name: IdIndex,
        ids: &mut IdStorage,
        reloc: &mut RelocStorage,
    ) -> Self {
        let mut counter = Self {
            name,
            owner,
            kind,
            storage: 0,
            spaces: Vec::new(),
            next_space_ordinal: 0,
            layout_done: false,
        };
        if kind == LoctrKind::NonStarting {
            let base_name = format!(
                "B {} {} ",
                ids.resolve(owner_name).to_owned(),
                ids.resolve(name).to_owned()
            );
            let base_id = ids.add(&base_name);
            counter.spaces.push(reloc.new_space(base_id, self_id));
        }
        counter
    }

    /// Bytes reserved so far (resolved spaces included).
    pub fn storage(&self) -> usize {
        self.storage
    }

    /// Pending (unresolved) spaces, in registration order.
    pub fn spaces(&self) -> &[SpaceId] {
        &self.spaces
    }

    /// Reserve `length` bytes at `align`, returning the address of the
    /// reserved area. Pending spaces ride along on the address.
    pub fn reserve_storage(
        &mut self,
        length: usize,
        align: Alignment,
    ) -> Address {
        self.storage += align.padding(self.storage);
        self.storage += length;
        Address::new(self.owner, self.storage as i32, &self.spaces)
    }

    /// Align without reserving.
    pub fn align(&mut self, align: Alignment) -> Address {
        self.reserve_storage(0, align)
    }

    /// Append a fresh space to the counter.
    pub fn register_space(
        &mut self,
        self_id: LoctrId,
        owner_name: IdIndex,
        ids: &mut IdStorage,
        reloc: &mut RelocStorage,
    ) -> SpaceId {
        let name = format!(
            "S {} {} {}",
            ids.resolve(owner_name).to_owned(),
            ids.resolve(self.name).to_owned(),
            self.next_space_ordinal
        );
        self.next_space_ordinal += 1;
        let space = reloc.new_space(ids.add(&name), self_id);
        self.spaces.push(space);
        space
    }

    /// A counter has undefined layout while any space beyond the implicit
    /// base-space is pending.
    pub fn has_undefined_layout(&self) -> bool {
        match self.kind {
            LoctrKind::Starting => !self.spaces.is_empty(),
            LoctrKind::NonStarting => self.spaces.len() > 1,
        }
    }

    pub(crate) fn remove_pending_space(&mut self, space: SpaceId) {
        self.spaces.retain(|&s| s != space);
    }

    pub(crate) fn grow_storage(&mut self, by: usize) {
        self.storage += by;
    }

    /// Resolve the implicit base-space to `offset`, fixing this counter's
    /// distance from the section origin. Callable once.
    pub(crate) fn finish_layout(&mut self, offset: usize, reloc: &mut RelocStorage) {
        assert!(!self.layout_done, "layout already created");
        debug_assert!(self.kind == LoctrKind::NonStarting || offset == 0);
        if self.kind == LoctrKind::NonStarting {
            let base = self.spaces[0];
            reloc.resolve_space(base, offset);
            self.remove_pending_space(base);
            self.storage += offset;
        }
        self.layout_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (IdStorage, RelocStorage) {
        (IdStorage::new(), RelocStorage::new())
    }

    #[test]
    fn starting_counter_owns_no_initial_space() {
        let (mut ids, mut reloc) = fixture();
        let name = ids.add("MAIN");
        let counter = LocationCounter::new(
            name,
            SectionId(0),
            LoctrId(0),
            LoctrKind::Starting,
            name,
            &mut ids,
            &mut reloc,
        );
        assert!(counter.spaces().is_empty());
        assert!(!counter.has_undefined_layout());
    }

    #[test]
    fn non_starting_counter_owns_exactly_one_base_space() {
        let (mut ids, mut reloc) = fixture();
        let sect = ids.add("MAIN");
        let name = ids.add("AUX");
        let counter = LocationCounter::new(
            name,
            SectionId(0),
            LoctrId(1),
            LoctrKind::NonStarting,
            sect,
            &mut ids,
            &mut reloc,
        );
        assert_eq!(counter.spaces().len(), 1);
        assert!(!counter.has_undefined_layout());
        assert!(ids.resolve(reloc.space(counter.spaces()[0]).name).starts_with("B "));
    }

    #[test]
    fn reserve_aligns_then_advances() {
        let (mut ids, mut reloc) = fixture();
        let name = ids.add("MAIN");
        let mut counter = LocationCounter::new(
            name,
            SectionId(0),
            LoctrId(0),
            LoctrKind::Starting,
            name,
            &mut ids,
            &mut reloc,
        );
        counter.reserve_storage(2, Alignment::NONE);
        let addr = counter.reserve_storage(4, Alignment::FULLWORD);
        assert_eq!(counter.storage(), 8);
        assert_eq!(addr.offset, 8);
        assert_eq!(addr.bases, vec![(SectionId(0), 1)]);
    }

    #[test]
    fn registered_spaces_ride_along_on_addresses() {
        let (mut ids, mut reloc) = fixture();
        let name = ids.add("MAIN");
        let mut counter = LocationCounter::new(
            name,
            SectionId(0),
            LoctrId(0),
            LoctrKind::Starting,
            name,
            &mut ids,
            &mut reloc,
        );
        let space = counter.register_space(LoctrId(0), name, &mut ids, &mut reloc);
        assert!(counter.has_undefined_layout());
        let addr = counter.reserve_storage(1, Alignment::NONE);
        assert_eq!(addr.spaces, vec![(space, 1)]);
    }

    #[test]
    fn finish_layout_resolves_the_base_space() {
        let (mut ids, mut reloc) = fixture();
        let sect = ids.add("MAIN");
        let aux = ids.add("AUX");
        let mut counter = LocationCounter::new(
            aux,
            SectionId(0),
            LoctrId(1),
            LoctrKind::NonStarting,
            sect,
            &mut ids,
            &mut reloc,
        );
        let base = counter.spaces()[0];
        let installed = reloc.install(counter.reserve_storage(0, Alignment::NONE));
        counter.finish_layout(24, &mut reloc);
        assert!(reloc.space(base).resolved);
        assert!(counter.spaces().is_empty());
        assert_eq!(reloc.get(installed).offset, 24);
        assert_eq!(counter.storage(), 24);
    }
}
