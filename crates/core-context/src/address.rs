//! Relocatable addresses and the space registry.
//!
//! An [`Address`] is the 3-part sum `Σ cᵢ·baseᵢ + offset + Σ dⱼ·spaceⱼ`:
//! section bases with integer coefficients, a constant byte offset, and
//! unresolved spaces with integer coefficients. Arithmetic is componentwise
//! over the union of keys; terms whose coefficient reaches zero are culled.
//!
//! Addresses that outlive the statement that built them (symbol values,
//! captured resolver inputs) are installed into [`RelocStorage`]'s arena.
//! Every space lists the arena addresses that mention it, which makes
//! resolution O(listeners): the inverse index replaces the raw back-pointer
//! pattern of pointer-based implementations.

use crate::section::{LoctrId, SectionId};
use core_ident::IdIndex;
use std::collections::BTreeSet;

/// Handle of a space in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub(crate) u32);

/// Handle of an address installed in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrId(pub(crate) u32);

/// An unresolved length contributor owned by a location counter.
#[derive(Debug)]
pub struct Space {
    pub name: IdIndex,
    pub owner: LoctrId,
    pub resolved: bool,
    pub(crate) listeners: BTreeSet<AddrId>,
}

/// A relocatable value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub bases: Vec<(SectionId, i32)>,
    pub offset: i32,
    pub spaces: Vec<(SpaceId, i32)>,
}

fn merge<K: Copy + Eq>(lhs: &[(K, i32)], rhs: &[(K, i32)], sign: i32) -> Vec<(K, i32)> {
    let mut out: Vec<(K, i32)> = Vec::with_capacity(lhs.len() + rhs.len());
    for &(k, c) in lhs {
        out.push((k, c));
    }
    for &(k, c) in rhs {
        match out.iter_mut().find(|(ok, _)| *ok == k) {
            Some(entry) => entry.1 += sign * c,
            None => out.push((k, sign * c)),
        }
    }
    out.retain(|&(_, c)| c != 0);
    out
}

impl Address {
    /// Plain section-relative address with the given pending spaces, each
    /// contributing with coefficient one.
    pub fn new(base: SectionId, offset: i32, spaces: &[SpaceId]) -> Self {
        Self {
            bases: vec![(base, 1)],
            offset,
            spaces: spaces.iter().map(|&s| (s, 1)).collect(),
        }
    }

    pub fn absolute(offset: i32) -> Self {
        Self {
            bases: Vec::new(),
            offset,
            spaces: Vec::new(),
        }
    }

    /// An address with no bases and no spaces is a plain number.
    pub fn is_absolute(&self) -> bool {
        self.bases.is_empty() && self.spaces.is_empty()
    }

    /// Relocatable in exactly one section with coefficient one and nothing
    /// pending.
    pub fn is_simple_reloc(&self) -> bool {
        self.spaces.is_empty() && self.bases.len() == 1 && self.bases[0].1 == 1
    }

    pub fn has_spaces(&self) -> bool {
        !self.spaces.is_empty()
    }

    pub fn add(&self, other: &Address) -> Address {
        Address {
            bases: merge(&self.bases, &other.bases, 1),
            offset: self.offset + other.offset,
            spaces: merge(&self.spaces, &other.spaces, 1),
        }
    }

    pub fn sub(&self, other: &Address) -> Address {
        Address {
            bases: merge(&self.bases, &other.bases, -1),
            offset: self.offset - other.offset,
            spaces: merge(&self.spaces, &other.spaces, -1),
        }
    }

    pub fn neg(&self) -> Address {
        Address {
            bases: merge(&[], &self.bases, -1),
            offset: -self.offset,
            spaces: merge(&[], &self.spaces, -1),
        }
    }

    pub fn add_offset(&self, offs: i32) -> Address {
        Address {
            bases: self.bases.clone(),
            offset: self.offset + offs,
            spaces: self.spaces.clone(),
        }
    }
}

/// Registry of spaces plus the arena of long-lived addresses.
#[derive(Debug, Default)]
pub struct RelocStorage {
    spaces: Vec<Space>,
    arena: Vec<Option<Address>>,
}

impl RelocStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn new_space(&mut self, name: IdIndex, owner: LoctrId) -> SpaceId {
        let id = SpaceId(self.spaces.len() as u32);
        self.spaces.push(Space {
            name,
            owner,
            resolved: false,
            listeners: BTreeSet::new(),
        });
        id
    }

    pub fn space(&self, id: SpaceId) -> &Space {
        &self.spaces[id.0 as usize]
    }

    pub fn space_by_name(&self, name: IdIndex) -> Option<SpaceId> {
        self.spaces
            .iter()
            .position(|s| s.name == name)
            .map(|i| SpaceId(i as u32))
    }

    /// Install an address into the arena, wiring up every listener set it
    /// belongs in.
    pub fn install(&mut self, addr: Address) -> AddrId {
        let id = AddrId(self.arena.len() as u32);
        for &(space, coeff) in &addr.spaces {
            debug_assert!(coeff != 0);
            self.spaces[space.0 as usize].listeners.insert(id);
        }
        self.arena.push(Some(addr));
        id
    }

    /// Replace an installed address, re-pointing listener sets atomically.
    pub fn replace(&mut self, id: AddrId, addr: Address) {
        let old = self.arena[id.0 as usize]
            .take()
            .expect("address slot in use");
        for &(space, _) in &old.spaces {
            self.spaces[space.0 as usize].listeners.remove(&id);
        }
        for &(space, coeff) in &addr.spaces {
            debug_assert!(coeff != 0);
            self.spaces[space.0 as usize].listeners.insert(id);
        }
        self.arena[id.0 as usize] = Some(addr);
    }

    /// Remove an address from the arena, erasing it from listener sets.
    pub fn remove(&mut self, id: AddrId) -> Address {
        let addr = self.arena[id.0 as usize]
            .take()
            .expect("address slot in use");
        for &(space, _) in &addr.spaces {
            self.spaces[space.0 as usize].listeners.remove(&id);
        }
        addr
    }

    pub fn get(&self, id: AddrId) -> &Address {
        self.arena[id.0 as usize]
            .as_ref()
            .expect("address slot in use")
    }

    /// Resolve `space` to `length`: every listener's offset grows by
    /// `length × coefficient` and the space term disappears. The caller
    /// updates the owning location counter's storage.
    ///
    /// Resolving an already-resolved space is a programming error.
    pub fn resolve_space(&mut self, space: SpaceId, length: usize) -> LoctrId {
        let idx = space.0 as usize;
        assert!(!self.spaces[idx].resolved, "space already resolved");
        let listeners = std::mem::take(&mut self.spaces[idx].listeners);
        for addr_id in listeners {
            let addr = self.arena[addr_id.0 as usize]
                .as_mut()
                .expect("listener points at a live address");
            let pos = addr
                .spaces
                .iter()
                .position(|&(s, _)| s == space)
                .expect("listener mentions the space");
            let (_, coeff) = addr.spaces.remove(pos);
            addr.offset += length as i32 * coeff;
        }
        self.spaces[idx].resolved = true;
        self.spaces[idx].owner
    }

    /// Invariant check used by tests: `addr listens to S` iff `S.listeners`
    /// contains the address.
    pub fn listener_sets_consistent(&self) -> bool {
        for (i, space) in self.spaces.iter().enumerate() {
            let sid = SpaceId(i as u32);
            for &addr_id in &space.listeners {
                let Some(addr) = self.arena[addr_id.0 as usize].as_ref() else {
                    return false;
                };
                if !addr.spaces.iter().any(|&(s, c)| s == sid && c != 0) {
                    return false;
                }
            }
        }
        for (ai, slot) in self.arena.iter().enumerate() {
            let Some(addr) = slot else { continue };
            for &(s, c) in &addr.spaces {
                if c == 0 || !self.spaces[s.0 as usize].listeners.contains(&AddrId(ai as u32)) {
                    return false;
                }
            }
        }
        true
    }
}
