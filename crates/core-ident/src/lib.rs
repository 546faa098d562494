//! Identifier pool: case-folded interning into stable handles.
//!
//! Every assembler name (ordinary symbols, sections, macro names, generated
//! space names) is interned once, folded to upper case, and referred to by
//! its `IdIndex` afterwards. All comparisons downstream are handle
//! comparisons. The pool is append-only; handles stay valid for the life of
//! the analysis context that owns the pool.

use std::collections::HashMap;

/// Stable handle to an interned identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdIndex(u32);

impl IdIndex {
    /// Distinguished handle of the empty name.
    pub const EMPTY: IdIndex = IdIndex(0);

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl std::fmt::Debug for IdIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdIndex({})", self.0)
    }
}

/// Append-only identifier storage.
#[derive(Debug, Clone)]
pub struct IdStorage {
    map: HashMap<String, u32>,
    names: Vec<String>,
}

impl Default for IdStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl IdStorage {
    pub fn new() -> Self {
        // Slot 0 is reserved for the empty-name sentinel.
        Self {
            map: HashMap::new(),
            names: vec![String::new()],
        }
    }

    /// Intern `name`, folding to upper case. Empty input returns the
    /// sentinel without touching the pool.
    pub fn add(&mut self, name: &str) -> IdIndex {
        if name.is_empty() {
            return IdIndex::EMPTY;
        }
        let folded = fold(name);
        if let Some(&idx) = self.map.get(&folded) {
            return IdIndex(idx);
        }
        let idx = self.names.len() as u32;
        self.names.push(folded.clone());
        self.map.insert(folded, idx);
        IdIndex(idx)
    }

    /// Look up `name` without inserting.
    pub fn find(&self, name: &str) -> Option<IdIndex> {
        if name.is_empty() {
            return Some(IdIndex::EMPTY);
        }
        self.map.get(&fold(name)).map(|&idx| IdIndex(idx))
    }

    /// The folded spelling behind a handle.
    pub fn resolve(&self, id: IdIndex) -> &str {
        &self.names[id.0 as usize]
    }

    /// Number of interned names, sentinel excluded.
    pub fn len(&self) -> usize {
        self.names.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fold(name: &str) -> String {
    name.to_uppercase()
}

/// Generator of synthetic identifiers for anonymous dependency targets.
///
/// Generated names start with a space, which a case-folded user identifier
/// can never produce, so `is_generated` is a cheap prefix test. Released
/// ids are recycled to keep the pool from growing with every postponed
/// statement.
#[derive(Debug)]
pub struct IdGenerator {
    next: u64,
    released: Vec<IdIndex>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: 0,
            released: Vec::new(),
        }
    }

    pub fn next_id(&mut self, ids: &mut IdStorage) -> IdIndex {
        if let Some(id) = self.released.pop() {
            return id;
        }
        let name = format!(" {}", self.next);
        self.next += 1;
        ids.add(&name)
    }

    pub fn release(&mut self, id: IdIndex) {
        self.released.push(id);
    }

    pub fn is_generated(ids: &IdStorage, id: IdIndex) -> bool {
        ids.resolve(id).starts_with(' ')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_folds_case_and_dedups() {
        let mut ids = IdStorage::new();
        let a = ids.add("label");
        let b = ids.add("LaBeL");
        let c = ids.add("LABEL");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(ids.resolve(a), "LABEL");
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn empty_name_is_the_sentinel() {
        let mut ids = IdStorage::new();
        assert_eq!(ids.add(""), IdIndex::EMPTY);
        assert_eq!(ids.find(""), Some(IdIndex::EMPTY));
        assert!(ids.add("").is_empty());
        assert_eq!(ids.resolve(IdIndex::EMPTY), "");
    }

    #[test]
    fn find_does_not_insert() {
        let mut ids = IdStorage::new();
        assert_eq!(ids.find("X"), None);
        let x = ids.add("x");
        assert_eq!(ids.find("X"), Some(x));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn handles_stay_stable_across_growth() {
        let mut ids = IdStorage::new();
        let first = ids.add("A");
        for i in 0..1000 {
            ids.add(&format!("SYM{i}"));
        }
        assert_eq!(ids.resolve(first), "A");
        assert_eq!(ids.find("a"), Some(first));
    }

    #[test]
    fn generated_ids_are_recognizable_and_recycled() {
        let mut ids = IdStorage::new();
        let mut generator = IdGenerator::new();
        let g0 = generator.next_id(&mut ids);
        let g1 = generator.next_id(&mut ids);
        assert_ne!(g0, g1);
        assert!(IdGenerator::is_generated(&ids, g0));
        let g0_named = ids.add("G0");
        assert!(!IdGenerator::is_generated(&ids, g0_named));

        generator.release(g0);
        assert_eq!(generator.next_id(&mut ids), g0);
    }
}
