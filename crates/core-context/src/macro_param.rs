//! Macro-parameter data: an arena of immutable nodes.
//!
//! Parameter values form a tree — leaves carry a string, composites an
//! ordered child list. Out-of-range subscripts land on the dummy node,
//! which yields the default value at any depth, so callers never deal with
//! missing children.

use std::fmt::Write;

/// Handle of a node in a [`MacroDataArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacroDataId(u32);

impl MacroDataId {
    /// The dummy node: every arena has it at slot zero.
    pub const DUMMY: MacroDataId = MacroDataId(0);
}

#[derive(Debug, Clone)]
enum Node {
    Dummy,
    Single(String),
    Composite { children: Vec<MacroDataId>, rendered: String },
}

/// Arena of immutable macro-parameter data nodes.
#[derive(Debug, Clone)]
pub struct MacroDataArena {
    nodes: Vec<Node>,
}

impl Default for MacroDataArena {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroDataArena {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::Dummy],
        }
    }

    pub fn single(&mut self, value: impl Into<String>) -> MacroDataId {
        let id = MacroDataId(self.nodes.len() as u32);
        self.nodes.push(Node::Single(value.into()));
        id
    }

    /// A composite node renders as `(a,b,…)` over its children.
    pub fn composite(&mut self, children: Vec<MacroDataId>) -> MacroDataId {
        let mut rendered = String::from("(");
        for (i, &child) in children.iter().enumerate() {
            if i > 0 {
                rendered.push(',');
            }
            let _ = write!(rendered, "{}", self.value(child));
        }
        rendered.push(')');
        let id = MacroDataId(self.nodes.len() as u32);
        self.nodes.push(Node::Composite { children, rendered });
        id
    }

    /// The textual value of a node; dummy yields the empty default.
    pub fn value(&self, id: MacroDataId) -> &str {
        match &self.nodes[id.0 as usize] {
            Node::Dummy => "",
            Node::Single(s) => s,
            Node::Composite { rendered, .. } => rendered,
        }
    }

    /// Number of components of a node: 0 for dummy, 1 for a leaf, the
    /// child count for composites.
    pub fn size(&self, id: MacroDataId) -> usize {
        match &self.nodes[id.0 as usize] {
            Node::Dummy => 0,
            Node::Single(_) => 1,
            Node::Composite { children, .. } => children.len(),
        }
    }

    /// The `idx`-th component (1-based, the macro-language convention).
    ///
    /// A leaf's first component is the leaf itself; anything out of range
    /// is the dummy.
    pub fn nth(&self, id: MacroDataId, idx: usize) -> MacroDataId {
        match &self.nodes[id.0 as usize] {
            Node::Dummy => MacroDataId::DUMMY,
            Node::Single(_) => {
                if idx <= 1 {
                    id
                } else {
                    MacroDataId::DUMMY
                }
            }
            Node::Composite { children, .. } => match idx {
                0 => MacroDataId::DUMMY,
                _ => children.get(idx - 1).copied().unwrap_or(MacroDataId::DUMMY),
            },
        }
    }

    /// Descend through nested subscripts, dummy-absorbing.
    pub fn get_path(&self, id: MacroDataId, path: &[usize]) -> MacroDataId {
        path.iter().fold(id, |node, &idx| self.nth(node, idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_value_and_self_subscript() {
        let mut arena = MacroDataArena::new();
        let leaf = arena.single("ABC");
        assert_eq!(arena.value(leaf), "ABC");
        // subscript 1 of a leaf is the leaf itself
        assert_eq!(arena.nth(leaf, 1), leaf);
        assert_eq!(arena.value(arena.nth(leaf, 2)), "");
    }

    #[test]
    fn composite_renders_parenthesized() {
        let mut arena = MacroDataArena::new();
        let a = arena.single("A");
        let b = arena.single("B");
        let inner = arena.composite(vec![a, b]);
        let outer = arena.composite(vec![inner, a]);
        assert_eq!(arena.value(inner), "(A,B)");
        assert_eq!(arena.value(outer), "((A,B),A)");
        assert_eq!(arena.size(outer), 2);
    }

    #[test]
    fn out_of_range_subscripts_hit_the_dummy() {
        let mut arena = MacroDataArena::new();
        let a = arena.single("A");
        let comp = arena.composite(vec![a]);
        assert_eq!(arena.nth(comp, 5), MacroDataId::DUMMY);
        assert_eq!(arena.value(MacroDataId::DUMMY), "");
        // dummy absorbs any further descent
        assert_eq!(arena.get_path(comp, &[5, 3, 1]), MacroDataId::DUMMY);
    }

    #[test]
    fn nested_path_descent() {
        let mut arena = MacroDataArena::new();
        let x = arena.single("X");
        let y = arena.single("Y");
        let inner = arena.composite(vec![x, y]);
        let outer = arena.composite(vec![inner]);
        assert_eq!(arena.value(arena.get_path(outer, &[1, 2])), "Y");
        assert_eq!(arena.value(arena.get_path(outer, &[1])), "(X,Y)");
    }
}
