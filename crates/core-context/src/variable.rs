//! Variable symbols: typed SET symbols and macro parameters.

use crate::macro_param::MacroDataId;
use core_ident::IdIndex;
use std::collections::HashMap;
use std::fmt;

/// SET symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetType {
    /// SETA — 32-bit arithmetic
    A,
    /// SETB — boolean
    B,
    /// SETC — character
    C,
}

/// A SET value. Conversions between types are the conditional-assembly
/// evaluator's business; storage is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetValue {
    A(i32),
    B(bool),
    C(String),
}

impl SetValue {
    pub fn set_type(&self) -> SetType {
        match self {
            SetValue::A(_) => SetType::A,
            SetValue::B(_) => SetType::B,
            SetValue::C(_) => SetType::C,
        }
    }

    pub fn default_of(set_type: SetType) -> SetValue {
        match set_type {
            SetType::A => SetValue::A(0),
            SetType::B => SetValue::B(false),
            SetType::C => SetValue::C(String::new()),
        }
    }
}

impl fmt::Display for SetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetValue::A(v) => write!(f, "{v}"),
            SetValue::B(v) => write!(f, "{}", *v as u8),
            SetValue::C(v) => f.write_str(v),
        }
    }
}

/// A SET symbol: scalar, or a sparse 1-indexed array of scalars.
#[derive(Debug, Clone)]
pub struct SetSymbol {
    pub name: IdIndex,
    pub set_type: SetType,
    pub is_scalar: bool,
    pub global: bool,
    data: HashMap<usize, SetValue>,
}

impl SetSymbol {
    pub fn new(name: IdIndex, set_type: SetType, is_scalar: bool, global: bool) -> Self {
        Self {
            name,
            set_type,
            is_scalar,
            global,
            data: HashMap::new(),
        }
    }

    /// Read a value; missing entries yield the type default. Scalars store
    /// under index 0 regardless of the subscript used.
    pub fn get(&self, idx: Option<usize>) -> SetValue {
        let key = if self.is_scalar { 0 } else { idx.unwrap_or(0) };
        self.data
            .get(&key)
            .cloned()
            .unwrap_or_else(|| SetValue::default_of(self.set_type))
    }

    /// Assign; any index of an array can be set directly.
    pub fn set(&mut self, idx: Option<usize>, value: SetValue) {
        debug_assert_eq!(value.set_type(), self.set_type, "SET type mismatch");
        let key = if self.is_scalar { 0 } else { idx.unwrap_or(0) };
        self.data.insert(key, value);
    }

    /// `N'` of the symbol: highest subscript assigned so far.
    pub fn number(&self) -> usize {
        if self.is_scalar {
            0
        } else {
            self.data.keys().copied().max().unwrap_or(0)
        }
    }
}

/// Kind of a macro parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroParamKind {
    /// Operand identified by position (1-based).
    Positional(usize),
    /// `&NAME=default` operand identified by name.
    Keyword,
}

/// A macro parameter bound for one invocation. `data` points into the
/// invocation's data arena (the keyword default when the call omitted it).
#[derive(Debug, Clone)]
pub struct MacroParam {
    pub name: IdIndex,
    pub kind: MacroParamKind,
    pub data: MacroDataId,
}

/// Any variable symbol visible in a scope.
#[derive(Debug, Clone)]
pub enum VariableSymbol {
    Set(SetSymbol),
    Param(MacroParam),
}

impl VariableSymbol {
    pub fn name(&self) -> IdIndex {
        match self {
            VariableSymbol::Set(s) => s.name,
            VariableSymbol::Param(p) => p.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_returns_default_for_any_subscript() {
        let mut sym = SetSymbol::new(IdIndex::EMPTY, SetType::A, true, false);
        sym.set(None, SetValue::A(7));
        assert_eq!(sym.get(None), SetValue::A(7));
        // subscripted read of a scalar yields the stored scalar slot
        assert_eq!(sym.get(Some(3)), SetValue::A(7));
    }

    #[test]
    fn array_is_sparse_and_one_indexed() {
        let mut sym = SetSymbol::new(IdIndex::EMPTY, SetType::C, false, false);
        sym.set(Some(5), SetValue::C("FIVE".into()));
        assert_eq!(sym.get(Some(5)), SetValue::C("FIVE".into()));
        assert_eq!(sym.get(Some(1)), SetValue::C(String::new()));
        assert_eq!(sym.number(), 5);
    }

    #[test]
    fn defaults_match_types() {
        assert_eq!(SetValue::default_of(SetType::A), SetValue::A(0));
        assert_eq!(SetValue::default_of(SetType::B), SetValue::B(false));
        assert_eq!(SetValue::default_of(SetType::C), SetValue::C(String::new()));
    }

    #[test]
    fn display_renders_macro_substitution_forms() {
        assert_eq!(SetValue::A(-3).to_string(), "-3");
        assert_eq!(SetValue::B(true).to_string(), "1");
        assert_eq!(SetValue::C("AB".into()).to_string(), "AB");
    }
}
