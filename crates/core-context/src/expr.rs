//! Assembler operand expressions.
//!
//! Hand-rolled recursive-descent parser and evaluator for the expression
//! subset ordinary statements need: self-defining terms (decimal, `X'..'`,
//! `B'..'`, `C'..'`), symbols, the location-counter reference `*`,
//! attribute references (`L'SYM`, `T'SYM`, …), unary and binary `+ -`,
//! `* /`, and parentheses.
//!
//! Evaluation distinguishes absolute from relocatable results and follows
//! the assembler rules: relocatable terms in the same section subtract to
//! an absolute distance, and division by zero yields zero.

use crate::address::Address;
use crate::symbol::{Symbol, SymbolValue};
use core_ident::{IdIndex, IdStorage};
use thiserror::Error;

/// Attribute reference kinds usable inside ordinary expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    /// `L'` length
    Length,
    /// `T'` type
    Type,
    /// `S'` scale
    Scale,
    /// `I'` integer
    Integer,
}

impl AttrKind {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'L' => Some(AttrKind::Length),
            'T' => Some(AttrKind::Type),
            'S' => Some(AttrKind::Scale),
            'I' => Some(AttrKind::Integer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmExpr {
    Num(i32),
    Sym(IdIndex),
    /// The location counter reference `*`; its value is captured by the
    /// statement that owns the expression.
    LocCtr,
    Attr(AttrKind, IdIndex),
    Neg(Box<AsmExpr>),
    Bin(BinOp, Box<AsmExpr>, Box<AsmExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("expected an expression")]
    Empty,
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),
    #[error("unbalanced parenthesis")]
    UnbalancedParen,
    #[error("self-defining term out of range")]
    NumberOverflow,
    #[error("invalid self-defining term")]
    BadSelfDefining,
    #[error("symbol is not defined")]
    Undefined,
    #[error("arithmetic on incompatible relocatable values")]
    BadReloc,
    #[error("location counter unavailable here")]
    NoLocation,
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalValue {
    Abs(i32),
    Reloc(Address),
}

impl EvalValue {
    pub fn as_abs(&self) -> Option<i32> {
        match self {
            EvalValue::Abs(v) => Some(*v),
            EvalValue::Reloc(a) if a.is_absolute() => Some(a.offset),
            _ => None,
        }
    }

    fn normalized(self) -> EvalValue {
        match self {
            EvalValue::Reloc(a) if a.is_absolute() => EvalValue::Abs(a.offset),
            other => other,
        }
    }
}

/// Read access the evaluator needs: symbols and installed addresses.
pub trait EvalContext {
    fn symbol(&self, id: IdIndex) -> Option<&Symbol>;
    fn address(&self, id: crate::address::AddrId) -> &Address;
    /// Attribute value of a symbol; `None` while the symbol is unknown.
    fn attribute(&self, id: IdIndex, attr: AttrKind) -> Option<i32>;

    /// A symbol value as an evaluation result; `None` while undefined.
    fn value_of(&self, value: SymbolValue) -> Option<EvalValue> {
        match value {
            SymbolValue::Undefined => None,
            SymbolValue::Abs(v) => Some(EvalValue::Abs(v)),
            SymbolValue::Reloc(id) => Some(EvalValue::Reloc(self.address(id).clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    rest: &'a str,
    consumed: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.rest.chars().next()?;
        self.rest = &self.rest[c.len_utf8()..];
        self.consumed += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '@' | '#' | '$' | '_' | '&')
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

/// Parse an expression from the start of `text`.
///
/// Returns the tree and the number of bytes consumed; trailing text is the
/// caller's business (operand parsing continues after it).
pub fn parse_expr(text: &str, ids: &mut IdStorage) -> Result<(AsmExpr, usize), EvalError> {
    let mut cur = Cursor {
        rest: text,
        consumed: 0,
    };
    let expr = parse_additive(&mut cur, ids)?;
    Ok((expr, cur.consumed))
}

fn parse_additive(cur: &mut Cursor<'_>, ids: &mut IdStorage) -> Result<AsmExpr, EvalError> {
    let mut lhs = parse_multiplicative(cur, ids)?;
    loop {
        let op = match cur.peek() {
            Some('+') => BinOp::Add,
            Some('-') => BinOp::Sub,
            _ => break,
        };
        cur.bump();
        let rhs = parse_multiplicative(cur, ids)?;
        lhs = AsmExpr::Bin(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_multiplicative(cur: &mut Cursor<'_>, ids: &mut IdStorage) -> Result<AsmExpr, EvalError> {
    let mut lhs = parse_unary(cur, ids)?;
    loop {
        // `*` is multiplication only between terms; a fresh `*` is the
        // location counter and handled in parse_primary.
        let op = match cur.peek() {
            Some('*') => BinOp::Mul,
            Some('/') => BinOp::Div,
            _ => break,
        };
        cur.bump();
        let rhs = parse_unary(cur, ids)?;
        lhs = AsmExpr::Bin(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_unary(cur: &mut Cursor<'_>, ids: &mut IdStorage) -> Result<AsmExpr, EvalError> {
    if cur.eat('-') {
        return Ok(AsmExpr::Neg(Box::new(parse_unary(cur, ids)?)));
    }
    if cur.eat('+') {
        return parse_unary(cur, ids);
    }
    parse_primary(cur, ids)
}

fn parse_primary(cur: &mut Cursor<'_>, ids: &mut IdStorage) -> Result<AsmExpr, EvalError> {
    match cur.peek() {
        None => Err(EvalError::Empty),
        Some('*') => {
            cur.bump();
            Ok(AsmExpr::LocCtr)
        }
        Some('(') => {
            cur.bump();
            let inner = parse_additive(cur, ids)?;
            if !cur.eat(')') {
                return Err(EvalError::UnbalancedParen);
            }
            Ok(inner)
        }
        Some(c) if c.is_ascii_digit() => parse_number(cur),
        Some(c) if is_ident_start(c) => parse_ident_or_attr(cur, ids),
        Some(c) => Err(EvalError::UnexpectedChar(c)),
    }
}

fn parse_number(cur: &mut Cursor<'_>) -> Result<AsmExpr, EvalError> {
    let mut value: i64 = 0;
    while let Some(c) = cur.peek() {
        let Some(d) = c.to_digit(10) else { break };
        cur.bump();
        value = value * 10 + d as i64;
        if value > i32::MAX as i64 {
            return Err(EvalError::NumberOverflow);
        }
    }
    Ok(AsmExpr::Num(value as i32))
}

fn parse_ident_or_attr(cur: &mut Cursor<'_>, ids: &mut IdStorage) -> Result<AsmExpr, EvalError> {
    let start = cur.rest;
    let first = cur.bump().expect("caller checked ident start");

    // Attribute reference: single letter, apostrophe, then either a quoted
    // self-defining term (C'..') or a symbol (L'SYM).
    if cur.peek() == Some('\'') {
        if let Some(attr) = AttrKind::from_char(first) {
            cur.bump();
            let sym_start = cur.rest;
            if cur.peek().is_some_and(is_ident_start) {
                let mut len = 0;
                while cur.peek().is_some_and(is_ident_part) {
                    len += cur.bump().unwrap().len_utf8();
                }
                return Ok(AsmExpr::Attr(attr, ids.add(&sym_start[..len])));
            }
        }
        match first.to_ascii_uppercase() {
            'X' | 'B' | 'C' => {
                cur.bump();
                return parse_quoted_term(cur, first.to_ascii_uppercase());
            }
            _ => return Err(EvalError::BadSelfDefining),
        }
    }

    let mut len = first.len_utf8();
    while cur.peek().is_some_and(is_ident_part) {
        len += cur.bump().unwrap().len_utf8();
    }
    Ok(AsmExpr::Sym(ids.add(&start[..len])))
}

fn parse_quoted_term(cur: &mut Cursor<'_>, kind: char) -> Result<AsmExpr, EvalError> {
    let mut body = String::new();
    loop {
        match cur.bump() {
            None => return Err(EvalError::BadSelfDefining),
            Some('\'') => {
                // doubled apostrophe inside C'..' is a literal apostrophe
                if kind == 'C' && cur.peek() == Some('\'') {
                    cur.bump();
                    body.push('\'');
                    continue;
                }
                break;
            }
            Some(c) => body.push(c),
        }
    }
    let value: i64 = match kind {
        'X' => i64::from_str_radix(&body, 16).map_err(|_| EvalError::BadSelfDefining)?,
        'B' => i64::from_str_radix(&body, 2).map_err(|_| EvalError::BadSelfDefining)?,
        'C' => {
            let mut v: i64 = 0;
            for c in body.chars() {
                if !c.is_ascii() {
                    return Err(EvalError::BadSelfDefining);
                }
                v = (v << 8) | c as i64;
                if v > u32::MAX as i64 {
                    return Err(EvalError::BadSelfDefining);
                }
            }
            v
        }
        _ => unreachable!(),
    };
    if value > u32::MAX as i64 {
        return Err(EvalError::NumberOverflow);
    }
    Ok(AsmExpr::Num(value as u32 as i32))
}

// ---------------------------------------------------------------------------
// Dependencies and evaluation
// ---------------------------------------------------------------------------

impl AsmExpr {
    /// Symbols the expression reads that are not yet defined.
    ///
    /// Attribute references count as dependencies too: the referenced
    /// symbol must exist before the attribute has a value (the provider
    /// may choose to satisfy them by lookahead instead).
    pub fn undefined_symbols(&self, ctx: &dyn EvalContext, out: &mut Vec<IdIndex>) {
        match self {
            AsmExpr::Num(_) | AsmExpr::LocCtr => {}
            AsmExpr::Sym(id) => {
                if !ctx.symbol(*id).is_some_and(Symbol::is_defined) && !out.contains(id) {
                    out.push(*id);
                }
            }
            AsmExpr::Attr(attr, id) => {
                if ctx.attribute(*id, *attr).is_none() && !out.contains(id) {
                    out.push(*id);
                }
            }
            AsmExpr::Neg(inner) => inner.undefined_symbols(ctx, out),
            AsmExpr::Bin(_, l, r) => {
                l.undefined_symbols(ctx, out);
                r.undefined_symbols(ctx, out);
            }
        }
    }

    /// Attribute references contained in the expression, for the lookahead
    /// trigger.
    pub fn attr_refs(&self, out: &mut Vec<(AttrKind, IdIndex)>) {
        match self {
            AsmExpr::Attr(attr, id) => out.push((*attr, *id)),
            AsmExpr::Neg(inner) => inner.attr_refs(out),
            AsmExpr::Bin(_, l, r) => {
                l.attr_refs(out);
                r.attr_refs(out);
            }
            _ => {}
        }
    }

    /// Evaluate with all symbol dependencies satisfied. `loctr` is the
    /// captured location-counter value of the owning statement.
    pub fn eval(
        &self,
        ctx: &dyn EvalContext,
        loctr: Option<&Address>,
    ) -> Result<EvalValue, EvalError> {
        let v = match self {
            AsmExpr::Num(n) => EvalValue::Abs(*n),
            AsmExpr::LocCtr => {
                let addr = loctr.ok_or(EvalError::NoLocation)?;
                EvalValue::Reloc(addr.clone())
            }
            AsmExpr::Sym(id) => {
                let sym = ctx.symbol(*id).ok_or(EvalError::Undefined)?;
                ctx.value_of(sym.value()).ok_or(EvalError::Undefined)?
            }
            AsmExpr::Attr(attr, id) => {
                EvalValue::Abs(ctx.attribute(*id, *attr).ok_or(EvalError::Undefined)?)
            }
            AsmExpr::Neg(inner) => match inner.eval(ctx, loctr)? {
                EvalValue::Abs(v) => EvalValue::Abs(v.wrapping_neg()),
                EvalValue::Reloc(a) => EvalValue::Reloc(a.neg()),
            },
            AsmExpr::Bin(op, l, r) => {
                let lhs = l.eval(ctx, loctr)?;
                let rhs = r.eval(ctx, loctr)?;
                apply(*op, lhs, rhs)?
            }
        };
        Ok(v.normalized())
    }
}

fn apply(op: BinOp, lhs: EvalValue, rhs: EvalValue) -> Result<EvalValue, EvalError> {
    use EvalValue::{Abs, Reloc};
    Ok(match (op, lhs, rhs) {
        (BinOp::Add, Abs(a), Abs(b)) => Abs(a.wrapping_add(b)),
        (BinOp::Sub, Abs(a), Abs(b)) => Abs(a.wrapping_sub(b)),
        (BinOp::Mul, Abs(a), Abs(b)) => Abs(a.wrapping_mul(b)),
        // assembler rule: division by zero yields zero
        (BinOp::Div, Abs(_), Abs(0)) => Abs(0),
        (BinOp::Div, Abs(a), Abs(b)) => Abs(a.wrapping_div(b)),

        (BinOp::Add, Reloc(a), Abs(b)) => Reloc(a.add_offset(b)),
        (BinOp::Add, Abs(a), Reloc(b)) => Reloc(b.add_offset(a)),
        (BinOp::Sub, Reloc(a), Abs(b)) => Reloc(a.add_offset(-b)),
        (BinOp::Add, Reloc(a), Reloc(b)) => Reloc(a.add(&b)),
        (BinOp::Sub, Reloc(a), Reloc(b)) => Reloc(a.sub(&b)),
        (BinOp::Sub, Abs(a), Reloc(b)) => Reloc(b.neg().add_offset(a)),

        (BinOp::Mul | BinOp::Div, _, _) => return Err(EvalError::BadReloc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::section::SectionId;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestCtx {
        symbols: HashMap<IdIndex, Symbol>,
        addrs: HashMap<crate::address::AddrId, Address>,
    }

    impl EvalContext for TestCtx {
        fn symbol(&self, id: IdIndex) -> Option<&Symbol> {
            self.symbols.get(&id)
        }

        fn address(&self, id: crate::address::AddrId) -> &Address {
            &self.addrs[&id]
        }

        fn attribute(&self, id: IdIndex, _attr: AttrKind) -> Option<i32> {
            self.symbols
                .get(&id)
                .filter(|s| s.is_defined())
                .map(|s| s.attrs.length as i32)
        }
    }

    fn parse(text: &str) -> (AsmExpr, usize) {
        let mut ids = IdStorage::new();
        parse_expr(text, &mut ids).unwrap()
    }

    #[test]
    fn parses_precedence() {
        let (e, n) = parse("1+2*3");
        assert_eq!(n, 5);
        assert_eq!(e.eval(&TestCtx::default(), None).unwrap(), EvalValue::Abs(7));
    }

    #[test]
    fn parses_parens_and_unary_minus() {
        let (e, _) = parse("-(1+2)*3");
        assert_eq!(
            e.eval(&TestCtx::default(), None).unwrap(),
            EvalValue::Abs(-9)
        );
    }

    #[test]
    fn division_by_zero_yields_zero() {
        let (e, _) = parse("5/0");
        assert_eq!(e.eval(&TestCtx::default(), None).unwrap(), EvalValue::Abs(0));
    }

    #[test]
    fn self_defining_terms() {
        assert_eq!(
            parse("X'1F'").0.eval(&TestCtx::default(), None).unwrap(),
            EvalValue::Abs(31)
        );
        assert_eq!(
            parse("B'101'").0.eval(&TestCtx::default(), None).unwrap(),
            EvalValue::Abs(5)
        );
        assert_eq!(
            parse("C'A'").0.eval(&TestCtx::default(), None).unwrap(),
            EvalValue::Abs(65)
        );
    }

    #[test]
    fn symbol_lookup_and_undefined_tracking() {
        let mut ids = IdStorage::new();
        let (e, _) = parse_expr("A+1", &mut ids).unwrap();
        let a = ids.add("A");

        let mut ctx = TestCtx::default();
        let mut undef = Vec::new();
        e.undefined_symbols(&ctx, &mut undef);
        assert_eq!(undef, vec![a]);

        ctx.symbols
            .insert(a, Symbol::new(a, SymbolValue::Abs(41), Default::default()));
        undef.clear();
        e.undefined_symbols(&ctx, &mut undef);
        assert!(undef.is_empty());
        assert_eq!(e.eval(&ctx, None).unwrap(), EvalValue::Abs(42));
    }

    #[test]
    fn loctr_reference_uses_captured_address() {
        let (e, _) = parse("*+4");
        let here = Address::new(SectionId(0), 8, &[]);
        match e.eval(&TestCtx::default(), Some(&here)).unwrap() {
            EvalValue::Reloc(a) => assert_eq!(a.offset, 12),
            other => panic!("expected reloc, got {other:?}"),
        }
    }

    #[test]
    fn reloc_minus_reloc_same_section_is_absolute() {
        let mut ids = IdStorage::new();
        let (e, _) = parse_expr("Y-*", &mut ids).unwrap();
        let y = ids.add("Y");

        let y_addr = crate::address::AddrId(0);
        let mut ctx = TestCtx::default();
        ctx.addrs.insert(y_addr, Address::new(SectionId(0), 20, &[]));
        ctx.symbols
            .insert(y, Symbol::new(y, SymbolValue::Reloc(y_addr), Default::default()));

        let here = Address::new(SectionId(0), 12, &[]);
        let v = e.eval(&ctx, Some(&here)).unwrap();
        assert_eq!(v, EvalValue::Abs(8));
    }

    #[test]
    fn attr_ref_parses_and_collects() {
        let mut ids = IdStorage::new();
        let (e, _) = parse_expr("L'X+1", &mut ids).unwrap();
        let x = ids.add("X");
        let mut refs = Vec::new();
        e.attr_refs(&mut refs);
        assert_eq!(refs, vec![(AttrKind::Length, x)]);
    }

    #[test]
    fn multiplication_of_relocatables_is_rejected() {
        let (e, _) = parse("*+*");
        // addition of two reloc values is fine...
        let here = Address::new(SectionId(0), 4, &[]);
        assert!(e.eval(&TestCtx::default(), Some(&here)).is_ok());
        // ...multiplication is not
        let (e, _) = parse("2**");
        assert_eq!(
            e.eval(&TestCtx::default(), Some(&here)),
            Err(EvalError::BadReloc)
        );
    }

    #[test]
    fn consumed_length_stops_at_operand_boundary() {
        let mut ids = IdStorage::new();
        let (_, n) = parse_expr("A+1,B", &mut ids).unwrap();
        assert_eq!(n, 3);
    }
}
