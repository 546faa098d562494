//! Conditional-assembly evaluation: variable scopes, substitution, and
//! the AIF/SETB condition language.

use core_context::{
    EvalContext, MacroDataArena, MacroDataId, SetSymbol, SetType, SetValue, parse_expr,
};
use core_ident::{IdIndex, IdStorage};
use std::collections::HashMap;
use thiserror::Error;

/// One invocation's worth of variable state. Opencode uses a single
/// bottom frame; each macro call pushes another.
#[derive(Debug)]
pub struct ScopeFrame {
    pub locals: HashMap<IdIndex, SetSymbol>,
    /// Parameter data: name → node in `arena`.
    pub params: HashMap<IdIndex, MacroDataId>,
    pub arena: MacroDataArena,
    /// Positional operands in order; SYSLIST(n) indexes this.
    pub syslist: Vec<MacroDataId>,
    /// The name-field value, SYSLIST(0).
    pub label_data: MacroDataId,
    pub sysndx: u32,
    pub sysect: String,
    /// Remaining AIF/AGO branches before the loop limit trips (ACTR).
    pub actr: i64,
}

impl ScopeFrame {
    pub fn opencode() -> Self {
        Self {
            locals: HashMap::new(),
            params: HashMap::new(),
            arena: MacroDataArena::new(),
            syslist: Vec::new(),
            label_data: MacroDataId::DUMMY,
            sysndx: 0,
            sysect: String::new(),
            actr: 4096,
        }
    }
}

/// Variable-symbol state for one analysis: a global pool plus the scope
/// stack.
#[derive(Debug)]
pub struct CaContext {
    pub globals: HashMap<IdIndex, SetSymbol>,
    frames: Vec<ScopeFrame>,
    sys_syslist: IdIndex,
    sys_sysndx: IdIndex,
    sys_sysect: IdIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaError {
    #[error("variable symbol is not defined")]
    UndefinedVariable(String),
    #[error("SET symbol declared with a different type")]
    TypeMismatch,
    #[error("subscript of an array SET symbol must be at least 1")]
    BadSubscript,
    #[error("invalid conditional-assembly expression: {0}")]
    BadExpression(String),
    #[error("ACTR limit exceeded")]
    ActrExceeded,
}

impl CaContext {
    pub fn new(ids: &mut IdStorage) -> Self {
        Self {
            globals: HashMap::new(),
            frames: vec![ScopeFrame::opencode()],
            sys_syslist: ids.add("SYSLIST"),
            sys_sysndx: ids.add("SYSNDX"),
            sys_sysect: ids.add("SYSECT"),
        }
    }

    pub fn push_frame(&mut self, frame: ScopeFrame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) {
        debug_assert!(self.frames.len() > 1, "opencode frame stays");
        self.frames.pop();
    }

    pub fn frame(&self) -> &ScopeFrame {
        self.frames.last().expect("at least the opencode frame")
    }

    pub fn frame_mut(&mut self) -> &mut ScopeFrame {
        self.frames.last_mut().expect("at least the opencode frame")
    }

    pub fn in_macro(&self) -> bool {
        self.frames.len() > 1
    }

    /// Declare a SET symbol (GBL*/LCL* or implicit via SET*). Idempotent
    /// per scope; a different type is an error.
    pub fn declare(
        &mut self,
        name: IdIndex,
        set_type: SetType,
        is_scalar: bool,
        global: bool,
    ) -> Result<(), CaError> {
        let table = if global {
            &mut self.globals
        } else {
            &mut self.frame_mut().locals
        };
        match table.get(&name) {
            Some(existing) if existing.set_type != set_type => Err(CaError::TypeMismatch),
            Some(_) => Ok(()),
            None => {
                table.insert(name, SetSymbol::new(name, set_type, is_scalar, global));
                Ok(())
            }
        }
    }

    /// Assign through SETx, declaring implicitly when needed.
    pub fn assign(
        &mut self,
        name: IdIndex,
        idx: Option<usize>,
        value: SetValue,
    ) -> Result<(), CaError> {
        let set_type = value.set_type();
        let global = self.globals.contains_key(&name) && !self.frame().locals.contains_key(&name);
        let table = if global {
            &mut self.globals
        } else {
            &mut self.frame_mut().locals
        };
        let sym = table
            .entry(name)
            .or_insert_with(|| SetSymbol::new(name, set_type, idx.is_none(), global));
        if sym.set_type != set_type {
            return Err(CaError::TypeMismatch);
        }
        if !sym.is_scalar {
            if let Some(0) = idx {
                return Err(CaError::BadSubscript);
            }
        }
        sym.set(idx, value);
        Ok(())
    }

    /// Read a variable as text for substitution. `subscripts` are the
    /// parenthesized indices, outermost first.
    pub fn read(&self, _ids: &IdStorage, name: IdIndex, subscripts: &[usize]) -> Option<String> {
        let frame = self.frame();

        if name == self.sys_sysndx && self.in_macro() {
            return Some(format!("{:04}", frame.sysndx));
        }
        if name == self.sys_sysect && self.in_macro() {
            return Some(frame.sysect.clone());
        }
        if name == self.sys_syslist && self.in_macro() {
            let node = match subscripts.split_first() {
                None => return Some(String::new()),
                Some((&0, rest)) => frame.arena.get_path(frame.label_data, rest),
                Some((&n, rest)) => {
                    let base = frame
                        .syslist
                        .get(n - 1)
                        .copied()
                        .unwrap_or(MacroDataId::DUMMY);
                    frame.arena.get_path(base, rest)
                }
            };
            return Some(frame.arena.value(node).to_owned());
        }

        if let Some(&data) = frame.params.get(&name) {
            let node = frame
                .arena
                .get_path(data, subscripts);
            return Some(frame.arena.value(node).to_owned());
        }
        if let Some(sym) = frame.locals.get(&name).or_else(|| self.globals.get(&name)) {
            let idx = subscripts.first().copied();
            return Some(sym.get(idx).to_string());
        }
        None
    }

    /// `N'` of a parameter or SET symbol.
    pub fn count_of(&self, name: IdIndex) -> usize {
        let frame = self.frame();
        if name == self.sys_syslist && self.in_macro() {
            return frame.syslist.len();
        }
        if let Some(&data) = frame.params.get(&name) {
            return frame.arena.size(data);
        }
        frame
            .locals
            .get(&name)
            .or_else(|| self.globals.get(&name))
            .map_or(0, SetSymbol::number)
    }
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// Replace `&VAR`, `&VAR(subscripts)`, `&&`, and `K'&V`/`N'&V` in `text`.
/// Unknown variables are left in place and reported.
pub fn substitute(
    text: &str,
    ids: &mut IdStorage,
    ca: &CaContext,
) -> (String, Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut unknown = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        // K'&V and N'&V need the raw variable, not its substitution
        if i + 2 < chars.len()
            && matches!(chars[i].to_ascii_uppercase(), 'K' | 'N')
            && chars[i + 1] == '\''
            && chars[i + 2] == '&'
            && (i == 0 || !chars[i - 1].is_ascii_alphanumeric())
        {
            let kind = chars[i].to_ascii_uppercase();
            let (name, consumed) = scan_var_name(&chars[i + 3..]);
            if !name.is_empty() {
                let id = ids.add(&name);
                let value = match kind {
                    'K' => ca
                        .read(ids, id, &[])
                        .map(|v| v.chars().count().to_string()),
                    _ => Some(ca.count_of(id).to_string()),
                };
                match value {
                    Some(v) => out.push_str(&v),
                    None => unknown.push(name.clone()),
                }
                i += 3 + consumed;
                continue;
            }
        }

        if chars[i] != '&' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&'&') {
            out.push('&');
            i += 2;
            continue;
        }
        let (name, consumed) = scan_var_name(&chars[i + 1..]);
        if name.is_empty() {
            out.push('&');
            i += 1;
            continue;
        }
        let mut j = i + 1 + consumed;
        // subscripts
        let mut subscripts = Vec::new();
        if chars.get(j) == Some(&'(') {
            if let Some((subs, used)) = scan_subscripts(&chars[j..], ids, ca) {
                subscripts = subs;
                j += used;
            }
        }
        let id = ids.add(&name);
        match ca.read(ids, id, &subscripts) {
            Some(value) => {
                out.push_str(&value);
                // a trailing dot is the concatenation operator
                if chars.get(j) == Some(&'.') {
                    j += 1;
                }
            }
            None => {
                unknown.push(name.clone());
                out.extend(&chars[i..j]);
            }
        }
        i = j;
    }
    (out, unknown)
}

fn scan_var_name(chars: &[char]) -> (String, usize) {
    let mut name = String::new();
    for &c in chars {
        if c.is_ascii_alphanumeric() || matches!(c, '@' | '#' | '$' | '_') {
            name.push(c);
        } else {
            break;
        }
    }
    let len = name.chars().count();
    (name, len)
}

fn scan_subscripts(
    chars: &[char],
    ids: &mut IdStorage,
    ca: &CaContext,
) -> Option<(Vec<usize>, usize)> {
    debug_assert_eq!(chars.first(), Some(&'('));
    let mut depth = 0usize;
    let mut end = None;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    let inner: String = chars[1..end].iter().collect();
    let mut subs = Vec::new();
    for part in inner.split(',') {
        // subscripts may themselves contain variables
        let (sub_text, _) = substitute(part, ids, ca);
        let (expr, used) = parse_expr(sub_text.trim(), ids).ok()?;
        if used != sub_text.trim().chars().map(char::len_utf8).sum::<usize>() {
            return None;
        }
        let value = expr.eval(&NoSymbols, None).ok()?.as_abs()?;
        if value < 0 {
            return None;
        }
        subs.push(value as usize);
    }
    Some((subs, end + 1))
}

/// Evaluation context with no ordinary symbols, for pure CA arithmetic.
pub struct NoSymbols;

impl EvalContext for NoSymbols {
    fn symbol(&self, _id: IdIndex) -> Option<&core_context::Symbol> {
        None
    }
    fn address(&self, _id: core_context::AddrId) -> &core_context::Address {
        unreachable!("pure CA arithmetic has no addresses")
    }
    fn attribute(&self, _id: IdIndex, _attr: core_context::AttrKind) -> Option<i32> {
        None
    }
}

// ---------------------------------------------------------------------------
// Conditions (AIF / SETB)
// ---------------------------------------------------------------------------

/// Evaluate a parenthesized logical expression after substitution:
/// relational operators EQ NE LT GT LE GE over arithmetic terms or quoted
/// strings, combined with AND/OR/NOT.
pub fn eval_condition(
    text: &str,
    ids: &mut IdStorage,
    ordinary: &dyn EvalContext,
) -> Result<bool, CaError> {
    let mut p = CondParser {
        tokens: cond_tokens(text)?,
        pos: 0,
        ids,
        ordinary,
    };
    let value = p.or_expr()?;
    if p.pos != p.tokens.len() {
        return Err(CaError::BadExpression(text.to_owned()));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CondTok {
    Open,
    Close,
    Word(String),
    Str(String),
    Other(String),
}

fn cond_tokens(text: &str) -> Result<Vec<CondTok>, CaError> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            ' ' => i += 1,
            '(' => {
                out.push(CondTok::Open);
                i += 1;
            }
            ')' => {
                out.push(CondTok::Close);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(CaError::BadExpression(text.to_owned())),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                out.push(CondTok::Str(s));
            }
            c if c.is_ascii_alphanumeric() => {
                // one arithmetic term; attribute apostrophes (L'X) and the
                // arithmetic operators stay inside the token, blanks and
                // relational keywords separate
                let mut w = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || matches!(chars[i], '\'' | '+' | '-' | '*' | '/' | '@' | '#' | '$' | '_'))
                {
                    w.push(chars[i]);
                    i += 1;
                }
                out.push(CondTok::Word(w));
            }
            c => {
                let mut w = String::new();
                while i < chars.len()
                    && !chars[i].is_ascii_alphanumeric()
                    && !matches!(chars[i], ' ' | '(' | ')' | '\'')
                {
                    w.push(chars[i]);
                    i += 1;
                }
                debug_assert!(!w.is_empty(), "scanner always advances on {c:?}");
                out.push(CondTok::Other(w));
            }
        }
    }
    Ok(out)
}

struct CondParser<'a> {
    tokens: Vec<CondTok>,
    pos: usize,
    ids: &'a mut IdStorage,
    ordinary: &'a dyn EvalContext,
}

impl CondParser<'_> {
    fn peek_word(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(CondTok::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    fn or_expr(&mut self) -> Result<bool, CaError> {
        let mut value = self.and_expr()?;
        while self.peek_word().is_some_and(|w| w.eq_ignore_ascii_case("OR")) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, CaError> {
        let mut value = self.not_expr()?;
        while self
            .peek_word()
            .is_some_and(|w| w.eq_ignore_ascii_case("AND"))
        {
            self.pos += 1;
            let rhs = self.not_expr()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn not_expr(&mut self) -> Result<bool, CaError> {
        if self
            .peek_word()
            .is_some_and(|w| w.eq_ignore_ascii_case("NOT"))
        {
            self.pos += 1;
            return Ok(!self.not_expr()?);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<bool, CaError> {
        if self.tokens.get(self.pos) == Some(&CondTok::Open) {
            // lookahead: a parenthesized boolean vs. an arithmetic group
            let save = self.pos;
            self.pos += 1;
            if let Ok(inner) = self.or_expr() {
                if self.tokens.get(self.pos) == Some(&CondTok::Close) {
                    self.pos += 1;
                    return Ok(inner);
                }
            }
            self.pos = save;
        }
        let lhs = self.term()?;
        let op = match self.peek_word() {
            Some(op) => op.to_ascii_uppercase(),
            None => {
                // bare arithmetic term: non-zero is true
                return Ok(match lhs {
                    Term::Num(v) => v != 0,
                    Term::Str(s) => !s.is_empty(),
                });
            }
        };
        if !matches!(op.as_str(), "EQ" | "NE" | "LT" | "GT" | "LE" | "GE") {
            return Ok(match lhs {
                Term::Num(v) => v != 0,
                Term::Str(s) => !s.is_empty(),
            });
        }
        self.pos += 1;
        let rhs = self.term()?;
        let ordering = match (lhs, rhs) {
            (Term::Num(a), Term::Num(b)) => a.cmp(&b),
            (Term::Str(a), Term::Str(b)) => a.cmp(&b),
            (Term::Str(a), Term::Num(b)) => a.cmp(&b.to_string()),
            (Term::Num(a), Term::Str(b)) => a.to_string().cmp(&b),
        };
        Ok(match op.as_str() {
            "EQ" => ordering.is_eq(),
            "NE" => ordering.is_ne(),
            "LT" => ordering.is_lt(),
            "GT" => ordering.is_gt(),
            "LE" => ordering.is_le(),
            _ => ordering.is_ge(),
        })
    }

    fn term(&mut self) -> Result<Term, CaError> {
        match self.tokens.get(self.pos).cloned() {
            Some(CondTok::Str(s)) => {
                self.pos += 1;
                Ok(Term::Str(s))
            }
            Some(CondTok::Word(w)) => {
                self.pos += 1;
                let (expr, used) = parse_expr(&w, self.ids)
                    .map_err(|e| CaError::BadExpression(e.to_string()))?;
                if used != w.len() {
                    return Err(CaError::BadExpression(w));
                }
                let value = expr
                    .eval(self.ordinary, None)
                    .ok()
                    .and_then(|v| v.as_abs())
                    .ok_or_else(|| CaError::BadExpression(w))?;
                Ok(Term::Num(value))
            }
            Some(CondTok::Other(w)) if w == "-" => {
                self.pos += 1;
                match self.term()? {
                    Term::Num(v) => Ok(Term::Num(-v)),
                    Term::Str(s) => Err(CaError::BadExpression(s)),
                }
            }
            other => Err(CaError::BadExpression(format!("{other:?}"))),
        }
    }
}

enum Term {
    Num(i32),
    Str(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (IdStorage, CaContext) {
        let mut ids = IdStorage::new();
        let ca = CaContext::new(&mut ids);
        (ids, ca)
    }

    #[test]
    fn declare_is_idempotent_but_type_checked() {
        let (mut ids, mut ca) = fixture();
        let a = ids.add("A");
        ca.declare(a, SetType::A, true, false).unwrap();
        ca.declare(a, SetType::A, true, false).unwrap();
        assert_eq!(
            ca.declare(a, SetType::C, true, false),
            Err(CaError::TypeMismatch)
        );
    }

    #[test]
    fn assign_and_substitute_scalar() {
        let (mut ids, mut ca) = fixture();
        let x = ids.add("X");
        ca.assign(x, None, SetValue::A(5)).unwrap();
        let (out, unknown) = substitute("LA 1,&X", &mut ids, &ca);
        assert_eq!(out, "LA 1,5");
        assert!(unknown.is_empty());
    }

    #[test]
    fn double_ampersand_escapes() {
        let (mut ids, ca) = fixture();
        let (out, _) = substitute("C'&&X'", &mut ids, &ca);
        assert_eq!(out, "C'&X'");
    }

    #[test]
    fn unknown_variable_is_left_and_reported() {
        let (mut ids, ca) = fixture();
        let (out, unknown) = substitute("LA 1,&NOPE", &mut ids, &ca);
        assert_eq!(out, "LA 1,&NOPE");
        assert_eq!(unknown, vec!["NOPE".to_string()]);
    }

    #[test]
    fn concatenation_dot_is_consumed() {
        let (mut ids, mut ca) = fixture();
        let p = ids.add("P");
        ca.assign(p, None, SetValue::C("AB".into())).unwrap();
        let (out, _) = substitute("&P.C", &mut ids, &ca);
        assert_eq!(out, "ABC");
    }

    #[test]
    fn array_subscript_substitution() {
        let (mut ids, mut ca) = fixture();
        let v = ids.add("V");
        ca.assign(v, Some(2), SetValue::C("TWO".into())).unwrap();
        let (out, _) = substitute("&V(2)", &mut ids, &ca);
        assert_eq!(out, "TWO");
    }

    #[test]
    fn syslist_reads_positionals_and_label() {
        let (mut ids, mut ca) = fixture();
        let mut frame = ScopeFrame::opencode();
        let lbl = frame.arena.single("NAME");
        let p1 = frame.arena.single("A");
        let x = frame.arena.single("X");
        let y = frame.arena.single("Y");
        let p2 = frame.arena.composite(vec![x, y]);
        frame.label_data = lbl;
        frame.syslist = vec![p1, p2];
        frame.sysndx = 3;
        ca.push_frame(frame);

        let (out, _) = substitute("&SYSLIST(0) &SYSLIST(1) &SYSLIST(2,2) &SYSNDX", &mut ids, &ca);
        assert_eq!(out, "NAME A Y 0003");
    }

    #[test]
    fn count_attribute_of_variables() {
        let (mut ids, mut ca) = fixture();
        let v = ids.add("V");
        ca.assign(v, None, SetValue::C("HELLO".into())).unwrap();
        let (out, _) = substitute("K'&V", &mut ids, &ca);
        assert_eq!(out, "5");
    }

    #[test]
    fn conditions() {
        let (mut ids, _ca) = fixture();
        assert!(eval_condition("1 LT 2", &mut ids, &NoSymbols).unwrap());
        assert!(!eval_condition("2 LT 1", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("'A' EQ 'A'", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("'A' NE 'B'", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("1 EQ 1 AND 2 EQ 2", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("1 EQ 2 OR 3 GE 3", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("NOT 0", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("(1 EQ 1)", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("1+2 EQ 3", &mut ids, &NoSymbols).unwrap());
        assert!(eval_condition("10/3 EQ 3", &mut ids, &NoSymbols).unwrap());
    }

    #[test]
    fn condition_rejects_garbage() {
        let (mut ids, _ca) = fixture();
        assert!(eval_condition("1 EQ", &mut ids, &NoSymbols).is_err());
    }
}
