//! Macro definitions and invocations.
//!
//! A definition captures the body statements as raw code text; parameter
//! substitution happens when a line is pulled into the statement stream,
//! never earlier, so system variables and SET symbols read their values at
//! expansion time.

use crate::ca::ScopeFrame;
use crate::parsers;
use core_context::{MacroDataArena, MacroDataId};
use core_ident::{IdIndex, IdStorage};
use core_model::Location;
use std::collections::HashMap;

/// One captured body line.
#[derive(Debug, Clone)]
pub struct MacroBodyLine {
    /// Joined code text of the captured logical line.
    pub code: String,
    /// First source line of the logical line.
    pub lineno: usize,
}

/// A parsed macro prototype parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoParam {
    Positional(IdIndex),
    Keyword(IdIndex, String),
}

/// A complete macro definition.
#[derive(Debug, Clone)]
pub struct MacroDefinition {
    pub name: IdIndex,
    /// `&LBL` from the prototype's name field.
    pub name_field_param: Option<IdIndex>,
    pub params: Vec<ProtoParam>,
    pub body: Vec<MacroBodyLine>,
    /// Sequence symbols defined in the body: name → body index.
    pub seq_symbols: HashMap<IdIndex, usize>,
    pub location: Location,
}

impl MacroDefinition {
    /// Parse the prototype statement (`&LBL NAME &P1,&P2,&K=dflt`).
    pub fn from_prototype(
        code: &str,
        ids: &mut IdStorage,
        location: Location,
    ) -> Option<MacroDefinition> {
        let fp = parsers::parse_first_part(code, ids);
        let name = ids.add(fp.instruction.as_deref()?);
        let name_field_param = match fp.label {
            core_semantics::LabelField::Variable { name } => Some(name),
            _ => None,
        };
        let (ops_text, _) = parsers::split_operands_and_remarks(&fp.rest);
        let mut params = Vec::new();
        if !ops_text.is_empty() {
            for (op, _) in parsers::split_operand_list(&ops_text) {
                let op = op.trim();
                let Some(stripped) = op.strip_prefix('&') else {
                    continue;
                };
                match stripped.split_once('=') {
                    Some((kw, default)) => {
                        params.push(ProtoParam::Keyword(ids.add(kw), default.to_owned()));
                    }
                    None => params.push(ProtoParam::Positional(ids.add(stripped))),
                }
            }
        }
        Some(MacroDefinition {
            name,
            name_field_param,
            params,
            body: Vec::new(),
            seq_symbols: HashMap::new(),
            location,
        })
    }

    /// Record a body line, indexing any sequence-symbol label.
    pub fn push_body_line(&mut self, code: String, lineno: usize, ids: &mut IdStorage) {
        if let Some(rest) = code.strip_prefix('.') {
            let name: String = rest
                .chars()
                .take_while(|&c| c.is_ascii_alphanumeric() || matches!(c, '@' | '#' | '$' | '_'))
                .collect();
            if !name.is_empty() {
                self.seq_symbols
                    .entry(ids.add(&name))
                    .or_insert(self.body.len());
            }
        }
        self.body.push(MacroBodyLine { code, lineno });
    }
}

/// Parse one call operand into macro data: sublists become composites.
fn operand_data(text: &str, arena: &mut MacroDataArena) -> MacroDataId {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
    {
        let children = parsers::split_operand_list(inner)
            .into_iter()
            .map(|(item, _)| operand_data(&item, arena))
            .collect();
        return arena.composite(children);
    }
    arena.single(trimmed)
}

/// Build the invocation scope frame for a macro call.
///
/// `label` is the call's name-field text, `operands` the raw operand
/// texts. Keyword operands are recognized by `NAME=`; everything else
/// binds positionally and lands in SYSLIST.
pub fn build_invocation_frame(
    def: &MacroDefinition,
    label: &str,
    operands: &[String],
    sysndx: u32,
    sysect: String,
    ids: &mut IdStorage,
) -> ScopeFrame {
    let mut frame = ScopeFrame::opencode();
    frame.sysndx = sysndx;
    frame.sysect = sysect;

    frame.label_data = frame.arena.single(label);
    if let Some(param) = def.name_field_param {
        frame.params.insert(param, frame.label_data);
    }

    // keyword defaults first, overridden by explicit keyword operands
    for param in &def.params {
        if let ProtoParam::Keyword(name, default) = param {
            let data = operand_data(default, &mut frame.arena);
            frame.params.insert(*name, data);
        }
    }

    let positional_names: Vec<IdIndex> = def
        .params
        .iter()
        .filter_map(|p| match p {
            ProtoParam::Positional(name) => Some(*name),
            ProtoParam::Keyword(..) => None,
        })
        .collect();

    for op in operands {
        let trimmed = op.trim();
        if let Some((kw, value)) = split_keyword(trimmed) {
            if let Some(id) = ids.find(kw) {
                if def
                    .params
                    .iter()
                    .any(|p| matches!(p, ProtoParam::Keyword(n, _) if *n == id))
                {
                    let data = operand_data(value, &mut frame.arena);
                    frame.params.insert(id, data);
                    continue;
                }
            }
        }
        let data = operand_data(trimmed, &mut frame.arena);
        let position = frame.syslist.len();
        frame.syslist.push(data);
        if let Some(&name) = positional_names.get(position) {
            frame.params.insert(name, data);
        }
    }

    // unset positionals read as empty
    for (i, &name) in positional_names.iter().enumerate() {
        if i >= frame.syslist.len() {
            frame.params.entry(name).or_insert(MacroDataId::DUMMY);
        }
    }

    frame
}

/// `NAME=value` with a plain name before the equals sign.
fn split_keyword(op: &str) -> Option<(&str, &str)> {
    let eq = op.find('=')?;
    let (name, value) = op.split_at(eq);
    if !name.is_empty() && parsers::is_ordinary_name(name) {
        Some((name, &value[1..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaContext;
    use crate::ca::substitute;
    use core_model::Position;

    fn loc() -> Location {
        Location::new("file:///m.hlasm", Position::default())
    }

    #[test]
    fn prototype_parses_name_field_and_params() {
        let mut ids = IdStorage::new();
        let def =
            MacroDefinition::from_prototype("&LBL     MOVE  &FROM,&TO,&LEN=4", &mut ids, loc())
                .unwrap();
        assert_eq!(def.name, ids.add("MOVE"));
        assert_eq!(def.name_field_param, Some(ids.add("LBL")));
        assert_eq!(
            def.params,
            vec![
                ProtoParam::Positional(ids.add("FROM")),
                ProtoParam::Positional(ids.add("TO")),
                ProtoParam::Keyword(ids.add("LEN"), "4".into()),
            ]
        );
    }

    #[test]
    fn body_lines_index_sequence_symbols() {
        let mut ids = IdStorage::new();
        let mut def = MacroDefinition::from_prototype("         M", &mut ids, loc()).unwrap();
        def.push_body_line("         LR    1,2".into(), 1, &mut ids);
        def.push_body_line(".LOOP    ANOP".into(), 2, &mut ids);
        assert_eq!(def.seq_symbols.get(&ids.add("LOOP")), Some(&1));
    }

    #[test]
    fn invocation_binds_positionals_keywords_and_syslist() {
        let mut ids = IdStorage::new();
        let def =
            MacroDefinition::from_prototype("&L       MOVE  &FROM,&TO,&LEN=4", &mut ids, loc())
                .unwrap();
        let frame = build_invocation_frame(
            &def,
            "HERE",
            &["A".into(), "(X,Y)".into(), "LEN=8".into()],
            7,
            "CODE".into(),
            &mut ids,
        );
        let mut ca = CaContext::new(&mut ids);
        ca.push_frame(frame);

        let (out, unknown) =
            substitute("&L &FROM &TO(2) &LEN &SYSNDX &SYSECT &SYSLIST(2,1)", &mut ids, &ca);
        assert_eq!(out, "HERE A Y 8 0007 CODE X");
        assert!(unknown.is_empty());
    }

    #[test]
    fn keyword_default_applies_when_omitted() {
        let mut ids = IdStorage::new();
        let def = MacroDefinition::from_prototype("         M     &K=DFLT", &mut ids, loc()).unwrap();
        let frame = build_invocation_frame(&def, "", &[], 1, String::new(), &mut ids);
        let mut ca = CaContext::new(&mut ids);
        ca.push_frame(frame);
        let (out, _) = substitute("&K", &mut ids, &ca);
        assert_eq!(out, "DFLT");
    }

    #[test]
    fn missing_positional_reads_empty() {
        let mut ids = IdStorage::new();
        let def = MacroDefinition::from_prototype("         M     &A,&B", &mut ids, loc()).unwrap();
        let frame = build_invocation_frame(&def, "", &["X".into()], 1, String::new(), &mut ids);
        let mut ca = CaContext::new(&mut ids);
        ca.push_frame(frame);
        let (out, unknown) = substitute("<&A><&B>", &mut ids, &ca);
        assert_eq!(out, "<X><>");
        assert!(unknown.is_empty());
    }
}
