//! Preprocessor stages.
//!
//! A stage transforms a [`Document`] into another: original lines may be
//! replaced by generated ones or have generated lines inserted after them,
//! but are never reordered. Generated lines carry the line number of the
//! original they stand in for, so diagnostics stay anchored to real
//! source. Stages compose in configuration order; the opencode provider
//! sees only the final document.
//!
//! The DB2/CICS replacement text here is a synthesized call sequence, not
//! the product-faithful expansion — the faithful rewriting rules are
//! outside the core. What is faithful: block recognition (first-card
//! continuation rules), INCLUDE/-INC member resolution, and cycle
//! detection across member names.

use crate::copy::CopybookResolver;
use core_lexing::DEFAULT_ICTL;
use core_model::{Diagnostic, DiagnosticCollector, DocLine, Document, Range};
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

/// A document-to-document rewriting stage.
pub trait Stage {
    fn name(&self) -> &'static str;
    fn run(
        &mut self,
        doc: Document,
        libs: &mut dyn CopybookResolver,
        diags: &mut DiagnosticCollector,
    ) -> Document;
}

/// Is the card continued according to copybook column rules?
fn is_continued(line: &str) -> bool {
    line.chars().nth(DEFAULT_ICTL.end).is_some_and(|c| c != ' ')
}

fn line_range(lineno: usize, line: &DocLine) -> Range {
    Range::line_span(lineno, 0, line.content().chars().count())
}

/// Collect a directive statement beginning at `idx`: the first card plus
/// its continuations. Returns the joined operand text and the consumed
/// line count.
fn collect_statement(doc: &Document, idx: usize) -> (String, usize) {
    let mut text = String::new();
    let mut used = 0;
    let mut i = idx;
    loop {
        let Some(line) = doc.get(i) else { break };
        let content = line.content();
        let code: String = if used == 0 {
            content.chars().take(DEFAULT_ICTL.end).collect()
        } else {
            // continuation cards restart at the continue column
            content
                .chars()
                .take(DEFAULT_ICTL.end)
                .skip(DEFAULT_ICTL.continuation - 1)
                .collect()
        };
        text.push_str(code.trim_end());
        used += 1;
        if !is_continued(content) {
            break;
        }
        text.push(' ');
        i += 1;
    }
    (text, used)
}

// ---------------------------------------------------------------------------
// Member inclusion (Endevor-style `-INC`, DB2 `INCLUDE`)
// ---------------------------------------------------------------------------

/// Inline `-INC member` directives, with cycle detection across names.
pub struct IncludeStage {
    pattern: Regex,
    active: HashSet<String>,
}

impl Default for IncludeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl IncludeStage {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"(?i)^-INC\s+(\S+)").expect("static pattern"),
            active: HashSet::new(),
        }
    }

    fn expand(
        &mut self,
        doc: Document,
        libs: &mut dyn CopybookResolver,
        diags: &mut DiagnosticCollector,
    ) -> Document {
        let mut out = Vec::new();
        for line in doc.into_lines() {
            let capture = self
                .pattern
                .captures(line.content())
                .map(|c| c[1].to_uppercase());
            let Some(member) = capture else {
                out.push(line);
                continue;
            };
            let lineno = line.lineno().unwrap_or(0);
            if !self.active.insert(member.clone()) {
                diags.add(Diagnostic::error(
                    "SEM010",
                    line_range(lineno, &line),
                    format!("recursive include of member {member}"),
                ));
                continue;
            }
            match libs.resolve(&member) {
                Some(text) => {
                    debug!(target: "preprocessor", member = %member, "include expanded");
                    let inner = self.expand(Document::from_text(&text), libs, diags);
                    out.extend(
                        inner
                            .into_lines()
                            .into_iter()
                            .map(|l| DocLine::generated(l.text().to_owned(), Some(lineno))),
                    );
                }
                None => {
                    diags.add(Diagnostic::error(
                        "SEM011",
                        line_range(lineno, &line),
                        format!("member {member} not found"),
                    ));
                }
            }
            self.active.remove(&member);
        }
        Document::new(out)
    }
}

impl Stage for IncludeStage {
    fn name(&self) -> &'static str {
        "include"
    }

    fn run(
        &mut self,
        doc: Document,
        libs: &mut dyn CopybookResolver,
        diags: &mut DiagnosticCollector,
    ) -> Document {
        self.active.clear();
        self.expand(doc, libs, diags)
    }
}

// ---------------------------------------------------------------------------
// DB2
// ---------------------------------------------------------------------------

/// Replace `EXEC SQL …` blocks and `SQL TYPE IS` declarations, resolving
/// `INCLUDE member` inside the SQL text.
pub struct Db2Stage {
    exec_sql: Regex,
    sql_type: Regex,
    include: Regex,
    active_includes: HashSet<String>,
}

impl Default for Db2Stage {
    fn default() -> Self {
        Self::new()
    }
}

impl Db2Stage {
    pub fn new() -> Self {
        Self {
            exec_sql: Regex::new(r"(?i)^(\S+\s+)?EXEC\s+SQL\b").expect("static pattern"),
            sql_type: Regex::new(r"(?i)^(\S+)\s+SQL\s+TYPE\s+IS\b").expect("static pattern"),
            include: Regex::new(r"(?i)\bINCLUDE\s+(\S+)").expect("static pattern"),
            active_includes: HashSet::new(),
        }
    }

    fn replacement(label: &str, lineno: Option<usize>) -> Vec<DocLine> {
        let mut out = Vec::new();
        if !label.is_empty() {
            out.push(DocLine::generated(format!("{label} DS 0H\n"), lineno));
        }
        out.push(DocLine::generated(
            "         BRAS  14,*+12                  SQL call stub\n".to_owned(),
            lineno,
        ));
        out.push(DocLine::generated("         DC    F'0'\n".to_owned(), lineno));
        out
    }
}

impl Stage for Db2Stage {
    fn name(&self) -> &'static str {
        "db2"
    }

    fn run(
        &mut self,
        doc: Document,
        libs: &mut dyn CopybookResolver,
        diags: &mut DiagnosticCollector,
    ) -> Document {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(line) = doc.get(i) {
            let content = line.content();
            if !line.is_original() || !self.exec_sql.is_match(content) {
                if line.is_original() && self.sql_type.is_match(content) {
                    let (_, used) = collect_statement(&doc, i);
                    let label = content.split_whitespace().next().unwrap_or("");
                    out.push(DocLine::generated(
                        format!("{label} DS    A                       SQL TYPE\n"),
                        line.lineno(),
                    ));
                    i += used;
                    continue;
                }
                out.push(line.clone());
                i += 1;
                continue;
            }

            // continuation is decided on the first card of the block
            let (text, used) = collect_statement(&doc, i);
            let lineno = line.lineno();
            let label = {
                let first = content.split_whitespace().next().unwrap_or("");
                if first.eq_ignore_ascii_case("EXEC") {
                    ""
                } else {
                    first
                }
            };

            if let Some(captures) = self.include.captures(&text) {
                let member = captures[1].to_uppercase();
                if !self.active_includes.insert(member.clone()) {
                    diags.add(Diagnostic::error(
                        "SEM010",
                        line_range(lineno.unwrap_or(0), line),
                        format!("recursive SQL include of member {member}"),
                    ));
                } else {
                    match libs.resolve(&member) {
                        Some(included) => {
                            let inner = self.run(Document::from_text(&included), libs, diags);
                            out.extend(inner.into_lines().into_iter().map(|l| {
                                DocLine::generated(l.text().to_owned(), lineno)
                            }));
                        }
                        None => diags.add(Diagnostic::error(
                            "SEM011",
                            line_range(lineno.unwrap_or(0), line),
                            format!("SQL include member {member} not found"),
                        )),
                    }
                    self.active_includes.remove(&member);
                }
            } else {
                out.extend(Self::replacement(label, lineno));
            }
            i += used;
        }
        Document::new(out)
    }
}

// ---------------------------------------------------------------------------
// CICS
// ---------------------------------------------------------------------------

/// Replace `EXEC CICS …` statements with a call sequence; continuation of
/// the rewritten statement is suppressed (the replacement is complete in
/// itself).
pub struct CicsStage {
    exec_cics: Regex,
}

impl Default for CicsStage {
    fn default() -> Self {
        Self::new()
    }
}

impl CicsStage {
    pub fn new() -> Self {
        Self {
            exec_cics: Regex::new(r"(?i)^(\S+\s+)?EXEC\s+CICS\b").expect("static pattern"),
        }
    }
}

impl Stage for CicsStage {
    fn name(&self) -> &'static str {
        "cics"
    }

    fn run(
        &mut self,
        doc: Document,
        _libs: &mut dyn CopybookResolver,
        _diags: &mut DiagnosticCollector,
    ) -> Document {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(line) = doc.get(i) {
            let content = line.content();
            if !line.is_original() || !self.exec_cics.is_match(content) {
                out.push(line.clone());
                i += 1;
                continue;
            }
            let (_, used) = collect_statement(&doc, i);
            let lineno = line.lineno();
            let label = {
                let first = content.split_whitespace().next().unwrap_or("");
                if first.eq_ignore_ascii_case("EXEC") {
                    ""
                } else {
                    first
                }
            };
            if !label.is_empty() {
                out.push(DocLine::generated(format!("{label} DS 0H\n"), lineno));
            }
            out.push(DocLine::generated(
                "         BALR  14,15                   CICS call stub\n".to_owned(),
                lineno,
            ));
            i += used;
        }
        Document::new(out)
    }
}

/// Run `stages` in order over `doc`.
pub fn run_pipeline(
    stages: &mut [Box<dyn Stage>],
    mut doc: Document,
    libs: &mut dyn CopybookResolver,
    diags: &mut DiagnosticCollector,
) -> Document {
    for stage in stages {
        debug!(target: "preprocessor", stage = stage.name(), "running stage");
        doc = stage.run(doc, libs, diags);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::InMemoryLibrary;

    fn run_one(stage: &mut dyn Stage, text: &str, lib: &mut InMemoryLibrary) -> (Document, Vec<Diagnostic>) {
        let mut diags = DiagnosticCollector::new("file:///t.hlasm");
        let doc = stage.run(Document::from_text(text), lib, &mut diags);
        let ds = diags.take();
        (doc, ds)
    }

    #[test]
    fn include_stage_inlines_members() {
        let mut lib = InMemoryLibrary::new();
        lib.insert("PAYLOAD", "A EQU 1\n");
        let mut stage = IncludeStage::new();
        let (doc, diags) = run_one(&mut stage, "-INC payload\n B EQU 2\n", &mut lib);
        assert!(diags.is_empty());
        assert_eq!(doc.len(), 2);
        assert!(!doc.at(0).is_original());
        assert_eq!(doc.at(0).content(), "A EQU 1");
        // generated line keeps the replaced line's number
        assert_eq!(doc.at(0).lineno(), Some(0));
        assert!(doc.at(1).is_original());
    }

    #[test]
    fn include_cycle_is_diagnosed() {
        let mut lib = InMemoryLibrary::new();
        lib.insert("A", "-INC B\n");
        lib.insert("B", "-INC A\n");
        let mut stage = IncludeStage::new();
        let (_, diags) = run_one(&mut stage, "-INC A\n", &mut lib);
        assert!(diags.iter().any(|d| d.code == "SEM010"));
    }

    #[test]
    fn missing_member_is_diagnosed() {
        let mut lib = InMemoryLibrary::new();
        let mut stage = IncludeStage::new();
        let (_, diags) = run_one(&mut stage, "-INC NOWHERE\n", &mut lib);
        assert!(diags.iter().any(|d| d.code == "SEM011"));
    }

    #[test]
    fn db2_replaces_exec_sql_blocks() {
        let mut lib = InMemoryLibrary::new();
        let mut stage = Db2Stage::new();
        let (doc, diags) = run_one(
            &mut stage,
            "         EXEC  SQL SELECT 1 FROM T\nNEXT     LR    1,2\n",
            &mut lib,
        );
        assert!(diags.is_empty());
        // stub lines replace the block, the following line is untouched
        assert!(!doc.at(0).is_original());
        assert!(doc.lines().iter().any(|l| l.content().contains("BRAS")));
        let last = doc.at(doc.len() - 1);
        assert!(last.is_original());
        assert_eq!(last.content(), "NEXT     LR    1,2");
    }

    #[test]
    fn db2_block_continuation_comes_from_first_card() {
        let mut lib = InMemoryLibrary::new();
        let mut stage = Db2Stage::new();
        // first card continued (col 72 non-blank), second card ends the block
        let first = format!("{:<71}X\n", "         EXEC  SQL SELECT 1");
        let text = format!("{first}               FROM T\n F2 LR 1,2\n");
        let (doc, _) = run_one(&mut stage, &text, &mut lib);
        // both block cards consumed, replacement + the trailing statement remain
        assert!(doc.lines().iter().all(|l| !l.content().contains("FROM T")));
        assert!(doc.lines().iter().any(|l| l.content().contains("LR 1,2")));
    }

    #[test]
    fn db2_include_pulls_member_through_the_stage() {
        let mut lib = InMemoryLibrary::new();
        lib.insert("SQLCA", "SQLCA    DS    F\n");
        let mut stage = Db2Stage::new();
        let (doc, diags) = run_one(&mut stage, "         EXEC  SQL INCLUDE SQLCA\n", &mut lib);
        assert!(diags.is_empty());
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.at(0).content(), "SQLCA    DS    F");
        assert!(!doc.at(0).is_original());
    }

    #[test]
    fn cics_replacement_suppresses_continuation() {
        let mut lib = InMemoryLibrary::new();
        let mut stage = CicsStage::new();
        let first = format!("{:<71}X\n", "LBL      EXEC  CICS SEND TEXT");
        let text = format!("{first}               FROM(MSG)\n");
        let (doc, _) = run_one(&mut stage, &text, &mut lib);
        // the rewritten statement is complete; no continuation survives
        for line in doc.lines() {
            assert!(!is_continued(line.content()), "line still continued: {line:?}");
        }
        assert!(doc.lines().iter().any(|l| l.content().starts_with("LBL DS 0H")));
        assert!(doc.lines().iter().any(|l| l.content().contains("BALR")));
    }

    #[test]
    fn stages_preserve_original_line_order() {
        let mut lib = InMemoryLibrary::new();
        lib.insert("M", "X EQU 1\n");
        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Db2Stage::new()),
            Box::new(CicsStage::new()),
            Box::new(IncludeStage::new()),
        ];
        let mut diags = DiagnosticCollector::new("u");
        let text = "A EQU 1\n-INC M\nB EQU 2\n";
        let doc = run_pipeline(
            &mut stages,
            Document::from_text(text),
            &mut lib,
            &mut diags,
        );
        let originals: Vec<usize> = doc
            .lines()
            .iter()
            .filter(|l| l.is_original())
            .map(|l| l.lineno().unwrap())
            .collect();
        let mut sorted = originals.clone();
        sorted.sort_unstable();
        assert_eq!(originals, sorted);
    }
}
