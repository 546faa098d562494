//! End-to-end analysis scenarios over the full pipeline.

use core_processing::{
    AnalysisResult, Analyzer, AnalyzerOptions, InMemoryLibrary, StageKind, SymbolView,
};
use core_semantics::{ProcessingForm, Statement};

fn analyze(source: &str) -> AnalysisResult {
    Analyzer::new(source, AnalyzerOptions::default()).analyze()
}

fn analyze_with_library(source: &str, members: &[(&str, &str)]) -> AnalysisResult {
    let mut lib = InMemoryLibrary::new();
    for (name, text) in members {
        lib.insert(*name, *text);
    }
    Analyzer::new(source, AnalyzerOptions::default())
        .with_library(Box::new(lib))
        .analyze()
}

fn errors(result: &AnalysisResult) -> Vec<&str> {
    result
        .diagnostics
        .iter()
        .filter(|d| d.severity == core_model::Severity::Error)
        .map(|d| d.code)
        .collect()
}

#[test]
fn simple_symbol_definition() {
    // S1
    let result = analyze("A EQU 1\nB EQU A+1\n");
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn forward_reference_resolves_through_the_solver() {
    let result = analyze("B EQU A+1\nA EQU 1\n");
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn deferred_resolution_via_space() {
    // S2: the unknown length is a space; Y's address carries it, so
    // Y - address(X) is exactly the space and stays non-negative.
    let result = analyze(" DS 0F\nX DS CL(Y-*)\nY DS CL1\n");
    assert_eq!(result.diagnostics, vec![]);

    let x = result.symbol("X").unwrap();
    let y = result.symbol("Y").unwrap();
    let (SymbolView::Reloc {
        offset: x_off,
        pending_spaces: x_pending,
        ..
    }, SymbolView::Reloc {
        offset: y_off,
        pending_spaces: y_pending,
        ..
    }) = (&x.value, &y.value)
    else {
        panic!("X and Y must be relocatable");
    };
    assert_eq!(*x_pending, 0);
    assert_eq!(*y_pending, 1);
    assert!(y_off - x_off >= 0);
}

#[test]
fn cycle_rejected() {
    // S3
    let result = analyze("A EQU B\nB EQU A\n");
    assert!(errors(&result).contains(&"DEF002"));
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Undefined);
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Undefined);
    // analysis continued past the cycle
    let more = analyze("A EQU B\nB EQU A\nC EQU 3\n");
    assert_eq!(more.symbol("C").unwrap().value, SymbolView::Abs(3));
}

#[test]
fn attribute_lookahead() {
    // S4
    let result = analyze(" LR 1,L'X\nX DC F'0'\n");
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.rewinds, 1);
    let x = result.symbol("X").unwrap();
    assert_eq!(x.length, 4);
    assert_eq!(x.type_attr, 'F');
    // exactly one pass produced the machine statement
    let machine_statements = result
        .statements
        .iter()
        .filter(|s| matches!(s, Statement::Resolved(r) if r.form == ProcessingForm::Mach))
        .count();
    assert_eq!(machine_statements, 1);
}

#[test]
fn lookahead_miss_defaults_and_warns() {
    let result = analyze(" LR 1,L'NOSUCH\n");
    assert_eq!(result.rewinds, 1);
    assert!(result.diagnostics.iter().any(|d| d.code == "DEF005"));
    // no undefined-symbol error for the attribute reference itself
    assert!(!errors(&result).contains(&"DEF001"));
}

#[test]
fn lookahead_attribute_out_of_register_range_is_caught() {
    // L'X is 100, out of register range for an RR instruction
    let result = analyze(" LR 1,L'X\nX DC XL100'00'\n");
    assert!(errors(&result).contains(&"SEM004"));
}

#[test]
fn continuation_statement() {
    // S5: operands end with comma-blank and resume at the continue column
    let source = "         LR    1,                                                      X\n               2\n";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.statements_processed, 1);
    let Statement::Resolved(stmt) = &result.statements[0] else {
        panic!("expected a resolved statement");
    };
    assert_eq!(stmt.form, ProcessingForm::Mach);
    assert_eq!(stmt.operands.len(), 2);
}

#[test]
fn continuation_error_is_diagnosed() {
    let mut source = String::from(
        "         LR    1,                                                      X\n",
    );
    source.push_str("              Z2\n"); // column 15 must be blank
    let result = analyze(&source);
    let lex: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.code == "LEX001")
        .collect();
    assert_eq!(lex.len(), 1);
}

#[test]
fn ainsert_round_trip() {
    // S6: the record is substituted at insertion time
    let source = "\
         MACRO
         M
         AINSERT '&&X SETA 7',BACK
         MEND
         M
Z        EQU   1
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    // the buffered record went through a virtual file
    assert!(result.virtual_files.iter().any(|h| h.uri.contains("AINSERT")));
    assert_eq!(result.symbol("Z").unwrap().value, SymbolView::Abs(1));
}

#[test]
fn ainsert_substitutes_sysndx_at_insertion_time() {
    let source = "\
         MACRO
         M
         AINSERT 'V&SYSNDX EQU 5',BACK
         MEND
         M
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    // SYSNDX was 0001 when the record was queued
    assert_eq!(result.symbol("V0001").unwrap().value, SymbolView::Abs(5));
}

#[test]
fn ainsert_front_back_ordering() {
    let source = "\
         MACRO
         M
         AINSERT 'B EQU 2',BACK
         AINSERT 'A EQU 1',FRONT
         MEND
         M
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn macro_expansion_defines_symbols() {
    let source = "\
         MACRO
&L       DEFINE &V
&L       EQU   &V
         MEND
FOO      DEFINE 41
BAR      DEFINE 42
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("FOO").unwrap().value, SymbolView::Abs(41));
    assert_eq!(result.symbol("BAR").unwrap().value, SymbolView::Abs(42));
}

#[test]
fn macro_expansion_is_deterministic() {
    // identical inputs produce the same statement effects each time
    let source = "\
         MACRO
         GEN   &N
X&N      EQU   &N
         MEND
         GEN   1
         GEN   2
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("X1").unwrap().value, SymbolView::Abs(1));
    assert_eq!(result.symbol("X2").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn conditional_assembly_loop() {
    let source = "\
&I       SETA  0
.LOOP    ANOP
&I       SETA  &I+1
         AIF   (&I LT 3).LOOP
N        EQU   &I
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("N").unwrap().value, SymbolView::Abs(3));
    // each backward AIF branch is a rewind
    assert_eq!(result.rewinds, 2);
}

#[test]
fn ago_forward_skips_statements() {
    let source = "\
         AGO   .DONE
BAD      EQU   1
.DONE    ANOP
GOOD     EQU   2
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert!(result.symbol("BAD").is_none());
    assert_eq!(result.symbol("GOOD").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn copy_members_enter_the_stream() {
    let result = analyze_with_library(
        "         COPY  DEFS\nB EQU A+1\n",
        &[("DEFS", "A EQU 1\n")],
    );
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Abs(2));
}

#[test]
fn recursive_copy_is_diagnosed() {
    let result = analyze_with_library(
        "         COPY  LOOPY\n",
        &[("LOOPY", "         COPY  LOOPY\n")],
    );
    assert!(errors(&result).contains(&"SEM012"));
}

#[test]
fn missing_copy_member_is_diagnosed() {
    let result = analyze_with_library("         COPY  GONE\n", &[]);
    assert!(errors(&result).contains(&"SEM011"));
}

#[test]
fn sections_and_location_counters() {
    let source = "\
CODE     CSECT
         LR    1,2
DATA     DSECT
F1       DS    F
F2       DS    H
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("CODE").unwrap().type_attr, 'J');
    let f1 = result.symbol("F1").unwrap();
    let SymbolView::Reloc { section, offset, .. } = &f1.value else {
        panic!("F1 is relocatable");
    };
    assert_eq!(section, "DATA");
    assert_eq!(*offset, 0);
    let f2 = result.symbol("F2").unwrap();
    let SymbolView::Reloc { offset, .. } = &f2.value else {
        panic!("F2 is relocatable");
    };
    assert_eq!(*offset, 4);
}

#[test]
fn loctr_distance_resolves_at_module_end() {
    let source = "\
CODE     CSECT
         DS    XL6
AUX      LOCTR
HERE     DS    X
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    let here = result.symbol("HERE").unwrap();
    let SymbolView::Reloc {
        offset,
        pending_spaces,
        ..
    } = &here.value
    else {
        panic!("HERE is relocatable");
    };
    // after finish_module_layout the inter-counter distance is known
    assert_eq!(*pending_spaces, 0);
    assert_eq!(*offset, 6);
}

#[test]
fn redefinition_is_reported_with_related_location() {
    let result = analyze("A EQU 1\nA EQU 2\n");
    let redef: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.code == "SEM002")
        .collect();
    assert_eq!(redef.len(), 1);
    assert!(!redef[0].related.is_empty());
    // the first definition wins
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
}

#[test]
fn mnote_severity_mapping() {
    let source = "\
         MNOTE 8,'SEVERE'
         MNOTE 4,'WARN'
         MNOTE 0,'INFO'
         MNOTE *,'COMMENT'
";
    let result = analyze(source);
    let severities: Vec<_> = result
        .diagnostics
        .iter()
        .map(|d| (d.code, d.severity))
        .collect();
    assert!(severities.contains(&("MNT008", core_model::Severity::Error)));
    assert!(severities.contains(&("MNT002", core_model::Severity::Warning)));
    assert_eq!(
        severities
            .iter()
            .filter(|(c, _)| *c == "MNT000")
            .count(),
        2
    );
}

#[test]
fn undefined_symbol_at_end_of_module() {
    let result = analyze("B EQU NEVER\n");
    assert!(errors(&result).contains(&"DEF001"));
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Undefined);
}

#[test]
fn process_cards_are_collected() {
    let result = analyze("*PROCESS OVERRIDE(X)\nA EQU 1\n");
    assert_eq!(result.process_options.len(), 1);
    assert!(result.process_options[0].contains("OVERRIDE"));
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
}

#[test]
fn ictl_reconfigures_columns() {
    // begin column 9: the first 8 columns never reach the parser, so the
    // statement reads `A EQU 1` with label A
    let result = analyze(" ICTL 9,71\n12345678A EQU   1\n");
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
}

#[test]
fn preprocessor_stage_feeds_the_provider() {
    let mut lib = InMemoryLibrary::new();
    lib.insert("DEFS", "A EQU 1\n");
    let mut opts = AnalyzerOptions::default();
    opts.stages = vec![StageKind::Include];
    let result = Analyzer::new("-INC DEFS\nB EQU A+1\n", opts)
        .with_library(Box::new(lib))
        .analyze();
    assert_eq!(result.diagnostics, vec![]);
    assert_eq!(result.symbol("B").unwrap().value, SymbolView::Abs(2));
    // the preprocessed view was published as a virtual file
    assert!(
        result
            .virtual_files
            .iter()
            .any(|h| h.uri.contains("PREPROCESSOR"))
    );
}

#[test]
fn cancellation_preserves_partial_state() {
    let mut analyzer = Analyzer::new("A EQU 1\nB EQU 2\n", AnalyzerOptions::default());
    analyzer.cancel_token().cancel();
    let result = analyzer.analyze();
    assert!(result.cancelled);
    assert_eq!(result.statements_processed, 0);
}

#[test]
fn statement_limit_stops_runaway_loops() {
    let mut opts = AnalyzerOptions::default();
    opts.statement_limit = 50;
    let result = Analyzer::new(
        "&I       SETA  0\n.LOOP    ANOP\n         AGO   .LOOP\n",
        opts,
    )
    .analyze();
    assert!(result.diagnostics.iter().any(|d| d.code == "DEF006"));
}

#[test]
fn actr_limits_branching() {
    let source = "\
         ACTR  2
.LOOP    ANOP
         AGO   .LOOP
";
    let result = analyze(source);
    assert!(errors(&result).contains(&"SEM008"));
}

#[test]
fn end_statement_stops_analysis() {
    let result = analyze("A EQU 1\n         END\nB EQU 2\n");
    assert_eq!(result.symbol("A").unwrap().value, SymbolView::Abs(1));
    assert!(result.symbol("B").is_none());
}

#[test]
fn literals_reserve_pool_storage() {
    let source = "\
CODE     CSECT
         L     1,=F'1'
AFTER    EQU   *
";
    let result = analyze(source);
    assert_eq!(result.diagnostics, vec![]);
    // the pool is poured at END; AFTER precedes it
    assert!(result.symbol("AFTER").is_some());
}
