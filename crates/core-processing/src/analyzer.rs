//! The analyzer: statement processors and the cooperative driver loop.
//!
//! One analysis pulls statements from the opencode provider (or the
//! active macro expansion), dispatches them by processing form, and keeps
//! the ordinary-assembly context, the variable scopes, and the dependency
//! solver in step. Host requests and the cancellation token are serviced
//! between statements, so a long analysis stays interruptible without
//! threads.

use crate::ca::{CaContext, eval_condition, substitute};
use crate::copy::{CopyFrame, CopybookResolver, InMemoryLibrary};
use crate::macros::{MacroDefinition, build_invocation_frame};
use crate::opcode::{AsmOp, CaOp, MachineInstr, OpCode, OpcodeTable};
use crate::parsers::{
    self, CodeMap, OperandField, collect_operand_field, data_type_defaults, is_comment,
    is_literal, is_ordinary_name, parse_data_def, parse_first_part,
};
use crate::preprocessor::{CicsStage, Db2Stage, IncludeStage, Stage, run_pipeline};
use crate::provider::{
    AinsertDestination, ExtractKind, ExtractedLine, LineSource, OpencodeProvider, ProviderYield,
    RewindPos,
};
use crate::virtual_files::{VirtualFileHandle, VirtualFileMonitor, VirtualFileRegistry};
use core_context::{
    Alignment, AsmExpr, AttrKind, ContextError, DependencySource, EvalContext, EvalValue,
    ExprResolver, OrdinaryAssemblyContext, PostponedCheck, PostponedKind, SectionKind, SetValue,
    SymbolAttributes, SymbolValue,
};
use core_ident::{IdIndex, IdStorage};
use core_lexing::Ictl;
use core_model::{Diagnostic, DiagnosticCollector, Document, Location, Position, Range, Severity};
use core_semantics::{
    Collector, DataDef, HlScope, HlToken, InstructionField, LabelField, LengthSpec, LiteralRef,
    Operand, Statement,
};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Preprocessor stage selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Db2,
    Cics,
    Include,
}

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub uri: String,
    pub ictl: Ictl,
    pub stages: Vec<StageKind>,
    /// Hard stop against runaway conditional assembly.
    pub statement_limit: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            uri: "file:///source.hlasm".into(),
            ictl: core_lexing::DEFAULT_ICTL,
            stages: Vec::new(),
            statement_limit: 100_000,
        }
    }
}

/// Liveness token checked at suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Requests a host may queue into a running analysis; serviced between
/// statements.
#[derive(Debug)]
pub enum AnalysisRequest {
    Cancel,
    /// Reply with the number of statements processed so far.
    Progress(Sender<usize>),
}

/// A symbol as reported in the analysis result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub value: SymbolView,
    pub length: u32,
    pub type_attr: char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolView {
    Undefined,
    Abs(i32),
    Reloc {
        section: String,
        offset: i32,
        pending_spaces: usize,
    },
}

#[derive(Debug)]
pub struct AnalysisResult {
    pub diagnostics: Vec<Diagnostic>,
    pub hl_tokens: Vec<HlToken>,
    pub symbols: Vec<SymbolInfo>,
    /// Statements produced by the pipeline, in production order.
    pub statements: Vec<Statement>,
    pub process_options: Vec<String>,
    pub virtual_files: Vec<VirtualFileHandle>,
    pub statements_processed: usize,
    pub rewinds: usize,
    pub cancelled: bool,
}

impl AnalysisResult {
    pub fn symbol(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).min()
    }
}

// ---------------------------------------------------------------------------

enum Mode {
    Ordinary,
    Lookahead {
        targets: Vec<(AttrKind, IdIndex)>,
        resume: RewindPos,
        trigger_uri: String,
        trigger_range: Range,
        /// MACRO..MEND depth; labels inside definitions are not
        /// candidates.
        macro_nest: usize,
    },
    SeqSkip {
        target: IdIndex,
        origin_uri: String,
        origin_range: Range,
    },
    MacroCapture {
        def: Option<MacroDefinition>,
        nest: usize,
    },
}

struct MacroInvocation {
    def_index: usize,
    pos: usize,
}

struct StmtInput {
    code: String,
    map: Option<CodeMap>,
    uri: String,
    lineno: usize,
    rewind: Option<RewindPos>,
    source: LineSource,
    continuation_error: bool,
    from_macro: bool,
}

impl StmtInput {
    fn from_extracted(line: ExtractedLine) -> Self {
        Self {
            code: line.code,
            uri: line.uri,
            lineno: line.begin_line,
            rewind: Some(line.rewind),
            source: line.source,
            continuation_error: line.continuation_error,
            from_macro: false,
            map: Some(line.map),
        }
    }

    fn range(&self, start: usize, end: usize) -> Range {
        match &self.map {
            Some(map) => map.range(start, end),
            None => Range::line_span(self.lineno, start, end),
        }
    }

    fn full_range(&self) -> Range {
        self.range(0, self.code.chars().count())
    }

    fn seg_starts(&self) -> Vec<usize> {
        self.map
            .as_ref()
            .map(|m| m.segment_starts())
            .unwrap_or_else(|| vec![0])
    }

    fn location(&self) -> Location {
        Location::new(self.uri.clone(), Position::new(self.lineno, 0))
    }
}

/// A machine statement whose value checks wait on symbol resolution.
struct PendingMachine {
    uri: String,
    range: Range,
    exprs: Vec<AsmExpr>,
    instr: MachineInstr,
}

pub struct Analyzer {
    ids: IdStorage,
    opts: AnalyzerOptions,
    opcodes: OpcodeTable,
    ctx: OrdinaryAssemblyContext,
    ca: CaContext,
    provider: OpencodeProvider,
    library: Box<dyn CopybookResolver>,
    monitor: Box<dyn VirtualFileMonitor>,
    vf_handles: Vec<VirtualFileHandle>,
    macro_defs: Vec<MacroDefinition>,
    macro_index: HashMap<IdIndex, usize>,
    invocations: Vec<MacroInvocation>,
    mode: Mode,
    seq_opencode: HashMap<IdIndex, RewindPos>,
    pending_machine: Vec<PendingMachine>,
    produced: Vec<Statement>,
    diags: DiagnosticCollector,
    hl_tokens: Vec<HlToken>,
    literals: Vec<LiteralRef>,
    process_options: Vec<String>,
    statements: usize,
    rewinds: usize,
    sysndx: u32,
    end_seen: bool,
    cancel: CancelToken,
    requests: Option<Receiver<AnalysisRequest>>,
}

impl Analyzer {
    pub fn new(text: &str, opts: AnalyzerOptions) -> Self {
        let mut ids = IdStorage::new();
        let opcodes = OpcodeTable::new(&mut ids);
        let ca = CaContext::new(&mut ids);
        let provider = OpencodeProvider::new(Document::new(Vec::new()), opts.uri.clone(), opts.ictl);
        let mut analyzer = Self {
            ids,
            opcodes,
            ctx: OrdinaryAssemblyContext::new(),
            ca,
            provider,
            library: Box::new(InMemoryLibrary::new()),
            monitor: Box::new(VirtualFileRegistry::new()),
            vf_handles: Vec::new(),
            macro_defs: Vec::new(),
            macro_index: HashMap::new(),
            invocations: Vec::new(),
            mode: Mode::Ordinary,
            seq_opencode: HashMap::new(),
            pending_machine: Vec::new(),
            produced: Vec::new(),
            diags: DiagnosticCollector::new(opts.uri.clone()),
            hl_tokens: Vec::new(),
            literals: Vec::new(),
            process_options: Vec::new(),
            statements: 0,
            rewinds: 0,
            sysndx: 0,
            end_seen: false,
            cancel: CancelToken::default(),
            requests: None,
            opts,
        };
        analyzer.load_document(text);
        analyzer
    }

    pub fn with_library(mut self, library: Box<dyn CopybookResolver>) -> Self {
        self.library = library;
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn VirtualFileMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Open a request channel; the driver services it between statements.
    pub fn request_channel(&mut self) -> Sender<AnalysisRequest> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.requests = Some(rx);
        tx
    }

    fn load_document(&mut self, text: &str) {
        let mut doc = Document::from_text(text);
        if !self.opts.stages.is_empty() {
            let mut stages: Vec<Box<dyn Stage>> = self
                .opts
                .stages
                .iter()
                .map(|kind| -> Box<dyn Stage> {
                    match kind {
                        StageKind::Db2 => Box::new(Db2Stage::new()),
                        StageKind::Cics => Box::new(CicsStage::new()),
                        StageKind::Include => Box::new(IncludeStage::new()),
                    }
                })
                .collect();
            doc = run_pipeline(&mut stages, doc, self.library.as_mut(), &mut self.diags);
            // publish the preprocessed view so diagnostics in generated
            // lines have a real file behind them
            if doc.lines().iter().any(|l| !l.is_original()) {
                let handle = self.monitor.file_generated("PREPROCESSOR_1", &doc.text());
                self.vf_handles.push(handle);
            }
        }
        self.provider = OpencodeProvider::new(doc, self.opts.uri.clone(), self.opts.ictl);
    }

    // -- driver -----------------------------------------------------------

    pub fn analyze(mut self) -> AnalysisResult {
        info!(target: "analysis", uri = %self.opts.uri, "analysis started");
        let mut cancelled = false;
        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.service_requests();
            if self.statements >= self.opts.statement_limit {
                self.diags.add(Diagnostic::error(
                    "DEF006",
                    Range::default(),
                    "statement limit exceeded",
                ));
                break;
            }
            if self.end_seen {
                break;
            }

            if self.next_macro_statement() {
                continue;
            }

            match self
                .provider
                .extract_next(&mut self.ids, self.monitor.as_mut(), &mut self.vf_handles)
            {
                ProviderYield::Retry => continue,
                ProviderYield::Line(line) => match line.kind {
                    ExtractKind::Ictl => self.process_ictl_card(StmtInput::from_extracted(*line)),
                    ExtractKind::Process => {
                        let input = StmtInput::from_extracted(*line);
                        self.process_options.push(input.code.trim_end().to_owned());
                    }
                    ExtractKind::Normal => {
                        let input = StmtInput::from_extracted(*line);
                        self.handle_line(input);
                    }
                },
                ProviderYield::Finished => {
                    if !self.handle_stream_end() {
                        break;
                    }
                }
            }
        }

        self.finish_module(cancelled)
    }

    fn service_requests(&mut self) {
        let Some(rx) = &self.requests else { return };
        let mut cancel = false;
        while let Ok(req) = rx.try_recv() {
            match req {
                AnalysisRequest::Cancel => cancel = true,
                AnalysisRequest::Progress(reply) => {
                    let _ = reply.send(self.statements);
                }
            }
        }
        if cancel {
            self.cancel.cancel();
        }
    }

    /// Pull the next statement of the active macro expansion, if any.
    fn next_macro_statement(&mut self) -> bool {
        let Some(invocation) = self.invocations.last_mut() else {
            return false;
        };
        let def = &self.macro_defs[invocation.def_index];
        if invocation.pos >= def.body.len() {
            self.invocations.pop();
            self.ca.pop_frame();
            return true;
        }
        let body_line = def.body[invocation.pos].clone();
        let uri = def.location.uri.clone();
        invocation.pos += 1;

        let input = StmtInput {
            code: body_line.code,
            map: None,
            uri,
            lineno: body_line.lineno,
            rewind: None,
            source: LineSource::File,
            continuation_error: false,
            from_macro: true,
        };
        self.handle_line(input);
        true
    }

    /// End of provider input. Returns `true` when the driver should keep
    /// going (a lookahead or skip was unwound).
    fn handle_stream_end(&mut self) -> bool {
        match std::mem::replace(&mut self.mode, Mode::Ordinary) {
            Mode::Lookahead {
                targets,
                resume,
                trigger_uri,
                trigger_range,
                ..
            } => {
                self.finish_lookahead(targets, resume, trigger_uri, trigger_range);
                true
            }
            Mode::SeqSkip {
                target,
                origin_uri,
                origin_range,
            } => {
                let name = self.ids.resolve(target).to_owned();
                self.diags.add(
                    Diagnostic::error(
                        "SEM009",
                        origin_range,
                        format!("sequence symbol .{name} not found"),
                    )
                    .with_uri(origin_uri),
                );
                false
            }
            Mode::MacroCapture { .. } => {
                self.diags.add(Diagnostic::error(
                    "SEM013",
                    Range::default(),
                    "macro definition is missing MEND",
                ));
                false
            }
            Mode::Ordinary => false,
        }
    }

    fn finish_module(mut self, cancelled: bool) -> AnalysisResult {
        if !cancelled {
            self.pool_literals();
            self.ctx.finish_module_layout(&mut self.ids, &mut self.diags);
            self.drain_ready_checks();
            let drained = self.ctx.report_unresolved(&mut self.diags);
            self.recheck(drained);
        }

        let symbols = self
            .ctx
            .symbols_in_order()
            .map(|sym| {
                let value = match sym.value() {
                    SymbolValue::Undefined => SymbolView::Undefined,
                    SymbolValue::Abs(v) => SymbolView::Abs(v),
                    SymbolValue::Reloc(id) => {
                        let addr = self.ctx.reloc.get(id);
                        let section = addr
                            .bases
                            .first()
                            .map(|&(s, _)| self.ids.resolve(self.ctx.section(s).name).to_owned())
                            .unwrap_or_default();
                        SymbolView::Reloc {
                            section,
                            offset: addr.offset,
                            pending_spaces: addr.spaces.len(),
                        }
                    }
                };
                SymbolInfo {
                    name: self.ids.resolve(sym.name).to_owned(),
                    value,
                    length: sym.attrs.length,
                    type_attr: sym.attrs.type_attr,
                }
            })
            .collect();

        info!(
            target: "analysis",
            statements = self.statements,
            diagnostics = self.diags.diags().len(),
            rewinds = self.rewinds,
            cancelled,
            "analysis finished"
        );

        AnalysisResult {
            diagnostics: self.diags.take(),
            hl_tokens: self.hl_tokens,
            symbols,
            statements: self.produced,
            process_options: self.process_options,
            virtual_files: self.vf_handles,
            statements_processed: self.statements,
            rewinds: self.rewinds,
            cancelled,
        }
    }

    /// Literals collected from operands are poured into storage at end of
    /// module, before the layout is fixed, each aligned by its type.
    fn pool_literals(&mut self) {
        if self.literals.is_empty() {
            return;
        }
        let literals = std::mem::take(&mut self.literals);
        let mut seen: Vec<String> = Vec::new();
        for lit in literals {
            let key = lit.text.to_uppercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let body = &lit.text[1..];
            let Ok(dd) = parse_data_def(body, &mut self.ids) else {
                self.diags
                    .add(Diagnostic::error("SYN004", lit.range, "malformed literal"));
                continue;
            };
            let Some((implied, align)) = data_type_defaults(dd.type_char) else {
                continue;
            };
            let length = match dd.length {
                Some(LengthSpec::Fixed(n)) => n,
                _ => implied,
            };
            self.ctx.reserve_storage(&mut self.ids, 0, align);
            self.ctx
                .reserve_storage(&mut self.ids, length as usize, Alignment::NONE);
        }
    }

    // -- statement handling -----------------------------------------------

    fn handle_line(&mut self, input: StmtInput) {
        self.statements += 1;

        if is_comment(&input.code) {
            if matches!(self.mode, Mode::Ordinary) {
                self.hl_tokens
                    .push(HlToken::new(input.full_range(), HlScope::Comment));
            }
            return;
        }

        if let Mode::MacroCapture { .. } = self.mode {
            self.capture_macro_line(input);
            return;
        }

        if input.continuation_error
            && !matches!(self.mode, Mode::Lookahead { .. } | Mode::SeqSkip { .. })
        {
            // lookahead may read past text that a rewind later removes
            self.diags.add(
                Diagnostic::error("LEX001", input.range(0, 0), "invalid continuation record")
                    .with_uri(input.uri.clone()),
            );
        }

        let fp = parse_first_part(&input.code, &mut self.ids);

        match &self.mode {
            Mode::Lookahead { .. } => self.lookahead_step(fp, input),
            Mode::SeqSkip { .. } => self.seq_skip_step(fp, input),
            Mode::Ordinary | Mode::MacroCapture { .. } => self.ordinary_step(fp, input),
        }
    }

    fn resolve_instruction(&mut self, text: &str) -> (IdIndex, OpCode) {
        let id = self.ids.add(text);
        let op = self.opcodes.resolve(id, |candidate| {
            self.macro_index.contains_key(&candidate)
        });
        (id, op)
    }

    fn ordinary_step(&mut self, mut fp: parsers::FirstPart, input: StmtInput) {
        // sequence symbols become rewind anchors for backward AGO
        if let LabelField::Sequence { id } = fp.label {
            if !input.from_macro {
                if let Some(pos) = input.rewind {
                    self.seq_opencode.entry(id).or_insert(pos);
                }
            }
        }

        let Some(instr_raw) = fp.instruction.clone() else {
            return;
        };

        let instr_text = if instr_raw.contains('&') {
            let (subst, unknown) = substitute(&instr_raw, &mut self.ids, &self.ca);
            self.report_unknown_vars(&unknown, &input, fp.instr_range);
            subst
        } else {
            instr_raw
        };

        if !is_ordinary_name(&instr_text) {
            self.diags.add(
                Diagnostic::error(
                    "SYN002",
                    input.range(fp.instr_range.0, fp.instr_range.1),
                    "invalid operation code",
                )
                .with_uri(input.uri.clone()),
            );
            return;
        }

        let (instr_id, op) = self.resolve_instruction(&instr_text);

        // variable symbols in the name field substitute for everything but
        // the SET family, whose name field is the assignment target
        let set_target = matches!(
            op,
            OpCode::Ca(CaOp::Seta | CaOp::Setb | CaOp::Setc | CaOp::Aread)
        );
        if !set_target
            && matches!(
                fp.label,
                LabelField::Variable { .. } | LabelField::Concat { .. }
            )
        {
            let label_text: String = {
                let chars: Vec<char> = input.code.chars().collect();
                chars[fp.label_range.0..fp.label_range.1].iter().collect()
            };
            if label_text.contains('&') {
                let (subst, unknown) = substitute(&label_text, &mut self.ids, &self.ca);
                self.report_unknown_vars(&unknown, &input, fp.label_range);
                fp.label = parsers::classify_label(subst.trim(), &mut self.ids);
            }
        }

        // gather the operand field (continuation-aware), substitute late
        let raw_field = collect_operand_field(&input.code, fp.rest_offset, &input.seg_starts());
        let remark_ranges: Vec<Range> = raw_field
            .remarks
            .iter()
            .map(|&(start, end)| input.range(start, end))
            .collect();
        let field = self.substituted_field(raw_field, &input, op);

        // typed operand parse, so attribute lookahead can fire before any
        // side effect and the statement carries real operand values
        let (parsed, operand_diags) = self.parse_operands(op, &field, &input);

        let trigger_exprs: Vec<&AsmExpr> = match &parsed {
            ParsedOps::Exprs { exprs, .. } => exprs.iter().map(|(e, _)| e).collect(),
            ParsedOps::Data { defs, .. } => defs
                .iter()
                .flat_map(|(dd, _)| {
                    dd.dup_factor.iter().chain(match &dd.length {
                        Some(LengthSpec::Expr(e)) => Some(e),
                        _ => None,
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        if self.try_trigger_lookahead(&trigger_exprs, &input) {
            return;
        }

        // assemble the statement
        let mut collector = Collector::new();
        collector.set_label(fp.label.clone(), input.range(fp.label_range.0, fp.label_range.1));
        collector.set_instruction(
            InstructionField::Ordinary { id: instr_id },
            input.range(fp.instr_range.0, fp.instr_range.1),
        );
        collector.add_hl_token(HlToken::new(
            input.range(fp.instr_range.0, fp.instr_range.1),
            HlScope::Instruction,
        ));
        if !fp.label.is_empty() {
            let scope = match fp.label {
                LabelField::Sequence { .. } => HlScope::SeqSymbol,
                LabelField::Variable { .. } => HlScope::VarSymbol,
                _ => HlScope::Label,
            };
            collector.add_hl_token(HlToken::new(
                input.range(fp.label_range.0, fp.label_range.1),
                scope,
            ));
        }
        collector.set_remarks(remark_ranges);
        for diag in operand_diags {
            self.diags.add(diag.clone());
            collector.add_diagnostic(diag);
        }
        match &parsed {
            ParsedOps::DeferredMacro => {
                let range = input.range(
                    field.source_offset(0),
                    field.source_offset(field.text.chars().count()),
                );
                collector.set_deferred_operands(field.text.clone(), range);
            }
            ParsedOps::Exprs { operands, .. } | ParsedOps::Data { operands, .. } => {
                collector.set_operands(operands.clone());
            }
            ParsedOps::Text(operands) => collector.set_operands(operands.clone()),
        }
        if op == OpCode::Unknown {
            collector.add_diagnostic(
                Diagnostic::error(
                    "SEM001",
                    input.range(fp.instr_range.0, fp.instr_range.1),
                    format!("undefined operation code {instr_text}"),
                )
                .with_uri(input.uri.clone()),
            );
            self.diags.add(
                Diagnostic::error(
                    "SEM001",
                    input.range(fp.instr_range.0, fp.instr_range.1),
                    format!("undefined operation code {instr_text}"),
                )
                .with_uri(input.uri.clone()),
            );
        }
        let extracted = collector.extract_statement(op.form(), input.full_range());
        self.hl_tokens.extend(extracted.hl_tokens.iter().copied());
        self.literals.extend(extracted.literals.iter().cloned());

        match op {
            OpCode::Machine(instr) => {
                if let ParsedOps::Exprs { exprs, count, .. } = parsed {
                    self.process_machine(instr, &fp, exprs, count, input);
                }
            }
            OpCode::Asm(AsmOp::Equ) => {
                if let ParsedOps::Exprs { exprs, .. } = parsed {
                    self.process_equ(&fp, exprs, input);
                }
                self.drain_ready_checks();
            }
            OpCode::Asm(AsmOp::Dc | AsmOp::Ds | AsmOp::Dxd) => {
                if let ParsedOps::Data { defs, .. } = parsed {
                    self.process_data(&fp, defs, input);
                }
                self.drain_ready_checks();
            }
            OpCode::Asm(asm_op) => self.process_asm(asm_op, fp, field, input),
            OpCode::Ca(ca_op) => self.process_ca(ca_op, fp, field, input),
            OpCode::Macro => self.process_macro_call(instr_id, fp, field, input),
            OpCode::Unknown => {}
        }

        self.produced.push(extracted.statement);
    }

    /// Parse the operand field according to the processing form.
    fn parse_operands(
        &mut self,
        op: OpCode,
        field: &OperandField,
        input: &StmtInput,
    ) -> (ParsedOps, Vec<Diagnostic>) {
        let mut diags = Vec::new();
        match op {
            OpCode::Macro => (ParsedOps::DeferredMacro, diags),
            OpCode::Machine(_) | OpCode::Asm(AsmOp::Equ) => {
                let mut exprs = Vec::new();
                let mut operands = Vec::new();
                let mut count = 0usize;
                if !field.text.is_empty() {
                    for (text, off) in parsers::split_operand_list(&field.text) {
                        let text = text.trim();
                        let range = input.range(
                            field.source_offset(off),
                            field.source_offset(off + text.chars().count()),
                        );
                        if text.is_empty() {
                            operands.push(Operand::Empty { range });
                            continue;
                        }
                        count += 1;
                        if is_literal(text) {
                            self.literals.push(LiteralRef {
                                text: text.to_owned(),
                                range,
                            });
                            operands.push(Operand::Text {
                                text: text.to_owned(),
                                range,
                            });
                            exprs.push((AsmExpr::Num(0), range));
                            continue;
                        }
                        match core_context::parse_expr(text, &mut self.ids) {
                            Ok((expr, used)) if used == text.len() => {
                                operands.push(Operand::Expr {
                                    expr: expr.clone(),
                                    range,
                                });
                                exprs.push((expr, range));
                            }
                            _ => {
                                diags.push(
                                    Diagnostic::error(
                                        "SYN003",
                                        range,
                                        "invalid operand expression",
                                    )
                                    .with_uri(input.uri.clone()),
                                );
                            }
                        }
                    }
                }
                (
                    ParsedOps::Exprs {
                        exprs,
                        operands,
                        count,
                    },
                    diags,
                )
            }
            OpCode::Asm(AsmOp::Dc | AsmOp::Ds | AsmOp::Dxd) => {
                let mut defs = Vec::new();
                let mut operands = Vec::new();
                for (text, off) in parsers::split_operand_list(&field.text) {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let range = input.range(
                        field.source_offset(off),
                        field.source_offset(off + text.chars().count()),
                    );
                    match parse_data_def(text, &mut self.ids) {
                        Ok(dd) => {
                            operands.push(Operand::Data {
                                def: dd.clone(),
                                range,
                            });
                            defs.push((dd, range));
                        }
                        Err(err) => {
                            diags.push(
                                Diagnostic::error("SYN004", range, err.to_string())
                                    .with_uri(input.uri.clone()),
                            );
                        }
                    }
                }
                (ParsedOps::Data { defs, operands }, diags)
            }
            _ => {
                let mut operands = Vec::new();
                if !field.text.is_empty() {
                    for (text, off) in parsers::split_operand_list(&field.text) {
                        let range = input.range(
                            field.source_offset(off),
                            field.source_offset(off + text.chars().count()),
                        );
                        if text.is_empty() {
                            operands.push(Operand::Empty { range });
                        } else {
                            operands.push(Operand::Text { text, range });
                        }
                    }
                }
                (ParsedOps::Text(operands), diags)
            }
        }
    }

    /// Substitute variable symbols in the operand field. SET targets keep
    /// their name field raw; operand text substitutes for everything
    /// except macro calls, whose operands defer to invocation binding.
    fn substituted_field(
        &mut self,
        mut field: OperandField,
        input: &StmtInput,
        _op: OpCode,
    ) -> OperandField {
        if field.text.contains('&') {
            let (subst, unknown) = substitute(&field.text, &mut self.ids, &self.ca);
            self.report_unknown_vars(&unknown, input, (0, 0));
            if subst != field.text {
                // offsets no longer track chars exactly; anchor everything
                // at the field start
                let anchor = field.offsets.first().copied().unwrap_or(0);
                field.offsets = vec![anchor; subst.chars().count() + 1];
                field.text = subst;
            }
        }
        field
    }

    fn report_unknown_vars(&mut self, unknown: &[String], input: &StmtInput, range: (usize, usize)) {
        for name in unknown {
            self.diags.add(
                Diagnostic::warning(
                    "SEM020",
                    input.range(range.0, range.1),
                    format!("undefined variable symbol &{name}"),
                )
                .with_uri(input.uri.clone()),
            );
        }
    }

    // -- lookahead --------------------------------------------------------

    /// Attribute references whose value is still unknown start a lookahead
    /// pass. Only document statements trigger; everything else resolves
    /// through the dependency tables.
    fn try_trigger_lookahead(&mut self, exprs: &[&AsmExpr], input: &StmtInput) -> bool {
        if input.from_macro || input.source != LineSource::File {
            return false;
        }
        if !matches!(self.mode, Mode::Ordinary) {
            return false;
        }
        let Some(resume) = input.rewind else {
            return false;
        };
        let mut refs = Vec::new();
        for expr in exprs {
            expr.attr_refs(&mut refs);
        }
        let mut targets: Vec<(AttrKind, IdIndex)> = Vec::new();
        for (attr, sym) in refs {
            if self.ctx.attribute(sym, attr).is_none() && !targets.contains(&(attr, sym)) {
                targets.push((attr, sym));
            }
        }
        if targets.is_empty() {
            return false;
        }
        debug!(target: "provider", targets = targets.len(), "attribute lookahead");
        self.mode = Mode::Lookahead {
            targets,
            resume,
            trigger_uri: input.uri.clone(),
            trigger_range: input.full_range(),
            macro_nest: 0,
        };
        true
    }

    fn lookahead_step(&mut self, fp: parsers::FirstPart, input: StmtInput) {
        let Some(instr_text) = fp.instruction.clone() else {
            return;
        };
        if !is_ordinary_name(&instr_text) {
            return;
        }
        let (_, op) = self.resolve_instruction(&instr_text);

        // macro definitions are opaque to lookahead
        if let Mode::Lookahead { macro_nest, .. } = &mut self.mode {
            match op {
                OpCode::Ca(CaOp::Macro) => {
                    *macro_nest += 1;
                    return;
                }
                OpCode::Ca(CaOp::Mend) if *macro_nest > 0 => {
                    *macro_nest -= 1;
                    return;
                }
                _ if *macro_nest > 0 => return,
                _ => {}
            }
        }

        match op {
            OpCode::Asm(AsmOp::Copy) => {
                // lookahead follows COPY members, quietly
                let field = collect_operand_field(&input.code, fp.rest_offset, &input.seg_starts());
                self.enter_copy_member(field.text.trim(), &input, true);
                return;
            }
            OpCode::Asm(AsmOp::End) => {
                self.end_of_lookahead_input();
                return;
            }
            _ => {}
        }

        let Some(label_id) = fp.label.ordinary_id() else {
            return;
        };
        let Mode::Lookahead { targets, .. } = &self.mode else {
            unreachable!("lookahead_step runs in lookahead mode");
        };
        if !targets.iter().any(|&(_, sym)| sym == label_id) {
            return;
        }

        // only EQU, COPY and labeled DC/DS/DXD need operand parsing here
        let attrs = match op {
            OpCode::Machine(m) => SymbolAttributes::machine(m.length),
            OpCode::Asm(AsmOp::Dc | AsmOp::Ds | AsmOp::Dxd) => {
                let field = collect_operand_field(&input.code, fp.rest_offset, &input.seg_starts());
                let first = parsers::split_operand_list(&field.text)
                    .into_iter()
                    .next()
                    .map(|(text, _)| text)
                    .unwrap_or_default();
                match parse_data_def(&first, &mut self.ids) {
                    Ok(dd) => {
                        let implied = data_type_defaults(dd.type_char).map_or(1, |(l, _)| l);
                        let length = match dd.length {
                            Some(LengthSpec::Fixed(n)) => n,
                            Some(LengthSpec::Expr(_)) | None => match (&dd.nominal, dd.type_char) {
                                (Some(nominal), 'C') => nominal.chars().count() as u32,
                                (Some(nominal), 'X') => (nominal.len() as u32 + 1) / 2,
                                _ => implied,
                            },
                        };
                        SymbolAttributes::data(dd.type_char, length)
                    }
                    Err(_) => SymbolAttributes::default(),
                }
            }
            _ => SymbolAttributes::default(),
        };
        self.ctx.record_lookahead_attrs(label_id, attrs);

        let Mode::Lookahead { targets, .. } = &mut self.mode else {
            unreachable!();
        };
        targets.retain(|&(_, sym)| sym != label_id);
        if targets.is_empty() {
            self.end_of_lookahead_input();
        }
    }

    fn end_of_lookahead_input(&mut self) {
        if let Mode::Lookahead {
            targets,
            resume,
            trigger_uri,
            trigger_range,
            ..
        } = std::mem::replace(&mut self.mode, Mode::Ordinary)
        {
            self.finish_lookahead(targets, resume, trigger_uri, trigger_range);
        }
    }

    /// Defaults for anything still missing, then rewind to the trigger.
    fn finish_lookahead(
        &mut self,
        targets: Vec<(AttrKind, IdIndex)>,
        resume: RewindPos,
        trigger_uri: String,
        trigger_range: Range,
    ) {
        for (_, sym) in targets {
            self.ctx
                .record_lookahead_attrs(sym, SymbolAttributes::default());
            let name = self.ids.resolve(sym).to_owned();
            self.diags.add(
                Diagnostic::warning(
                    "DEF005",
                    trigger_range,
                    format!("attribute of {name} is unknown; using defaults"),
                )
                .with_uri(trigger_uri.clone()),
            );
        }
        self.provider.rewind_input(resume);
        self.rewinds += 1;
        self.mode = Mode::Ordinary;
    }

    fn seq_skip_step(&mut self, fp: parsers::FirstPart, input: StmtInput) {
        let Mode::SeqSkip { target, .. } = &self.mode else {
            unreachable!("seq_skip_step runs in skip mode");
        };
        let target = *target;

        if let LabelField::Sequence { id } = fp.label {
            if !input.from_macro {
                if let Some(pos) = input.rewind {
                    self.seq_opencode.entry(id).or_insert(pos);
                }
            }
            if id == target {
                self.mode = Mode::Ordinary;
                self.ordinary_step(fp, input);
            }
        }
    }

    // -- conditional assembly ---------------------------------------------

    fn process_ca(
        &mut self,
        op: CaOp,
        fp: parsers::FirstPart,
        field: OperandField,
        input: StmtInput,
    ) {
        match op {
            CaOp::Gbla | CaOp::Gblb | CaOp::Gblc | CaOp::Lcla | CaOp::Lclb | CaOp::Lclc => {
                let set_type = op.set_type().expect("declaration ops have a type");
                let global = matches!(op, CaOp::Gbla | CaOp::Gblb | CaOp::Gblc);
                for (operand, _) in parsers::split_operand_list(&field.text) {
                    let operand = operand.trim();
                    if operand.is_empty() {
                        continue;
                    }
                    let Some((name, dimensioned)) = parse_var_decl(operand, &mut self.ids) else {
                        self.diags.add(
                            Diagnostic::error("SYN005", input.full_range(), "invalid variable symbol")
                                .with_uri(input.uri.clone()),
                        );
                        continue;
                    };
                    if let Err(err) = self.ca.declare(name, set_type, !dimensioned, global) {
                        self.diags.add(
                            Diagnostic::error("SEM021", input.full_range(), err.to_string())
                                .with_uri(input.uri.clone()),
                        );
                    }
                }
            }
            CaOp::Seta | CaOp::Setb | CaOp::Setc => {
                self.process_set(op, fp, field, &input);
            }
            CaOp::Aif => self.process_aif(field, input),
            CaOp::Ago => self.process_ago(field, input),
            CaOp::Anop => {}
            CaOp::Actr => {
                if let Some(limit) = self.eval_abs(&field.text) {
                    self.ca.frame_mut().actr = i64::from(limit);
                }
            }
            CaOp::Aread => self.process_aread(fp, input),
            CaOp::Macro => {
                self.mode = Mode::MacroCapture { def: None, nest: 0 };
            }
            CaOp::Mend => {
                if self.invocations.is_empty() {
                    self.diags.add(
                        Diagnostic::error("SEM014", input.full_range(), "MEND outside a macro")
                            .with_uri(input.uri.clone()),
                    );
                }
            }
            CaOp::Mexit => {
                if self.invocations.pop().is_some() {
                    self.ca.pop_frame();
                } else {
                    self.diags.add(
                        Diagnostic::error("SEM014", input.full_range(), "MEXIT outside a macro")
                            .with_uri(input.uri.clone()),
                    );
                }
            }
        }
    }

    fn process_set(
        &mut self,
        op: CaOp,
        fp: parsers::FirstPart,
        field: OperandField,
        input: &StmtInput,
    ) {
        let label_text: String = {
            let chars: Vec<char> = input.code.chars().collect();
            chars[fp.label_range.0..fp.label_range.1].iter().collect()
        };
        let Some((name, index)) = parse_set_target(&label_text, &mut self.ids, &self.ca) else {
            self.diags.add(
                Diagnostic::error(
                    "SEM022",
                    input.range(fp.label_range.0, fp.label_range.1),
                    "SET statement requires a variable symbol label",
                )
                .with_uri(input.uri.clone()),
            );
            return;
        };

        let value = match op {
            CaOp::Seta => self.eval_abs(&field.text).map(SetValue::A),
            CaOp::Setb => {
                let inner = field
                    .text
                    .trim()
                    .strip_prefix('(')
                    .and_then(|t| t.strip_suffix(')'))
                    .unwrap_or(field.text.trim());
                eval_condition(inner, &mut self.ids, &self.ctx)
                    .ok()
                    .map(SetValue::B)
            }
            CaOp::Setc => {
                let trimmed = field.text.trim();
                let value = trimmed
                    .strip_prefix('\'')
                    .and_then(|t| t.strip_suffix('\''))
                    .map(|t| t.replace("''", "'"))
                    .unwrap_or_else(|| trimmed.to_owned());
                Some(SetValue::C(value))
            }
            _ => unreachable!("process_set only handles SET ops"),
        };

        let Some(value) = value else {
            self.diags.add(
                Diagnostic::error("SEM007", input.full_range(), "invalid SET operand")
                    .with_uri(input.uri.clone()),
            );
            return;
        };

        // scalar subscripting is tolerated with a warning
        if let Some(idx) = index {
            let scalar = self
                .ca
                .frame()
                .locals
                .get(&name)
                .or_else(|| self.ca.globals.get(&name))
                .is_some_and(|s| s.is_scalar);
            if scalar && idx > 0 {
                self.diags.add(
                    Diagnostic::warning(
                        "SEM023",
                        input.range(fp.label_range.0, fp.label_range.1),
                        "subscript on a scalar SET symbol",
                    )
                    .with_uri(input.uri.clone()),
                );
            }
        }

        if let Err(err) = self.ca.assign(name, index, value) {
            self.diags.add(
                Diagnostic::error("SEM021", input.full_range(), err.to_string())
                    .with_uri(input.uri.clone()),
            );
        }
    }

    fn process_aif(&mut self, field: OperandField, input: StmtInput) {
        for (operand, _) in parsers::split_operand_list(&field.text) {
            let operand = operand.trim();
            if operand.is_empty() {
                continue;
            }
            let Some((condition, target)) = split_aif_operand(operand) else {
                self.diags.add(
                    Diagnostic::error("SYN006", input.full_range(), "malformed AIF operand")
                        .with_uri(input.uri.clone()),
                );
                return;
            };
            match eval_condition(condition, &mut self.ids, &self.ctx) {
                Ok(true) => {
                    let target = self.ids.add(target);
                    self.branch_to(target, input);
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    self.diags.add(
                        Diagnostic::error("SEM007", input.full_range(), err.to_string())
                            .with_uri(input.uri.clone()),
                    );
                    return;
                }
            }
        }
    }

    fn process_ago(&mut self, field: OperandField, input: StmtInput) {
        let operand = field.text.trim();
        let Some(target) = operand.strip_prefix('.') else {
            self.diags.add(
                Diagnostic::error("SYN006", input.full_range(), "malformed AGO operand")
                    .with_uri(input.uri.clone()),
            );
            return;
        };
        let target = self.ids.add(target);
        self.branch_to(target, input);
    }

    fn branch_to(&mut self, target: IdIndex, input: StmtInput) {
        let frame = self.ca.frame_mut();
        frame.actr -= 1;
        if frame.actr < 0 {
            self.diags.add(
                Diagnostic::error("SEM008", input.full_range(), "ACTR limit exceeded")
                    .with_uri(input.uri.clone()),
            );
            if self.invocations.pop().is_some() {
                self.ca.pop_frame();
            }
            return;
        }

        if let Some(invocation) = self.invocations.last_mut() {
            let def = &self.macro_defs[invocation.def_index];
            match def.seq_symbols.get(&target) {
                Some(&pos) => invocation.pos = pos,
                None => {
                    let name = self.ids.resolve(target).to_owned();
                    self.diags.add(
                        Diagnostic::error(
                            "SEM009",
                            input.full_range(),
                            format!("sequence symbol .{name} not found"),
                        )
                        .with_uri(input.uri.clone()),
                    );
                }
            }
            return;
        }

        match self.seq_opencode.get(&target) {
            Some(&pos) => {
                // backward branch: a rewind, which also drops the AINSERT
                // buffer
                self.provider.rewind_input(pos);
                self.rewinds += 1;
            }
            None => {
                self.mode = Mode::SeqSkip {
                    target,
                    origin_uri: input.uri.clone(),
                    origin_range: input.full_range(),
                };
            }
        }
    }

    fn process_aread(&mut self, fp: parsers::FirstPart, input: StmtInput) {
        let label_text: String = {
            let chars: Vec<char> = input.code.chars().collect();
            chars[fp.label_range.0..fp.label_range.1].iter().collect()
        };
        let Some((name, index)) = parse_set_target(&label_text, &mut self.ids, &self.ca) else {
            self.diags.add(
                Diagnostic::error(
                    "SEM022",
                    input.range(fp.label_range.0, fp.label_range.1),
                    "AREAD requires a variable symbol label",
                )
                .with_uri(input.uri.clone()),
            );
            return;
        };
        let record = self.provider.aread();
        if let Err(err) = self.ca.assign(name, index, SetValue::C(record)) {
            self.diags.add(
                Diagnostic::error("SEM021", input.full_range(), err.to_string())
                    .with_uri(input.uri.clone()),
            );
        }
    }

    // -- macro definition and expansion -----------------------------------

    fn capture_macro_line(&mut self, input: StmtInput) {
        let fp = parse_first_part(&input.code, &mut self.ids);
        let instr = fp.instruction.as_deref().unwrap_or("");

        let Mode::MacroCapture { def, nest } = &mut self.mode else {
            unreachable!("capture_macro_line runs in capture mode");
        };

        match def {
            None => {
                // this statement is the prototype
                match MacroDefinition::from_prototype(&input.code, &mut self.ids, input.location())
                {
                    Some(proto) => *def = Some(proto),
                    None => {
                        self.diags.add(
                            Diagnostic::error(
                                "SYN007",
                                input.full_range(),
                                "invalid macro prototype",
                            )
                            .with_uri(input.uri.clone()),
                        );
                        self.mode = Mode::Ordinary;
                    }
                }
            }
            Some(definition) => {
                if instr.eq_ignore_ascii_case("MACRO") {
                    *nest += 1;
                    definition.push_body_line(input.code.clone(), input.lineno, &mut self.ids);
                } else if instr.eq_ignore_ascii_case("MEND") {
                    if *nest > 0 {
                        *nest -= 1;
                        definition.push_body_line(input.code.clone(), input.lineno, &mut self.ids);
                    } else {
                        let Mode::MacroCapture { def: Some(done), .. } =
                            std::mem::replace(&mut self.mode, Mode::Ordinary)
                        else {
                            unreachable!();
                        };
                        debug!(target: "analysis", name = self.ids.resolve(done.name), "macro defined");
                        let index = self.macro_defs.len();
                        self.macro_index.insert(done.name, index);
                        self.macro_defs.push(done);
                    }
                } else {
                    definition.push_body_line(input.code.clone(), input.lineno, &mut self.ids);
                }
            }
        }
    }

    fn process_macro_call(
        &mut self,
        name: IdIndex,
        fp: parsers::FirstPart,
        field: OperandField,
        input: StmtInput,
    ) {
        let def_index = self.macro_index[&name];

        let label_text: String = {
            let chars: Vec<char> = input.code.chars().collect();
            chars[fp.label_range.0..fp.label_range.1].iter().collect()
        };
        let label = if label_text.contains('&') {
            substitute(&label_text, &mut self.ids, &self.ca).0
        } else {
            label_text
        };

        let operands: Vec<String> = if field.text.is_empty() {
            Vec::new()
        } else {
            parsers::split_operand_list(&field.text)
                .into_iter()
                .map(|(text, _)| text)
                .collect()
        };

        self.sysndx += 1;
        let sysect = self
            .ctx
            .current_section()
            .map(|s| self.ids.resolve(self.ctx.section(s).name).to_owned())
            .unwrap_or_default();

        let def = &self.macro_defs[def_index];
        let frame = build_invocation_frame(def, &label, &operands, self.sysndx, sysect, &mut self.ids);
        self.ca.push_frame(frame);
        self.invocations.push(MacroInvocation { def_index, pos: 0 });
    }

    // -- assembler operations ---------------------------------------------

    fn process_asm(
        &mut self,
        op: AsmOp,
        fp: parsers::FirstPart,
        field: OperandField,
        input: StmtInput,
    ) {
        match op {
            AsmOp::Equ | AsmOp::Dc | AsmOp::Ds | AsmOp::Dxd => {
                unreachable!("typed operand forms dispatch before process_asm")
            }
            AsmOp::Csect => self.process_section(SectionKind::Executable, fp, input),
            AsmOp::Rsect => self.process_section(SectionKind::ReadOnly, fp, input),
            AsmOp::Dsect => self.process_section(SectionKind::Dummy, fp, input),
            AsmOp::Com => self.process_section(SectionKind::Common, fp, input),
            AsmOp::Loctr => self.process_loctr(fp, input),
            AsmOp::Copy => {
                self.enter_copy_member(field.text.trim(), &input, false);
            }
            AsmOp::Ictl => {
                self.diags.add(
                    Diagnostic::error(
                        "LEX002",
                        input.full_range(),
                        "ICTL must precede all other statements",
                    )
                    .with_uri(input.uri.clone()),
                );
            }
            AsmOp::Ainsert => self.process_ainsert(field, input),
            AsmOp::Mnote => self.process_mnote(field, input),
            AsmOp::End => {
                self.end_seen = true;
            }
        }
        self.drain_ready_checks();
    }

    fn process_equ(
        &mut self,
        fp: &parsers::FirstPart,
        exprs: Vec<(AsmExpr, Range)>,
        input: StmtInput,
    ) {
        let Some(label_id) = fp.label.ordinary_id() else {
            self.diags.add(
                Diagnostic::error("SEM005", input.full_range(), "EQU requires a name")
                    .with_uri(input.uri.clone()),
            );
            return;
        };
        let Some((expr, _)) = exprs.into_iter().next() else {
            self.diags.add(
                Diagnostic::error("SYN003", input.full_range(), "EQU requires an expression")
                    .with_uri(input.uri.clone()),
            );
            return;
        };

        let mut undefined = Vec::new();
        expr.undefined_symbols(&self.ctx, &mut undefined);

        let loctr_capture = if expr_mentions_loctr(&expr) {
            let addr = self.ctx.current_address(&mut self.ids);
            Some(self.ctx.reloc.install(addr))
        } else {
            None
        };

        if undefined.is_empty() {
            let loctr = loctr_capture.map(|id| self.ctx.reloc.get(id).clone());
            let value = expr.eval(&self.ctx, loctr.as_ref());
            if let Some(id) = loctr_capture {
                self.ctx.reloc.remove(id);
            }
            let value = match value {
                Ok(EvalValue::Abs(v)) => SymbolValue::Abs(v),
                Ok(EvalValue::Reloc(addr)) => SymbolValue::Reloc(self.ctx.reloc.install(addr)),
                Err(err) => {
                    self.diags.add(
                        Diagnostic::error("SEM007", input.full_range(), err.to_string())
                            .with_uri(input.uri.clone()),
                    );
                    return;
                }
            };
            self.define_symbol(label_id, value, SymbolAttributes::default(), &input);
            return;
        }

        // forward reference: create the symbol undefined and let the
        // solver fill it in
        if let Err(err) = self.ctx.create_symbol(
            &mut self.ids,
            label_id,
            SymbolValue::Undefined,
            SymbolAttributes::default(),
            Some(input.location()),
            &mut self.diags,
        ) {
            self.report_context_error(err, label_id, &input);
            if let Some(id) = loctr_capture {
                self.ctx.reloc.remove(id);
            }
            return;
        }
        let postponed = PostponedCheck {
            kind: PostponedKind::EquValue,
            uri: input.uri.clone(),
            range: input.full_range(),
        };
        let result = self.ctx.add_dependency(
            &mut self.ids,
            label_id,
            DependencySource::Expr(ExprResolver {
                expr,
                loctr: loctr_capture,
            }),
            Some(postponed),
            &mut self.diags,
        );
        if result.is_err() {
            self.diags.add(
                Diagnostic::error("DEF002", input.full_range(), "cyclic symbol definition")
                    .with_uri(input.uri.clone()),
            );
        }
    }

    fn process_data(
        &mut self,
        fp: &parsers::FirstPart,
        defs: Vec<(DataDef, Range)>,
        input: StmtInput,
    ) {
        if defs.is_empty() {
            return;
        }

        for (index, (dd, _)) in defs.iter().enumerate() {
            let (implied, align) = data_type_defaults(dd.type_char)
                .expect("parse_data_def validated the type");

            let element_align = if dd.length.is_some() {
                // an explicit length modifier turns off alignment
                Alignment::NONE
            } else {
                align
            };
            let label_addr = self.ctx.reserve_storage(&mut self.ids, 0, element_align);

            if index == 0 {
                if let Some(label_id) = fp.label.ordinary_id() {
                    let length_attr = match &dd.length {
                        Some(LengthSpec::Fixed(n)) => *n,
                        Some(LengthSpec::Expr(_)) => implied,
                        None => nominal_length(dd, implied),
                    };
                    let installed = self.ctx.reloc.install(label_addr.clone());
                    self.define_symbol(
                        label_id,
                        SymbolValue::Reloc(installed),
                        SymbolAttributes::data(dd.type_char, length_attr),
                        &input,
                    );
                }
            }

            let dup = match &dd.dup_factor {
                None => Some(1i64),
                Some(expr) => {
                    let mut undef = Vec::new();
                    expr.undefined_symbols(&self.ctx, &mut undef);
                    if undef.is_empty() {
                        expr.eval(&self.ctx, None)
                            .ok()
                            .and_then(|v| v.as_abs())
                            .map(i64::from)
                    } else {
                        None
                    }
                }
            };
            let Some(dup) = dup.filter(|&d| d >= 0) else {
                self.diags.add(
                    Diagnostic::error(
                        "SEM006",
                        input.full_range(),
                        "duplication factor must be a previously defined non-negative value",
                    )
                    .with_uri(input.uri.clone()),
                );
                continue;
            };

            match self.data_element_length(dd) {
                LengthKnown::Known(len) => {
                    self.ctx
                        .reserve_storage(&mut self.ids, (len as i64 * dup) as usize, Alignment::NONE);
                }
                LengthKnown::Deferred(expr) => {
                    // `*` in the length expression is the statement's own
                    // address, captured before the space joins the counter
                    let space = self.ctx.register_space(&mut self.ids);
                    let loctr = self.ctx.reloc.install(label_addr.clone());
                    let total = if dup == 1 {
                        expr
                    } else {
                        AsmExpr::Bin(
                            core_context::BinOp::Mul,
                            Box::new(AsmExpr::Num(dup as i32)),
                            Box::new(expr),
                        )
                    };
                    let postponed = PostponedCheck {
                        kind: PostponedKind::SpaceLength,
                        uri: input.uri.clone(),
                        range: input.full_range(),
                    };
                    let result = self.ctx.add_space_dependency(
                        &mut self.ids,
                        space,
                        DependencySource::Expr(ExprResolver {
                            expr: total,
                            loctr: Some(loctr),
                        }),
                        Some(postponed),
                        &mut self.diags,
                    );
                    if result.is_err() {
                        self.diags.add(
                            Diagnostic::error(
                                "DEF002",
                                input.full_range(),
                                "cyclic length dependency",
                            )
                            .with_uri(input.uri.clone()),
                        );
                    }
                }
            }
        }
    }

    fn data_element_length(&mut self, dd: &core_semantics::DataDef) -> LengthKnown {
        let implied = data_type_defaults(dd.type_char).map_or(1, |(l, _)| l);
        match &dd.length {
            Some(LengthSpec::Fixed(n)) => LengthKnown::Known(*n),
            Some(LengthSpec::Expr(expr)) => {
                let mut undef = Vec::new();
                expr.undefined_symbols(&self.ctx, &mut undef);
                if undef.is_empty() {
                    match expr.eval(&self.ctx, None).ok().and_then(|v| v.as_abs()) {
                        Some(v) if v >= 0 => LengthKnown::Known(v as u32),
                        _ => LengthKnown::Deferred(expr.clone()),
                    }
                } else {
                    LengthKnown::Deferred(expr.clone())
                }
            }
            None => LengthKnown::Known(nominal_length(dd, implied)),
        }
    }

    fn process_section(&mut self, kind: SectionKind, fp: parsers::FirstPart, input: StmtInput) {
        let name = fp.label.ordinary_id().unwrap_or(IdIndex::EMPTY);
        match self.ctx.set_section(
            &mut self.ids,
            name,
            kind,
            Some(input.location()),
            &mut self.diags,
        ) {
            Ok(_) => {}
            Err(err) => self.report_context_error(err, name, &input),
        }
    }

    fn process_loctr(&mut self, fp: parsers::FirstPart, input: StmtInput) {
        let Some(name) = fp.label.ordinary_id() else {
            self.diags.add(
                Diagnostic::error("SEM005", input.full_range(), "LOCTR requires a name")
                    .with_uri(input.uri.clone()),
            );
            return;
        };
        if let Err(err) = self.ctx.set_location_counter(
            &mut self.ids,
            name,
            Some(input.location()),
            &mut self.diags,
        ) {
            self.report_context_error(err, name, &input);
        }
    }

    fn enter_copy_member(&mut self, member: &str, input: &StmtInput, quiet: bool) {
        if !is_ordinary_name(member) {
            if !quiet {
                self.diags.add(
                    Diagnostic::error("SYN008", input.full_range(), "invalid COPY member name")
                        .with_uri(input.uri.clone()),
                );
            }
            return;
        }
        let member_id = self.ids.add(member);
        if self.provider.in_copy(member_id) {
            if !quiet {
                let name = self.ids.resolve(member_id).to_owned();
                self.diags.add(
                    Diagnostic::error(
                        "SEM012",
                        input.full_range(),
                        format!("recursive COPY of member {name}"),
                    )
                    .with_uri(input.uri.clone()),
                );
            }
            return;
        }
        let name = self.ids.resolve(member_id).to_owned();
        match self.library.resolve(&name) {
            Some(text) => {
                let uri = format!("copy://{name}");
                self.provider.push_copy(CopyFrame::new(member_id, uri, text));
            }
            None => {
                if !quiet {
                    self.diags.add(
                        Diagnostic::error(
                            "SEM011",
                            input.full_range(),
                            format!("COPY member {name} not found"),
                        )
                        .with_uri(input.uri.clone()),
                    );
                }
            }
        }
    }

    fn process_ainsert(&mut self, field: OperandField, input: StmtInput) {
        let operands = parsers::split_operand_list(&field.text);
        let Some((record_text, _)) = operands.first() else {
            return;
        };
        let record = record_text
            .trim()
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
            .map(|t| t.replace("''", "'"));
        let Some(record) = record else {
            self.diags.add(
                Diagnostic::error("SYN009", input.full_range(), "AINSERT record must be quoted")
                    .with_uri(input.uri.clone()),
            );
            return;
        };
        let dest = match operands.get(1).map(|(t, _)| t.trim().to_ascii_uppercase()) {
            Some(ref d) if d == "FRONT" => AinsertDestination::Front,
            Some(ref d) if d == "BACK" => AinsertDestination::Back,
            Some(_) => {
                self.diags.add(
                    Diagnostic::error(
                        "SYN009",
                        input.full_range(),
                        "AINSERT destination must be BACK or FRONT",
                    )
                    .with_uri(input.uri.clone()),
                );
                return;
            }
            None => AinsertDestination::Back,
        };
        self.provider.ainsert(record, dest);
    }

    fn process_mnote(&mut self, field: OperandField, input: StmtInput) {
        let operands = parsers::split_operand_list(&field.text);
        let (severity, message) = match operands.as_slice() {
            [(single, _)] => (None, single.clone()),
            [(sev, _), (msg, _), ..] => (Some(sev.trim().to_owned()), msg.clone()),
            [] => return,
        };
        let text = message
            .trim()
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
            .map(|t| t.replace("''", "'"))
            .unwrap_or_else(|| message.trim().to_owned());

        let severity_value = match severity.as_deref() {
            None | Some("*") | Some("") => None,
            Some(s) => match s.parse::<u32>() {
                Ok(v) if v <= 255 => Some(v),
                _ => {
                    self.diags.add(
                        Diagnostic::error("SYN010", input.full_range(), "invalid MNOTE severity")
                            .with_uri(input.uri.clone()),
                    );
                    return;
                }
            },
        };
        let diag = match severity_value {
            Some(v) if v >= 8 => Diagnostic::error("MNT008", input.full_range(), text),
            Some(v) if v >= 2 => Diagnostic::warning("MNT002", input.full_range(), text),
            _ => Diagnostic::note("MNT000", input.full_range(), text),
        };
        self.diags.add(diag.with_uri(input.uri.clone()));
    }

    fn process_ictl_card(&mut self, input: StmtInput) {
        self.statements += 1;
        let fp = parse_first_part(&input.code, &mut self.ids);
        let field = collect_operand_field(&input.code, fp.rest_offset, &input.seg_starts());
        let mut values = [None::<usize>; 3];
        for (i, (text, _)) in parsers::split_operand_list(&field.text).into_iter().enumerate() {
            if i >= 3 {
                break;
            }
            values[i] = text.trim().parse().ok();
        }
        let (Some(begin), end, continuation) = (values[0], values[1], values[2]) else {
            self.diags.add(
                Diagnostic::error("LEX003", input.full_range(), "invalid ICTL operands")
                    .with_uri(input.uri.clone()),
            );
            return;
        };
        match Ictl::new(begin, end.unwrap_or(71), continuation.unwrap_or(0)) {
            Ok(ictl) => {
                let ictl = ictl.with_dbcs(self.opts.ictl.dbcs);
                self.provider.set_ictl(ictl);
            }
            Err(err) => {
                self.diags.add(
                    Diagnostic::error("LEX003", input.full_range(), err.to_string())
                        .with_uri(input.uri.clone()),
                );
            }
        }
    }

    // -- machine statements -----------------------------------------------

    fn process_machine(
        &mut self,
        instr: MachineInstr,
        fp: &parsers::FirstPart,
        exprs: Vec<(AsmExpr, Range)>,
        operand_count: usize,
        input: StmtInput,
    ) {
        let exprs: Vec<AsmExpr> = exprs.into_iter().map(|(e, _)| e).collect();

        if operand_count < instr.min_operands || operand_count > instr.max_operands {
            self.diags.add(
                Diagnostic::error(
                    "SEM003",
                    input.full_range(),
                    format!(
                        "expected {}..{} operands, found {operand_count}",
                        instr.min_operands, instr.max_operands
                    ),
                )
                .with_uri(input.uri.clone()),
            );
        }

        if let Some(label_id) = fp.label.ordinary_id() {
            let addr = self.ctx.reserve_storage(&mut self.ids, 0, Alignment::HALFWORD);
            let installed = self.ctx.reloc.install(addr);
            self.define_symbol(
                label_id,
                SymbolValue::Reloc(installed),
                SymbolAttributes::machine(instr.length),
                &input,
            );
        } else {
            self.ctx.reserve_storage(&mut self.ids, 0, Alignment::HALFWORD);
        }
        self.ctx
            .reserve_storage(&mut self.ids, instr.length as usize, Alignment::NONE);

        let mut undefined = Vec::new();
        for expr in &exprs {
            expr.undefined_symbols(&self.ctx, &mut undefined);
        }
        if undefined.is_empty() {
            self.check_machine_values(&exprs, instr, input.full_range(), &input.uri);
        } else {
            let folded = exprs
                .iter()
                .cloned()
                .reduce(|a, b| AsmExpr::Bin(core_context::BinOp::Add, Box::new(a), Box::new(b)))
                .unwrap_or(AsmExpr::Num(0));
            let range = input.full_range();
            self.pending_machine.push(PendingMachine {
                uri: input.uri.clone(),
                range,
                exprs,
                instr,
            });
            let postponed = PostponedCheck {
                kind: PostponedKind::Statement,
                uri: input.uri.clone(),
                range,
            };
            let result = self.ctx.add_dependency(
                &mut self.ids,
                IdIndex::EMPTY,
                DependencySource::Expr(ExprResolver {
                    expr: folded,
                    loctr: None,
                }),
                Some(postponed),
                &mut self.diags,
            );
            if result.is_err() {
                self.diags.add(
                    Diagnostic::error("DEF002", range, "cyclic operand dependency")
                        .with_uri(input.uri.clone()),
                );
            }
        }
        self.drain_ready_checks();
    }

    /// Deferred value checks: once everything resolved, registers of RR
    /// instructions must fit in 0..=15.
    fn check_machine_values(
        &mut self,
        exprs: &[AsmExpr],
        instr: MachineInstr,
        range: Range,
        uri: &str,
    ) {
        if instr.length != 2 {
            return;
        }
        for expr in exprs {
            let value = expr.eval(&self.ctx, None).ok().and_then(|v| v.as_abs());
            if let Some(v) = value {
                if !(0..=15).contains(&v) {
                    self.diags.add(
                        Diagnostic::error(
                            "SEM004",
                            range,
                            format!("register operand {v} out of range 0..15"),
                        )
                        .with_uri(uri.to_owned()),
                    );
                }
            }
        }
    }

    /// Postponed statements whose dependencies were satisfied re-check in
    /// order, before the next statement is fetched.
    fn drain_ready_checks(&mut self) {
        let ready = self.ctx.deps.collect_resolved();
        self.recheck(ready);
    }

    fn recheck(&mut self, checks: Vec<PostponedCheck>) {
        for check in checks {
            if check.kind != PostponedKind::Statement {
                continue;
            }
            let Some(pos) = self
                .pending_machine
                .iter()
                .position(|p| p.uri == check.uri && p.range == check.range)
            else {
                continue;
            };
            let pending = self.pending_machine.swap_remove(pos);
            self.check_machine_values(&pending.exprs, pending.instr, pending.range, &pending.uri);
        }
    }

    // -- shared helpers ---------------------------------------------------

    fn define_symbol(
        &mut self,
        name: IdIndex,
        value: SymbolValue,
        attrs: SymbolAttributes,
        input: &StmtInput,
    ) {
        if let Err(err) = self.ctx.create_symbol(
            &mut self.ids,
            name,
            value,
            attrs,
            Some(input.location()),
            &mut self.diags,
        ) {
            if let SymbolValue::Reloc(id) = value {
                self.ctx.reloc.remove(id);
            }
            self.report_context_error(err, name, input);
        }
    }

    fn report_context_error(&mut self, err: ContextError, name: IdIndex, input: &StmtInput) {
        let symbol = self.ids.resolve(name).to_owned();
        let mut diag = Diagnostic::error(
            "SEM002",
            input.full_range(),
            format!("{err}: {symbol}"),
        )
        .with_uri(input.uri.clone());
        if let Some(prev) = self.ctx.symbol(name).and_then(|s| s.definition.clone()) {
            diag = diag.with_related(prev, "previous definition");
        }
        self.diags.add(diag);
    }

    fn eval_abs(&mut self, text: &str) -> Option<i32> {
        let trimmed = text.trim();
        let (expr, used) = core_context::parse_expr(trimmed, &mut self.ids).ok()?;
        if used != trimmed.len() {
            return None;
        }
        expr.eval(&self.ctx, None).ok().and_then(|v| v.as_abs())
    }
}

enum LengthKnown {
    Known(u32),
    Deferred(AsmExpr),
}

/// Operand field parsed according to the processing form.
enum ParsedOps {
    /// Expression operands (machine statements, EQU).
    Exprs {
        exprs: Vec<(AsmExpr, Range)>,
        operands: Vec<Operand>,
        count: usize,
    },
    /// Data-definition operands (DC/DS/DXD).
    Data {
        defs: Vec<(DataDef, Range)>,
        operands: Vec<Operand>,
    },
    /// Uninterpreted text operands (conditional assembly and the rest).
    Text(Vec<Operand>),
    /// Macro call: raw text kept for the macro's own parse.
    DeferredMacro,
}

fn nominal_length(dd: &core_semantics::DataDef, implied: u32) -> u32 {
    match (&dd.nominal, dd.type_char.to_ascii_uppercase()) {
        (Some(nominal), 'C') => nominal.chars().count().max(1) as u32,
        (Some(nominal), 'X') => ((nominal.chars().count() as u32) + 1) / 2,
        (Some(nominal), 'B') => ((nominal.chars().count() as u32) + 7) / 8,
        _ => implied,
    }
}

fn expr_mentions_loctr(expr: &AsmExpr) -> bool {
    match expr {
        AsmExpr::LocCtr => true,
        AsmExpr::Neg(inner) => expr_mentions_loctr(inner),
        AsmExpr::Bin(_, l, r) => expr_mentions_loctr(l) || expr_mentions_loctr(r),
        _ => false,
    }
}

/// `&NAME` or `&NAME(dim)` in a GBL/LCL operand.
fn parse_var_decl(operand: &str, ids: &mut IdStorage) -> Option<(IdIndex, bool)> {
    let rest = operand.strip_prefix('&')?;
    match rest.find('(') {
        None => is_ordinary_name(rest).then(|| (ids.add(rest), false)),
        Some(open) => {
            let name = &rest[..open];
            is_ordinary_name(name).then(|| (ids.add(name), true))
        }
    }
}

/// `&NAME` or `&NAME(index)` as the target of SET/AREAD.
fn parse_set_target(
    label: &str,
    ids: &mut IdStorage,
    ca: &CaContext,
) -> Option<(IdIndex, Option<usize>)> {
    let rest = label.strip_prefix('&')?;
    match rest.find('(') {
        None => is_ordinary_name(rest).then(|| (ids.add(rest), None)),
        Some(open) => {
            let name = &rest[..open];
            if !is_ordinary_name(name) {
                return None;
            }
            let inner = rest[open + 1..].strip_suffix(')')?;
            let (sub_text, _) = substitute(inner, ids, ca);
            let (expr, used) = core_context::parse_expr(sub_text.trim(), ids).ok()?;
            if used != sub_text.trim().len() {
                return None;
            }
            let idx = expr
                .eval(&crate::ca::NoSymbols, None)
                .ok()
                .and_then(|v| v.as_abs())?;
            if idx < 0 {
                return None;
            }
            Some((ids.add(name), Some(idx as usize)))
        }
    }
}

/// `(condition).TARGET`.
fn split_aif_operand(operand: &str) -> Option<(&str, &str)> {
    let inner = operand.strip_prefix('(')?;
    let mut depth = 1usize;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let target = inner[i + 1..].strip_prefix('.')?;
                    if !is_ordinary_name(target) {
                        return None;
                    }
                    return Some((&inner[..i], target));
                }
            }
            _ => {}
        }
    }
    None
}
