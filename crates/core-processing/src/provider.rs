//! The opencode statement provider.
//!
//! Multiplexes, in strict priority order: the AINSERT buffer (converted to
//! a virtual copybook whenever it is non-empty), the active COPY stack,
//! and the preprocessed document. ICTL and `*PROCESS` cards are recognized
//! only at the very beginning of the document.
//!
//! The provider deals in *extracted lines*: the joined code text of one
//! logical line plus the map back to source positions. Statement parsing
//! happens above.

use crate::copy::CopyFrame;
use crate::parsers::CodeMap;
use crate::virtual_files::{VirtualFileHandle, VirtualFileMonitor};
use core_ident::{IdIndex, IdStorage};
use core_lexing::{DEFAULT_ICTL_COPY, Ictl, LogicalLine, append_to_logical_line, extract_line, extract_logical_line, finish_logical_line};
use std::collections::VecDeque;
use tracing::debug;

/// Where an extracted line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    File,
    Copy(IdIndex),
}

/// Classification of an extracted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    Normal,
    Ictl,
    Process,
}

/// A rewind target: a cursor into the preprocessed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewindPos {
    pub doc_index: usize,
}

/// One logical line in owned form, ready for statement parsing.
#[derive(Debug)]
pub struct ExtractedLine {
    pub code: String,
    pub map: CodeMap,
    pub uri: String,
    pub begin_line: usize,
    pub kind: ExtractKind,
    pub source: LineSource,
    pub continuation_error: bool,
    pub so_si_continuation: bool,
    pub missing_next_line: bool,
    /// Position of this statement, for attribute-lookahead re-entry.
    pub rewind: RewindPos,
}

/// Result of one extraction attempt.
#[derive(Debug)]
pub enum ProviderYield {
    Line(Box<ExtractedLine>),
    /// Internal state changed (AINSERT converted, COPY popped); try again.
    Retry,
    Finished,
}

/// AINSERT queueing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AinsertDestination {
    Back,
    Front,
}

#[derive(Debug)]
pub struct OpencodeProvider {
    doc: core_model::Document,
    uri: String,
    next_line_index: usize,
    ainsert: VecDeque<String>,
    copy_stack: Vec<CopyFrame>,
    ictl: Ictl,
    ictl_allowed: bool,
    process_remaining: usize,
    ainsert_counter: u32,
}

impl OpencodeProvider {
    pub fn new(doc: core_model::Document, uri: impl Into<String>, ictl: Ictl) -> Self {
        Self {
            doc,
            uri: uri.into(),
            next_line_index: 0,
            ainsert: VecDeque::new(),
            copy_stack: Vec::new(),
            ictl,
            ictl_allowed: true,
            process_remaining: 10,
            ainsert_counter: 0,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_ictl(&mut self, ictl: Ictl) {
        self.ictl = ictl;
    }

    pub fn ictl(&self) -> Ictl {
        self.ictl
    }

    /// Queue a card image for the statement stream.
    pub fn ainsert(&mut self, record: String, dest: AinsertDestination) {
        match dest {
            AinsertDestination::Back => self.ainsert.push_back(record),
            AinsertDestination::Front => self.ainsert.push_front(record),
        }
        // the buffered statements may remove lines from copybooks; stop
        // copybook unwinding until the buffer drains
        self.suspend_copy_frames();
    }

    pub fn ainsert_buffer_len(&self) -> usize {
        self.ainsert.len()
    }

    pub fn push_copy(&mut self, frame: CopyFrame) {
        self.copy_stack.push(frame);
    }

    pub fn copy_stack(&self) -> &[CopyFrame] {
        &self.copy_stack
    }

    pub fn copy_depth(&self) -> usize {
        self.copy_stack.len()
    }

    pub fn in_copy(&self, member: IdIndex) -> bool {
        self.copy_stack.iter().any(|f| f.member == member)
    }

    /// The current rewind target: the next document statement.
    pub fn position(&self) -> RewindPos {
        RewindPos {
            doc_index: self.next_line_index,
        }
    }

    /// Rewind to `pos`: the AINSERT buffer is discarded, active COPY
    /// frames suspend at the line they were reading, and document
    /// production resumes at the target.
    pub fn rewind_input(&mut self, pos: RewindPos) {
        self.ainsert.clear();
        self.suspend_copy_frames();
        debug_assert!(pos.doc_index <= self.doc.len());
        self.next_line_index = pos.doc_index;
        debug!(target: "provider", doc_index = pos.doc_index, "rewind");
    }

    fn suspend_copy_frames(&mut self) {
        for frame in &mut self.copy_stack {
            if !frame.is_suspended() {
                frame.suspend(frame.current_line);
            }
        }
    }

    pub fn finished(&self) -> bool {
        self.ainsert.is_empty()
            && self.copy_stack.is_empty()
            && self.next_line_index >= self.doc.len()
    }

    /// Pull the next logical line, converting internal state as needed.
    pub fn extract_next(
        &mut self,
        ids: &mut IdStorage,
        monitor: &mut dyn VirtualFileMonitor,
        vf_handles: &mut Vec<VirtualFileHandle>,
    ) -> ProviderYield {
        if !self.ainsert.is_empty() {
            self.convert_ainsert_to_copybook(ids, monitor, vf_handles);
            return ProviderYield::Retry;
        }

        if !self.copy_stack.is_empty() {
            return self.extract_from_copy();
        }

        if self.next_line_index >= self.doc.len() {
            return ProviderYield::Finished;
        }

        let ictl_allowed = std::mem::take(&mut self.ictl_allowed);
        if ictl_allowed && self.is_next_line_ictl() {
            return self.extract_single_line(ExtractKind::Ictl);
        }

        if self.process_remaining > 0 {
            if self.is_next_line_process() {
                self.process_remaining -= 1;
                return self.extract_single_line(ExtractKind::Process);
            }
            self.process_remaining = 0;
        }

        self.extract_from_document()
    }

    /// After every drain-to-empty the buffer becomes a virtual COPY
    /// member, so its statements participate uniformly in the stream.
    fn convert_ainsert_to_copybook(
        &mut self,
        ids: &mut IdStorage,
        monitor: &mut dyn VirtualFileMonitor,
        vf_handles: &mut Vec<VirtualFileHandle>,
    ) {
        let mut content = String::with_capacity(self.ainsert.len() * 81);
        for record in self.ainsert.drain(..) {
            content.push_str(&record);
            content.push('\n');
        }
        self.ainsert_counter += 1;
        let name = format!("AINSERT_{}", self.ainsert_counter);
        let handle = monitor.file_generated(&name, &content);
        let uri = handle.uri.clone();
        vf_handles.push(handle);
        let member = ids.add(&name);
        debug!(target: "provider", member = %name, "ainsert buffer converted");
        self.copy_stack.push(CopyFrame::new(member, uri, content));
    }

    fn extract_from_copy(&mut self) -> ProviderYield {
        let frame_index = self.copy_stack.len() - 1;
        let frame = &mut self.copy_stack[frame_index];
        frame.resume();

        let begin_line = frame.current_line;
        let member = frame.member;
        let uri = frame.uri.clone();
        let text = frame.text_handle();
        let start = frame.start_of(begin_line);
        let rewind = RewindPos {
            doc_index: self.next_line_index,
        };

        let mut view = &text[start..];
        let Some(line) = extract_logical_line(&mut view, &DEFAULT_ICTL_COPY) else {
            self.copy_stack.pop();
            return ProviderYield::Retry;
        };
        let extracted = Self::to_extracted(
            &line,
            begin_line,
            uri,
            ExtractKind::Normal,
            LineSource::Copy(member),
            rewind,
        );
        let consumed = line.segments.len();
        drop(line);

        self.copy_stack[frame_index].current_line += consumed;
        ProviderYield::Line(Box::new(extracted))
    }

    fn extract_single_line(&mut self, kind: ExtractKind) -> ProviderYield {
        let rewind = self.position();
        let line = self.doc.at(self.next_line_index);
        let begin_line = line.lineno().unwrap_or(self.next_line_index);
        let mut view = line.text();
        let mut logical = LogicalLine::default();
        append_to_logical_line(&mut logical, &mut view, &core_lexing::DEFAULT_ICTL);
        finish_logical_line(&mut logical, &core_lexing::DEFAULT_ICTL);
        let extracted = Self::to_extracted(
            &logical,
            begin_line,
            self.uri.clone(),
            kind,
            LineSource::File,
            rewind,
        );
        drop(logical);
        self.next_line_index += 1;
        ProviderYield::Line(Box::new(extracted))
    }

    fn extract_from_document(&mut self) -> ProviderYield {
        let rewind = self.position();
        let first_index = self.next_line_index;
        let begin_line = self
            .doc
            .at(first_index)
            .lineno()
            .unwrap_or(first_index);

        let mut logical = LogicalLine::default();
        let mut index = first_index;
        while index < self.doc.len() {
            let mut view = self.doc.at(index).text();
            let more = append_to_logical_line(&mut logical, &mut view, &self.ictl);
            index += 1;
            if !more {
                break;
            }
        }
        finish_logical_line(&mut logical, &self.ictl);

        if logical.segments.is_empty() {
            self.next_line_index = index;
            return ProviderYield::Retry;
        }

        let extracted = Self::to_extracted(
            &logical,
            begin_line,
            self.uri.clone(),
            ExtractKind::Normal,
            LineSource::File,
            rewind,
        );
        drop(logical);
        self.next_line_index = index;
        ProviderYield::Line(Box::new(extracted))
    }

    fn to_extracted(
        line: &LogicalLine<'_>,
        begin_line: usize,
        uri: String,
        kind: ExtractKind,
        source: LineSource,
        rewind: RewindPos,
    ) -> ExtractedLine {
        ExtractedLine {
            code: line.code_text(),
            map: CodeMap::new(line, begin_line),
            uri,
            begin_line,
            kind,
            source,
            continuation_error: line.continuation_error,
            so_si_continuation: line.so_si_continuation,
            missing_next_line: line.missing_next_line,
            rewind,
        }
    }

    fn is_next_line_ictl(&self) -> bool {
        let line = self.doc.at(self.next_line_index);
        if !line.is_original() {
            return false;
        }
        let content = line.content();
        let trimmed = content.trim_start_matches(' ');
        if trimmed.len() == content.len() {
            // ICTL cannot start in the name field
            return false;
        }
        let word: String = trimmed.chars().take_while(|&c| c != ' ').collect();
        word.eq_ignore_ascii_case("ICTL")
    }

    fn is_next_line_process(&self) -> bool {
        let line = self.doc.at(self.next_line_index);
        if !line.is_original() {
            return false;
        }
        let content = line.content();
        let word: String = content.chars().take_while(|&c| c != ' ').collect();
        word.eq_ignore_ascii_case("*PROCESS")
    }

    // -- AREAD ------------------------------------------------------------

    /// Read one raw 80-column card: AINSERT buffer first, then the topmost
    /// suspended copybook, then the document.
    pub fn aread(&mut self) -> String {
        if let Some(mut record) = self.ainsert.pop_front() {
            pad_to_80(&mut record);
            return record;
        }

        self.suspend_copy_frames();
        while let Some(frame) = self.copy_stack.last() {
            let line = frame.suspended.unwrap_or(frame.current_line);
            let text_handle = frame.text_handle();
            let start = frame.start_of(line);
            let mut view = &text_handle[start..];
            if view.is_empty() {
                self.copy_stack.pop();
                continue;
            }
            let (card, _) = extract_line(&mut view).expect("non-empty text has a line");
            let mut record = card.to_owned();
            if view.is_empty() {
                self.copy_stack.pop();
            } else {
                self.copy_stack
                    .last_mut()
                    .expect("frame checked above")
                    .suspend(line + 1);
            }
            pad_to_80(&mut record);
            return record;
        }

        if self.next_line_index < self.doc.len() {
            let mut record = self.doc.at(self.next_line_index).content().to_owned();
            self.next_line_index += 1;
            pad_to_80(&mut record);
            return record;
        }
        String::new()
    }
}

fn pad_to_80(record: &mut String) {
    let len = record.chars().count();
    if len < 80 {
        record.extend(std::iter::repeat_n(' ', 80 - len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_files::VirtualFileRegistry;
    use core_model::Document;

    fn provider(text: &str) -> OpencodeProvider {
        OpencodeProvider::new(
            Document::from_text(text),
            "file:///t.hlasm",
            core_lexing::DEFAULT_ICTL,
        )
    }

    fn next_line(
        p: &mut OpencodeProvider,
        ids: &mut IdStorage,
        reg: &mut VirtualFileRegistry,
        handles: &mut Vec<VirtualFileHandle>,
    ) -> Option<Box<ExtractedLine>> {
        loop {
            match p.extract_next(ids, reg, handles) {
                ProviderYield::Line(line) => return Some(line),
                ProviderYield::Retry => continue,
                ProviderYield::Finished => return None,
            }
        }
    }

    #[test]
    fn document_lines_come_out_in_order() {
        let mut p = provider("A EQU 1\nB EQU 2\n");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        let first = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(first.code.trim_end(), "A EQU 1");
        assert_eq!(first.rewind.doc_index, 0);
        let second = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(second.code.trim_end(), "B EQU 2");
        assert!(next_line(&mut p, &mut ids, &mut reg, &mut handles).is_none());
        assert!(p.finished());
    }

    #[test]
    fn ainsert_front_and_back_order() {
        let mut p = provider("");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        p.ainsert("Y EQU 2".into(), AinsertDestination::Back);
        p.ainsert("X EQU 1".into(), AinsertDestination::Front);
        let first = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(first.code.trim_end(), "X EQU 1");
        assert!(matches!(first.source, LineSource::Copy(_)));
        let second = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(second.code.trim_end(), "Y EQU 2");
        // the buffer became a published virtual file
        assert_eq!(reg.len(), 1);
        assert_eq!(handles.len(), 1);
        assert!(handles[0].uri.starts_with("hlasm://"));
    }

    #[test]
    fn ainsert_takes_priority_over_document() {
        let mut p = provider("DOC EQU 1\n");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        p.ainsert("INS EQU 9".into(), AinsertDestination::Back);
        let first = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(first.code.trim_end(), "INS EQU 9");
        let second = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(second.code.trim_end(), "DOC EQU 1");
    }

    #[test]
    fn copy_stack_yields_topmost_and_pops_when_done() {
        let mut p = provider("AFTER EQU 3\n");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        let m = ids.add("MEM");
        p.push_copy(CopyFrame::new(m, "copy:MEM", "IN1 EQU 1\nIN2 EQU 2\n"));
        let lines: Vec<String> = std::iter::from_fn(|| {
            next_line(&mut p, &mut ids, &mut reg, &mut handles)
                .map(|l| l.code.trim_end().to_owned())
        })
        .collect();
        assert_eq!(lines, vec!["IN1 EQU 1", "IN2 EQU 2", "AFTER EQU 3"]);
    }

    #[test]
    fn rewind_clears_ainsert_and_suspends_copies() {
        let mut p = provider("L0 EQU 0\nL1 EQU 1\n");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        let pos = p.position();
        let _ = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        p.ainsert("Q EQU 9".into(), AinsertDestination::Back);
        let m = ids.add("MEM");
        p.push_copy(CopyFrame::new(m, "copy:MEM", "C EQU 1\n"));

        p.rewind_input(pos);
        assert_eq!(p.ainsert_buffer_len(), 0);
        assert!(p.copy_stack()[0].is_suspended());
        assert_eq!(p.position(), pos);
    }

    #[test]
    fn rewind_to_current_position_only_drops_ainsert() {
        let mut p = provider("L0 EQU 0\n");
        p.ainsert("Q EQU 9".into(), AinsertDestination::Back);
        let pos = p.position();
        p.rewind_input(pos);
        assert_eq!(p.ainsert_buffer_len(), 0);
        assert_eq!(p.position(), pos);
    }

    #[test]
    fn ictl_and_process_recognized_only_up_front() {
        let mut p = provider(" ICTL 1,71,16\n*PROCESS OVERRIDE\nA EQU 1\n ICTL 9,71,16\n");
        let mut ids = IdStorage::new();
        let mut reg = VirtualFileRegistry::new();
        let mut handles = Vec::new();
        let first = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(first.kind, ExtractKind::Ictl);
        let second = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(second.kind, ExtractKind::Process);
        let third = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(third.kind, ExtractKind::Normal);
        // a later ICTL is an ordinary (erroneous) statement, not a config card
        let fourth = next_line(&mut p, &mut ids, &mut reg, &mut handles).unwrap();
        assert_eq!(fourth.kind, ExtractKind::Normal);
    }

    #[test]
    fn aread_prefers_ainsert_then_copy_then_document() {
        let mut p = provider("DOCLINE\n");
        p.ainsert("BUFFERED".into(), AinsertDestination::Back);
        let card = p.aread();
        assert_eq!(card.trim_end(), "BUFFERED");
        assert_eq!(card.chars().count(), 80);

        let mut ids = IdStorage::new();
        let mem = ids.add("MEM");
        p.push_copy(CopyFrame::new(mem, "copy:MEM", "FROMCOPY\n"));
        let card = p.aread();
        assert_eq!(card.trim_end(), "FROMCOPY");

        let card = p.aread();
        assert_eq!(card.trim_end(), "DOCLINE");
        assert_eq!(p.aread(), "");
    }
}
