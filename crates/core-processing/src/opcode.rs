//! Instruction resolution.
//!
//! A deliberately small table: enough machine instructions to exercise the
//! checker and attribute paths, plus every assembler and
//! conditional-assembly operation the pipeline dispatches on. Full
//! architecture tables live outside the core.

use core_ident::{IdIndex, IdStorage};
use core_semantics::ProcessingForm;

/// Assembler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmOp {
    Equ,
    Dc,
    Ds,
    Dxd,
    Copy,
    Csect,
    Dsect,
    Rsect,
    Com,
    Loctr,
    Ictl,
    Ainsert,
    Mnote,
    End,
}

/// Conditional-assembly operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaOp {
    Seta,
    Setb,
    Setc,
    Gbla,
    Gblb,
    Gblc,
    Lcla,
    Lclb,
    Lclc,
    Aif,
    Ago,
    Anop,
    Actr,
    Aread,
    Macro,
    Mend,
    Mexit,
}

impl CaOp {
    /// SET/GBL/LCL family member, with its value type.
    pub fn set_type(self) -> Option<core_context::SetType> {
        use core_context::SetType;
        match self {
            CaOp::Seta | CaOp::Gbla | CaOp::Lcla => Some(SetType::A),
            CaOp::Setb | CaOp::Gblb | CaOp::Lclb => Some(SetType::B),
            CaOp::Setc | CaOp::Gblc | CaOp::Lclc => Some(SetType::C),
            _ => None,
        }
    }
}

/// A machine instruction's checking data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineInstr {
    /// Object-code length in bytes; also the label's length attribute.
    pub length: u32,
    pub min_operands: usize,
    pub max_operands: usize,
}

/// Resolved opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Machine(MachineInstr),
    Asm(AsmOp),
    Ca(CaOp),
    /// A macro defined earlier in this analysis.
    Macro,
    Unknown,
}

impl OpCode {
    pub fn form(self) -> ProcessingForm {
        match self {
            OpCode::Machine(_) => ProcessingForm::Mach,
            OpCode::Asm(AsmOp::Dc | AsmOp::Ds | AsmOp::Dxd) => ProcessingForm::Dat,
            OpCode::Asm(_) => ProcessingForm::Asm,
            OpCode::Ca(_) => ProcessingForm::Ca,
            OpCode::Macro => ProcessingForm::Mac,
            OpCode::Unknown => ProcessingForm::Unknown,
        }
    }
}

macro_rules! machine_table {
    ($($name:literal => ($len:expr, $min:expr, $max:expr)),* $(,)?) => {
        &[$(($name, MachineInstr { length: $len, min_operands: $min, max_operands: $max })),*]
    };
}

/// Representative machine instruction sample (RR, RX, SS formats).
const MACHINE_INSTRUCTIONS: &[(&str, MachineInstr)] = machine_table![
    "LR"   => (2, 2, 2),
    "AR"   => (2, 2, 2),
    "SR"   => (2, 2, 2),
    "CR"   => (2, 2, 2),
    "BR"   => (2, 1, 1),
    "BALR" => (2, 2, 2),
    "LA"   => (4, 2, 2),
    "L"    => (4, 2, 2),
    "ST"   => (4, 2, 2),
    "A"    => (4, 2, 2),
    "S"    => (4, 2, 2),
    "C"    => (4, 2, 2),
    "IC"   => (4, 2, 2),
    "STC"  => (4, 2, 2),
    "BAL"  => (4, 2, 2),
    "BC"   => (4, 2, 2),
    "BCT"  => (4, 2, 2),
    "B"    => (4, 1, 1),
    "MVC"  => (6, 2, 2),
    "CLC"  => (6, 2, 2),
];

const ASM_OPS: &[(&str, AsmOp)] = &[
    ("EQU", AsmOp::Equ),
    ("DC", AsmOp::Dc),
    ("DS", AsmOp::Ds),
    ("DXD", AsmOp::Dxd),
    ("COPY", AsmOp::Copy),
    ("CSECT", AsmOp::Csect),
    ("DSECT", AsmOp::Dsect),
    ("RSECT", AsmOp::Rsect),
    ("COM", AsmOp::Com),
    ("LOCTR", AsmOp::Loctr),
    ("ICTL", AsmOp::Ictl),
    ("AINSERT", AsmOp::Ainsert),
    ("MNOTE", AsmOp::Mnote),
    ("END", AsmOp::End),
];

const CA_OPS: &[(&str, CaOp)] = &[
    ("SETA", CaOp::Seta),
    ("SETB", CaOp::Setb),
    ("SETC", CaOp::Setc),
    ("GBLA", CaOp::Gbla),
    ("GBLB", CaOp::Gblb),
    ("GBLC", CaOp::Gblc),
    ("LCLA", CaOp::Lcla),
    ("LCLB", CaOp::Lclb),
    ("LCLC", CaOp::Lclc),
    ("AIF", CaOp::Aif),
    ("AGO", CaOp::Ago),
    ("ANOP", CaOp::Anop),
    ("ACTR", CaOp::Actr),
    ("AREAD", CaOp::Aread),
    ("MACRO", CaOp::Macro),
    ("MEND", CaOp::Mend),
    ("MEXIT", CaOp::Mexit),
];

/// Interned instruction tables for one analysis context.
#[derive(Debug)]
pub struct OpcodeTable {
    machine: Vec<(IdIndex, MachineInstr)>,
    asm: Vec<(IdIndex, AsmOp)>,
    ca: Vec<(IdIndex, CaOp)>,
}

impl OpcodeTable {
    pub fn new(ids: &mut IdStorage) -> Self {
        Self {
            machine: MACHINE_INSTRUCTIONS
                .iter()
                .map(|&(name, instr)| (ids.add(name), instr))
                .collect(),
            asm: ASM_OPS.iter().map(|&(name, op)| (ids.add(name), op)).collect(),
            ca: CA_OPS.iter().map(|&(name, op)| (ids.add(name), op)).collect(),
        }
    }

    /// Resolve an instruction name; `is_macro` reports names with an
    /// in-scope macro definition, which shadow machine instructions but
    /// not assembler or CA operations.
    pub fn resolve(&self, id: IdIndex, is_macro: impl Fn(IdIndex) -> bool) -> OpCode {
        if let Some(&(_, op)) = self.asm.iter().find(|&&(n, _)| n == id) {
            return OpCode::Asm(op);
        }
        if let Some(&(_, op)) = self.ca.iter().find(|&&(n, _)| n == id) {
            return OpCode::Ca(op);
        }
        if is_macro(id) {
            return OpCode::Macro;
        }
        if let Some(&(_, instr)) = self.machine.iter().find(|&&(n, _)| n == id) {
            return OpCode::Machine(instr);
        }
        OpCode::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_each_category() {
        let mut ids = IdStorage::new();
        let table = OpcodeTable::new(&mut ids);
        let lr = ids.add("LR");
        let equ = ids.add("EQU");
        let aif = ids.add("AIF");
        let nope = ids.add("NOPE");

        assert!(matches!(table.resolve(lr, |_| false), OpCode::Machine(m) if m.length == 2));
        assert_eq!(table.resolve(equ, |_| false), OpCode::Asm(AsmOp::Equ));
        assert_eq!(table.resolve(aif, |_| false), OpCode::Ca(CaOp::Aif));
        assert_eq!(table.resolve(nope, |_| false), OpCode::Unknown);
    }

    #[test]
    fn macro_shadows_machine_but_not_asm() {
        let mut ids = IdStorage::new();
        let table = OpcodeTable::new(&mut ids);
        let lr = ids.add("LR");
        let equ = ids.add("EQU");
        assert_eq!(table.resolve(lr, |_| true), OpCode::Macro);
        assert_eq!(table.resolve(equ, |_| true), OpCode::Asm(AsmOp::Equ));
    }

    #[test]
    fn data_ops_use_the_data_form() {
        let mut ids = IdStorage::new();
        let table = OpcodeTable::new(&mut ids);
        let dc = ids.add("DC");
        assert_eq!(table.resolve(dc, |_| false).form(), ProcessingForm::Dat);
    }
}
