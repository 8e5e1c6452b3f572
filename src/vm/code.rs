//! Bytecode words and the opcode set.
//!
//! Instructions use the classic 32-bit layout: a 6-bit opcode with `A`/`B`/`C`
//! register fields (8/9/9 bits), an 18-bit `Bx`/`sBx` immediate, or a 26-bit
//! `Ax` immediate. The debugger's implanted [`Opcode::Interrupt`] is encoded
//! in `Ax` form, the operand carrying a breakpoint id (0 requests an
//! asynchronous pause).

use std::sync::atomic::{AtomicU32, Ordering};

const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_C: u32 = 9;
const SIZE_B: u32 = 9;

const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP;
const POS_C: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_C + SIZE_C;
const POS_BX: u32 = POS_C;
const POS_AX: u32 = POS_A;

const MASK_OP: u32 = (1 << SIZE_OP) - 1;
const MASK_A: u32 = (1 << SIZE_A) - 1;
const MASK_C: u32 = (1 << SIZE_C) - 1;
const MASK_B: u32 = (1 << SIZE_B) - 1;
const MASK_BX: u32 = (1 << (SIZE_C + SIZE_B)) - 1;
const MASK_AX: u32 = (1 << (SIZE_A + SIZE_C + SIZE_B)) - 1;

/// Bias applied to the signed `sBx` immediate.
pub const MAX_SBX: i32 = (MASK_BX >> 1) as i32;

/// Constant-operand marker bit within a `B`/`C` field.
pub const BIT_RK: u32 = 1 << (SIZE_B - 1);

/// A single bytecode word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Builds an `ABC`-form instruction.
    #[must_use]
    pub fn abc(op: Opcode, a: u32, b: u32, c: u32) -> Self {
        Self(
            (op as u32 & MASK_OP)
                | ((a & MASK_A) << POS_A)
                | ((c & MASK_C) << POS_C)
                | ((b & MASK_B) << POS_B),
        )
    }

    /// Builds an `ABx`-form instruction.
    #[must_use]
    pub fn abx(op: Opcode, a: u32, bx: u32) -> Self {
        Self((op as u32 & MASK_OP) | ((a & MASK_A) << POS_A) | ((bx & MASK_BX) << POS_BX))
    }

    /// Builds an `AsBx`-form instruction.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit the 18-bit biased immediate.
    #[must_use]
    pub fn asbx(op: Opcode, a: u32, sbx: i32) -> Self {
        let bx = u32::try_from(sbx + MAX_SBX).expect("jump offset out of range");
        Self::abx(op, a, bx)
    }

    /// Builds an `Ax`-form instruction.
    #[must_use]
    pub fn new_ax(op: Opcode, ax: u32) -> Self {
        Self((op as u32 & MASK_OP) | ((ax & MASK_AX) << POS_AX))
    }

    /// Decodes the opcode field.
    #[must_use]
    pub fn opcode(self) -> Opcode {
        Opcode::from_u32(self.0 & MASK_OP)
    }

    #[must_use]
    pub fn a(self) -> u32 {
        (self.0 >> POS_A) & MASK_A
    }

    #[must_use]
    pub fn b(self) -> u32 {
        (self.0 >> POS_B) & MASK_B
    }

    #[must_use]
    pub fn c(self) -> u32 {
        (self.0 >> POS_C) & MASK_C
    }

    #[must_use]
    pub fn bx(self) -> u32 {
        (self.0 >> POS_BX) & MASK_BX
    }

    #[must_use]
    pub fn sbx(self) -> i32 {
        self.bx() as i32 - MAX_SBX
    }

    #[must_use]
    pub fn ax(self) -> u32 {
        (self.0 >> POS_AX) & MASK_AX
    }
}

/// Whether a `B`/`C` operand names a constant rather than a register.
#[must_use]
pub fn is_k(rk: u32) -> bool {
    rk & BIT_RK != 0
}

/// Constant-pool index of a constant operand.
#[must_use]
pub fn index_k(rk: u32) -> usize {
    (rk & !BIT_RK) as usize
}

/// Marks a constant-pool index as an RK operand.
#[must_use]
pub fn rk_const(index: u32) -> u32 {
    index | BIT_RK
}

/// The host VM's opcode set.
///
/// Numbering is load-bearing: the stepping strategies scan for the
/// `Jmp..=TForLoop` control-flow block, and the symbolic namer relies on the
/// arithmetic block staying contiguous.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum Opcode {
    Move,
    LoadK,
    LoadKx,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Method,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
    /// Debugger trap; `Ax` carries the breakpoint id.
    Interrupt,
}

impl Opcode {
    const ALL: [Self; 48] = [
        Self::Move,
        Self::LoadK,
        Self::LoadKx,
        Self::LoadBool,
        Self::LoadNil,
        Self::GetUpval,
        Self::GetTabUp,
        Self::GetTable,
        Self::SetTabUp,
        Self::SetUpval,
        Self::SetTable,
        Self::NewTable,
        Self::Method,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Mod,
        Self::Pow,
        Self::Div,
        Self::IDiv,
        Self::BAnd,
        Self::BOr,
        Self::BXor,
        Self::Shl,
        Self::Shr,
        Self::Unm,
        Self::BNot,
        Self::Not,
        Self::Len,
        Self::Concat,
        Self::Jmp,
        Self::Eq,
        Self::Lt,
        Self::Le,
        Self::Test,
        Self::TestSet,
        Self::Call,
        Self::TailCall,
        Self::Return,
        Self::ForLoop,
        Self::ForPrep,
        Self::TForCall,
        Self::TForLoop,
        Self::SetList,
        Self::Closure,
        Self::Vararg,
        Self::ExtraArg,
        Self::Interrupt,
    ];

    fn from_u32(raw: u32) -> Self {
        Self::ALL[raw as usize]
    }

    /// Whether the instruction writes register `A`.
    ///
    /// Mirrors the VM's opcode mode table; instructions with broader effects
    /// (`LoadNil`, the call family, `TForCall`) are special-cased by the
    /// last-writer scan.
    #[must_use]
    #[rustfmt::skip]
    pub fn sets_reg_a(self) -> bool {
        !matches!(
            self,
            Self::SetTabUp | Self::SetUpval | Self::SetTable
                | Self::Jmp | Self::Eq | Self::Lt | Self::Le | Self::Test
                | Self::Return | Self::TForCall | Self::SetList
                | Self::ExtraArg | Self::Interrupt
        )
    }
}

/// A prototype's instruction array.
///
/// Words are individually atomic: the debugger patches breakpoint slots from
/// the server thread while the VM may be fetching, and the contract of the
/// interrupt scheme is a single aligned word store per patch.
#[derive(Debug, Default)]
pub struct Code(Box<[AtomicU32]>);

impl Code {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fetches the word at `pc`.
    #[must_use]
    pub fn get(&self, pc: usize) -> Instruction {
        Instruction(self.0[pc].load(Ordering::Relaxed))
    }

    /// Overwrites the word at `pc`.
    pub fn patch(&self, pc: usize, insn: Instruction) {
        self.0[pc].store(insn.0, Ordering::Relaxed);
    }
}

impl From<Vec<Instruction>> for Code {
    fn from(code: Vec<Instruction>) -> Self {
        Self(code.into_iter().map(|i| AtomicU32::new(i.0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_fields_round_trip() {
        let insn = Instruction::abc(Opcode::GetTable, 3, 0x1ff, rk_const(7));
        assert_eq!(insn.opcode(), Opcode::GetTable);
        assert_eq!(insn.a(), 3);
        assert_eq!(insn.b(), 0x1ff);
        assert!(is_k(insn.c()));
        assert_eq!(index_k(insn.c()), 7);
    }

    #[test]
    fn sbx_is_biased() {
        let back = Instruction::asbx(Opcode::Jmp, 0, -5);
        assert_eq!(back.sbx(), -5);
        let fwd = Instruction::asbx(Opcode::Jmp, 0, 12);
        assert_eq!(fwd.sbx(), 12);
    }

    #[test]
    fn interrupt_carries_id() {
        let insn = Instruction::new_ax(Opcode::Interrupt, 42);
        assert_eq!(insn.opcode(), Opcode::Interrupt);
        assert_eq!(insn.ax(), 42);
    }

    #[test]
    fn control_flow_block_is_contiguous() {
        assert!(Opcode::Jmp < Opcode::Call);
        assert!(Opcode::Call < Opcode::TForLoop);
        assert!((Opcode::Jmp..=Opcode::TForLoop).contains(&Opcode::ForPrep));
        assert!(!(Opcode::Jmp..=Opcode::TForLoop).contains(&Opcode::Concat));
    }

    #[test]
    fn patching_swaps_single_words() {
        let code = Code::from(vec![
            Instruction::abc(Opcode::Move, 0, 1, 0),
            Instruction::abc(Opcode::Return, 0, 1, 0),
        ]);
        let saved = code.get(0);
        code.patch(0, Instruction::new_ax(Opcode::Interrupt, 1));
        assert_eq!(code.get(0).opcode(), Opcode::Interrupt);
        code.patch(0, saved);
        assert_eq!(code.get(0), saved);
    }
}
