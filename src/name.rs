//! Symbolic name recovery.
//!
//! Given a prototype, a program counter, and a register, reconstructs a
//! human-readable name for whatever occupies the register by reverse-scanning
//! the instruction stream for its last writer. Any instruction sitting before
//! a forward-jump target is conditional and cannot be trusted as the writer.
//! Feeds backtrace call-site names and diagnostics of the form
//! `attempt to index a nil value (local 'x')`.

use displaydoc::Display;

use crate::vm::code::{index_k, is_k};
use crate::vm::{Opcode, Proto, Value, Vm};

/// How a recovered name binds.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NameKind {
    /// local
    Local,
    /// upvalue
    Upvalue,
    /// global
    Global,
    /// field
    Field,
    /// method
    Method,
    /// constant
    Constant,
    /// for iterator
    ForIterator,
    /// metamethod
    Metamethod,
    /// hook
    Hook,
}

/// Finds the last instruction before `lastpc` that wrote `reg`.
fn find_set_reg(p: &Proto, lastpc: usize, reg: u32) -> Option<usize> {
    let mut setreg = None;
    // Any code before this pc is conditional.
    let mut jmptarget = 0;
    let filter = |pc: usize, jmptarget: usize| (pc >= jmptarget).then_some(pc);
    for pc in 0..lastpc {
        let i = p.code.get(pc);
        let a = i.a();
        match i.opcode() {
            Opcode::LoadNil => {
                // Sets registers a..=a+b.
                if a <= reg && reg <= a + i.b() {
                    setreg = filter(pc, jmptarget);
                }
            }
            Opcode::TForCall => {
                // Affects all registers above its base.
                if reg >= a + 2 {
                    setreg = filter(pc, jmptarget);
                }
            }
            Opcode::Call | Opcode::TailCall => {
                if reg >= a {
                    setreg = filter(pc, jmptarget);
                }
            }
            Opcode::Jmp => {
                let dest = pc as i64 + 1 + i64::from(i.sbx());
                // Track forward jumps that stay within the scan window.
                if (pc as i64) < dest && dest <= lastpc as i64 {
                    jmptarget = jmptarget.max(dest as usize);
                }
            }
            op => {
                if op.sets_reg_a() && reg == a {
                    setreg = filter(pc, jmptarget);
                }
            }
        }
    }
    setreg
}

/// Names the RK operand `rk` at `pc`.
fn key_name(p: &Proto, pc: usize, rk: u32) -> String {
    if is_k(rk) {
        if let Some(Value::Str(s)) = p.constants.get(index_k(rk)) {
            return s.to_string();
        }
    } else if let Some((NameKind::Constant, name)) = object_name(p, pc, rk) {
        return name;
    }
    "?".into()
}

/// Recovers a name for register `reg` as observed at `lastpc`.
#[must_use]
pub fn object_name(p: &Proto, lastpc: usize, reg: u32) -> Option<(NameKind, String)> {
    if let Some(name) = p.local_name(reg as usize, lastpc) {
        return Some((NameKind::Local, name.into()));
    }
    let pc = find_set_reg(p, lastpc, reg)?;
    let i = p.code.get(pc);
    match i.opcode() {
        Opcode::Move => {
            let b = i.b();
            // A move from a lower register carries that register's name.
            (b < i.a()).then(|| object_name(p, pc, b)).flatten()
        }
        op @ (Opcode::GetTabUp | Opcode::GetTable) => {
            let table_name = if op == Opcode::GetTable {
                p.local_name(i.b() as usize, pc)
            } else {
                Some(p.upval_name(i.b() as usize))
            };
            let name = key_name(p, pc, i.c());
            let kind = if table_name == Some("_ENV") {
                NameKind::Global
            } else {
                NameKind::Field
            };
            Some((kind, name))
        }
        Opcode::GetUpval => Some((NameKind::Upvalue, p.upval_name(i.b() as usize).into())),
        op @ (Opcode::LoadK | Opcode::LoadKx) => {
            let k = if op == Opcode::LoadK {
                i.bx() as usize
            } else {
                p.code.get(pc + 1).ax() as usize
            };
            match p.constants.get(k) {
                Some(Value::Str(s)) => Some((NameKind::Constant, s.to_string())),
                _ => None,
            }
        }
        Opcode::Method => Some((NameKind::Method, key_name(p, pc, i.c()))),
        _ => None,
    }
}

/// Names the function a frame is running, from the code that called it.
///
/// `level` indexes the *called* frame; its caller's call-site instruction
/// decides the name. Only works when the caller is a Lua frame.
#[must_use]
pub fn func_name(vm: &Vm, level: usize) -> Option<(NameKind, String)> {
    let frame = vm.frames().get(level)?;
    if frame.is_finalizer {
        return Some((NameKind::Metamethod, "__gc".into()));
    }
    if frame.is_tail {
        return None;
    }
    let caller = vm.frames().get(level.checked_sub(1)?)?;
    if !caller.is_lua() {
        return None;
    }
    if caller.is_hooked {
        return Some((NameKind::Hook, "?".into()));
    }

    let p = &caller.closure().proto;
    let pc = caller.current_pc();
    let i = p.code.get(pc);
    let metamethod = |name: &str| Some((NameKind::Metamethod, name.into()));
    match i.opcode() {
        Opcode::Call | Opcode::TailCall => object_name(p, pc, i.a()),
        Opcode::TForCall => Some((NameKind::ForIterator, "for iterator".into())),
        Opcode::Method | Opcode::GetTabUp | Opcode::GetTable => metamethod("__index"),
        Opcode::SetTabUp | Opcode::SetTable => metamethod("__newindex"),
        Opcode::Add => metamethod("__add"),
        Opcode::Sub => metamethod("__sub"),
        Opcode::Mul => metamethod("__mul"),
        Opcode::Mod => metamethod("__mod"),
        Opcode::Pow => metamethod("__pow"),
        Opcode::Div => metamethod("__div"),
        Opcode::IDiv => metamethod("__idiv"),
        Opcode::BAnd => metamethod("__band"),
        Opcode::BOr => metamethod("__bor"),
        Opcode::BXor => metamethod("__bxor"),
        Opcode::Shl => metamethod("__shl"),
        Opcode::Shr => metamethod("__shr"),
        Opcode::Unm => metamethod("__unm"),
        Opcode::BNot => metamethod("__bnot"),
        Opcode::Len => metamethod("__len"),
        Opcode::Concat => metamethod("__concat"),
        Opcode::Eq => metamethod("__eq"),
        Opcode::Lt => metamethod("__lt"),
        Opcode::Le => metamethod("__le"),
        _ => None,
    }
}

/// Describes the variable holding `frame` register `reg`, for diagnostics.
///
/// Renders as e.g. ` (local 'x')`, or an empty string when nothing
/// reasonable can be inferred.
#[must_use]
pub fn var_info(p: &Proto, pc: usize, reg: u32) -> String {
    object_name(p, pc, reg)
        .map(|(kind, name)| format!(" ({kind} '{name}')"))
        .unwrap_or_default()
}
