//! Host-VM surface consumed by the debugger.
//!
//! The debugger does not interpret bytecode; it borrows the VM's data
//! structures: prototypes, activation frames, the value stack, tables, and
//! the registered source files. This module models exactly that surface.
//! Tables live in an arena and are referenced by [`TableId`], so prototypes,
//! values, and breakpoints never form reference cycles.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;

pub mod code;

pub use self::code::{Code, Instruction, Opcode};

/// Handle to a table in the VM's arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TableId(pub(crate) usize);

/// Handle to a registered source file.
///
/// Hosts hand ids out in registration order, so a compiler may name a
/// source's id before the chunk is registered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SrcId(pub usize);

/// A dynamically-typed VM value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Str(Arc<str>),
    Table(TableId),
    Function(Arc<Closure>),
}

impl Value {
    /// Interns a string value.
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// The value's type name, as surfaced in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
        }
    }
}

/// Key of a table's hash part.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Key {
    Int(i64),
    Str(Arc<str>),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "'{s}'"),
        }
    }
}

/// A Lua-style table: a dense 1-based array part plus a hash part.
#[derive(Debug, Default)]
pub struct Table {
    pub(crate) array: Vec<Value>,
    pub(crate) hash: IndexMap<Key, Value>,
}

impl Table {
    /// Reads `t[i]`, consulting the array part first.
    #[must_use]
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as usize) <= self.array.len() {
            self.array[i as usize - 1].clone()
        } else {
            self.hash.get(&Key::Int(i)).cloned().unwrap_or_default()
        }
    }

    /// Reads `t[s]`.
    #[must_use]
    pub fn get_str(&self, s: &str) -> Value {
        self.hash
            .get(&Key::Str(Arc::from(s)))
            .cloned()
            .unwrap_or_default()
    }

    /// Writes `t[s] = v`.
    pub fn set_str(&mut self, s: &str, v: Value) {
        self.hash.insert(Key::Str(Arc::from(s)), v);
    }

    /// Writes `t[i] = v`, growing the array part for dense appends.
    pub fn set_int(&mut self, i: i64, v: Value) {
        if i >= 1 && (i as usize) <= self.array.len() + 1 {
            let i = i as usize;
            if i == self.array.len() + 1 {
                self.array.push(v);
            } else {
                self.array[i - 1] = v;
            }
        } else {
            self.hash.insert(Key::Int(i), v);
        }
    }
}

/// A local-variable descriptor.
///
/// By convention descriptor index equals the register the variable occupies,
/// so a live `locvars[i]` is found at stack slot `base + i`.
#[derive(Clone, Debug)]
pub struct LocVar {
    pub name: Arc<str>,
    /// First pc where the variable is live.
    pub startpc: usize,
    /// First pc where the variable is dead.
    pub endpc: usize,
}

/// An upvalue descriptor.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    pub name: Arc<str>,
}

/// Compiled representation of a source function.
#[derive(Debug)]
pub struct Proto {
    /// Owning source file.
    pub source: SrcId,
    /// Line of the `function` keyword; 0 for a main chunk.
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub code: Code,
    /// Per-instruction source line, parallel to `code`.
    pub lineinfo: Box<[u32]>,
    pub constants: Box<[Value]>,
    pub locvars: Box<[LocVar]>,
    pub upvals: Box<[UpvalDesc]>,
    pub protos: Box<[Arc<Proto>]>,
    pub numparams: u8,
    pub is_vararg: bool,
}

impl Proto {
    /// Name of the local occupying register `reg`, if live at `pc`.
    #[must_use]
    pub fn local_name(&self, reg: usize, pc: usize) -> Option<&str> {
        self.locvars
            .get(reg)
            .filter(|lv| lv.startpc <= pc && pc < lv.endpc)
            .map(|lv| &*lv.name)
    }

    /// Name of upvalue `uv`, `"?"` when undescribed.
    #[must_use]
    pub fn upval_name(&self, uv: usize) -> &str {
        self.upvals.get(uv).map_or("?", |u| &*u.name)
    }
}

/// An instantiated function: a prototype plus captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub proto: Arc<Proto>,
    pub upvals: Vec<Value>,
}

/// What a frame is running.
#[derive(Debug)]
pub enum Callee {
    Lua(Arc<Closure>),
    /// A native (C) function, identified for backtraces only.
    Native(&'static str),
}

/// Per-activation record.
#[derive(Debug)]
pub struct Frame {
    pub callee: Callee,
    /// Index of the next instruction to fetch.
    pub saved_pc: usize,
    /// Stack slot of register 0.
    pub base: usize,
    /// Extra arguments of a vararg activation.
    pub varargs: Vec<Value>,
    pub is_tail: bool,
    pub is_hooked: bool,
    pub is_finalizer: bool,
}

impl Frame {
    #[must_use]
    pub fn lua(closure: Arc<Closure>, base: usize) -> Self {
        Self {
            callee: Callee::Lua(closure),
            saved_pc: 0,
            base,
            varargs: Vec::new(),
            is_tail: false,
            is_hooked: false,
            is_finalizer: false,
        }
    }

    #[must_use]
    pub fn native(name: &'static str) -> Self {
        Self {
            callee: Callee::Native(name),
            saved_pc: 0,
            base: 0,
            varargs: Vec::new(),
            is_tail: false,
            is_hooked: false,
            is_finalizer: false,
        }
    }

    #[must_use]
    pub fn is_lua(&self) -> bool {
        matches!(self.callee, Callee::Lua(_))
    }

    /// The frame's Lua closure.
    ///
    /// # Panics
    ///
    /// Panics on a native frame; callers must check [`Self::is_lua`].
    #[must_use]
    pub fn closure(&self) -> &Arc<Closure> {
        match &self.callee {
            Callee::Lua(cl) => cl,
            Callee::Native(_) => panic!("native frame has no closure"),
        }
    }

    /// Index of the instruction this frame is currently at.
    ///
    /// `saved_pc` names the *next* fetch, so a suspended caller is sitting on
    /// the instruction just before it (its call site).
    #[must_use]
    pub fn current_pc(&self) -> usize {
        self.saved_pc.saturating_sub(1)
    }
}

/// A source file registered with the VM.
#[derive(Debug)]
pub struct SrcFile {
    pub path: PathBuf,
    /// Root (main chunk) prototype compiled from this file.
    pub proto: Arc<Proto>,
}

/// The host VM state visible to the debugger.
#[derive(Debug, Default)]
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    tables: Vec<Table>,
    sources: Vec<SrcFile>,
    globals: Option<TableId>,
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut vm = Self::default();
        vm.globals = Some(vm.new_table());
        vm
    }

    /// Allocates an empty table in the arena.
    pub fn new_table(&mut self) -> TableId {
        self.tables.push(Table::default());
        TableId(self.tables.len() - 1)
    }

    #[must_use]
    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.0]
    }

    /// The globals table (`_ENV`).
    #[must_use]
    pub fn globals(&self) -> TableId {
        self.globals.expect("VM constructed without globals")
    }

    pub fn set_global(&mut self, name: &str, v: Value) {
        let globals = self.globals();
        self.table_mut(globals).set_str(name, v);
    }

    /// Registers a compiled source file.
    pub fn register_source(&mut self, path: impl Into<PathBuf>, proto: Arc<Proto>) -> SrcId {
        self.sources.push(SrcFile {
            path: path.into(),
            proto,
        });
        SrcId(self.sources.len() - 1)
    }

    #[must_use]
    pub fn source(&self, id: SrcId) -> &SrcFile {
        &self.sources[id.0]
    }

    /// Looks a source file up by path, falling back to a file-name match.
    #[must_use]
    pub fn source_by_name(&self, name: &str) -> Option<SrcId> {
        let exact = self.sources.iter().position(|s| s.path == Path::new(name));
        exact
            .or_else(|| {
                self.sources
                    .iter()
                    .position(|s| s.path.file_name().is_some_and(|f| f == name))
            })
            .map(SrcId)
    }

    /// Pushes an activation frame.
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame_mut(&mut self, level: usize) -> &mut Frame {
        &mut self.frames[level]
    }

    /// Reads stack slot `base + reg` of `frame`.
    #[must_use]
    pub fn register(&self, frame: &Frame, reg: usize) -> Value {
        self.stack.get(frame.base + reg).cloned().unwrap_or_default()
    }

    /// Grows the stack and writes `slot`.
    pub fn set_stack(&mut self, slot: usize, v: Value) {
        if self.stack.len() <= slot {
            self.stack.resize(slot + 1, Value::Nil);
        }
        self.stack[slot] = v;
    }

    #[must_use]
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_array_then_hash() {
        let mut t = Table::default();
        t.set_int(1, Value::Integer(10));
        t.set_int(2, Value::Integer(20));
        t.set_int(100, Value::Integer(99));
        t.set_str("k", Value::str("v"));
        assert!(matches!(t.get_int(1), Value::Integer(10)));
        assert!(matches!(t.get_int(100), Value::Integer(99)));
        assert!(matches!(t.get_int(3), Value::Nil));
        assert!(matches!(t.get_str("k"), Value::Str(_)));
        assert!(matches!(t.get_str("missing"), Value::Nil));
    }

    #[test]
    fn source_lookup_by_file_name() {
        let mut vm = Vm::new();
        let proto = Arc::new(Proto {
            source: SrcId(0),
            linedefined: 0,
            lastlinedefined: 0,
            code: Code::from(vec![Instruction::abc(Opcode::Return, 0, 1, 0)]),
            lineinfo: Box::new([1]),
            constants: Box::new([]),
            locvars: Box::new([]),
            upvals: Box::new([]),
            protos: Box::new([]),
            numparams: 0,
            is_vararg: false,
        });
        let id = vm.register_source("/tmp/scripts/a.lua", proto);
        assert_eq!(vm.source_by_name("/tmp/scripts/a.lua"), Some(id));
        assert_eq!(vm.source_by_name("a.lua"), Some(id));
        assert_eq!(vm.source_by_name("b.lua"), None);
    }

    #[test]
    fn local_liveness_window() {
        let proto = Proto {
            source: SrcId(0),
            linedefined: 0,
            lastlinedefined: 9,
            code: Code::from(vec![Instruction::abc(Opcode::Return, 0, 1, 0)]),
            lineinfo: Box::new([1]),
            constants: Box::new([]),
            locvars: Box::new([LocVar {
                name: Arc::from("x"),
                startpc: 2,
                endpc: 5,
            }]),
            upvals: Box::new([]),
            protos: Box::new([]),
            numparams: 0,
            is_vararg: false,
        };
        assert_eq!(proto.local_name(0, 2), Some("x"));
        assert_eq!(proto.local_name(0, 4), Some("x"));
        assert_eq!(proto.local_name(0, 5), None);
        assert_eq!(proto.local_name(0, 1), None);
        assert_eq!(proto.local_name(1, 3), None);
    }
}
