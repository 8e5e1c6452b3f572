//! Shared fixtures: an on-disk script, its compiled shape, and a miniature
//! fetch-execute loop that honors the debugger's two coupling points (the
//! implanted interrupt words and the asynchronous pause mark).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use ldbg::vm::{Closure, Code, Frame, Instruction, Opcode, Proto, SrcId, Value, Vm};
use ldbg::Debugger;

/// Runs `vm` until its frame stack drains or `fuel` instructions elapse.
///
/// The fetch advances `saved_pc` first; an implanted interrupt word
/// dispatches into the debugger, and the pause mark is consulted between
/// fetch and execute, exactly the window the step-off-breakpoint re-arm
/// depends on.
pub fn run(vm: &mut Vm, dbg: &Debugger, mut fuel: usize) {
    while fuel > 0 && !vm.frames().is_empty() {
        fuel -= 1;
        let top = vm.frames().len() - 1;
        if !vm.frames()[top].is_lua() {
            vm.pop_frame();
            continue;
        }
        let proto = vm.frames()[top].closure().proto.clone();
        let pc = vm.frames()[top].saved_pc;
        if pc >= proto.code.len() {
            vm.pop_frame();
            continue;
        }
        let insn = proto.code.get(pc);
        vm.frame_mut(top).saved_pc = pc + 1;

        if insn.opcode() == Opcode::Interrupt {
            dbg.interrupt(vm, insn.ax());
            continue;
        }
        if dbg.pause_requested() {
            dbg.interrupt(vm, 0);
            // A stepping command may have rewound the pc; refetch if so.
            if vm.frames().len() != top + 1 || vm.frames()[top].saved_pc != pc + 1 {
                continue;
            }
        }

        match insn.opcode() {
            Opcode::Jmp => {
                let dest = pc as i64 + 1 + i64::from(insn.sbx());
                vm.frame_mut(top).saved_pc = usize::try_from(dest).unwrap();
            }
            Opcode::Call => {
                let a = insn.a() as usize;
                let base = vm.frames()[top].base;
                let callee = {
                    let frame = &vm.frames()[top];
                    vm.register(frame, a)
                };
                if let Value::Function(cl) = callee {
                    vm.push_frame(Frame::lua(cl, base + a + 1));
                }
            }
            Opcode::Return => {
                vm.pop_frame();
            }
            _ => {}
        }
    }
}

pub struct Script {
    pub vm: Vm,
    pub main: Arc<Proto>,
    pub path: PathBuf,
    /// Keeps the on-disk source alive for the whole test.
    pub dir: tempfile::TempDir,
}

fn function(src: SrcId, defined: u32, lines: &[u32], code: Vec<Instruction>) -> Arc<Proto> {
    Arc::new(Proto {
        source: src,
        linedefined: defined,
        lastlinedefined: lines.iter().max().copied().unwrap_or(defined),
        code: Code::from(code),
        lineinfo: lines.into(),
        constants: Box::new([]),
        locvars: Box::new([]),
        upvals: Box::new([]),
        protos: Box::new([]),
        numparams: 0,
        is_vararg: false,
    })
}

/// The canonical five-line script:
///
/// ```text
/// 1  t = {x = {y = 7}}
/// 2  local a = 1
/// 3  print("hi")
/// 4  f(); g()
/// 5  done = true
/// ```
///
/// `f` and `g` are one-line helpers living in the same file; the globals
/// `t.x.y` chain is prebuilt so `print` has something to chase.
pub fn script() -> Script {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.lua");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(
        b"t = {x = {y = 7}}\nlocal a = 1\nprint(\"hi\")\nf(); g()\ndone = true\n",
    )
    .unwrap();

    let mut vm = Vm::new();

    // Register the source first so nested protos can name it.
    let placeholder = function(SrcId(0), 0, &[1], vec![Instruction::abc(Opcode::Return, 0, 1, 0)]);
    let src = vm.register_source(&path, placeholder);

    let helper_f = function(src, 6, &[7], vec![Instruction::abc(Opcode::Return, 0, 1, 0)]);
    let helper_g = function(src, 9, &[10], vec![Instruction::abc(Opcode::Return, 0, 1, 0)]);
    let main = function(
        src,
        0,
        &[1, 2, 3, 4, 4, 5, 5],
        vec![
            Instruction::abc(Opcode::Move, 0, 2, 0),
            Instruction::abc(Opcode::Move, 0, 2, 0),
            Instruction::abc(Opcode::Move, 0, 2, 0),
            Instruction::abc(Opcode::Call, 0, 1, 1),
            Instruction::abc(Opcode::Call, 1, 1, 1),
            Instruction::abc(Opcode::Move, 0, 2, 0),
            Instruction::abc(Opcode::Return, 0, 1, 0),
        ],
    );

    // t = {x = {y = 7}}
    let inner = vm.new_table();
    vm.table_mut(inner).set_str("y", Value::Integer(7));
    let outer = vm.new_table();
    vm.table_mut(outer).set_str("x", Value::Table(inner));
    vm.set_global("t", Value::Table(outer));

    // Registers 0 and 1 hold the helpers the main chunk calls.
    let f = Value::Function(Arc::new(Closure {
        proto: helper_f,
        upvals: vec![],
    }));
    let g = Value::Function(Arc::new(Closure {
        proto: helper_g,
        upvals: vec![],
    }));
    vm.set_stack(0, f);
    vm.set_stack(1, g);

    let closure = Arc::new(Closure {
        proto: Arc::clone(&main),
        upvals: vec![Value::Nil],
    });
    vm.push_frame(Frame::lua(closure, 0));

    Script {
        vm,
        main,
        path,
        dir,
    }
}

/// Reads one prompt-terminated reply off the wire.
pub fn read_reply(stream: &mut TcpStream) -> String {
    let mut reply = Vec::new();
    let mut byte = [0u8; 256];
    loop {
        let n = stream.read(&mut byte).expect("debugger closed the socket");
        assert!(n > 0, "EOF before prompt; got {:?}", String::from_utf8_lossy(&reply));
        reply.extend_from_slice(&byte[..n]);
        if reply.ends_with(b"\n> ") {
            return String::from_utf8(reply).unwrap();
        }
    }
}

/// Sends one command line.
pub fn send(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
}
