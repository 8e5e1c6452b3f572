//! Command handlers.
//!
//! One function per command. Handlers write their reply into the state's
//! output buffer; recoverable errors bubble up to the dispatcher, which
//! renders them inline. The stepping strategies at the bottom compose three
//! primitives: restore the breakpoint being sat on, arm the one-shot pseudo
//! breakpoint at a chosen pc, and grant the VM resume.

use itertools::Itertools as _;
use log::debug;

use crate::bp::{self, MAX_BREAKPOINTS, PSEUDO_ID};
use crate::buf::{reply, Reply, Sink};
use crate::engine::{
    frame_pc, update_file_pos, DebugState, Mode, Shared, Why, RESUME, RUNNING,
};
use crate::lang::{int, Command};
use crate::source::FileContent;
use crate::vm::{Opcode, SrcId, TableId, Value, Vm};
use crate::{name, path, Error, Result};

/// Routes a parsed command to its handler.
pub(crate) fn dispatch(
    shared: &Shared,
    ds: &mut DebugState,
    vm: &mut Vm,
    cmd: Command,
) -> Result<()> {
    #[allow(clippy::enum_glob_use)]
    use Command::*;

    match cmd {
        Empty => Ok(()),
        Unknown(cmd) => {
            reply!(ds.out, "unknown command \"{cmd}\"");
            Ok(())
        }
        Print(exprs) => print(ds, vm, &exprs),
        Break { file, line } => set_break(ds, vm, file, line, false),
        TBreak { file, line } => set_break(ds, vm, file, line, true),
        Enable { what, ids } => enable(ds, what.as_deref(), &ids),
        Disable { what, ids } => disable(ds, what.as_deref(), &ids),
        Delete { what, ids } => delete(ds, what.as_deref(), &ids),
        Info { what } => info(ds, vm, what.as_deref()),
        List { file, line } => list(ds, vm, file, line),
        Frame { level } => frame(ds, vm, level),
        Backtrace => backtrace(ds, vm),
        Step => step(ds, shared, vm),
        Next => next(ds, shared, vm),
        Finish => finish(ds, shared, vm),
        Until => until(ds, shared, vm),
        Continue => r#continue(ds, shared, vm),
        Pause => pause(ds, shared),
        Quit => quit(ds),
    }
}

pub(crate) fn print(ds: &mut DebugState, vm: &Vm, exprs: &[String]) -> Result<()> {
    for expr in exprs {
        let fields = match path::parse(expr) {
            Ok(fields) => fields,
            Err(err) => {
                reply!(ds.out, "[[{expr}]] syntax error: {err}");
                return Ok(());
            }
        };
        let frame = &vm.frames()[ds.ci];
        match path::resolve(vm, frame, frame_pc(vm, ds.ci), &fields) {
            Ok((value, _)) => {
                reply!(ds.out, "{expr} = ");
                print_value(&mut ds.out, vm, &value, false);
                ds.out.push_str("\n");
            }
            Err(err) => reply!(ds.out, "{err}\n"),
        }
    }
    Ok(())
}

fn print_value(out: &mut Reply, vm: &Vm, v: &Value, nested: bool) {
    match v {
        Value::Nil => out.push_str("nil"),
        Value::Boolean(true) => out.push_str("true"),
        Value::Boolean(false) => out.push_str("false"),
        Value::Integer(i) => reply!(out, "{i}"),
        Value::Number(n) => reply!(out, "{n}"),
        Value::Str(s) => reply!(out, "'{s}'"),
        Value::Table(id) => print_table(out, vm, *id, nested),
        Value::Function(_) => out.push_str(v.type_name()),
    }
}

fn print_table(out: &mut Reply, vm: &Vm, id: TableId, nested: bool) {
    let t = vm.table(id);
    let (nrarray, nrnode) = (t.array.len(), t.hash.len());
    reply!(out, "(table #{}, sizearray={nrarray}, sizenode={nrnode}){{", id.0);
    if nested || (nrarray == 0 && nrnode == 0) {
        out.push_str("}");
        return;
    }

    out.push_str("\n");
    if nrarray > 0 {
        out.push_str("--array\n\t");
        // The array part ends at its first nil; five entries per row.
        let live = t.array.iter().take_while(|v| !matches!(v, Value::Nil));
        let rows = live.chunks(5);
        for (row, chunk) in (&rows).into_iter().enumerate() {
            if row > 0 {
                out.push_str("\n\t");
            }
            for v in chunk {
                print_value(out, vm, v, true);
                out.push_str(", ");
            }
        }
        out.push_str("\n");
    }
    if nrnode > 0 {
        out.push_str("--node\n");
        for (k, v) in &t.hash {
            if matches!(v, Value::Nil) {
                continue;
            }
            reply!(out, "\t[{k}] = ");
            print_value(out, vm, v, true);
            out.push_str(",\n");
        }
    }
    out.push_str("}\n");
}

fn info(ds: &mut DebugState, vm: &Vm, what: Option<&str>) -> Result<()> {
    match what {
        Some("breaks") => info_breaks(ds, vm),
        Some("locals") => info_locals(ds, vm),
        Some("upvals") => info_upvals(ds, vm),
        Some("args") => info_args(ds, vm),
        _ => return Err(Error::InfoUsage),
    }
    Ok(())
}

fn info_breaks(ds: &mut DebugState, vm: &Vm) {
    for bp in ds.bps.iter() {
        reply!(
            ds.out,
            "#{:02} {}:{}\n",
            bp.id,
            vm.source(bp.src).path.display(),
            bp.line
        );
    }
}

pub(crate) fn info_locals(ds: &mut DebugState, vm: &Vm) {
    let frame = &vm.frames()[ds.ci];
    let proto = frame.closure().proto.clone();
    let pc = frame_pc(vm, ds.ci);
    for (reg, lv) in proto.locvars.iter().enumerate().rev() {
        if lv.startpc <= pc && pc < lv.endpc {
            reply!(ds.out, "{} = ", lv.name);
            let v = vm.register(frame, reg);
            print_value(&mut ds.out, vm, &v, false);
            ds.out.push_str("\n");
        }
    }
    if proto.is_vararg {
        ds.out.push_str("use `info args` to list the variable args");
    }
}

pub(crate) fn info_upvals(ds: &mut DebugState, vm: &Vm) {
    let frame = &vm.frames()[ds.ci];
    let closure = frame.closure().clone();
    for (i, uv) in closure.proto.upvals.iter().enumerate() {
        reply!(ds.out, "{} = ", uv.name);
        let v = closure.upvals.get(i).cloned().unwrap_or_default();
        // The first upvalue is _ENV; never expand it.
        print_value(&mut ds.out, vm, &v, i == 0);
        ds.out.push_str("\n");
    }
}

pub(crate) fn info_args(ds: &mut DebugState, vm: &Vm) {
    let frame = &vm.frames()[ds.ci];
    let proto = frame.closure().proto.clone();
    let mut n = 0;
    for reg in 0..usize::from(proto.numparams) {
        n += 1;
        reply!(ds.out, "${n} = ");
        let v = vm.register(frame, reg);
        print_value(&mut ds.out, vm, &v, false);
        ds.out.push_str("\n");
    }
    if proto.is_vararg {
        for v in &frame.varargs {
            n += 1;
            reply!(ds.out, "${n} = ");
            print_value(&mut ds.out, vm, v, false);
            ds.out.push_str("\n");
        }
    }
}

/// Emits a listing window, marking the VM's current line with an arrow.
pub(crate) fn list_window(ds: &mut DebugState, vm: &Vm, src: SrcId, sline: i64, nline: u32) {
    let path = vm.source(src).path.clone();
    let Some(fc) = ds.cache.get_or_load(src, &path) else {
        reply!(ds.out, "<failed to access \"{}\">", path.display());
        return;
    };
    if fc.is_binary() {
        ds.out.push_str("<binary format>");
        return;
    }

    let lines = fc.lines();
    let sline = usize::try_from(sline.max(1)).unwrap_or(1);
    if sline > lines {
        return;
    }
    let eline = (sline + nline as usize - 1).min(lines);
    let wide = sline > 9999;
    for i in sline..=eline {
        let arrow = ds.rtline as usize == i && ds.rtsrc == Some(src);
        ds.out.push_str(if arrow { "->" } else { "  " });
        if wide {
            reply!(ds.out, "{i:8}  ");
        } else {
            reply!(ds.out, "{i:4}  ");
        }
        ds.out.push_bytes(fc.line(i));
    }
    ds.last_list = Some((src, eline + 1));
}

/// The window shown on every pause, centered just above the current line.
pub(crate) fn list_at_current(ds: &mut DebugState, vm: &Vm) {
    let Some(src) = ds.rtsrc else { return };
    let nline = ds.conf.listsize;
    list_window(ds, vm, src, i64::from(ds.rtline) - 2, nline);
}

fn list_continue(ds: &mut DebugState, vm: &Vm) -> Result<()> {
    let Some((src, next)) = ds.last_list else {
        return Err(Error::NoListing);
    };
    match ds.cache.get(src).map(FileContent::lines) {
        Some(lines) if next > lines => {
            ds.out.push_str("<EOF>");
            Ok(())
        }
        _ => {
            let nline = ds.conf.listsize;
            list_window(ds, vm, src, next as i64, nline);
            Ok(())
        }
    }
}

fn list(ds: &mut DebugState, vm: &Vm, file: Option<String>, line: i64) -> Result<()> {
    match file {
        None => list_continue(ds, vm),
        Some(name) => {
            let src = vm.source_by_name(&name).ok_or(Error::ListFileNotFound)?;
            let nline = ds.conf.listsize;
            list_window(ds, vm, src, line, nline);
            Ok(())
        }
    }
}

fn frame(ds: &mut DebugState, vm: &Vm, level: i64) -> Result<()> {
    // Counted up (towards callers) from the topmost Lua frame.
    let idx = usize::try_from(level)
        .ok()
        .and_then(|level| ds.citop.checked_sub(level))
        .ok_or(Error::FrameNotFound)?;
    if !vm.frames()[idx].is_lua() {
        return Err(Error::NativeFrame);
    }
    ds.ci = idx;
    update_file_pos(ds, vm);
    if let Some(src) = ds.rtsrc {
        reply!(ds.out, "in \"{}\":\n", vm.source(src).path.display());
    }
    list_at_current(ds, vm);
    Ok(())
}

fn backtrace(ds: &mut DebugState, vm: &Vm) -> Result<()> {
    for idx in (0..vm.frames().len()).rev() {
        let f = &vm.frames()[idx];
        let marker = if idx == ds.ci { "->  " } else { "    " };
        let named = name::func_name(vm, idx);
        if f.is_lua() {
            let proto = &f.closure().proto;
            let path = vm.source(proto.source).path.clone();
            let line = proto.lineinfo[f.current_pc()];
            reply!(ds.out, "{marker}{}:{line}: in ", path.display());
            match named {
                Some((kind, name)) => reply!(ds.out, "{kind} '{name}'"),
                None if proto.linedefined == 0 => ds.out.push_str("main chunk"),
                None => reply!(ds.out, "function <{}:{}>", path.display(), proto.linedefined),
            }
        } else {
            reply!(ds.out, "{marker}[C]: in ");
            match named {
                Some((kind, name)) => reply!(ds.out, "{kind} '{name}'"),
                None => ds.out.push_str("?"),
            }
        }
        if f.is_tail {
            ds.out.push_str("\n    (...tail calls...)");
        }
        ds.out.push_str("\n");
    }
    Ok(())
}

fn set_break(
    ds: &mut DebugState,
    vm: &Vm,
    file: Option<String>,
    line: i64,
    temp: bool,
) -> Result<()> {
    if ds.bps.len() == MAX_BREAKPOINTS {
        return Err(bp::Error::TooMany.into());
    }
    let src = match file {
        Some(name) => vm
            .source_by_name(&name)
            .ok_or_else(|| Error::FileNotFound(name))?,
        None => ds.rtsrc.ok_or(Error::BreakUsage)?,
    };
    let line = u32::try_from(line)
        .ok()
        .filter(|&l| l > 0)
        .ok_or(Error::BreakUsage)?;

    let root = vm.source(src).proto.clone();
    let id = ds.bps.set(src, line, &root)?;
    if temp {
        if let Some(b) = ds.bps.get_mut(id) {
            b.temp = true;
        }
    }
    reply!(
        ds.out,
        "breakpoint #{id} set at {}:{}",
        vm.source(src).path.display(),
        line
    );
    Ok(())
}

fn check_breaks(what: Option<&str>, usage: &'static str) -> Result<()> {
    if what == Some("breaks") {
        Ok(())
    } else {
        Err(Error::BulkUsage(usage))
    }
}

/// Looks a user-supplied id token up, honoring the 1..=99 id space.
fn user_bp(ds: &DebugState, tok: &str) -> Option<u32> {
    let id: i64 = int(tok);
    u32::try_from(id)
        .ok()
        .filter(|&id| id >= 1 && id <= MAX_BREAKPOINTS as u32)
        .filter(|&id| ds.bps.get(id).is_some())
}

fn enable(ds: &mut DebugState, what: Option<&str>, ids: &[String]) -> Result<()> {
    check_breaks(what, "enable")?;
    let mut num = 0;
    let targets: Vec<_> = if ids.is_empty() {
        ds.bps.ids().into_iter().map(Ok).collect()
    } else {
        ids.iter().map(|tok| user_bp(ds, tok).ok_or(tok)).collect()
    };
    for target in targets {
        match target {
            Ok(id) => {
                if let Some(b) = ds.bps.get_mut(id) {
                    if b.disabled {
                        b.implant();
                        b.disabled = false;
                        num += 1;
                    }
                }
            }
            Err(tok) => reply!(ds.out, "breakpoint #{tok} not found\n"),
        }
    }
    reply!(ds.out, "enabled {num} breakpoint(s)");
    Ok(())
}

fn disable(ds: &mut DebugState, what: Option<&str>, ids: &[String]) -> Result<()> {
    check_breaks(what, "disable")?;
    let mut num = 0;
    let targets: Vec<_> = if ids.is_empty() {
        ds.bps.ids().into_iter().map(Ok).collect()
    } else {
        ids.iter().map(|tok| user_bp(ds, tok).ok_or(tok)).collect()
    };
    for target in targets {
        match target {
            Ok(id) => {
                if let Some(b) = ds.bps.get_mut(id) {
                    if !b.disabled {
                        b.restore();
                        b.disabled = true;
                        num += 1;
                    }
                }
            }
            Err(tok) => reply!(ds.out, "breakpoint #{tok} not found\n"),
        }
    }
    reply!(ds.out, "disabled {num} breakpoint(s)");
    Ok(())
}

fn delete(ds: &mut DebugState, what: Option<&str>, ids: &[String]) -> Result<()> {
    check_breaks(what, "delete")?;
    let mut num = 0;
    if ids.is_empty() {
        for id in ds.bps.ids() {
            ds.bps.remove(id);
            num += 1;
        }
        ds.rtbp = None;
        ds.restorebp = None;
    } else {
        for tok in ids {
            match user_bp(ds, tok) {
                Some(id) => {
                    ds.bps.remove(id);
                    if ds.rtbp == Some(id) {
                        ds.rtbp = None;
                    }
                    if ds.restorebp == Some(id) {
                        ds.restorebp = None;
                    }
                    num += 1;
                }
                None => reply!(ds.out, "breakpoint #{tok} not found\n"),
            }
        }
    }
    reply!(ds.out, "deleted {num} breakpoint(s)");
    Ok(())
}

/// Re-selects the topmost frame and, if the VM is sitting on a breakpoint,
/// restores the displaced instruction and rewinds the pc so it executes on
/// resume. A restored user breakpoint is re-armed at the next asynchronous
/// interrupt; the pseudo breakpoint is one-shot.
fn prepare_resume(ds: &mut DebugState, vm: &mut Vm) -> bool {
    if ds.ci != ds.citop {
        ds.ci = ds.citop;
        update_file_pos(ds, vm);
    }
    let Some(rid) = ds.rtbp else { return false };
    let Some(b) = ds.bps.get(rid) else {
        return false;
    };
    b.restore();
    if rid == PSEUDO_ID {
        ds.bps.clear_pseudo();
    } else {
        ds.restorebp = Some(rid);
    }
    let citop = ds.citop;
    let f = vm.frame_mut(citop);
    f.saved_pc = f.saved_pc.saturating_sub(1);
    true
}

fn step(ds: &mut DebugState, shared: &Shared, vm: &mut Vm) -> Result<()> {
    ds.why = Some(Why::Step);
    shared.set_pause_mark(true);
    prepare_resume(ds, vm);
    shared.set_cont(RESUME);
    Ok(())
}

fn next(ds: &mut DebugState, shared: &Shared, vm: &mut Vm) -> Result<()> {
    prepare_resume(ds, vm);
    let frame = &vm.frames()[ds.citop];
    let p = frame.closure().proto.clone();
    let start = frame.saved_pc;

    // First pc on a different source line, unless a loop or branch leaves the
    // line first; calls are stepped over, not into.
    let mut target = None;
    if start < p.code.len() {
        let thisline = p.lineinfo[start];
        let mut pos = start + 1;
        while pos < p.code.len() {
            if p.lineinfo[pos] != thisline {
                target = Some(pos);
                break;
            }
            let op = p.code.get(pos).opcode();
            if (Opcode::Jmp..=Opcode::TForLoop).contains(&op) && op != Opcode::Call {
                break;
            }
            pos += 1;
        }
    }

    match target {
        Some(pos) => {
            ds.bps.arm_pseudo(p, pos);
            ds.why = Some(Why::Next);
        }
        // Fell off the function or hit control flow: degrade to stepping.
        None => ds.why = Some(Why::Step),
    }
    shared.set_pause_mark(true);
    shared.set_cont(RESUME);
    Ok(())
}

fn finish(ds: &mut DebugState, shared: &Shared, vm: &mut Vm) -> Result<()> {
    prepare_resume(ds, vm);
    for idx in (0..ds.citop).rev() {
        let f = &vm.frames()[idx];
        if f.is_lua() {
            let p = f.closure().proto.clone();
            // The caller's saved pc is its return point.
            let codepos = f.saved_pc;
            if codepos < p.code.len() {
                ds.bps.arm_pseudo(p, codepos);
                shared.set_pause_mark(true);
                ds.why = Some(Why::Next);
                shared.set_cont(RESUME);
            }
            return Ok(());
        }
    }
    Ok(())
}

fn until(ds: &mut DebugState, shared: &Shared, vm: &mut Vm) -> Result<()> {
    if ds.ci != ds.citop {
        ds.ci = ds.citop;
        update_file_pos(ds, vm);
    }
    let frame = &vm.frames()[ds.citop];
    let p = frame.closure().proto.clone();
    let savedpc = frame.saved_pc;

    // Scan for the instruction closing the innermost enclosing loop: a
    // backward jump to at or before the current pc, or the loop instruction
    // whose counterpart opener lies behind us. Assumes the compiler emits
    // balanced ForPrep/ForLoop and TForCall/TForLoop pairs.
    let mut found = None;
    let (mut forprep, mut tforcall) = (0i32, 0i32);
    let mut pos = savedpc;
    while pos < p.code.len() {
        let i = p.code.get(pos);
        match i.opcode() {
            Opcode::Jmp => {
                if pos as i64 + 1 + i64::from(i.sbx()) <= savedpc as i64 {
                    found = Some(pos);
                    break;
                }
            }
            Opcode::ForPrep => forprep += 1,
            Opcode::ForLoop => {
                forprep -= 1;
                if forprep < 0 {
                    found = Some(pos);
                    break;
                }
            }
            Opcode::TForCall => tforcall += 1,
            Opcode::TForLoop => {
                tforcall -= 1;
                if tforcall < 0 {
                    found = Some(pos);
                    break;
                }
            }
            _ => {}
        }
        pos += 1;
    }

    let Some(pos) = found.filter(|&pos| pos + 1 < p.code.len()) else {
        return Err(Error::UntilNoLoop);
    };
    prepare_resume(ds, vm);
    ds.bps.arm_pseudo(p, pos + 1);
    ds.why = Some(Why::Next);
    shared.set_pause_mark(true);
    shared.set_cont(RESUME);
    Ok(())
}

pub(crate) fn r#continue(ds: &mut DebugState, shared: &Shared, vm: &mut Vm) -> Result<()> {
    if prepare_resume(ds, vm) {
        shared.set_pause_mark(true);
        ds.why = Some(Why::Next);
    }
    shared.set_cont(RESUME);
    Ok(())
}

pub(crate) fn pause(ds: &mut DebugState, shared: &Shared) -> Result<()> {
    if ds.mode == Mode::Background && shared.cont() == RUNNING {
        debug!("pause requested");
        ds.why = Some(Why::Cli);
        shared.set_pause_mark(true);
    }
    Ok(())
}

pub(crate) fn quit(ds: &mut DebugState) -> Result<()> {
    match ds.mode {
        Mode::Inline | Mode::Foreground => {
            debug!("quit; exiting process");
            std::process::exit(0);
        }
        Mode::Background => {
            // Close the client; the server's read loop observes the EOF and
            // runs the detach sequence, then returns to accepting.
            if let Sink::Client(stream) = &ds.sink {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            ds.sink = Sink::Discard;
            Ok(())
        }
    }
}
