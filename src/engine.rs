//! Pause/resume engine.
//!
//! The VM enters through [`Shared::interrupt`], either by dispatching an
//! implanted interrupt word (carrying a breakpoint id) or because the
//! asynchronous pause mark was set. The engine decides whether the stop
//! surfaces to the operator, re-arms any breakpoint whose slot was restored
//! for a step-off, and, when pausing, blocks the VM thread in a mode-specific
//! interact loop until a stepping command grants resume.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};

use displaydoc::Display;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::bp::Breakpoints;
use crate::buf::{reply, Reply, Sink};
use crate::exec;
use crate::lang::Command;
use crate::server::ClientInput;
use crate::source::SourceCache;
use crate::vm::{Frame, SrcId, Vm};
use crate::Error;

/// Continuation flag: user code is executing.
pub(crate) const RUNNING: i8 = -1;
/// Continuation flag: the VM thread is suspended awaiting commands.
pub(crate) const PAUSED: i8 = 0;
/// Continuation flag: a resume has been granted but not yet acknowledged.
pub(crate) const RESUME: i8 = 1;

/// How the debugger is attached.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Mode {
    /// inline
    Inline,
    /// foreground
    Foreground,
    /// background
    Background,
}

impl Mode {
    /// Maps the host entry point's mode character; anything unknown reads as
    /// inline.
    #[must_use]
    pub fn from_char(c: char) -> Self {
        match c {
            'f' => Self::Foreground,
            'b' => Self::Background,
            _ => Self::Inline,
        }
    }
}

/// Tunables of a debugger instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lines per listing window.
    pub listsize: u32,
    /// TCP port of the debug server.
    pub port: u16,
    /// Directory receiving `ldb-<pid>.dump` files.
    pub dump_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listsize: 10,
            port: crate::PORT,
            dump_dir: ".".into(),
        }
    }
}

/// Why the asynchronous pause mark was armed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Why {
    /// An operator `pause`; always surfaces.
    Cli,
    /// A stepping strategy is in flight; the interrupt only re-arms state.
    Next,
    /// Single-stepping; surfaces once the source line changes.
    Step,
}

/// Engine state guarded by the shared mutex.
#[derive(Debug)]
pub(crate) struct DebugState {
    pub conf: Config,
    pub mode: Mode,
    pub bps: Breakpoints,
    pub cache: SourceCache,
    pub why: Option<Why>,
    /// Breakpoint the VM is currently stopped at.
    pub rtbp: Option<u32>,
    /// Breakpoint whose slot was restored for a step-off; re-armed on the
    /// next asynchronous interrupt.
    pub restorebp: Option<u32>,
    /// Selected frame, movable by `frame`.
    pub ci: usize,
    /// Topmost Lua frame at the time of the pause.
    pub citop: usize,
    pub oldpc: usize,
    pub oldline: u32,
    /// Source position the VM is paused at.
    pub rtsrc: Option<SrcId>,
    pub rtline: u32,
    /// Window continuation for a bare `list`: source and next line.
    pub last_list: Option<(SrcId, usize)>,
    pub out: Reply,
    pub sink: Sink,
    /// Command lines forwarded by the server thread while paused.
    pub pending: VecDeque<String>,
    /// Client vanished; unpatch everything and resume.
    pub detach: bool,
}

impl DebugState {
    fn new(mode: Mode, conf: Config) -> Self {
        Self {
            conf,
            mode,
            bps: Breakpoints::default(),
            cache: SourceCache::default(),
            why: None,
            rtbp: None,
            restorebp: None,
            ci: 0,
            citop: 0,
            oldpc: 0,
            oldline: 0,
            rtsrc: None,
            rtline: 0,
            last_list: None,
            out: Reply::default(),
            sink: Sink::Discard,
            pending: VecDeque::new(),
            detach: false,
        }
    }

    /// Flushes the reply buffer to the attached sink.
    pub fn flush(&mut self) {
        let Self { out, sink, .. } = self;
        out.flush(sink);
    }
}

/// State shared between the VM thread and the server thread.
///
/// The two lock-free words are the coupling points consulted on the VM's
/// instruction dispatch path: the pause mark and the continuation flag.
/// Everything else lives under the mutex, which the server thread only takes
/// while the VM is running or suspended on the condvar.
pub(crate) struct Shared {
    pub state: Mutex<DebugState>,
    pub cond: Condvar,
    /// Asynchronous pause mark, checked after every instruction fetch.
    pub pause: AtomicBool,
    pub cont: AtomicI8,
    /// Input endpoint of the inline/foreground interact loop.
    pub io: Mutex<Option<ClientInput>>,
    /// Bound server address, in the TCP modes.
    pub addr: Option<SocketAddr>,
}

impl Shared {
    pub fn new(mode: Mode, conf: Config, addr: Option<SocketAddr>) -> Self {
        Self {
            state: Mutex::new(DebugState::new(mode, conf)),
            cond: Condvar::new(),
            pause: AtomicBool::new(false),
            cont: AtomicI8::new(RUNNING),
            io: Mutex::new(None),
            addr,
        }
    }

    pub fn cont(&self) -> i8 {
        self.cont.load(Ordering::SeqCst)
    }

    pub fn set_cont(&self, v: i8) {
        self.cont.store(v, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn set_pause_mark(&self, v: bool) {
        self.pause.store(v, Ordering::SeqCst);
    }

    /// Interrupt entry point.
    ///
    /// `id` is the operand of the dispatched interrupt word; 0 means the
    /// asynchronous pause mark fired. Blocks the calling (VM) thread for the
    /// whole lifetime of a surfaced pause.
    pub fn interrupt(&self, vm: &mut Vm, id: u32) {
        if !self.on_interrupt(vm, id) {
            return;
        }
        let mode = self.state.lock().mode;
        match mode {
            Mode::Inline | Mode::Foreground => self.fg_interact(vm),
            Mode::Background => self.bg_interact(vm),
        }
        self.set_cont(RUNNING);
        debug!("VM resumed");
    }

    /// Decides whether the interrupt surfaces; on pause, emits the banner and
    /// listing and leaves the continuation flag at [`PAUSED`].
    pub fn on_interrupt(&self, vm: &mut Vm, id: u32) -> bool {
        let ds = &mut *self.state.lock();
        let mut pause = true;
        let mut hit = None;

        if id != 0 {
            hit = ds.bps.get(id).map(|bp| bp.id);
        } else {
            // Re-arm (or free) the breakpoint whose slot was restored so the
            // VM could step off it.
            if let Some(rid) = ds.restorebp.take() {
                if ds.bps.get(rid).is_some_and(|bp| bp.temp) {
                    ds.bps.remove(rid);
                } else if let Some(bp) = ds.bps.get(rid) {
                    bp.implant();
                }
                trace!("restore breakpoint #{rid} processed");
            }

            match ds.why {
                Some(Why::Step) => {
                    // Single-line fidelity: surface only once the VM leaves
                    // the line (or the frame) it was paused on.
                    let top = vm.frames().len().wrapping_sub(1);
                    let newline = vm
                        .frames()
                        .last()
                        .filter(|f| f.is_lua())
                        .map(|f| f.closure().proto.lineinfo[f.current_pc()]);
                    if top == ds.ci && newline == Some(ds.oldline) {
                        pause = false;
                    }
                    if pause {
                        self.set_pause_mark(false);
                        ds.why = None;
                    }
                }
                why => {
                    self.set_pause_mark(false);
                    ds.why = None;
                    if why == Some(Why::Next) {
                        // A stepping strategy reached its target through the
                        // pseudo breakpoint; nothing surfaces here.
                        pause = false;
                    }
                }
            }
        }

        if !pause {
            return false;
        }

        let Some(citop) = update_citop(ds, vm) else {
            debug!("interrupt without a Lua frame; not pausing");
            return false;
        };
        ds.rtbp = hit;
        let frame = &vm.frames()[citop];
        ds.oldpc = frame.current_pc();
        ds.oldline = frame.closure().proto.lineinfo[ds.oldpc];

        update_file_pos(ds, vm);
        if let Some(src) = ds.rtsrc {
            let path = vm.source(src).path.clone();
            reply!(ds.out, "Lua VM paused at {}:{}\n", path.display(), ds.rtline);
        }
        exec::list_at_current(ds, vm);
        ds.flush();
        self.set_cont(PAUSED);
        debug!("VM paused (breakpoint: {hit:?})");
        true
    }

    /// Inline/foreground interact loop: read and dispatch on the VM thread
    /// until a command grants resume.
    fn fg_interact(&self, vm: &mut Vm) {
        while self.cont() != RESUME {
            let input = {
                let mut io = self.io.lock();
                match io.as_mut() {
                    Some(input) => input.read_line(),
                    None => Ok(None),
                }
            };
            match input {
                Ok(Some(crate::server::Input::Line(line))) => {
                    let ds = &mut *self.state.lock();
                    self.dispatch_line(ds, vm, &line);
                    ds.flush();
                }
                Ok(Some(crate::server::Input::TooLong)) => {
                    let ds = &mut *self.state.lock();
                    ds.out.push_str("invalid command line");
                    ds.flush();
                }
                // The operator hung up; there is no one left to serve.
                Ok(None) => {
                    debug!("input closed; exiting");
                    std::process::exit(0);
                }
                Err(err) => {
                    debug!("input error: {err}; exiting");
                    std::process::exit(1);
                }
            }
        }
    }

    /// Background interact loop: park on the condvar; the server thread
    /// forwards command lines and signals.
    fn bg_interact(&self, vm: &mut Vm) {
        let mut guard = self.state.lock();
        loop {
            if guard.detach {
                let ds = &mut *guard;
                ds.detach = false;
                self.handle_detach(ds, vm);
            }
            while let Some(line) = guard.pending.pop_front() {
                let ds = &mut *guard;
                self.dispatch_line(ds, vm, &line);
                if self.cont() == RESUME {
                    ds.out.push_str("Lua VM continuing ... ");
                }
                ds.flush();
            }
            if self.cont() == RESUME {
                break;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Client-detach sequence: step off any hit breakpoint, unpatch every
    /// slot, and let the VM run free.
    fn handle_detach(&self, ds: &mut DebugState, vm: &mut Vm) {
        debug!("client detached; unpatching and resuming");
        let _ = exec::r#continue(ds, self, vm);
        for id in ds.bps.ids() {
            ds.bps.remove(id);
        }
        ds.rtbp = None;
        ds.restorebp = None;
    }

    /// Parses and dispatches one command line on the VM thread.
    pub fn dispatch_line(&self, ds: &mut DebugState, vm: &mut Vm, line: &str) {
        match line.parse::<Command>() {
            Err(err) => {
                trace!("unparsable command line: {err}");
                ds.out.push_str("invalid command line");
            }
            Ok(cmd) => {
                trace!("dispatching {cmd:?}");
                match exec::dispatch(self, ds, vm, cmd) {
                    Ok(()) => {}
                    Err(Error::Fatal(msg)) => self.fatal(ds, &msg),
                    Err(err) => reply!(ds.out, "{err}"),
                }
            }
        }
    }

    /// Fatal tier: notify the client and give up the process.
    fn fatal(&self, ds: &mut DebugState, msg: &str) -> ! {
        ds.out.reset_fmt(format_args!("fatal error: {msg}"));
        ds.flush();
        std::process::exit(1);
    }
}

/// Repoints `ci`/`citop` at the topmost Lua frame.
pub(crate) fn update_citop(ds: &mut DebugState, vm: &Vm) -> Option<usize> {
    let citop = vm.frames().iter().rposition(Frame::is_lua)?;
    ds.citop = citop;
    ds.ci = citop;
    Some(citop)
}

/// Current instruction index of a suspended frame.
pub(crate) fn frame_pc(vm: &Vm, level: usize) -> usize {
    vm.frames()[level].current_pc()
}

/// Refreshes the paused source position from the selected frame, loading the
/// file into the cache.
pub(crate) fn update_file_pos(ds: &mut DebugState, vm: &Vm) {
    let frame = &vm.frames()[ds.ci];
    if !frame.is_lua() {
        return;
    }
    let proto = &frame.closure().proto;
    ds.rtline = proto.lineinfo[frame.current_pc()];
    ds.rtsrc = Some(proto.source);
    let path = vm.source(proto.source).path.clone();
    let _ = ds.cache.get_or_load(proto.source, &path);
}
